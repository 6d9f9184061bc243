//! Human-readable report and JSON export of a finished run.
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use time::{format_description::well_known, OffsetDateTime};

use crate::ports::compress_ranges;
use crate::types::{AbortCause, Classification, RunInfo, ScanResults};

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// `Empty`, a lone port, or the compressed range listing.
pub fn category_listing(results: &ScanResults, class: Classification) -> String {
    let list = results.list(class);
    if list.is_empty() {
        "Empty".to_string()
    } else {
        compress_ranges(list)
    }
}

/// Short end-of-run summary.
///
/// Always the four counts; then either "All ports open!" or, for each
/// category small enough to be interesting (at most a quarter of the total),
/// its port listing.
pub fn summary_lines(results: &ScanResults) -> Vec<String> {
    let counts = results.counts();
    let total = counts.total();
    let mut out = vec![format!(
        "accept: {}, close: {}, drop: {}, srverr: {}",
        counts.accepted, counts.closed, counts.dropped, counts.server_error
    )];
    if total > 0 && counts.accepted == total {
        out.push("All ports open!".to_string());
        return out;
    }
    let threshold = total / 4;
    for class in Classification::ALL {
        let n = counts.get(class);
        if n > 0 && n <= threshold {
            out.push(format!("{}: {}", class.label(), compress_ranges(results.list(class))));
        }
    }
    out
}

/// One-line explanation of an early stop.
pub fn abort_notice(cause: Option<AbortCause>) -> &'static str {
    match cause {
        Some(AbortCause::Interrupted) => "run interrupted; ports after the stop were not probed",
        Some(AbortCause::HeartbeatLost) | None => "heartbeat died during the run; results may be unreliable",
    }
}

pub fn render_text(info: &RunInfo, results: &ScanResults) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "=== drop-detect report ===");
    let _ = writeln!(s, "started     : {}", info.started);
    let _ = writeln!(s, "finished    : {}", info.finished);
    let _ = writeln!(s, "elapsed     : {}s", info.elapsed_secs);
    let _ = writeln!(s, "server      : {}", info.server);
    let _ = writeln!(s, "data port   : {}", info.data_port);
    let _ = writeln!(s, "port range  : {}-{} (end exclusive)", info.port_start, info.port_end);
    let _ = writeln!(s, "total       : {} ports", info.total_ports());
    let _ = writeln!(s, "chunk size  : {} ports/worker ({} chunks)", info.chunk_size, info.chunks);
    let _ = writeln!(s, "fail delay  : {}s", info.delay_secs);
    if results.aborted {
        let _ = writeln!(s, "WARNING     : {}", abort_notice(results.abort_cause));
    }
    let _ = writeln!(s, "---");
    for class in Classification::ALL {
        let _ = writeln!(s, "{:<7}: {}", class.label(), category_listing(results, class));
    }
    s
}

pub fn write_text(path: &Path, info: &RunInfo, results: &ScanResults) -> Result<()> {
    fs::write(path, render_text(info, results))
        .with_context(|| format!("failed to write report: {}", path.display()))
}

#[derive(Serialize)]
struct JsonReport<'a> {
    run: &'a RunInfo,
    results: &'a ScanResults,
}

pub fn write_json(path: &Path, info: &RunInfo, results: &ScanResults) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(
        file,
        &JsonReport {
            run: info,
            results,
        },
    )?;
    Ok(())
}
