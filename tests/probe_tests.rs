use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use drop_detect_rs::aggregate;
use drop_detect_rs::prober::{
    probe_port, probe_port_with, run_probe_worker, ProbeSettings, ATTEMPTS, MAX_TRANSIENT_RETRIES,
};
use drop_detect_rs::target::{run_listen_worker, serve_port, PortOutcome};
use drop_detect_rs::types::Classification;
use drop_detect_rs::wire::{write_unit, ContentType, Direction, SessionKey, Status, Unit, HEADER_LEN};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

fn settings() -> ProbeSettings {
    ProbeSettings {
        timeout: Duration::from_secs(1),
        delay: Duration::from_millis(100),
    }
}

/// A port nothing is listening on (right now).
fn free_port() -> u16 {
    let l = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    l.local_addr().unwrap().port()
}

#[tokio::test]
async fn answered_probe_is_accepted() {
    let port = free_port();
    let target = tokio::spawn(serve_port(LOCALHOST, port, Duration::from_secs(2)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(probe_port(LOCALHOST, port, &settings()).await, Classification::Accepted);
    assert_eq!(target.await.unwrap().unwrap(), PortOutcome::Answered);
}

#[tokio::test]
async fn refused_port_is_closed() {
    let port = free_port();
    let quick = ProbeSettings {
        delay: Duration::from_millis(10),
        ..settings()
    };
    assert_eq!(probe_port(LOCALHOST, port, &quick).await, Classification::Closed);
}

#[tokio::test]
async fn listener_without_reply_is_server_error() {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        drop(sock);
    });
    assert_eq!(probe_port(LOCALHOST, port, &settings()).await, Classification::ServerError);
}

#[tokio::test]
async fn reply_with_wrong_id_is_server_error() {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; HEADER_LEN];
        sock.read_exact(&mut buf).await.unwrap();
        let other = Unit::new(Direction::FromTarget, ContentType::Info, Status::Ok, SessionKey::random());
        write_unit(&mut sock, &other).await.unwrap();
    });
    assert_eq!(probe_port(LOCALHOST, port, &settings()).await, Classification::ServerError);
}

#[tokio::test]
async fn silent_listener_is_server_error() {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hold = tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        drop(sock);
    });
    let quick = ProbeSettings {
        timeout: Duration::from_millis(200),
        ..settings()
    };
    assert_eq!(probe_port(LOCALHOST, port, &quick).await, Classification::ServerError);
    hold.abort();
}

#[tokio::test]
async fn listen_worker_serves_a_whole_chunk() {
    let ports = vec![free_port(), free_port()];
    let target = tokio::spawn(run_listen_worker(LOCALHOST, ports.clone(), Duration::from_secs(2)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    for &port in &ports {
        assert_eq!(probe_port(LOCALHOST, port, &settings()).await, Classification::Accepted);
    }
    let summary = target.await.unwrap();
    assert_eq!(summary.answered, 2);
    assert!(!summary.gave_up);
}

#[tokio::test]
async fn aggregate_counts_every_port_once() {
    let (aggregator, agg) = aggregate::channel(CancellationToken::new());
    let collector = tokio::spawn(aggregator.run());
    let quick = ProbeSettings {
        delay: Duration::from_millis(1),
        ..settings()
    };

    let mut workers = tokio::task::JoinSet::new();
    let mut expected = Vec::new();
    for _ in 0..4 {
        let ports: Vec<u16> = (0..5).map(|_| free_port()).collect();
        expected.extend(ports.iter().copied());
        agg.worker_started();
        workers.spawn(run_probe_worker(LOCALHOST, ports, quick, agg.clone()));
    }
    while let Some(done) = workers.join_next().await {
        assert_eq!(done.unwrap(), 5);
    }
    drop(agg);

    let results = collector.await.unwrap();
    assert_eq!(results.total(), 20);
    assert_eq!(results.counts().total(), 20);
    assert!(!results.aborted);
    let mut seen: Vec<u16> = Classification::ALL
        .iter()
        .flat_map(|c| results.list(*c).iter().copied())
        .collect();
    seen.sort_unstable();
    expected.sort_unstable();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn aborted_worker_stops_early() {
    let abort = CancellationToken::new();
    abort.cancel();
    let (aggregator, agg) = aggregate::channel(abort);
    let collector = tokio::spawn(aggregator.run());
    agg.worker_started();
    let classified = run_probe_worker(LOCALHOST, vec![free_port(), free_port()], settings(), agg).await;
    assert_eq!(classified, 0);
    let results = collector.await.unwrap();
    assert!(results.aborted);
    assert_eq!(results.total(), 0);
}

/// Needs a route that blackholes 10.255.255.1.
#[tokio::test]
#[ignore]
async fn blackholed_port_is_dropped() {
    let addr = IpAddr::V4(Ipv4Addr::new(10, 255, 255, 1));
    assert_eq!(probe_port(addr, 80, &settings()).await, Classification::Dropped);
}

fn target_addr() -> SocketAddr {
    SocketAddr::new(LOCALHOST, 9)
}

#[tokio::test]
async fn hanging_connect_is_dropped_without_retry() {
    let calls = AtomicUsize::new(0);
    let settings = ProbeSettings {
        timeout: Duration::from_millis(200),
        delay: Duration::from_secs(5),
    };
    let started = Instant::now();
    let class = probe_port_with(target_addr(), &settings, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<io::Result<DuplexStream>>()
    })
    .await;
    let elapsed = started.elapsed();

    assert_eq!(class, Classification::Dropped);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "slept after a timeout: {elapsed:?}");
}

#[tokio::test]
async fn os_connect_timeout_is_dropped_without_retry() {
    let calls = AtomicUsize::new(0);
    let class = probe_port_with(target_addr(), &settings(), |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Err::<DuplexStream, _>(io::Error::from(io::ErrorKind::TimedOut)))
    })
    .await;
    assert_eq!(class, Classification::Dropped);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refusals_use_up_every_attempt() {
    let calls = AtomicUsize::new(0);
    let quick = ProbeSettings {
        delay: Duration::from_millis(1),
        ..settings()
    };
    let class = probe_port_with(target_addr(), &quick, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Err::<DuplexStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused)))
    })
    .await;
    assert_eq!(class, Classification::Closed);
    assert_eq!(calls.load(Ordering::SeqCst), ATTEMPTS as usize);
}

#[tokio::test]
async fn transient_errors_retry_then_count_as_attempts() {
    let calls = AtomicUsize::new(0);
    let quick = ProbeSettings {
        delay: Duration::from_millis(1),
        ..settings()
    };
    let class = probe_port_with(target_addr(), &quick, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Err::<DuplexStream, _>(io::Error::from(io::ErrorKind::AddrNotAvailable)))
    })
    .await;
    assert_eq!(class, Classification::Closed);
    assert_eq!(
        calls.load(Ordering::SeqCst),
        (MAX_TRANSIENT_RETRIES + ATTEMPTS) as usize
    );
}
