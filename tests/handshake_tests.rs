use std::time::Duration;

use drop_detect_rs::error::HandshakeError;
use drop_detect_rs::handshake::{accept_handshake, initiate_handshake, HandshakeOutcome, SessionConfig};
use drop_detect_rs::wire::{read_unit, write_unit, ContentType, Direction, SessionKey, Status, Unit};

fn config(port_start: u32) -> SessionConfig {
    SessionConfig {
        timeout: 3,
        port_start,
        port_end: 200,
        port_chunk: 50,
        heartbeat: 1,
    }
}

#[tokio::test]
async fn both_sides_agree_on_key_and_parameters() {
    let (prober_io, mut target_io) = tokio::io::duplex(4096);
    let target = tokio::spawn(async move { accept_handshake(&mut target_io, true).await });

    let key = SessionKey::random();
    let outcome = initiate_handshake(prober_io, config(100), key, Duration::from_secs(2))
        .await
        .expect("handshake io");
    let session = match outcome {
        HandshakeOutcome::Ready(s) => s,
        other => panic!("expected ready, got {other:?}"),
    };
    assert_eq!(session.key, key);
    assert_eq!(session.config, config(100));

    let accepted = target.await.unwrap().expect("target side ready");
    assert_eq!(accepted.key, key);
    assert_eq!(accepted.config, config(100));
}

#[tokio::test]
async fn unprivileged_target_rejects_low_ports() {
    let (prober_io, mut target_io) = tokio::io::duplex(4096);
    let target = tokio::spawn(async move { accept_handshake(&mut target_io, false).await });

    let outcome = initiate_handshake(prober_io, config(100), SessionKey::random(), Duration::from_secs(2))
        .await
        .expect("handshake io");
    match outcome {
        HandshakeOutcome::Rejected(reason) => assert!(reason.contains("privilege"), "{reason}"),
        other => panic!("expected rejection, got {other:?}"),
    }

    let err = target.await.unwrap().unwrap_err();
    assert!(matches!(err, HandshakeError::InsufficientPrivilege { port_start: 100 }));
}

#[tokio::test]
async fn unprivileged_target_accepts_high_ports() {
    let (prober_io, mut target_io) = tokio::io::duplex(4096);
    let target = tokio::spawn(async move { accept_handshake(&mut target_io, false).await });

    let cfg = SessionConfig {
        port_start: 20000,
        port_end: 20100,
        ..config(0)
    };
    let outcome = initiate_handshake(prober_io, cfg, SessionKey::random(), Duration::from_secs(2))
        .await
        .expect("handshake io");
    assert!(matches!(outcome, HandshakeOutcome::Ready(_)));
    assert_eq!(target.await.unwrap().unwrap().config, cfg);
}

#[tokio::test]
async fn target_that_hangs_up_means_no_session() {
    let (prober_io, target_io) = tokio::io::duplex(4096);
    drop(target_io);
    let outcome = initiate_handshake(prober_io, config(100), SessionKey::random(), Duration::from_secs(2))
        .await
        .expect("disconnect is not an error");
    assert!(matches!(outcome, HandshakeOutcome::NoSession));
}

#[tokio::test]
async fn opener_must_be_a_handshake_unit() {
    let (mut prober_io, mut target_io) = tokio::io::duplex(4096);
    let target = tokio::spawn(async move { accept_handshake(&mut target_io, true).await });

    let bogus = Unit::new(Direction::FromProber, ContentType::PortRequest, Status::Ok, SessionKey::random());
    write_unit(&mut prober_io, &bogus).await.unwrap();

    let err = target.await.unwrap().unwrap_err();
    assert!(matches!(err, HandshakeError::NotHandshake(ContentType::PortRequest)));
    // Nothing useful comes back, at most a BAD unit before the close.
    if let Ok(reply) = read_unit(&mut prober_io).await {
        assert!(!reply.is_ok());
    }
}

#[tokio::test]
async fn unbounded_heartbeat_is_refused() {
    let (prober_io, mut target_io) = tokio::io::duplex(4096);
    let target = tokio::spawn(async move { accept_handshake(&mut target_io, true).await });

    let cfg = SessionConfig {
        heartbeat: u64::MAX,
        ..config(100)
    };
    let outcome = initiate_handshake(prober_io, cfg, SessionKey::random(), Duration::from_secs(2))
        .await
        .expect("handshake io");
    match outcome {
        HandshakeOutcome::Rejected(reason) => {
            assert!(reason.starts_with("invalid handshake parameters"), "{reason}")
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    let err = target.await.unwrap().unwrap_err();
    assert!(matches!(err, HandshakeError::InvalidParameters(_)));
}
