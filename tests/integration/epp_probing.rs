//! Integration tests for EPP-over-TCP probing
//!
//! These tests verify that:
//! - The greeting/login/check/logout chain completes over one connection
//! - Every action and the sequence record SUCCESS
//! - Target rotation feeds each cycle's domain check

use std::sync::Arc;

use registry_prober::action::SEQUENCE_LABEL;
use registry_prober::metrics::MetricsCollector;
use registry_prober::sequence::SequenceHandle;
use registry_prober::{Outcome, Protocol};
use tokio::sync::broadcast;

use crate::helpers::{EppServerMode, epp_config, spawn_epp_server};

#[tokio::test]
async fn test_epp_full_sequence_success() {
    let addr = spawn_epp_server(EppServerMode::Normal).await;
    let config = epp_config(addr, &["dev"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, mut event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_epp(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::Success);

    for action in ["greet", "login", "send-query", "logout"] {
        assert_eq!(
            metrics.counter(Protocol::Epp, action, Outcome::Success),
            1,
            "action {action} should have succeeded exactly once"
        );
    }
    assert_eq!(
        metrics.counter(Protocol::Epp, SEQUENCE_LABEL, Outcome::Success),
        1
    );

    let event = event_rx.recv().await.unwrap();
    assert_eq!(event.protocol, Protocol::Epp);
    assert_eq!(event.outcome, Outcome::Success);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_epp_create_delete_flow() {
    use registry_prober::config::EppProbeFlow;

    let addr = spawn_epp_server(EppServerMode::Normal).await;
    let mut config = epp_config(addr, &["dev"]);
    config.flow = EppProbeFlow::CreateDelete;

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, _event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_epp(&config, metrics.clone(), event_tx).unwrap();

    // the mock answers a delete with 2303 unless it names the domain created
    // on the same connection, so SUCCESS proves the two commands agree
    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::Success);

    for action in ["greet", "login", "create", "delete", "logout"] {
        assert_eq!(
            metrics.counter(Protocol::Epp, action, Outcome::Success),
            1,
            "action {action} should have succeeded exactly once"
        );
    }
    assert_eq!(
        metrics.counter(Protocol::Epp, SEQUENCE_LABEL, Outcome::Success),
        1
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_epp_repeated_cycles_rotate_targets() {
    let addr = spawn_epp_server(EppServerMode::Normal).await;
    let config = epp_config(addr, &["app", "dev"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, mut event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_epp(&config, metrics.clone(), event_tx).unwrap();

    for _ in 0..4 {
        assert_eq!(handle.probe_now().await.unwrap(), Outcome::Success);
    }

    let mut seen = vec![];
    for _ in 0..4 {
        seen.push(event_rx.recv().await.unwrap().target);
    }
    assert_eq!(seen, vec!["app", "dev", "app", "dev"]);

    // each cycle ran the whole four-action chain
    assert_eq!(metrics.counter(Protocol::Epp, "logout", Outcome::Success), 4);

    handle.shutdown().await.unwrap();
}
