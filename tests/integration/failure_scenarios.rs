//! Integration tests for failure classification
//!
//! These tests verify that:
//! - Unanswered actions are classified TIMEOUT and abort the sequence
//! - Refused connections are classified CONNECTION_ERROR with no action samples
//! - Malformed framing is classified PROTOCOL_ERROR
//! - Failed cycles still advance the target rotation

use std::sync::Arc;

use registry_prober::action::SEQUENCE_LABEL;
use registry_prober::metrics::MetricsCollector;
use registry_prober::sequence::SequenceHandle;
use registry_prober::{Outcome, Protocol};
use tokio::sync::broadcast;

use crate::helpers::{EppServerMode, epp_config, spawn_epp_server};

#[tokio::test]
async fn test_silent_server_times_out_after_greeting() {
    let addr = spawn_epp_server(EppServerMode::SilentAfterGreeting).await;
    let config = epp_config(addr, &["dev"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, _event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_epp(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::Timeout);

    // the greeting arrived, the login never got answered, nothing ran after
    assert_eq!(metrics.counter(Protocol::Epp, "greet", Outcome::Success), 1);
    assert_eq!(metrics.counter(Protocol::Epp, "login", Outcome::Timeout), 1);
    assert_eq!(
        metrics.counter(Protocol::Epp, "send-query", Outcome::Timeout)
            + metrics.counter(Protocol::Epp, "send-query", Outcome::Success),
        0
    );
    assert_eq!(
        metrics.counter(Protocol::Epp, SEQUENCE_LABEL, Outcome::Timeout),
        1
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_domain_check_times_out_and_rotates() {
    let addr = spawn_epp_server(EppServerMode::SilentOnCheck).await;
    let config = epp_config(addr, &["app", "dev"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, mut event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_epp(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::Timeout);

    assert_eq!(metrics.counter(Protocol::Epp, "greet", Outcome::Success), 1);
    assert_eq!(metrics.counter(Protocol::Epp, "login", Outcome::Success), 1);
    assert_eq!(
        metrics.counter(Protocol::Epp, "send-query", Outcome::Timeout),
        1
    );
    assert_eq!(metrics.counter(Protocol::Epp, "logout", Outcome::Success), 0);

    // the token still advanced past the failed target
    assert_eq!(event_rx.recv().await.unwrap().target, "app");
    handle.probe_now().await.unwrap();
    assert_eq!(event_rx.recv().await.unwrap().target, "dev");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_mute_server_times_out_on_greeting() {
    let addr = spawn_epp_server(EppServerMode::Mute).await;
    let config = epp_config(addr, &["dev"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, _event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_epp(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::Timeout);

    assert_eq!(metrics.counter(Protocol::Epp, "greet", Outcome::Timeout), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_redirect_chain_exceeding_budget_is_sequence_timeout() {
    use std::time::Duration;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let mock_server = MockServer::start().await;
    let addr = *mock_server.address();

    // each hop answers just under the single-action timeout, so no action
    // ever times out on its own; only the wall-clock budget catches the
    // cumulative delay
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", format!("http://{addr}/hop1"))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hop1"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", format!("http://{addr}/hop2"))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hop2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Domain not found"))
        .mount(&mock_server)
        .await;

    // budget is 500ms action timeout + 100ms margin; two 400ms hops blow it
    let config: registry_prober::config::WhoisConfig =
        serde_json::from_value(serde_json::json!({
            "targets": ["dev"],
            "host": addr.ip().to_string(),
            "port": addr.port(),
            "interval_secs": 3600,
            "action_timeout_ms": 500,
            "budget_margin_ms": 100,
        }))
        .unwrap();

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, mut event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_whois(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::Timeout);

    assert_eq!(
        metrics.counter(Protocol::Whois, SEQUENCE_LABEL, Outcome::Timeout),
        1
    );
    // the in-flight action was dropped mid-chain, so it recorded nothing
    for outcome in [
        Outcome::Success,
        Outcome::Timeout,
        Outcome::ProtocolError,
        Outcome::ConnectionError,
    ] {
        assert_eq!(metrics.counter(Protocol::Whois, "send-query", outcome), 0);
    }

    // the aborted cycle still advanced the rotation
    let event = event_rx.recv().await.unwrap();
    assert_eq!(event.outcome, Outcome::Timeout);
    assert_eq!(event.target, "dev");

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refused_connection_records_no_action_samples() {
    // bind then drop to get a port that refuses connections
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = epp_config(addr, &["dev"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, _event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_epp(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::ConnectionError);

    assert_eq!(
        metrics.counter(Protocol::Epp, SEQUENCE_LABEL, Outcome::ConnectionError),
        1
    );
    // no connection, no actions
    for action in ["greet", "login", "send-query", "logout"] {
        let snapshot = metrics.snapshot();
        assert!(
            !snapshot.iter().any(|entry| entry.key.action == action),
            "action {action} should not have recorded any sample"
        );
    }

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_is_protocol_error() {
    let addr = spawn_epp_server(EppServerMode::BadFraming).await;
    let config = epp_config(addr, &["dev"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, _event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_epp(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::ProtocolError);

    assert_eq!(metrics.counter(Protocol::Epp, "greet", Outcome::Success), 1);
    assert_eq!(
        metrics.counter(Protocol::Epp, "login", Outcome::ProtocolError),
        1
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_cycles_still_rotate() {
    let addr = spawn_epp_server(EppServerMode::Mute).await;
    let config = epp_config(addr, &["app", "dev", "page"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, mut event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_epp(&config, metrics, event_tx).unwrap();

    for _ in 0..3 {
        assert_eq!(handle.probe_now().await.unwrap(), Outcome::Timeout);
    }

    let mut seen = vec![];
    for _ in 0..3 {
        seen.push(event_rx.recv().await.unwrap().target);
    }
    assert_eq!(seen, vec!["app", "dev", "page"]);

    handle.shutdown().await.unwrap();
}
