//! Integration tests for WHOIS-over-HTTP probing
//!
//! These tests verify that:
//! - A full probe cycle against a healthy server records SUCCESS
//! - Status and body validation reject wrong responses
//! - The target rotation walks the configured list in order

use std::sync::Arc;

use registry_prober::action::SEQUENCE_LABEL;
use registry_prober::metrics::MetricsCollector;
use registry_prober::sequence::SequenceHandle;
use registry_prober::{Outcome, Protocol};
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::whois_config;

#[tokio::test]
async fn test_whois_probe_success() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Domain not found"))
        .mount(&mock_server)
        .await;

    let addr = mock_server.address();
    let config = whois_config(&addr.ip().to_string(), addr.port(), &["dev"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, mut event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_whois(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::Success);

    assert_eq!(
        metrics.counter(Protocol::Whois, "send-query", Outcome::Success),
        1
    );
    assert_eq!(
        metrics.counter(Protocol::Whois, SEQUENCE_LABEL, Outcome::Success),
        1
    );

    let event = event_rx.recv().await.unwrap();
    assert_eq!(event.protocol, Protocol::Whois);
    assert_eq!(event.target, "dev");
    assert_eq!(event.outcome, Outcome::Success);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_whois_follows_redirect_to_final_location() {
    let mock_server = MockServer::start().await;
    let addr = *mock_server.address();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", format!("http://{addr}/rdap")),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rdap"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Domain not found"))
        .mount(&mock_server)
        .await;

    let mut config = whois_config(&addr.ip().to_string(), addr.port(), &["dev"]);
    config.body_pattern = Some("Domain not found".to_string());

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, _event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_whois(&config, metrics.clone(), event_tx).unwrap();

    // the redirected location's body satisfies the pattern, so the cycle
    // succeeds even though the first response was a 302
    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::Success);

    assert_eq!(
        metrics.counter(Protocol::Whois, "send-query", Outcome::Success),
        1
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_whois_redirect_loop_is_protocol_error() {
    let mock_server = MockServer::start().await;
    let addr = *mock_server.address();

    // every request redirects back to itself
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("Location", format!("http://{addr}/")),
        )
        .mount(&mock_server)
        .await;

    let config = whois_config(&addr.ip().to_string(), addr.port(), &["dev"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, _event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_whois(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::ProtocolError);

    assert_eq!(
        metrics.counter(Protocol::Whois, "send-query", Outcome::ProtocolError),
        1
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_whois_unexpected_status_is_protocol_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("oops"))
        .mount(&mock_server)
        .await;

    let addr = mock_server.address();
    let mut config = whois_config(&addr.ip().to_string(), addr.port(), &["dev"]);
    config.expected_status = Some(vec![200]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, _event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_whois(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::ProtocolError);

    assert_eq!(
        metrics.counter(Protocol::Whois, "send-query", Outcome::ProtocolError),
        1
    );
    assert_eq!(
        metrics.counter(Protocol::Whois, SEQUENCE_LABEL, Outcome::ProtocolError),
        1
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_whois_body_pattern_mismatch_is_protocol_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("unexpected payload"))
        .mount(&mock_server)
        .await;

    let addr = mock_server.address();
    let mut config = whois_config(&addr.ip().to_string(), addr.port(), &["dev"]);
    config.body_pattern = Some("Domain not found".to_string());

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, _event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_whois(&config, metrics.clone(), event_tx).unwrap();

    let outcome = handle.probe_now().await.unwrap();
    assert_eq!(outcome, Outcome::ProtocolError);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_whois_targets_rotate_in_order() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .mount(&mock_server)
        .await;

    let addr = mock_server.address();
    let config = whois_config(&addr.ip().to_string(), addr.port(), &["app", "dev", "page"]);

    let metrics = Arc::new(MetricsCollector::new(1.0).unwrap());
    let (event_tx, mut event_rx) = broadcast::channel(16);

    let handle = SequenceHandle::spawn_whois(&config, metrics.clone(), event_tx).unwrap();

    for _ in 0..5 {
        handle.probe_now().await.unwrap();
    }

    let mut seen = vec![];
    for _ in 0..5 {
        seen.push(event_rx.recv().await.unwrap().target);
    }
    assert_eq!(seen, vec!["app", "dev", "page", "app", "dev"]);

    assert_eq!(
        metrics.counter(Protocol::Whois, SEQUENCE_LABEL, Outcome::Success),
        5
    );

    handle.shutdown().await.unwrap();
}
