// Retry policy against real sockets and a mocked fiscal device.

mod common;

use common::FakePrinter;
use std::time::{Duration, Instant};
use sushiamo_print_bridge::errors::BridgeError;
use sushiamo_print_bridge::jobs::RtRoute;
use sushiamo_print_bridge::transport::{
    is_retriable, post_fiscal_document, send_raw_tcp, FISCAL_TEST_TIMEOUT,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_reset_then_success_retries_once() {
    let printer = FakePrinter::spawn().await;
    printer.fail_next_connections(1);

    let payload = b"\x1b\x40prova".to_vec();
    let started = Instant::now();
    let attempts = send_raw_tcp(&printer.host, printer.port, &payload).await.unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(printer.connection_count(), 2);
    // the 500 ms pause between attempts is honored
    assert!(started.elapsed() >= Duration::from_millis(450));

    let received = printer.received().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], payload);
}

#[tokio::test]
async fn test_retry_cap_is_two_attempts() {
    let printer = FakePrinter::spawn().await;
    printer.fail_next_connections(10);

    let err = send_raw_tcp(&printer.host, printer.port, b"\x1b\x40").await.unwrap_err();

    assert_eq!(printer.connection_count(), 2, "never more than two attempts");
    assert!(is_retriable(&err), "the surfaced error is the transient one: {}", err);
}

#[tokio::test]
async fn test_successful_delivery_is_single_attempt() {
    let printer = FakePrinter::spawn().await;

    let attempts = send_raw_tcp(&printer.host, printer.port, b"\x1b\x40ok").await.unwrap();

    assert_eq!(attempts, 1);
    assert_eq!(printer.connection_count(), 1);
}

fn device_route(server: &MockServer) -> RtRoute {
    let addr = server.address();
    RtRoute {
        host: addr.ip().to_string(),
        port: addr.port(),
        brand: "epson".into(),
        api_path: "/cgi-bin/fpmate.cgi".into(),
    }
}

#[tokio::test]
async fn test_fiscal_rejection_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/fpmate.cgi"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(r#"<response status="error" code="22"/>"#),
        )
        .mount(&server)
        .await;

    let err = post_fiscal_document(&device_route(&server), "<FPMessage/>", FISCAL_TEST_TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::FiscalRejected(_)), "got: {}", err);
    assert!(!is_retriable(&err));
    assert_eq!(server.received_requests().await.unwrap().len(), 1, "exactly one attempt");
}

#[tokio::test]
async fn test_fiscal_success_extracts_receipt_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/fpmate.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<response status="ok" receipt_id="777" progressive_number="12"/>"#,
        ))
        .mount(&server)
        .await;

    let outcome = post_fiscal_document(&device_route(&server), "<FPMessage/>", FISCAL_TEST_TIMEOUT)
        .await
        .unwrap();

    assert_eq!(outcome.receipt_id.as_deref(), Some("777"));
    assert_eq!(outcome.attempts, 1);
}

#[tokio::test]
async fn test_fiscal_http_error_carries_excerpt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cgi-bin/fpmate.cgi"))
        .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(2000)))
        .mount(&server)
        .await;

    let err = post_fiscal_document(&device_route(&server), "<FPMessage/>", FISCAL_TEST_TIMEOUT)
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("500"));
    assert!(message.len() < 600, "body excerpt is truncated: {} chars", message.len());
}
