// End-to-end print flow against a mocked backend and a fake printer socket.

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use sushiamo_print_bridge::LogLevel;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn test_happy_kitchen_path() {
    let server = mock_backend().await;
    let printer = FakePrinter::spawn().await;

    mount_rpc_once(
        &server,
        "print_claim_jobs",
        json!([{
            "id": "abc-0001",
            "department": "cucina",
            "payload": {
                "restaurant_name": "Aoyama",
                "table_number": "7",
                "order_number": 42,
                "created_at": "2024-01-15T12:30:00Z",
                "items": [
                    {"name": "TUNA ROLL", "quantity": 2},
                    {"name": "salmon nigiri", "quantity": 1, "notes": "no wasabi"}
                ]
            },
            "route": {"id": "p1"},
            "created_at": "2024-01-15T12:31:00Z"
        }]),
    )
    .await;
    mount_rpc(&server, "print_claim_jobs", json!([])).await;
    mount_rpc(&server, "print_complete_job", json!(null)).await;
    mount_rpc(&server, "physical_receipt_claim_jobs", json!([])).await;
    mount_rpc(&server, "non_fiscal_receipt_claim_jobs", json!([])).await;
    mount_settings(
        &server,
        json!({
            "printing": {
                "printers": [
                    {"id": "p1", "name": "Cucina", "host": printer.host, "port": printer.port,
                     "enabled": true, "departments": ["cucina"]}
                ]
            }
        }),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let worker = worker_against(&server, dir.path()).await;
    worker.start_service().await.unwrap();

    let state = wait_for_state(&worker, |s| s.stats.printed >= 1).await;
    assert_eq!(state.stats.claimed, 1);
    assert_eq!(state.stats.failed, 0);
    assert_eq!(state.stats.last_error, None);

    let buffer = printer.wait_for_job().await;
    assert_eq!(&buffer[..8], &[0x1B, 0x40, 0x1B, 0x4D, 0x01, 0x1B, 0x20, 0x02]);
    assert_eq!(&buffer[buffer.len() - 6..], &[0x1B, 0x64, 0x07, 0x1D, 0x56, 0x00]);

    let text = String::from_utf8_lossy(&buffer);
    assert!(text.contains("COMANDA CUCINA #42"));
    assert!(text.contains("TAVOLO: 7"));
    assert!(text.contains("2x Tuna Roll"));
    assert!(text.contains("1x Salmon Nigiri"));
    assert!(text.contains(" Nota: no wasabi"));
    assert!(text.contains("-- Aoyama --"));

    worker.stop_service().await.unwrap();

    let acks = rpc_request_bodies(&server, "print_complete_job").await;
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["p_job_id"], json!("abc-0001"));
    assert_eq!(acks[0]["p_consumer_id"], json!("bridge-test"));
    assert_eq!(acks[0]["p_success"], json!(true));
    assert_eq!(acks[0]["p_error"], json!(null));
}

#[tokio::test]
async fn test_unreachable_printer_still_acked() {
    let server = mock_backend().await;

    // A port nothing listens on: bind, read the number, close.
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    mount_rpc_once(
        &server,
        "print_claim_jobs",
        json!([{
            "id": "job-down",
            "department": "bar",
            "payload": {"restaurant_name": "Aoyama", "table_number": "3", "order_number": 9,
                        "items": [{"name": "Spritz", "quantity": 1}]},
            "route": {"host": "127.0.0.1", "port": closed_port}
        }]),
    )
    .await;
    mount_rpc(&server, "print_claim_jobs", json!([])).await;
    mount_rpc(&server, "print_complete_job", json!(null)).await;
    mount_rpc(&server, "physical_receipt_claim_jobs", json!([])).await;
    mount_rpc(&server, "non_fiscal_receipt_claim_jobs", json!([])).await;
    mount_settings(&server, json!({})).await;

    let dir = tempfile::tempdir().unwrap();
    let worker = worker_against(&server, dir.path()).await;
    worker.start_service().await.unwrap();

    let state = wait_for_state(&worker, |s| s.stats.failed >= 1).await;
    assert_eq!(state.stats.printed, 0);

    worker.stop_service().await.unwrap();

    let acks = rpc_request_bodies(&server, "print_complete_job").await;
    assert_eq!(acks.len(), 1, "every claimed job gets exactly one completion");
    assert_eq!(acks[0]["p_success"], json!(false));
    let error = acks[0]["p_error"].as_str().expect("failure ack carries an error");
    assert!(!error.is_empty());
    assert!(error.len() <= 500);
}

#[tokio::test]
async fn test_missing_fiscal_rpc_disables_family() {
    let server = mock_backend().await;

    mount_rpc(&server, "print_claim_jobs", json!([])).await;
    mount_rpc(&server, "non_fiscal_receipt_claim_jobs", json!([])).await;
    mount_rpc_missing(&server, "physical_receipt_claim_jobs").await;

    let dir = tempfile::tempdir().unwrap();
    let worker = worker_against(&server, dir.path()).await;
    let mut logs = worker.subscribe_logs();
    worker.start_service().await.unwrap();

    let state = wait_for_state(&worker, |s| !s.rpc.physical_receipt_rpc_available).await;
    assert!(state.rpc.non_fiscal_receipt_rpc_available);

    // Let a couple more ticks run: the family must stay silent.
    tokio::time::sleep(Duration::from_millis(2600)).await;
    worker.stop_service().await.unwrap();

    assert_eq!(
        rpc_call_count(&server, "physical_receipt_claim_jobs").await,
        1,
        "no further fiscal claims after the function was reported missing"
    );

    let mut warnings = 0;
    while let Ok(row) = logs.try_recv() {
        if row.level == LogLevel::Warn && row.message.contains("physical_receipt_claim_jobs") {
            warnings += 1;
        }
    }
    assert_eq!(warnings, 1, "the flip is logged exactly once");
}

#[tokio::test]
async fn test_fiscal_receipt_fallback_id() {
    let server = mock_backend().await;
    let device = server.address();

    mount_rpc(&server, "print_claim_jobs", json!([])).await;
    mount_rpc(&server, "non_fiscal_receipt_claim_jobs", json!([])).await;
    mount_rpc_once(
        &server,
        "physical_receipt_claim_jobs",
        json!([{
            "id": "fis-42",
            "payload": {
                "total_amount": 12.34,
                "payment_method": "card",
                "table_number": "9",
                "route": {"host": device.ip().to_string(), "port": device.port(),
                          "brand": "epson", "api_path": "/cgi-bin/fpmate.cgi"}
            }
        }]),
    )
    .await;
    mount_rpc(&server, "physical_receipt_claim_jobs", json!([])).await;
    mount_rpc(&server, "physical_receipt_complete_job", json!(null)).await;

    // The RT device answers ok but without any identifier field.
    Mock::given(method("POST"))
        .and(path("/cgi-bin/fpmate.cgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"<response status="ok"/>"#))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let worker = worker_against(&server, dir.path()).await;
    worker.start_service().await.unwrap();

    wait_for_state(&worker, |s| s.stats.printed >= 1).await;
    worker.stop_service().await.unwrap();

    let posted: Vec<String> = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/cgi-bin/fpmate.cgi")
        .map(|r| String::from_utf8_lossy(&r.body).to_string())
        .collect();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].contains(r#"description="Sushiamo Tavolo 9""#));
    assert!(posted[0].contains(r#"price="1234""#));
    assert!(posted[0].contains(r#"description="ELETTRONICO" payment="1234""#));

    let acks = rpc_request_bodies(&server, "physical_receipt_complete_job").await;
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["p_success"], json!(true));
    assert_eq!(acks[0]["p_error"], json!(null));

    let receipt_id = acks[0]["p_receipt_id"].as_str().expect("receipt id present");
    let shape = regex::Regex::new(r"^RT-[a-zA-Z0-9]{1,8}-\d+$").unwrap();
    assert!(shape.is_match(receipt_id), "unexpected id: {}", receipt_id);
}

#[tokio::test]
async fn test_heartbeat_adopts_server_assignment() {
    // Hand-built backend: the agent listing reports a server-side assignment.
    let server = wiremock::MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/v1/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": TEST_USER_ID, "email": "titolare@aoyama.it",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/v1/restaurants"))
        .and(wiremock::matchers::query_param("owner_id", format!("eq.{}", TEST_USER_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": TEST_RESTAURANT_ID, "name": "Aoyama", "city": "Milano"}
        ])))
        .mount(&server)
        .await;
    mount_rpc(
        &server,
        "printing_list_agents",
        json!([{"agent_id": "bridge-test", "printer_id": "printer-77"}]),
    )
    .await;
    mount_rpc(&server, "printing_register_agent", json!({"printer_id": "printer-77"})).await;
    mount_rpc(&server, "print_claim_jobs", json!([])).await;
    mount_rpc(&server, "physical_receipt_claim_jobs", json!([])).await;
    mount_rpc(&server, "non_fiscal_receipt_claim_jobs", json!([])).await;

    let dir = tempfile::tempdir().unwrap();
    let worker = worker_against(&server, dir.path()).await;
    worker.start_service().await.unwrap();

    let state = wait_for_state(&worker, |s| s.service.assigned_printer_id.is_some()).await;
    assert_eq!(state.service.assigned_printer_id.as_deref(), Some("printer-77"));

    worker.stop_service().await.unwrap();

    // stop issues one final best-effort heartbeat with is_active=false
    let beats = rpc_request_bodies(&server, "printing_register_agent").await;
    assert!(beats.iter().any(|b| b["p_is_active"] == json!(false)));
    assert!(beats
        .iter()
        .all(|b| b["p_agent_id"] == json!("bridge-test")));
}
