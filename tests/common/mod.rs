// Shared fixtures: a fake ESC/POS printer on a real socket and a mocked
// Supabase surface.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sushiamo_print_bridge::{
    AgentConfigPatch, BackendSettings, PrintWorker, PublicState, SessionSnapshot, StateStore,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Minimal network printer: accepts connections, reads until the client
/// half-closes, remembers every buffer. Can be told to RST the next N
/// connections to simulate transient faults.
pub struct FakePrinter {
    pub host: String,
    pub port: u16,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    connections: Arc<AtomicU32>,
    reset_next: Arc<AtomicU32>,
}

impl FakePrinter {
    pub async fn spawn() -> FakePrinter {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake printer");
        let addr = listener.local_addr().expect("fake printer addr");

        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicU32::new(0));
        let reset_next = Arc::new(AtomicU32::new(0));

        let received_bg = received.clone();
        let connections_bg = connections.clone();
        let reset_bg = reset_next.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                connections_bg.fetch_add(1, Ordering::SeqCst);

                if reset_bg.load(Ordering::SeqCst) > 0 {
                    reset_bg.fetch_sub(1, Ordering::SeqCst);
                    // Linger 0 turns the close into an RST, which the client
                    // sees as ECONNRESET.
                    let _ = socket.set_linger(Some(Duration::ZERO));
                    drop(socket);
                    continue;
                }

                let received = received_bg.clone();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    let _ = socket.read_to_end(&mut buffer).await;
                    received.lock().await.push(buffer);
                });
            }
        });

        FakePrinter {
            host: addr.ip().to_string(),
            port: addr.port(),
            received,
            connections,
            reset_next,
        }
    }

    pub fn fail_next_connections(&self, n: u32) {
        self.reset_next.store(n, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> u32 {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().await.clone()
    }

    pub async fn wait_for_job(&self) -> Vec<u8> {
        for _ in 0..200 {
            if let Some(buffer) = self.received.lock().await.first().cloned() {
                return buffer;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("fake printer never received a job");
    }
}

pub const TEST_USER_ID: &str = "user-1";
pub const TEST_RESTAURANT_ID: &str = "rest-1";

pub fn test_session() -> SessionSnapshot {
    SessionSnapshot {
        access_token: "test-access".into(),
        refresh_token: "test-refresh".into(),
        expires_at: Some(chrono::Utc::now().timestamp() + 3600),
    }
}

/// Backend with the calls every tick makes: auth user, owned-restaurant
/// lookup, heartbeat RPCs. Job-family RPCs are left to each test.
pub async fn mock_backend() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/v1/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": TEST_USER_ID,
            "email": "titolare@aoyama.it",
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/restaurants"))
        .and(query_param("owner_id", format!("eq.{}", TEST_USER_ID)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": TEST_RESTAURANT_ID, "name": "Aoyama", "city": "Milano"}
        ])))
        .mount(&server)
        .await;

    mount_rpc(&server, "printing_list_agents", json!([])).await;
    mount_rpc(&server, "printing_register_agent", json!({"printer_id": null})).await;

    server
}

pub async fn mount_rpc(server: &MockServer, function: &str, response: Value) {
    Mock::given(method("POST"))
        .and(path(format!("/rest/v1/rpc/{}", function)))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .mount(server)
        .await;
}

/// Respond once with `response`, then fall through to later mounts.
pub async fn mount_rpc_once(server: &MockServer, function: &str, response: Value) {
    Mock::given(method("POST"))
        .and(path(format!("/rest/v1/rpc/{}", function)))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

/// PostgREST's answer when a migration has not been applied.
pub async fn mount_rpc_missing(server: &MockServer, function: &str) {
    Mock::given(method("POST"))
        .and(path(format!("/rest/v1/rpc/{}", function)))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "message": format!("Could not find the function {} in schema cache", function),
        })))
        .mount(server)
        .await;
}

/// The live printer table read (`restaurants.settings`).
pub async fn mount_settings(server: &MockServer, settings: Value) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/restaurants"))
        .and(query_param("id", format!("eq.{}", TEST_RESTAURANT_ID)))
        .and(query_param("select", "settings"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{"settings": settings}])),
        )
        .mount(server)
        .await;
}

pub async fn rpc_request_bodies(server: &MockServer, function: &str) -> Vec<Value> {
    let wanted = format!("/rest/v1/rpc/{}", function);
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == wanted)
        .map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
        .collect()
}

pub async fn rpc_call_count(server: &MockServer, function: &str) -> usize {
    rpc_request_bodies(server, function).await.len()
}

/// Worker wired to the mock backend, with a deterministic consumer id, the
/// fastest legal poll interval, and a fresh session already synced.
pub async fn worker_against(server: &MockServer, dir: &std::path::Path) -> PrintWorker {
    let worker = PrintWorker::new(
        StateStore::new(dir),
        BackendSettings {
            supabase_url: server.uri(),
            supabase_anon_key: "anon-test".into(),
        },
    );

    worker
        .save_config(AgentConfigPatch {
            consumer_id: Some("bridge-test".into()),
            poll_ms: Some(1000),
            ..Default::default()
        })
        .await
        .expect("save test config");

    worker
        .sync_session(test_session())
        .await
        .expect("sync test session");

    worker
}

/// Wait (max 10 s) for a state snapshot satisfying the predicate.
pub async fn wait_for_state<F>(worker: &PrintWorker, pred: F) -> PublicState
where
    F: Fn(&PublicState) -> bool,
{
    let mut rx = worker.subscribe_state();
    let current = worker.public_state().await;
    if pred(&current) {
        return current;
    }

    tokio::time::timeout(Duration::from_secs(10), async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    if pred(&snapshot) {
                        return snapshot;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => panic!("state stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for state")
}
