use crate::config::{
    same_session, AgentConfig, AgentConfigPatch, BackendSettings, PersistedState, SessionSnapshot,
    StateStore,
};
use crate::discovery::{self, DiscoveredPrinter, DiscoveredRtDevice};
use crate::errors::{truncate_error, BridgeError, Result};
use crate::escpos::{render_courtesy_receipt, render_kitchen_ticket};
use crate::fpmate;
use crate::jobs::{
    loose_string, loose_u64, FiscalJob, KitchenJob, NonFiscalJob, RtRoute,
};
use crate::routes::{resolve_kitchen_target, sanitize_printer_port, LiveRoutes, PrintTarget};
use crate::session::{AuthState, RestaurantScope, SessionManager};
use crate::state::{
    LogBuffer, LogLevel, LogRow, PublicState, RpcAvailability, RuntimeStats, ServiceState,
};
use crate::supabase::{is_missing_function_error, SupabaseClient};
use crate::transport::{
    post_fiscal_document, send_raw_tcp, FISCAL_TEST_TIMEOUT, FISCAL_TIMEOUT,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RPC_PRINT_CLAIM: &str = "print_claim_jobs";
const RPC_PRINT_COMPLETE: &str = "print_complete_job";
const RPC_FISCAL_CLAIM: &str = "physical_receipt_claim_jobs";
const RPC_FISCAL_COMPLETE: &str = "physical_receipt_complete_job";
const RPC_NON_FISCAL_CLAIM: &str = "non_fiscal_receipt_claim_jobs";
const RPC_NON_FISCAL_COMPLETE: &str = "non_fiscal_receipt_complete_job";
const RPC_LIST_AGENTS: &str = "printing_list_agents";
const RPC_REGISTER_AGENT: &str = "printing_register_agent";

/// Request coming from the setup UI to test a fiscal device.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtTestRequest {
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    pub brand: Option<String>,
    pub api_path: Option<String>,
}

struct WorkerState {
    config: AgentConfig,
    session: Option<SessionSnapshot>,
    auth: AuthState,
    service: ServiceState,
    stats: RuntimeStats,
    rpc: RpcAvailability,
    logs: LogBuffer,
    loop_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<Notify>,
}

struct Inner {
    backend: SupabaseClient,
    store: StateStore,
    state: Mutex<WorkerState>,
    state_tx: broadcast::Sender<PublicState>,
    log_tx: broadcast::Sender<LogRow>,
}

/// The print worker singleton. Owns every piece of mutable state; control
/// operations and the tick loop are the only mutators, and both go through
/// the single state lock.
#[derive(Clone)]
pub struct PrintWorker {
    inner: Arc<Inner>,
}

impl PrintWorker {
    pub fn new(store: StateStore, backend: BackendSettings) -> Self {
        let persisted = store.load();
        let (state_tx, _) = broadcast::channel(64);
        let (log_tx, _) = broadcast::channel(256);

        let inner = Inner {
            backend: SupabaseClient::new(backend.supabase_url, backend.supabase_anon_key),
            store,
            state: Mutex::new(WorkerState {
                config: persisted.config,
                session: persisted.session,
                auth: AuthState::default(),
                service: ServiceState::default(),
                stats: RuntimeStats::default(),
                rpc: RpcAvailability::default(),
                logs: LogBuffer::default(),
                loop_handle: None,
                stop_signal: Arc::new(Notify::new()),
            }),
            state_tx,
            log_tx,
        };

        Self { inner: Arc::new(inner) }
    }

    /// `printer-state` push stream.
    pub fn subscribe_state(&self) -> broadcast::Receiver<PublicState> {
        self.inner.state_tx.subscribe()
    }

    /// `printer-log` push stream.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogRow> {
        self.inner.log_tx.subscribe()
    }

    pub async fn public_state(&self) -> PublicState {
        let state = self.inner.state.lock().await;
        self.inner.snapshot_locked(&state)
    }

    pub async fn auto_start_requested(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.config.auto_start
    }

    /// Merge a partial config, sanitize, persist, broadcast.
    pub async fn save_config(&self, patch: AgentConfigPatch) -> Result<PublicState> {
        let mut state = self.inner.state.lock().await;
        let merged = state.config.merged(&patch);
        if merged != state.config {
            state.config = merged;
            self.inner.persist_locked(&state)?;
            self.inner
                .log_locked(&mut state, LogLevel::Info, "Configurazione salvata".to_string());
            self.inner.broadcast_locked(&state);
        }
        Ok(self.inner.snapshot_locked(&state))
    }

    /// Adopt a session handed over by the shell. Equal snapshots are a no-op
    /// (no state mutation, no disk write).
    pub async fn sync_session(&self, raw: SessionSnapshot) -> Result<PublicState> {
        if !raw.is_usable() {
            return Err(BridgeError::SessionInvalid("Token di sessione mancanti".into()));
        }

        let auto_start = {
            let mut state = self.inner.state.lock().await;
            if state.session.as_ref().map(|s| same_session(s, &raw)).unwrap_or(false) {
                debug!("sync_session: snapshot unchanged, skipping");
                return Ok(self.inner.snapshot_locked(&state));
            }

            state.session = Some(raw);
            state.auth = AuthState::default();
            self.inner.persist_locked(&state)?;
            self.inner
                .log_locked(&mut state, LogLevel::Info, "Sessione sincronizzata".to_string());
            self.inner.broadcast_locked(&state);
            state.config.auto_start && !state.service.running
        };

        if auto_start {
            if let Err(e) = self.start_service().await {
                self.inner
                    .log(LogLevel::Warn, format!("Avvio automatico fallito: {}", e))
                    .await;
            }
        }

        Ok(self.public_state().await)
    }

    /// Wipe auth and stop the service.
    pub async fn clear_session(&self) -> Result<PublicState> {
        let _ = self.stop_service().await;

        let mut state = self.inner.state.lock().await;
        state.session = None;
        state.auth = AuthState::default();
        self.inner.persist_locked(&state)?;
        self.inner
            .log_locked(&mut state, LogLevel::Info, "Sessione rimossa".to_string());
        self.inner.broadcast_locked(&state);
        Ok(self.inner.snapshot_locked(&state))
    }

    /// Idempotent. Resets run counters and re-arms the RPC availability
    /// flags, then spawns the tick loop.
    pub async fn start_service(&self) -> Result<PublicState> {
        let mut state = self.inner.state.lock().await;
        if state.service.running {
            return Ok(self.inner.snapshot_locked(&state));
        }

        state.stats.reset();
        state.rpc = RpcAvailability::default();
        state.service.running = true;
        state.service.processing = false;
        state.stop_signal = Arc::new(Notify::new());
        self.inner
            .log_locked(&mut state, LogLevel::Info, "Servizio di stampa avviato".to_string());
        self.inner.broadcast_locked(&state);

        let loop_inner = self.inner.clone();
        let stop = state.stop_signal.clone();
        state.loop_handle = Some(tokio::spawn(async move {
            loop_inner.run_loop(stop).await;
        }));

        Ok(self.inner.snapshot_locked(&state))
    }

    /// Idempotent. Cancels the next-tick timer but never aborts an in-flight
    /// tick; returns once the loop has wound down, after a best-effort
    /// `is_active=false` heartbeat.
    pub async fn stop_service(&self) -> Result<PublicState> {
        let (handle, stop, scope) = {
            let mut state = self.inner.state.lock().await;
            if !state.service.running && state.loop_handle.is_none() {
                return Ok(self.inner.snapshot_locked(&state));
            }
            state.service.running = false;
            (
                state.loop_handle.take(),
                state.stop_signal.clone(),
                state.auth.restaurant.clone(),
            )
        };

        stop.notify_one();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if let Some(scope) = scope {
            if let Err(e) = self.inner.register_agent(&scope.id, false).await {
                debug!("Final heartbeat failed: {}", e);
            }
        }

        let mut state = self.inner.state.lock().await;
        state.service.processing = false;
        self.inner
            .log_locked(&mut state, LogLevel::Info, "Servizio di stampa fermato".to_string());
        self.inner.broadcast_locked(&state);
        Ok(self.inner.snapshot_locked(&state))
    }

    pub async fn discover_printers(&self, timeout_ms: Option<u64>) -> Vec<DiscoveredPrinter> {
        self.inner
            .log(LogLevel::Info, "Ricerca stampanti sulla rete locale".to_string())
            .await;
        let found = discovery::discover_printers(timeout_ms).await;
        self.inner
            .log(LogLevel::Info, format!("Ricerca completata: {} stampanti", found.len()))
            .await;
        found
    }

    pub async fn discover_rt_devices(&self, timeout_ms: Option<u64>) -> Vec<DiscoveredRtDevice> {
        self.inner
            .log(LogLevel::Info, "Ricerca registratori telematici sulla rete".to_string())
            .await;
        let found = discovery::discover_rt_devices(timeout_ms).await;
        self.inner
            .log(LogLevel::Info, format!("Ricerca completata: {} dispositivi RT", found.len()))
            .await;
        found
    }

    /// Send the non-fiscal connectivity document to an RT device and report
    /// any receipt id the device answered with.
    pub async fn test_rt_receipt(&self, request: RtTestRequest) -> Result<Option<String>> {
        if request.host.trim().is_empty() {
            return Err(BridgeError::RtHostMissing);
        }

        let brand = request.brand.unwrap_or_else(|| "epson".to_string()).to_lowercase();
        let route = RtRoute {
            host: request.host.trim().to_string(),
            port: request.port.filter(|p| *p > 0).unwrap_or(crate::jobs::RT_DEFAULT_PORT),
            api_path: request
                .api_path
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| crate::jobs::default_api_path(&brand).to_string()),
            brand,
        };

        self.inner
            .log(
                LogLevel::Info,
                format!("Test scontrino verso {}:{}{}", route.host, route.port, route.api_path),
            )
            .await;

        let outcome = post_fiscal_document(&route, &fpmate::test_document(), FISCAL_TEST_TIMEOUT).await?;
        Ok(outcome.receipt_id)
    }
}

impl Inner {
    fn snapshot_locked(&self, state: &WorkerState) -> PublicState {
        PublicState::from_parts(&state.config, &state.auth, &state.service, &state.stats, &state.rpc)
    }

    fn broadcast_locked(&self, state: &WorkerState) {
        let _ = self.state_tx.send(self.snapshot_locked(state));
    }

    fn persist_locked(&self, state: &WorkerState) -> Result<()> {
        self.store.save(&PersistedState {
            config: state.config.clone(),
            session: state.session.clone(),
        })
    }

    fn log_locked(&self, state: &mut WorkerState, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        let row = LogRow {
            at: chrono::Utc::now().timestamp(),
            level,
            message,
        };
        state.logs.push(row.clone());
        let _ = self.log_tx.send(row);
    }

    async fn log(&self, level: LogLevel, message: String) {
        let mut state = self.state.lock().await;
        self.log_locked(&mut state, level, message);
    }

    // =========================================================================
    // Tick loop
    // =========================================================================

    async fn run_loop(self: Arc<Self>, stop: Arc<Notify>) {
        info!("Print worker loop started");
        loop {
            let entered = {
                let mut state = self.state.lock().await;
                if !state.service.running {
                    break;
                }
                if state.service.processing {
                    false
                } else {
                    state.service.processing = true;
                    true
                }
            };

            if entered {
                self.tick().await;
                let mut state = self.state.lock().await;
                state.service.processing = false;
                self.broadcast_locked(&state);
            }

            let poll_ms = {
                let state = self.state.lock().await;
                if !state.service.running {
                    break;
                }
                state.config.poll_ms
            };

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(poll_ms)) => {}
                _ = stop.notified() => {}
            }
        }
        info!("Print worker loop ended");
    }

    async fn tick(&self) {
        let result = self.run_tick().await;

        let mut state = self.state.lock().await;
        state.stats.last_run_at = Some(chrono::Utc::now().timestamp());
        match result {
            Ok(()) => {
                state.stats.last_error = None;
            }
            Err(e) => {
                let message = truncate_error(&e.to_string());
                state.stats.last_error = Some(message.clone());
                self.log_locked(&mut state, LogLevel::Error, format!("Ciclo fallito: {}", message));
            }
        }
        self.broadcast_locked(&state);
    }

    async fn run_tick(&self) -> Result<()> {
        let (snapshot, cached_user) = {
            let state = self.state.lock().await;
            (state.session.clone(), state.auth.user.clone())
        };

        let outcome =
            SessionManager::ensure_signed_in(&self.backend, snapshot.as_ref(), cached_user.as_ref())
                .await?;

        if let Some(rotated) = &outcome.rotated {
            let mut state = self.state.lock().await;
            state.session = Some(rotated.clone());
            self.persist_locked(&state)?;
        }

        {
            let mut state = self.state.lock().await;
            let changed =
                state.auth.user.as_ref().map(|u| u.id.as_str()) != Some(outcome.user.id.as_str());
            state.auth.user = Some(outcome.user.clone());
            if changed {
                self.broadcast_locked(&state);
            }
        }

        let scope = match self.current_scope(&outcome.user.id).await? {
            Some(scope) => scope,
            None => {
                self.log(
                    LogLevel::Warn,
                    "Nessun ristorante associato all'utente, ciclo saltato".to_string(),
                )
                .await;
                return Ok(());
            }
        };

        self.heartbeat(&scope).await;

        self.process_kitchen_jobs(&scope).await?;
        self.process_fiscal_jobs(&scope).await;
        self.process_non_fiscal_jobs(&scope).await;

        Ok(())
    }

    async fn current_scope(&self, user_id: &str) -> Result<Option<RestaurantScope>> {
        {
            let state = self.state.lock().await;
            if let Some(scope) = &state.auth.restaurant {
                return Ok(Some(scope.clone()));
            }
        }

        let resolved =
            SessionManager::resolve_restaurant_for_current_user(&self.backend, user_id).await?;
        if let Some(scope) = &resolved {
            let mut state = self.state.lock().await;
            state.auth.restaurant = Some(scope.clone());
            self.log_locked(
                &mut state,
                LogLevel::Info,
                format!("Ristorante attivo: {} ({:?})", scope.name, scope.role),
            );
            self.broadcast_locked(&state);
        }
        Ok(resolved)
    }

    // =========================================================================
    // Heartbeat & assignment
    // =========================================================================

    async fn heartbeat(&self, scope: &RestaurantScope) {
        if let Err(e) = self.register_agent(&scope.id, true).await {
            self.log(LogLevel::Warn, format!("Heartbeat fallito: {}", e)).await;
        }
    }

    /// Observe the server-side printer assignment, then register this agent.
    /// Returns the assignment the server answered with.
    async fn register_agent(&self, restaurant_id: &str, is_active: bool) -> Result<Option<String>> {
        let (consumer_id, device_name, cached_assignment) = {
            let state = self.state.lock().await;
            (
                state.config.consumer_id.clone(),
                state.config.device_name.clone(),
                state.service.assigned_printer_id.clone(),
            )
        };

        // The server's view wins over whatever we cached locally.
        let mut printer_id = cached_assignment;
        match self
            .backend
            .rpc(RPC_LIST_AGENTS, json!({ "p_restaurant_id": restaurant_id }))
            .await
        {
            Ok(rows) => {
                let server_side = rows.as_array().and_then(|rows| {
                    rows.iter()
                        .find(|row| {
                            row.get("agent_id").and_then(|v| v.as_str()) == Some(consumer_id.as_str())
                        })
                        .and_then(|row| row.get("printer_id"))
                        .and_then(loose_string)
                });
                if let Some(assignment) = server_side {
                    printer_id = Some(assignment);
                }
            }
            Err(e) => debug!("printing_list_agents unavailable: {}", e),
        }

        let response = self
            .backend
            .rpc(
                RPC_REGISTER_AGENT,
                json!({
                    "p_restaurant_id": restaurant_id,
                    "p_agent_id": consumer_id,
                    "p_printer_id": printer_id,
                    "p_device_name": device_name,
                    "p_app_version": env!("CARGO_PKG_VERSION"),
                    "p_is_active": is_active,
                }),
            )
            .await?;

        let assigned = response
            .get("printer_id")
            .or_else(|| response.as_array().and_then(|a| a.first()).and_then(|r| r.get("printer_id")))
            .and_then(loose_string);

        let mut state = self.state.lock().await;
        if state.service.assigned_printer_id != assigned {
            state.service.assigned_printer_id = assigned.clone();
            self.broadcast_locked(&state);
        }
        Ok(assigned)
    }

    // =========================================================================
    // Kitchen family
    // =========================================================================

    async fn claim_params(&self, restaurant_id: &str) -> (String, Value) {
        let state = self.state.lock().await;
        let consumer = state.config.consumer_id.clone();
        let params = json!({
            "p_restaurant_id": restaurant_id,
            "p_consumer_id": consumer,
            "p_limit": state.config.claim_limit,
        });
        (consumer, params)
    }

    async fn process_kitchen_jobs(&self, scope: &RestaurantScope) -> Result<()> {
        let (consumer_id, params) = self.claim_params(&scope.id).await;
        let claimed = self.backend.rpc(RPC_PRINT_CLAIM, params).await?;
        let rows = claimed.as_array().cloned().unwrap_or_default();
        if rows.is_empty() {
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            state.stats.claimed += rows.len() as u64;
            self.log_locked(
                &mut state,
                LogLevel::Info,
                format!("{} comande da stampare", rows.len()),
            );
        }

        // One settings read per tick, shared by every claimed job.
        let routes = match self.fetch_live_routes(&scope.id).await {
            Ok(routes) => routes,
            Err(e) => {
                self.log(
                    LogLevel::Warn,
                    format!("Lettura stampanti del ristorante fallita: {}", e),
                )
                .await;
                LiveRoutes::default()
            }
        };

        for row in rows {
            let job = match KitchenJob::from_row(&row) {
                Ok(job) => job,
                Err(e) => {
                    // No id means no ack is possible; skip the row.
                    self.log(LogLevel::Warn, format!("Comanda scartata: {}", e)).await;
                    continue;
                }
            };

            let outcome = self.print_kitchen_job(&job, &routes).await;
            self.ack_kitchen_job(&consumer_id, &job, outcome).await;
        }

        Ok(())
    }

    async fn print_kitchen_job(
        &self,
        job: &KitchenJob,
        routes: &LiveRoutes,
    ) -> Result<(PrintTarget, u32)> {
        let target = resolve_kitchen_target(job, routes)?;
        let bytes = render_kitchen_ticket(&job.ticket());
        debug!(
            "Kitchen job {} -> {}:{} ({} bytes)",
            job.id, target.host, target.port, bytes.len()
        );
        let attempts = send_raw_tcp(&target.host, target.port, &bytes).await?;
        Ok((target, attempts))
    }

    async fn ack_kitchen_job(
        &self,
        consumer_id: &str,
        job: &KitchenJob,
        outcome: Result<(PrintTarget, u32)>,
    ) {
        let (success, error, meta) = match &outcome {
            Ok((target, attempts)) => (
                true,
                Value::Null,
                json!({
                    "printer": {"id": target.id, "name": target.name, "host": target.host, "port": target.port},
                    "attempts": attempts,
                }),
            ),
            Err(e) => (
                false,
                Value::String(truncate_error(&e.to_string())),
                json!({ "department": job.department }),
            ),
        };

        let ack = self
            .backend
            .rpc(
                RPC_PRINT_COMPLETE,
                json!({
                    "p_job_id": job.id,
                    "p_consumer_id": consumer_id,
                    "p_success": success,
                    "p_error": error,
                    "p_meta": meta,
                }),
            )
            .await;

        let mut state = self.state.lock().await;
        match &outcome {
            Ok(_) => {
                state.stats.printed += 1;
                self.log_locked(
                    &mut state,
                    LogLevel::Info,
                    format!("Comanda {} stampata", job.id),
                );
            }
            Err(e) => {
                state.stats.failed += 1;
                self.log_locked(
                    &mut state,
                    LogLevel::Error,
                    format!("Comanda {} fallita: {}", job.id, truncate_error(&e.to_string())),
                );
            }
        }
        if let Err(e) = ack {
            // A lost ack must not take the tick down with it.
            self.log_locked(
                &mut state,
                LogLevel::Warn,
                format!("Conferma comanda {} non riuscita: {}", job.id, e),
            );
        }
    }

    // =========================================================================
    // Fiscal family
    // =========================================================================

    async fn process_fiscal_jobs(&self, scope: &RestaurantScope) {
        let available = {
            let state = self.state.lock().await;
            state.rpc.physical_receipt_rpc_available
        };
        if !available {
            return;
        }

        let (consumer_id, params) = self.claim_params(&scope.id).await;
        let rows = match self.backend.rpc(RPC_FISCAL_CLAIM, params).await {
            Ok(value) => value.as_array().cloned().unwrap_or_default(),
            Err(e) => {
                if is_missing_function_error(&e, RPC_FISCAL_CLAIM) {
                    self.disable_fiscal_family(RPC_FISCAL_CLAIM).await;
                } else {
                    self.log(LogLevel::Warn, format!("Prelievo scontrini fallito: {}", e)).await;
                }
                return;
            }
        };
        if rows.is_empty() {
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.stats.claimed += rows.len() as u64;
            self.log_locked(
                &mut state,
                LogLevel::Info,
                format!("{} scontrini fiscali da emettere", rows.len()),
            );
        }

        for row in rows {
            let job = match FiscalJob::from_row(&row) {
                Ok(job) => job,
                Err(e) => {
                    self.log(LogLevel::Warn, format!("Scontrino scartato: {}", e)).await;
                    continue;
                }
            };

            let outcome = self.print_fiscal_job(&job, row.get("route")).await;
            let aborted = self.ack_fiscal_job(&consumer_id, &job, outcome).await;
            if aborted {
                // The complete RPC itself is missing; the family is done.
                return;
            }
        }
    }

    async fn print_fiscal_job(
        &self,
        job: &FiscalJob,
        row_route: Option<&Value>,
    ) -> Result<(RtRoute, String, u32)> {
        let route = job.route(row_route).ok_or(BridgeError::RtHostMissing)?;
        let receipt = job.receipt();
        let document = fpmate::fiscal_receipt_document(&receipt);
        debug!(
            "Fiscal job {} -> {}:{}{} ({} EUR)",
            job.id, route.host, route.port, route.api_path, receipt.total_amount
        );

        let outcome = post_fiscal_document(&route, &document, FISCAL_TIMEOUT).await?;
        let receipt_id = outcome
            .receipt_id
            .unwrap_or_else(|| synthetic_receipt_id(&job.id));
        Ok((route, receipt_id, outcome.attempts))
    }

    /// Acks the job either way. Returns true when the family has to stop
    /// because the complete RPC is missing.
    async fn ack_fiscal_job(
        &self,
        consumer_id: &str,
        job: &FiscalJob,
        outcome: Result<(RtRoute, String, u32)>,
    ) -> bool {
        let (success, receipt_id, error, meta) = match &outcome {
            Ok((route, receipt_id, attempts)) => (
                true,
                Value::String(receipt_id.clone()),
                Value::Null,
                json!({
                    "device": {"host": route.host, "port": route.port, "brand": route.brand},
                    "attempts": attempts,
                }),
            ),
            Err(e) => (
                false,
                Value::Null,
                Value::String(truncate_error(&e.to_string())),
                json!({}),
            ),
        };

        let ack = self
            .backend
            .rpc(
                RPC_FISCAL_COMPLETE,
                json!({
                    "p_job_id": job.id,
                    "p_consumer_id": consumer_id,
                    "p_success": success,
                    "p_receipt_id": receipt_id,
                    "p_error": error,
                    "p_meta": meta,
                }),
            )
            .await;

        {
            let mut state = self.state.lock().await;
            match &outcome {
                Ok((_, receipt_id, _)) => {
                    state.stats.printed += 1;
                    self.log_locked(
                        &mut state,
                        LogLevel::Info,
                        format!("Scontrino {} emesso ({})", job.id, receipt_id),
                    );
                }
                Err(e) => {
                    state.stats.failed += 1;
                    self.log_locked(
                        &mut state,
                        LogLevel::Error,
                        format!("Scontrino {} fallito: {}", job.id, truncate_error(&e.to_string())),
                    );
                }
            }
        }

        match ack {
            Ok(_) => false,
            Err(e) if is_missing_function_error(&e, RPC_FISCAL_COMPLETE) => {
                self.disable_fiscal_family(RPC_FISCAL_COMPLETE).await;
                true
            }
            Err(e) => {
                self.log(
                    LogLevel::Warn,
                    format!("Conferma scontrino {} non riuscita: {}", job.id, e),
                )
                .await;
                false
            }
        }
    }

    async fn disable_fiscal_family(&self, function: &str) {
        let mut state = self.state.lock().await;
        if state.rpc.physical_receipt_rpc_available {
            state.rpc.physical_receipt_rpc_available = false;
            self.log_locked(
                &mut state,
                LogLevel::Warn,
                format!(
                    "RPC {} assente nel backend: scontrini fiscali sospesi fino al riavvio del servizio",
                    function
                ),
            );
            self.broadcast_locked(&state);
        }
    }

    // =========================================================================
    // Non-fiscal receipt family
    // =========================================================================

    async fn process_non_fiscal_jobs(&self, scope: &RestaurantScope) {
        let available = {
            let state = self.state.lock().await;
            state.rpc.non_fiscal_receipt_rpc_available
        };
        if !available {
            return;
        }

        let (consumer_id, params) = self.claim_params(&scope.id).await;
        let rows = match self.backend.rpc(RPC_NON_FISCAL_CLAIM, params).await {
            Ok(value) => value.as_array().cloned().unwrap_or_default(),
            Err(e) => {
                if is_missing_function_error(&e, RPC_NON_FISCAL_CLAIM) {
                    self.disable_non_fiscal_family(RPC_NON_FISCAL_CLAIM).await;
                } else {
                    self.log(LogLevel::Warn, format!("Prelievo pre-conti fallito: {}", e)).await;
                }
                return;
            }
        };
        if rows.is_empty() {
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.stats.claimed += rows.len() as u64;
            self.log_locked(
                &mut state,
                LogLevel::Info,
                format!("{} pre-conti da stampare", rows.len()),
            );
        }

        for row in rows {
            let job = match NonFiscalJob::from_row(&row) {
                Ok(job) => job,
                Err(e) => {
                    self.log(LogLevel::Warn, format!("Pre-conto scartato: {}", e)).await;
                    continue;
                }
            };

            let outcome = self.print_non_fiscal_job(&job).await;
            let aborted = self.ack_non_fiscal_job(&consumer_id, &job, outcome).await;
            if aborted {
                return;
            }
        }
    }

    async fn print_non_fiscal_job(&self, job: &NonFiscalJob) -> Result<(String, u16, u32)> {
        let route = job.payload.get("route").ok_or(BridgeError::NoPrinterHost)?;
        let host = route
            .get("host")
            .and_then(loose_string)
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .ok_or(BridgeError::NoPrinterHost)?;
        let port = sanitize_printer_port(route.get("port").and_then(loose_u64).map(|p| p as i64));

        let bytes = render_courtesy_receipt(&job.receipt());
        debug!("Non-fiscal job {} -> {}:{} ({} bytes)", job.id, host, port, bytes.len());
        let attempts = send_raw_tcp(&host, port, &bytes).await?;
        Ok((host, port, attempts))
    }

    async fn ack_non_fiscal_job(
        &self,
        consumer_id: &str,
        job: &NonFiscalJob,
        outcome: Result<(String, u16, u32)>,
    ) -> bool {
        let (success, error, meta) = match &outcome {
            Ok((host, port, attempts)) => (
                true,
                Value::Null,
                json!({ "printer": {"host": host, "port": port}, "attempts": attempts }),
            ),
            Err(e) => (
                false,
                Value::String(truncate_error(&e.to_string())),
                json!({}),
            ),
        };

        let ack = self
            .backend
            .rpc(
                RPC_NON_FISCAL_COMPLETE,
                json!({
                    "p_job_id": job.id,
                    "p_consumer_id": consumer_id,
                    "p_success": success,
                    "p_error": error,
                    "p_meta": meta,
                }),
            )
            .await;

        {
            let mut state = self.state.lock().await;
            match &outcome {
                Ok(_) => {
                    state.stats.printed += 1;
                    self.log_locked(
                        &mut state,
                        LogLevel::Info,
                        format!("Pre-conto {} stampato", job.id),
                    );
                }
                Err(e) => {
                    state.stats.failed += 1;
                    self.log_locked(
                        &mut state,
                        LogLevel::Error,
                        format!("Pre-conto {} fallito: {}", job.id, truncate_error(&e.to_string())),
                    );
                }
            }
        }

        match ack {
            Ok(_) => false,
            Err(e) if is_missing_function_error(&e, RPC_NON_FISCAL_COMPLETE) => {
                self.disable_non_fiscal_family(RPC_NON_FISCAL_COMPLETE).await;
                true
            }
            Err(e) => {
                self.log(
                    LogLevel::Warn,
                    format!("Conferma pre-conto {} non riuscita: {}", job.id, e),
                )
                .await;
                false
            }
        }
    }

    async fn disable_non_fiscal_family(&self, function: &str) {
        let mut state = self.state.lock().await;
        if state.rpc.non_fiscal_receipt_rpc_available {
            state.rpc.non_fiscal_receipt_rpc_available = false;
            self.log_locked(
                &mut state,
                LogLevel::Warn,
                format!(
                    "RPC {} assente nel backend: pre-conti sospesi fino al riavvio del servizio",
                    function
                ),
            );
            self.broadcast_locked(&state);
        }
    }

    // =========================================================================
    // Live printer table
    // =========================================================================

    async fn fetch_live_routes(&self, restaurant_id: &str) -> Result<LiveRoutes> {
        let rows = self
            .backend
            .select(
                "restaurants",
                &[
                    ("id", format!("eq.{}", restaurant_id)),
                    ("select", "settings".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;

        let settings = rows
            .first()
            .and_then(|row| row.get("settings"))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(LiveRoutes::from_settings(&settings))
    }
}

/// `RT-<id8>-<now>`: fallback receipt id when the device answers 2xx without
/// any recognizable identifier.
fn synthetic_receipt_id(job_id: &str) -> String {
    let id8: String = job_id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
    let id8 = if id8.is_empty() { "rt".to_string() } else { id8 };
    format!("RT-{}-{}", id8, chrono::Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_receipt_id_shape() {
        let id = synthetic_receipt_id("abc-1234-def");
        let re = regex::Regex::new(r"^RT-[a-zA-Z0-9]{1,8}-\d+$").unwrap();
        assert!(re.is_match(&id), "unexpected id: {}", id);
        assert!(id.starts_with("RT-abc1234d-"));
    }

    #[test]
    fn test_synthetic_receipt_id_empty_job() {
        let id = synthetic_receipt_id("---");
        assert!(id.starts_with("RT-rt-"));
    }
}
