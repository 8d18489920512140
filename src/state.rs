use crate::config::AgentConfig;
use crate::session::{AuthState, RestaurantScope};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Counters for the current service run. Monotonic while the service runs,
/// reset by every start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub claimed: u64,
    pub printed: u64,
    pub failed: u64,
    pub last_run_at: Option<i64>,
    pub last_error: Option<String>,
}

impl RuntimeStats {
    pub fn reset(&mut self) {
        *self = RuntimeStats::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRow {
    pub at: i64,
    pub level: LogLevel,
    pub message: String,
}

pub const LOG_CAPACITY: usize = 500;

/// Bounded log history mirrored to the shell. Oldest rows are evicted first.
#[derive(Debug, Default)]
pub struct LogBuffer {
    rows: VecDeque<LogRow>,
}

impl LogBuffer {
    pub fn push(&mut self, row: LogRow) {
        if self.rows.len() == LOG_CAPACITY {
            self.rows.pop_front();
        }
        self.rows.push_back(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &LogRow> {
        self.rows.iter()
    }
}

/// One-shot availability flags for optional backend job families.
/// Cleared when the backend reports the function missing; only a service
/// restart re-arms them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcAvailability {
    pub physical_receipt_rpc_available: bool,
    pub non_fiscal_receipt_rpc_available: bool,
}

impl Default for RpcAvailability {
    fn default() -> Self {
        Self {
            physical_receipt_rpc_available: true,
            non_fiscal_receipt_rpc_available: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub running: bool,
    pub processing: bool,
    pub assigned_printer_id: Option<String>,
}

/// Full snapshot pushed to the shell. Scalars are copied, collections are
/// cloned, so the receiver can never alias worker internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicState {
    pub config: AgentConfig,
    pub user: Option<PublicUser>,
    pub restaurant: Option<RestaurantScope>,
    pub service: ServiceState,
    pub stats: RuntimeStats,
    pub rpc: RpcAvailability,
    pub app_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: String,
    pub email: String,
}

impl PublicState {
    pub fn from_parts(
        config: &AgentConfig,
        auth: &AuthState,
        service: &ServiceState,
        stats: &RuntimeStats,
        rpc: &RpcAvailability,
    ) -> Self {
        Self {
            config: config.clone(),
            user: auth.user.as_ref().map(|u| PublicUser {
                id: u.id.clone(),
                email: u.email.clone(),
            }),
            restaurant: auth.restaurant.clone(),
            service: service.clone(),
            stats: stats.clone(),
            rpc: rpc.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
