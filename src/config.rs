use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const POLL_MS_DEFAULT: u64 = 2500;
pub const POLL_MS_MIN: u64 = 1000;
pub const POLL_MS_MAX: u64 = 10_000;
pub const CLAIM_LIMIT_DEFAULT: u32 = 5;
pub const CLAIM_LIMIT_MIN: u32 = 1;
pub const CLAIM_LIMIT_MAX: u32 = 20;

const CONSUMER_ID_MAX: usize = 64;
const DEVICE_NAME_MAX: usize = 80;
const DEVICE_NAME_DEFAULT: &str = "Sushiamo Bridge";

/// Persistent agent configuration. Every field goes through `sanitized()`
/// before it is stored or used, so a round-trip through disk is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub consumer_id: String,
    pub device_name: String,
    pub poll_ms: u64,
    pub claim_limit: u32,
    pub auto_start: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            consumer_id: default_consumer_id(),
            device_name: DEVICE_NAME_DEFAULT.to_string(),
            poll_ms: POLL_MS_DEFAULT,
            claim_limit: CLAIM_LIMIT_DEFAULT,
            auto_start: false,
        }
    }
}

/// Partial update coming from the shell's save-config call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfigPatch {
    pub consumer_id: Option<String>,
    pub device_name: Option<String>,
    pub poll_ms: Option<u64>,
    pub claim_limit: Option<u32>,
    pub auto_start: Option<bool>,
}

impl AgentConfig {
    pub fn sanitized(&self) -> Self {
        Self {
            consumer_id: sanitize_consumer_id(&self.consumer_id),
            device_name: sanitize_device_name(&self.device_name),
            poll_ms: sanitize_poll_ms(self.poll_ms),
            claim_limit: sanitize_claim_limit(self.claim_limit),
            auto_start: self.auto_start,
        }
    }

    pub fn merged(&self, patch: &AgentConfigPatch) -> Self {
        Self {
            consumer_id: patch.consumer_id.clone().unwrap_or_else(|| self.consumer_id.clone()),
            device_name: patch.device_name.clone().unwrap_or_else(|| self.device_name.clone()),
            poll_ms: patch.poll_ms.unwrap_or(self.poll_ms),
            claim_limit: patch.claim_limit.unwrap_or(self.claim_limit),
            auto_start: patch.auto_start.unwrap_or(self.auto_start),
        }
        .sanitized()
    }
}

/// Lowercase alphanumerics plus `._:-`, at most 64 chars; never empty.
pub fn sanitize_consumer_id(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
        .take(CONSUMER_ID_MAX)
        .collect();

    if cleaned.is_empty() {
        default_consumer_id()
    } else {
        cleaned
    }
}

pub fn sanitize_device_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEVICE_NAME_DEFAULT.to_string();
    }
    trimmed.chars().take(DEVICE_NAME_MAX).collect()
}

pub fn sanitize_poll_ms(raw: u64) -> u64 {
    if raw == 0 {
        return POLL_MS_DEFAULT;
    }
    raw.clamp(POLL_MS_MIN, POLL_MS_MAX)
}

pub fn sanitize_claim_limit(raw: u32) -> u32 {
    if raw == 0 {
        return CLAIM_LIMIT_DEFAULT;
    }
    raw.clamp(CLAIM_LIMIT_MIN, CLAIM_LIMIT_MAX)
}

/// `{platform}-bridge-{hostname}`, sanitized through the same rules.
pub fn default_consumer_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "local".to_string());
    let raw = format!("{}-bridge-{}", std::env::consts::OS, host);
    let cleaned: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
        .take(CONSUMER_ID_MAX)
        .collect();
    if cleaned.is_empty() {
        "bridge-local".to_string()
    } else {
        cleaned
    }
}

/// Tokens saved from the webapp session. Two snapshots are the same session
/// iff all three fields match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<i64>,
}

impl SessionSnapshot {
    pub fn is_usable(&self) -> bool {
        !self.access_token.trim().is_empty() && !self.refresh_token.trim().is_empty()
    }
}

pub fn same_session(a: &SessionSnapshot, b: &SessionSnapshot) -> bool {
    a.access_token == b.access_token
        && a.refresh_token == b.refresh_token
        && a.expires_at == b.expires_at
}

/// Supabase endpoint settings. Resolved from the environment with compiled
/// defaults; validated lazily so a misconfigured install fails on the first
/// RPC of a tick rather than at startup.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

impl BackendSettings {
    pub fn from_env() -> Self {
        Self {
            supabase_url: std::env::var("SUSHIAMO_SUPABASE_URL")
                .unwrap_or_else(|_| "https://xkzfqwnuogqbkhdzjmqs.supabase.co".to_string()),
            supabase_anon_key: std::env::var("SUSHIAMO_SUPABASE_ANON_KEY").unwrap_or_default(),
        }
    }
}

/// On-disk document: `{config, session}` in one JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub config: AgentConfig,
    pub session: Option<SessionSnapshot>,
}

pub const STATE_FILE_NAME: &str = "desktop-print-worker.json";

/// Single-file state store under the host-provided user-data directory.
/// Every write is a full-file rewrite; a missing or unparseable file yields
/// defaults.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(user_data_dir: &Path) -> Self {
        Self {
            path: user_data_dir.join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> PersistedState {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => {
                info!("No persisted state at {:?}, using defaults", self.path);
                return PersistedState::default();
            }
        };

        match serde_json::from_str::<PersistedState>(&raw) {
            Ok(mut state) => {
                state.config = state.config.sanitized();
                state
            }
            Err(e) => {
                warn!("Persisted state unparseable ({}), using defaults", e);
                PersistedState::default()
            }
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(state)?;
        std::fs::write(&self.path, body)?;
        Ok(())
    }
}
