use crate::config::SessionSnapshot;
use crate::errors::{BridgeError, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Signed-in user as reported by the auth endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

/// Supabase client for the bridge: GoTrue session endpoints plus PostgREST
/// RPC and table reads. The access token rotates on refresh, so it lives
/// behind a lock rather than in the constructor.
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    access_token: RwLock<Option<String>>,
}

impl SupabaseClient {
    pub fn new(supabase_url: String, anon_key: String) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with custom config: {}. Using defaults.", e);
                Client::new()
            });

        Self {
            client,
            base_url: supabase_url.trim_end_matches('/').to_string(),
            anon_key,
            access_token: RwLock::new(None),
        }
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().expect("access token lock") = token;
    }

    fn bearer(&self) -> String {
        self.access_token
            .read()
            .expect("access token lock")
            .clone()
            .unwrap_or_else(|| self.anon_key.clone())
    }

    /// Missing URL or key is a configuration fault; it surfaces on the first
    /// backend call of a tick, not at construction.
    fn ensure_configured(&self) -> Result<()> {
        if self.base_url.trim().is_empty() || self.anon_key.trim().is_empty() {
            return Err(BridgeError::Config(
                "Supabase URL or anon key missing (SUSHIAMO_SUPABASE_URL / SUSHIAMO_SUPABASE_ANON_KEY)".into(),
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Auth (GoTrue)
    // =========================================================================

    /// Ask the backend who the given access token belongs to.
    /// `Ok(None)` means the token was rejected; the caller decides whether to
    /// refresh.
    pub async fn current_user(&self, access_token: &str) -> Result<Option<AuthUser>> {
        self.ensure_configured()?;
        let url = format!("{}/auth/v1/user", self.base_url);

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| BridgeError::Network(e.to_string()))?;

        if response.status().is_success() {
            let user: AuthUser = response
                .json()
                .await
                .map_err(|e| BridgeError::Network(format!("Parse error: {}", e)))?;
            return Ok(Some(user));
        }

        debug!("Access token rejected: {}", response.status());
        Ok(None)
    }

    /// Exchange the refresh token for a new session.
    pub async fn refresh_session(
        &self,
        refresh_token: &str,
    ) -> Result<(SessionSnapshot, AuthUser)> {
        self.ensure_configured()?;
        let url = format!("{}/auth/v1/token?grant_type=refresh_token", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .header("Content-Type", "application/json")
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| BridgeError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::SessionInvalid(format!("{} - {}", status, body)));
        }

        let refreshed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::SessionInvalid(format!("Parse error: {}", e)))?;

        let snapshot = SessionSnapshot {
            access_token: refreshed.access_token,
            refresh_token: refreshed.refresh_token,
            expires_at: refreshed.expires_at,
        };
        Ok((snapshot, refreshed.user))
    }

    // =========================================================================
    // PostgREST
    // =========================================================================

    /// Call a database function. Errors carry the function name so callers
    /// can recognize a missing backend migration.
    pub async fn rpc(&self, function: &str, params: Value) -> Result<Value> {
        self.ensure_configured()?;
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, function);

        let response = self
            .client
            .post(&url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.bearer()))
            .header("Content-Type", "application/json")
            .json(&params)
            .send()
            .await
            .map_err(|e| BridgeError::Rpc {
                function: function.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = extract_pg_message(&body).unwrap_or(body);
            return Err(BridgeError::Rpc {
                function: function.to_string(),
                message: format!("{} - {}", status, message),
            });
        }

        if status.as_u16() == 204 {
            return Ok(Value::Null);
        }

        response.json().await.or(Ok(Value::Null))
    }

    /// Read rows from a table through the REST surface.
    pub async fn select(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<Value>> {
        self.ensure_configured()?;
        let url = format!("{}/rest/v1/{}", self.base_url, table);

        let response = self
            .client
            .get(&url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.bearer()))
            .query(query)
            .send()
            .await
            .map_err(|e| BridgeError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Network(format!(
                "Select on '{}' failed: {} - {}",
                table, status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BridgeError::Network(format!("Parse error: {}", e)))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// PostgREST wraps errors as `{"message": "..."}` (sometimes `error`/`msg`).
fn extract_pg_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    for key in ["message", "error", "msg"] {
        if let Some(text) = parsed.get(key).and_then(|v| v.as_str()) {
            return Some(text.to_string());
        }
    }
    None
}

/// True when the backend said this specific function does not exist
/// (missing migration). The message must reference the function name.
pub fn is_missing_function_error(error: &BridgeError, function: &str) -> bool {
    let message = match error {
        BridgeError::Rpc { function: f, message } if f == function => message,
        _ => return false,
    };
    let lower = message.to_lowercase();
    lower.contains(&function.to_lowercase())
        && (lower.contains("schema cache")
            || lower.contains("does not exist")
            || lower.contains("not found"))
}
