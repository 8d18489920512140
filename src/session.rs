use crate::config::{same_session, SessionSnapshot};
use crate::errors::{BridgeError, Result};
use crate::supabase::{AuthUser, SupabaseClient};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Where the signed-in user operates, with their privilege level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestaurantScope {
    pub id: String,
    pub name: String,
    pub city: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Manager,
    Staff,
}

impl Role {
    fn parse(raw: &str) -> Option<Role> {
        match raw {
            "owner" => Some(Role::Owner),
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "staff" => Some(Role::Staff),
            _ => None,
        }
    }
}

/// In-memory auth state. Cleared on clear-session, re-resolved on every
/// service start and lazily whenever the scope is missing.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub user: Option<AuthUser>,
    pub restaurant: Option<RestaurantScope>,
}

pub struct SignInOutcome {
    pub user: AuthUser,
    /// Present when the refresh rotated the tokens; the caller persists it.
    pub rotated: Option<SessionSnapshot>,
}

/// Refresh slightly before the reported expiry so a token never dies mid-tick.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Restores or refreshes the backend session and resolves the restaurant
/// scope for the signed-in user.
pub struct SessionManager;

impl SessionManager {
    /// Adopt the current user if the backend still accepts our access token,
    /// otherwise restore the session from the snapshot's refresh token.
    pub async fn ensure_signed_in(
        client: &SupabaseClient,
        snapshot: Option<&SessionSnapshot>,
        cached_user: Option<&AuthUser>,
    ) -> Result<SignInOutcome> {
        let snapshot = snapshot.ok_or(BridgeError::SessionAbsent)?;
        if !snapshot.is_usable() {
            return Err(BridgeError::SessionAbsent);
        }

        let now = chrono::Utc::now().timestamp();
        // None = expiry unknown: the token may still work, but ask the
        // backend instead of trusting the cache.
        let fresh = snapshot.expires_at.map(|t| t - EXPIRY_MARGIN_SECS > now);

        if fresh != Some(false) {
            if fresh == Some(true) {
                if let Some(user) = cached_user {
                    client.set_access_token(Some(snapshot.access_token.clone()));
                    return Ok(SignInOutcome {
                        user: user.clone(),
                        rotated: None,
                    });
                }
            }
            if let Some(user) = client.current_user(&snapshot.access_token).await? {
                client.set_access_token(Some(snapshot.access_token.clone()));
                return Ok(SignInOutcome { user, rotated: None });
            }
        }

        debug!("Access token stale or rejected, refreshing session");
        let (refreshed, user) = client.refresh_session(&snapshot.refresh_token).await?;
        client.set_access_token(Some(refreshed.access_token.clone()));

        let rotated = if same_session(snapshot, &refreshed) {
            None
        } else {
            info!("Session tokens rotated by refresh");
            Some(refreshed)
        };

        Ok(SignInOutcome { user, rotated })
    }

    /// Owned restaurants win (most recently created first). Otherwise rank
    /// role memberships by privilege, then by earliest assignment, so the
    /// bridge lands on the same restaurant across restarts.
    pub async fn resolve_restaurant_for_current_user(
        client: &SupabaseClient,
        user_id: &str,
    ) -> Result<Option<RestaurantScope>> {
        let owned = client
            .select(
                "restaurants",
                &[
                    ("owner_id", format!("eq.{}", user_id)),
                    ("select", "id,name,city".to_string()),
                    ("order", "created_at.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;

        if let Some(row) = owned.first() {
            return Ok(scope_from_row(row, Role::Owner));
        }

        let memberships = client
            .select(
                "user_roles",
                &[
                    ("user_id", format!("eq.{}", user_id)),
                    ("role", "in.(admin,manager,staff)".to_string()),
                    ("select", "role,restaurant_id,created_at".to_string()),
                    ("order", "created_at.asc".to_string()),
                ],
            )
            .await?;

        let mut ranked: Vec<(Role, usize, String)> = memberships
            .iter()
            .enumerate()
            .filter_map(|(ordinal, row)| {
                let role = Role::parse(row.get("role")?.as_str()?)?;
                let restaurant_id = row.get("restaurant_id")?.as_str()?.to_string();
                Some((role, ordinal, restaurant_id))
            })
            .collect();

        // Rows arrive oldest-first, so the ordinal breaks privilege ties.
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let Some((role, _, restaurant_id)) = ranked.into_iter().next() else {
            debug!("User {} has no restaurant scope", user_id);
            return Ok(None);
        };

        let rows = client
            .select(
                "restaurants",
                &[
                    ("id", format!("eq.{}", restaurant_id)),
                    ("select", "id,name,city".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;

        Ok(rows.first().and_then(|row| scope_from_row(row, role)))
    }
}

fn scope_from_row(row: &serde_json::Value, role: Role) -> Option<RestaurantScope> {
    Some(RestaurantScope {
        id: row.get("id")?.as_str()?.to_string(),
        name: row
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        city: row
            .get("city")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        role,
    })
}
