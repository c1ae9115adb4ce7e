use std::sync::Arc;

use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::session::{new_token, SessionRegistry};
use crate::state::AppState;

const SESSION_HEADER: &str = "x-tm-session";

/// Extractor enforcing the control-surface invariant: a mutating request
/// must carry the current controller's session token.
pub struct ControllerToken(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for ControllerToken
where
    Arc<SessionRegistry>: axum::extract::FromRef<S>,
    S: Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let sessions = Arc::<SessionRegistry>::from_ref(state);
        let token = parts
            .headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(AppError::control_locked)?;
        if !sessions.is_controller(&token) {
            return Err(AppError::control_locked());
        }
        sessions.touch(&token);
        Ok(ControllerToken(token))
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session: String,
    pub is_controller: bool,
    pub controller_present: bool,
    pub control_timeout_sec: u64,
    pub can_claim: bool,
}

/// `GET /session` — reports status for the caller's token without claiming.
pub async fn get_session(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Json<SessionView> {
    let token = query.session.unwrap_or_default();
    let is_controller = !token.is_empty() && state.sessions.touch(&token);
    Json(SessionView {
        controller_present: state.sessions.controller_present(),
        can_claim: token.is_empty() || state.sessions.can_claim(&token),
        is_controller,
        control_timeout_sec: state.control_timeout.as_secs(),
        session: token,
    })
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub session: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub session: String,
    pub claimed: bool,
}

/// `POST /session/claim` — test-and-set the controller slot.
pub async fn claim(
    State(state): State<AppState>,
    Json(body): Json<ClaimRequest>,
) -> AppResult<Json<ClaimResponse>> {
    let token = body.session.unwrap_or_else(new_token);
    if !state.sessions.claim(&token) {
        return Err(AppError::control_locked());
    }
    Ok(Json(ClaimResponse {
        session: token,
        claimed: true,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogoutQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub session: String,
}

/// `POST /session/logout` — relinquishes the controller slot. With
/// `?force=1`, clears it regardless of which token currently holds it.
pub async fn logout(
    State(state): State<AppState>,
    Query(query): Query<LogoutQuery>,
    Json(body): Json<LogoutRequest>,
) -> Json<serde_json::Value> {
    state.sessions.logout(&body.session, query.force);
    Json(serde_json::json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_view_reports_claimability_for_empty_token() {
        let sessions = Arc::new(SessionRegistry::new(std::time::Duration::from_secs(30)));
        let query = SessionQuery { session: None };
        let view = get_session(
            State(AppState {
                catalog: Arc::new(crate::catalog::Catalog::default()),
                manager: Arc::new(crate::manager::Manager::new(
                    Arc::new(crate::storage::MemoryStore::default()),
                    None,
                    Arc::new(crate::streamer::Streamer::new()),
                    vec![],
                    64,
                )),
                streamer: Arc::new(crate::streamer::Streamer::new()),
                sessions,
                control_timeout: std::time::Duration::from_secs(30),
            }),
            Query(query),
        )
        .await;
        assert!(view.can_claim);
        assert!(!view.is_controller);
    }
}
