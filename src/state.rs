use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;

use crate::catalog::Catalog;
use crate::manager::Manager;
use crate::session::SessionRegistry;
use crate::streamer::Streamer;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub manager: Arc<Manager>,
    pub streamer: Arc<Streamer>,
    pub sessions: Arc<SessionRegistry>,
    pub control_timeout: Duration,
}

impl FromRef<AppState> for Arc<Manager> {
    fn from_ref(state: &AppState) -> Arc<Manager> {
        state.manager.clone()
    }
}

impl FromRef<AppState> for Arc<Streamer> {
    fn from_ref(state: &AppState) -> Arc<Streamer> {
        state.streamer.clone()
    }
}

impl FromRef<AppState> for Arc<SessionRegistry> {
    fn from_ref(state: &AppState) -> Arc<SessionRegistry> {
        state.sessions.clone()
    }
}

impl FromRef<AppState> for Arc<Catalog> {
    fn from_ref(state: &AppState) -> Arc<Catalog> {
        state.catalog.clone()
    }
}
