pub mod health;
pub mod job;
pub mod sensors;
pub mod session;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api/v2",
            Router::new()
                .route("/sensors", get(sensors::list))
                .route("/session", get(session::get_session))
                .route("/session/claim", post(session::claim))
                .route("/session/logout", post(session::logout))
                .route("/ws/state", get(ws::ws_handler))
                .route(
                    "/job/sensors",
                    get(sensors::get_working_list).post(sensors::set_working_list),
                )
                .route("/job/sensors/count", get(sensors::count))
                .route("/job/range", get(job::get_range).post(job::set_range))
                .route("/job/seek", post(job::seek))
                .route("/job/start", post(job::start))
                .route("/job/pause", post(job::pause))
                .route("/job/resume", post(job::resume))
                .route("/job/stop", post(job::stop))
                .route("/job/apply", post(job::apply))
                .route("/job/reset", post(job::reset))
                .route("/job/step/forward", post(job::step_forward))
                .route("/job/step/backward", post(job::step_backward))
                .route("/job", get(job::status))
                .route("/snapshot", post(job::snapshot)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod control_gaps_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::catalog::Catalog;
    use crate::manager::Manager;
    use crate::session::SessionRegistry;
    use crate::storage::MemoryStore;
    use crate::streamer::Streamer;

    fn state() -> AppState {
        AppState {
            catalog: Arc::new(Catalog::default()),
            manager: Arc::new(Manager::new(
                Arc::new(MemoryStore::default()),
                None,
                Arc::new(Streamer::new()),
                vec![],
                64,
            )),
            streamer: Arc::new(Streamer::new()),
            sessions: Arc::new(SessionRegistry::new(Duration::from_secs(30))),
            control_timeout: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn job_start_without_session_is_control_locked() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v2/job/start")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn job_sensors_post_without_session_is_control_locked() {
        let app = router(state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v2/job/sensors")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"sensors":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn healthz_is_unauthenticated() {
        let app = router(state());
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
