use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::parse_timestamp;
use crate::error::{AppError, AppResult};
use crate::manager::{JobView, Manager};
use crate::routes::session::ControllerToken;

fn parse_ts(label: &str, value: &str) -> Result<DateTime<Utc>, AppError> {
    parse_timestamp(label, value).map_err(|e| AppError::bad_request(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RangeResponse {
    pub min_ts: Option<DateTime<Utc>>,
    pub max_ts: Option<DateTime<Utc>>,
    pub distinct_sensor_count: u64,
}

/// `GET /job/range` — archive bounds for the working list.
pub async fn get_range(
    State(manager): State<Arc<Manager>>,
    axum::extract::Query(query): axum::extract::Query<RangeQuery>,
) -> AppResult<Json<RangeResponse>> {
    let from = query.from.as_deref().map(|v| parse_ts("from", v)).transpose()?;
    let to = query.to.as_deref().map(|v| parse_ts("to", v)).transpose()?;
    let info = manager.range(from, to).await?;
    Ok(Json(RangeResponse {
        min_ts: info.min_ts,
        max_ts: info.max_ts,
        distinct_sensor_count: info.distinct_sensor_count,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SetRangeRequest {
    pub from: String,
    pub to: String,
    pub step: f64,
    pub speed: Option<f64>,
    pub window: Option<f64>,
    pub save_output: Option<bool>,
}

/// `POST /job/range` — stages a pending range for the next Start.
pub async fn set_range(
    State(manager): State<Arc<Manager>>,
    _controller: ControllerToken,
    Json(body): Json<SetRangeRequest>,
) -> AppResult<Json<serde_json::Value>> {
    if body.step <= 0.0 {
        return Err(AppError::bad_request("step must be positive"));
    }
    let from = parse_ts("from", &body.from)?;
    let to = parse_ts("to", &body.to)?;
    manager.set_pending_range(
        from,
        to,
        chrono::Duration::milliseconds((body.step * 1000.0) as i64),
        body.speed,
        body.window.map(|w| chrono::Duration::milliseconds((w * 1000.0) as i64)),
        body.save_output,
    )?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct SeekRequest {
    pub ts: String,
    #[serde(default)]
    pub apply: bool,
}

/// `POST /job/seek` — live seek if a job is active, otherwise a pending seek
/// staged for the next Start.
pub async fn seek(
    State(manager): State<Arc<Manager>>,
    _controller: ControllerToken,
    Json(body): Json<SeekRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let ts = parse_ts("ts", &body.ts)?;
    let status = manager.status().status;
    use crate::manager::JobStatus;
    if matches!(status, JobStatus::Running | JobStatus::Paused) {
        manager.seek(ts, body.apply).await?;
    } else {
        manager.set_pending_seek(ts)?;
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `POST /job/start` — starts from the staged pending range.
pub async fn start(
    State(manager): State<Arc<Manager>>,
    _controller: ControllerToken,
) -> AppResult<Json<serde_json::Value>> {
    manager.start().await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

macro_rules! simple_command {
    ($name:ident, $method:ident) => {
        pub async fn $name(
            State(manager): State<Arc<Manager>>,
            _controller: ControllerToken,
        ) -> AppResult<Json<serde_json::Value>> {
            manager.$method().await?;
            Ok(Json(serde_json::json!({ "ok": true })))
        }
    };
}

simple_command!(pause, pause);
simple_command!(resume, resume);
simple_command!(stop, stop);
simple_command!(apply, apply);

/// `POST /job/reset` — cancels any active job and clears pending state.
pub async fn reset(
    State(manager): State<Arc<Manager>>,
    _controller: ControllerToken,
) -> AppResult<Json<serde_json::Value>> {
    manager.reset();
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Debug, Deserialize, Default)]
pub struct StepRequest {
    #[serde(default)]
    pub apply: bool,
}

/// `POST /job/step/forward`
pub async fn step_forward(
    State(manager): State<Arc<Manager>>,
    _controller: ControllerToken,
) -> AppResult<Json<serde_json::Value>> {
    manager.step_forward().await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `POST /job/step/backward`
pub async fn step_backward(
    State(manager): State<Arc<Manager>>,
    _controller: ControllerToken,
    body: Option<Json<StepRequest>>,
) -> AppResult<Json<serde_json::Value>> {
    let apply = body.map(|b| b.0.apply).unwrap_or(false);
    manager.step_backward(apply).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// `GET /job` — full status including pending range/seek.
pub async fn status(State(manager): State<Arc<Manager>>) -> Json<JobView> {
    Json(manager.status())
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub ts: String,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub ts: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: &'static str,
    pub updates: Vec<crate::output::SensorUpdate>,
}

/// `POST /snapshot` — computes state at `ts` with no side effects.
pub async fn snapshot(
    State(manager): State<Arc<Manager>>,
    Json(body): Json<SnapshotRequest>,
) -> AppResult<Json<SnapshotResponse>> {
    let ts = parse_ts("ts", &body.ts)?;
    let started = std::time::Instant::now();
    let state = manager.snapshot_at(ts).await?;
    let updates = state
        .into_iter()
        .filter(|(_, cell)| cell.has_value)
        .map(|(id, cell)| crate::output::SensorUpdate { id, value: cell.value })
        .collect();
    Ok(Json(SnapshotResponse {
        ts,
        duration_ms: started.elapsed().as_millis() as u64,
        status: "ok",
        updates,
    }))
}
