use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, SensorInfo};
use crate::error::AppResult;
use crate::manager::Manager;
use crate::routes::session::ControllerToken;

#[derive(Debug, Serialize)]
pub struct SensorsResponse {
    pub sensors: Vec<SensorInfo>,
    pub count: usize,
}

/// `GET /sensors` — the full catalog.
pub async fn list(State(catalog): State<Arc<Catalog>>) -> Json<SensorsResponse> {
    let sensors = catalog.sensors();
    Json(SensorsResponse {
        count: sensors.len(),
        sensors,
    })
}

#[derive(Debug, Serialize)]
pub struct WorkingListResponse {
    pub sensors: Vec<u64>,
}

/// `GET /job/sensors` — the job's current working list.
pub async fn get_working_list(State(manager): State<Arc<Manager>>) -> Json<WorkingListResponse> {
    Json(WorkingListResponse {
        sensors: manager.working_list(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SetWorkingListRequest {
    pub sensors: Vec<String>,
}

/// `POST /job/sensors` — replaces the working list, resolving each entry as
/// an id, a name, or (implicitly, via the catalog) a derived-hash id.
pub async fn set_working_list(
    State(catalog): State<Arc<Catalog>>,
    State(manager): State<Arc<Manager>>,
    _controller: ControllerToken,
    Json(body): Json<SetWorkingListRequest>,
) -> AppResult<Json<WorkingListResponse>> {
    let mut ids = Vec::with_capacity(body.sensors.len());
    for token in &body.sensors {
        ids.push(resolve_one(&catalog, token)?);
    }
    manager.set_working_list(ids.clone())?;
    Ok(Json(WorkingListResponse { sensors: ids }))
}

fn resolve_one(catalog: &Catalog, token: &str) -> Result<u64, crate::error::AppError> {
    if let Ok(id) = token.parse::<u64>() {
        if catalog.contains_id(id) {
            return Ok(id);
        }
    }
    catalog
        .id_by_name(token)
        .ok_or_else(|| crate::error::AppError::bad_request(format!("unknown sensor: {token}")))
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

/// `GET /job/sensors/count` — distinct sensor count in the given bounds.
pub async fn count(
    State(manager): State<Arc<Manager>>,
    axum::extract::Query(query): axum::extract::Query<CountQuery>,
) -> AppResult<Json<CountResponse>> {
    let from = query
        .from
        .map(|v| crate::config::parse_timestamp("from", &v))
        .transpose()
        .map_err(|e| crate::error::AppError::bad_request(e.to_string()))?;
    let to = query
        .to
        .map(|v| crate::config::parse_timestamp("to", &v))
        .transpose()
        .map_err(|e| crate::error::AppError::bad_request(e.to_string()))?;
    let count = manager.sensors_count(from, to).await?;
    Ok(Json(CountResponse { count }))
}
