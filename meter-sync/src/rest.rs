use crate::sink::{DeviceSnapshot, MemoryStore};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone)]
struct AppState {
    store: MemoryStore,
}

#[derive(Debug, Deserialize)]
pub struct DevicesQuery {
    available: Option<bool>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub data: Vec<DeviceSnapshot>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

pub fn create_router(store: MemoryStore) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:id", get(get_device))
        .with_state(state)
}

async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<DevicesQuery>,
) -> Json<DevicesResponse> {
    let limit = params.limit.unwrap_or(100).min(1000);
    let offset = params.offset.unwrap_or(0);

    let matching: Vec<DeviceSnapshot> = state
        .store
        .snapshots()
        .await
        .into_iter()
        .filter(|s| params.available.map_or(true, |a| s.available == a))
        .collect();
    let total = matching.len();

    Json(DevicesResponse {
        data: matching.into_iter().skip(offset).take(limit).collect(),
        total,
        limit,
        offset,
    })
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceSnapshot>, AppError> {
    state
        .store
        .snapshot(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Unknown device {}", id)))
}

struct AppError(StatusCode, String);

impl AppError {
    fn not_found(message: String) -> Self {
        Self(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        warn!("API error: {} {}", self.0, self.1);
        (self.0, self.1).into_response()
    }
}
