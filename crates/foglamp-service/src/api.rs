//! REST API endpoints.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use foglamp_types::{AppendPayload, PurgeResult};

use crate::notify;
use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .route("/storage/reading", post(append_readings).get(fetch_readings))
        .route("/storage/reading/query", put(query_readings))
        .route("/storage/reading/purge", put(purge_readings))
        .route(
            "/storage/reading/interest/{asset}",
            post(register_interest).delete(unregister_interest),
        )
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Append a readings batch.
async fn append_readings(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<Value>, AppError> {
    let added = state.store.append_readings(&body)?;

    if added > 0 {
        // The payload parsed once already inside the store; a second pass
        // here just collects the distinct assets for notification.
        if let Ok(payload) = serde_json::from_str::<AppendPayload>(&body) {
            let assets: BTreeSet<String> = payload
                .readings
                .iter()
                .map(|r| r.asset_code.clone())
                .collect();
            notify::publish_append(&state, assets, added).await;
        }
    }

    Ok(Json(json!({ "response": "appended", "readings_added": added })))
}

/// Query parameters for the north-bound fetch.
#[derive(Debug, Deserialize, Default)]
pub struct FetchParams {
    pub id: Option<u64>,
    pub count: Option<u32>,
}

/// Fetch a block of readings by id.
async fn fetch_readings(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FetchParams>,
) -> Result<Json<Value>, AppError> {
    let set = state
        .store
        .fetch_readings(params.id.unwrap_or(1), params.count.unwrap_or(100))?;
    Ok(Json(set))
}

/// Run a query document against the readings table.
async fn query_readings(
    State(state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<Value>, AppError> {
    let set = state.store.retrieve_readings(&body)?;
    Ok(Json(set))
}

/// Query parameters for purge.
#[derive(Debug, Deserialize, Default)]
pub struct PurgeParams {
    pub age: Option<u64>,
    pub size: Option<u64>,
    pub sent: Option<u64>,
    pub flags: Option<String>,
}

/// Purge readings by age or by row count.
async fn purge_readings(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PurgeParams>,
) -> Result<Json<PurgeResult>, AppError> {
    let flags = match params.flags.as_deref() {
        None | Some("purge") => 0,
        Some("retain") => foglamp_store::FLAG_RETAIN_UNSENT,
        Some(other) => {
            return Err(AppError::BadRequest(format!(
                "Invalid flags value '{other}': expected 'retain' or 'purge'"
            )));
        }
    };
    let sent = params.sent.unwrap_or(0);

    let store = Arc::clone(&state.store);
    let result = match (params.age, params.size) {
        (Some(_), Some(_)) => {
            return Err(AppError::BadRequest(
                "Only one of age and size may be specified".to_string(),
            ));
        }
        (Some(age), None) => {
            tokio::task::spawn_blocking(move || store.purge_readings_by_age(age, flags, sent))
                .await
                .map_err(|e| AppError::Internal(e.to_string()))??
        }
        (None, Some(size)) => {
            tokio::task::spawn_blocking(move || store.purge_readings_by_rows(size, flags, sent))
                .await
                .map_err(|e| AppError::Internal(e.to_string()))??
        }
        (None, None) => {
            return Err(AppError::BadRequest(
                "Either age or size is required".to_string(),
            ));
        }
    };

    Ok(Json(result))
}

/// Interest registration body.
#[derive(Debug, Deserialize)]
pub struct InterestBody {
    pub url: String,
}

/// Register an asset notification callback.
async fn register_interest(
    State(state): State<Arc<AppState>>,
    Path(asset): Path<String>,
    Json(body): Json<InterestBody>,
) -> Result<Json<Value>, AppError> {
    notify::register(&state, &asset, &body.url).await;
    Ok(Json(json!({ "response": "registered" })))
}

/// Remove an asset notification callback.
async fn unregister_interest(
    State(state): State<Arc<AppState>>,
    Path(asset): Path<String>,
    Json(body): Json<InterestBody>,
) -> Result<Json<Value>, AppError> {
    if notify::unregister(&state, &asset, &body.url).await {
        Ok(Json(json!({ "response": "unregistered" })))
    } else {
        Err(AppError::NotFound(format!(
            "No interest in asset {asset} for {}",
            body.url
        )))
    }
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Store(foglamp_store::Error),
    Internal(String),
}

impl From<foglamp_store::Error> for AppError {
    fn from(e: foglamp_store::Error) -> Self {
        AppError::Store(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use foglamp_store::Error;

        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Store(e @ (Error::Parse(_) | Error::Shape { .. } | Error::Date(_))) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
