//! API route definitions.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use super::state::AppState;
use crate::storage;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/signals", get(list_signals))
        .route("/divergence", get(divergence))
        .route("/freshness", get(freshness))
        .route("/baselines", get(baselines))
}

fn meta(total: usize) -> Value {
    json!({
        "total": total,
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn envelope<T: serde::Serialize>(rows: Vec<T>) -> ApiResult {
    let total = rows.len();
    let data = serde_json::to_value(rows).map_err(|e| internal(e.into()))?;
    Ok(Json(json!({ "data": data, "meta": meta(total) })))
}

fn internal(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    error!("api request failed: {:#}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{:#}", e) })),
    )
}

/// Run a store query off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, (StatusCode, Json<Value>)>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(internal),
        Err(e) => Err(internal(e.into())),
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Debug, Default, Deserialize)]
struct SignalQuery {
    #[serde(default)]
    include_expired: bool,
    limit: Option<usize>,
}

async fn list_signals(State(state): State<AppState>, Query(q): Query<SignalQuery>) -> ApiResult {
    let max = state.config.api.max_rows;
    let limit = q.limit.unwrap_or(max).min(max);
    let store = state.engine.store().clone();
    let rows = blocking(move || {
        if q.include_expired {
            store.list_all(limit)
        } else {
            store.list_active(Utc::now(), limit)
        }
    })
    .await?;
    envelope(rows)
}

async fn divergence(State(state): State<AppState>) -> ApiResult {
    let engine = state.engine.clone();
    envelope(blocking(move || engine.divergence()).await?)
}

async fn freshness(State(state): State<AppState>) -> ApiResult {
    let engine = state.engine.clone();
    envelope(blocking(move || engine.freshness(Utc::now())).await?)
}

async fn baselines(State(state): State<AppState>) -> ApiResult {
    let pool = state.pool.clone();
    let rows = blocking(move || {
        let conn = pool.get()?;
        storage::list_baselines(&conn)
    })
    .await?;
    envelope(rows)
}
