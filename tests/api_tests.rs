use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use serde_json::Value;
use skywatch::api::{self, state::AppState};
use skywatch::config::SkywatchConfig;
use skywatch::detect::{AnomalyType, Severity};
use skywatch::observation::{EntityType, RawObservation, Source};
use skywatch::signal::{Finding, SignalStore};
use skywatch::storage::{self, Pool};
use tempfile::TempDir;
use tower::ServiceExt;

fn setup() -> (TempDir, Pool, axum::Router) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("skywatch.db");
    let pool = storage::open_pool(path.to_str().unwrap()).unwrap();
    let state = AppState::new(pool.clone(), Arc::new(SkywatchConfig::default()));
    (dir, pool, api::router(state))
}

async fn get_json(app: axum::Router, uri: &str) -> Result<(StatusCode, Value)> {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty())?)
        .await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
    Ok((status, body))
}

fn finding(entity: &str) -> Finding {
    Finding {
        anomaly_type: AnomalyType::MarketVolume,
        severity: Severity::High,
        entity_id: entity.to_string(),
        entity_type: EntityType::Security,
        entity_name: None,
        metric_type: "volume".to_string(),
        observed_value: Some(9_800_000.0),
        baseline_value: Some(2_100_000.0),
        z_score: Some(4.6),
        source: Some(Source::MarketFeed),
        raw_data: serde_json::json!({}),
    }
}

#[tokio::test]
async fn test_health_envelope() -> Result<()> {
    let (_dir, _pool, app) = setup();
    let (status, body) = get_json(app, "/api/v1/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert!(body["meta"]["version"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_unknown_route_is_404() -> Result<()> {
    let (_dir, _pool, app) = setup();
    let (status, _) = get_json(app, "/api/v1/nope").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_signals_hide_expired_unless_asked() -> Result<()> {
    let (_dir, pool, app) = setup();
    let policy = SkywatchConfig::default()
        .domain(skywatch::observation::Domain::Market)
        .signal_policy();
    let store = SignalStore::new(pool);
    store.emit(&finding("ASTS").into_signal(Utc::now(), &policy))?;
    store.emit(&finding("ASTS").into_signal(Utc::now() - Duration::hours(30), &policy))?;

    let (status, body) = get_json(app.clone(), "/api/v1/signals").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["anomaly_type"], "market_volume");
    assert_eq!(body["data"][0]["severity"], "high");

    let (_, body) = get_json(app, "/api/v1/signals?include_expired=true").await?;
    assert_eq!(body["meta"]["total"], 2);
    Ok(())
}

#[tokio::test]
async fn test_divergence_and_freshness_views() -> Result<()> {
    let (_dir, pool, app) = setup();
    let t = Utc::now() - Duration::hours(2);
    let row = |source, value, epoch| RawObservation {
        entity_id: "BW3".to_string(),
        entity_type: EntityType::Satellite,
        metric_type: "bstar".to_string(),
        source,
        value,
        epoch,
    };
    storage::save_observations(
        &pool,
        &[
            row(Source::SpaceTrack, 0.000118, t),
            row(Source::Celestrak, 0.000042, t + Duration::hours(1)),
        ],
    )?;

    let (status, body) = get_json(app.clone(), "/api/v1/divergence").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["total"], 1);
    assert_eq!(body["data"][0]["diverged"], false);
    assert_eq!(body["data"][0]["source_a"], "space_track");

    let (_, body) = get_json(app.clone(), "/api/v1/freshness").await?;
    assert_eq!(body["meta"]["total"], 2);
    assert_eq!(body["data"][0]["tier"], "FRESH");

    let (_, body) = get_json(app, "/api/v1/baselines").await?;
    assert_eq!(body["meta"]["total"], 0);
    Ok(())
}
