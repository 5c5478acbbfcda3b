//! Signal emission: fingerprinting, expiry, and the idempotent signal store.
//!
//! A signal is identified by `sha256(entity | anomaly_type | time bucket)`.
//! Re-emitting the same condition inside one bucket refreshes the stored row
//! instead of adding a second one.

use crate::detect::{AnomalyType, Severity};
use crate::observation::{EntityType, Source};
use crate::storage::{conversion_err, fmt_ts, parsed_column, ts_column, Pool};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalySignal {
    pub id: Uuid,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub entity_name: Option<String>,
    pub metric_type: String,
    pub observed_value: Option<f64>,
    pub baseline_value: Option<f64>,
    pub z_score: Option<f64>,
    pub source: Option<Source>,
    pub raw_data: serde_json::Value,
    pub fingerprint: String,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Visibility of a stored signal. Expired rows are kept, just hidden from
/// the default feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    Active,
    Expired,
}

impl AnomalySignal {
    pub fn state_at(&self, now: DateTime<Utc>) -> SignalState {
        if now < self.expires_at {
            SignalState::Active
        } else {
            SignalState::Expired
        }
    }
}

/// What an emission did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Emission {
    /// First signal for this fingerprint.
    Created,
    /// An existing signal with the same fingerprint was updated in place.
    Refreshed,
}

/// Bucket length and lifetime for one domain's signals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalPolicy {
    pub bucket: Duration,
    pub ttl: Duration,
}

/// Index of the bucket containing `detected_at`.
pub fn time_bucket(detected_at: DateTime<Utc>, bucket: Duration) -> i64 {
    let width = bucket.num_seconds().max(1);
    detected_at.timestamp().div_euclid(width)
}

pub fn fingerprint(entity_id: &str, anomaly_type: AnomalyType, bucket: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", entity_id, anomaly_type.as_str(), bucket).as_bytes());
    hex::encode(hasher.finalize())
}

/// A detector or reconciler result before it gets an identity.
#[derive(Debug, Clone)]
pub struct Finding {
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub entity_name: Option<String>,
    pub metric_type: String,
    pub observed_value: Option<f64>,
    pub baseline_value: Option<f64>,
    pub z_score: Option<f64>,
    pub source: Option<Source>,
    pub raw_data: serde_json::Value,
}

impl Finding {
    pub fn into_signal(self, detected_at: DateTime<Utc>, policy: &SignalPolicy) -> AnomalySignal {
        let bucket = time_bucket(detected_at, policy.bucket);
        AnomalySignal {
            id: Uuid::new_v4(),
            fingerprint: fingerprint(&self.entity_id, self.anomaly_type, bucket),
            anomaly_type: self.anomaly_type,
            severity: self.severity,
            entity_id: self.entity_id,
            entity_type: self.entity_type,
            entity_name: self.entity_name,
            metric_type: self.metric_type,
            observed_value: self.observed_value,
            baseline_value: self.baseline_value,
            z_score: self.z_score,
            source: self.source,
            raw_data: self.raw_data,
            detected_at,
            expires_at: detected_at + policy.ttl,
            created_at: detected_at,
        }
    }
}

/// Severity first, then |z|. Findings without a z-score rank below those with one.
fn outranks(a: &AnomalySignal, b: &AnomalySignal) -> bool {
    let z = |s: &AnomalySignal| s.z_score.map(f64::abs).unwrap_or(f64::NEG_INFINITY);
    match a.severity.cmp(&b.severity) {
        std::cmp::Ordering::Equal => z(a) > z(b),
        ord => ord == std::cmp::Ordering::Greater,
    }
}

/// Keep one signal per fingerprint: the strongest finding owns the row.
///
/// Several series can land on one fingerprint in a single scan (two metrics
/// judged under the same anomaly type, or one metric from two sources).
/// Ties keep the earlier signal, so the result is stable for a given input order.
pub fn collapse_by_fingerprint(signals: Vec<AnomalySignal>) -> Vec<AnomalySignal> {
    let mut order: Vec<String> = Vec::new();
    let mut best: BTreeMap<String, AnomalySignal> = BTreeMap::new();
    for signal in signals {
        let replace = match best.get(&signal.fingerprint) {
            Some(held) => outranks(&signal, held),
            None => {
                order.push(signal.fingerprint.clone());
                true
            }
        };
        if replace {
            best.insert(signal.fingerprint.clone(), signal);
        }
    }
    order.into_iter().filter_map(|fp| best.remove(&fp)).collect()
}

const SIGNAL_COLUMNS: &str = "id, anomaly_type, severity, entity_id, entity_type, entity_name, metric_type,
     observed_value, baseline_value, z_score, source, raw_data, fingerprint,
     detected_at, expires_at, created_at";

fn signal_from_row(row: &Row<'_>) -> rusqlite::Result<AnomalySignal> {
    let source: Option<String> = row.get(10)?;
    let raw: String = row.get(11)?;
    Ok(AnomalySignal {
        id: parsed_column(row, 0)?,
        anomaly_type: parsed_column(row, 1)?,
        severity: parsed_column(row, 2)?,
        entity_id: row.get(3)?,
        entity_type: parsed_column(row, 4)?,
        entity_name: row.get(5)?,
        metric_type: row.get(6)?,
        observed_value: row.get(7)?,
        baseline_value: row.get(8)?,
        z_score: row.get(9)?,
        source: match source {
            Some(_) => Some(parsed_column(row, 10)?),
            None => None,
        },
        raw_data: serde_json::from_str(&raw).map_err(|e| conversion_err(11, e))?,
        fingerprint: row.get(12)?,
        detected_at: ts_column(row, 13)?,
        expires_at: ts_column(row, 14)?,
        created_at: ts_column(row, 15)?,
    })
}

/// Persisted signal feed.
#[derive(Clone)]
pub struct SignalStore {
    pool: Pool,
}

impl SignalStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert, or refresh the row already holding this fingerprint.
    ///
    /// The refresh keeps the original `id` and `created_at`. Everything else
    /// describing the finding, plus `detected_at` and `expires_at`, takes the
    /// newer emission's.
    pub fn emit(&self, signal: &AnomalySignal) -> Result<Emission> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM anomaly_signals WHERE fingerprint = ?1",
                params![signal.fingerprint],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO anomaly_signals (
                id, anomaly_type, severity, entity_id, entity_type, entity_name, metric_type,
                observed_value, baseline_value, z_score, source, raw_data, fingerprint,
                detected_at, expires_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(fingerprint) DO UPDATE SET
                severity = excluded.severity,
                entity_name = excluded.entity_name,
                metric_type = excluded.metric_type,
                source = excluded.source,
                observed_value = excluded.observed_value,
                baseline_value = excluded.baseline_value,
                z_score = excluded.z_score,
                raw_data = excluded.raw_data,
                detected_at = excluded.detected_at,
                expires_at = excluded.expires_at",
            params![
                signal.id.to_string(),
                signal.anomaly_type.as_str(),
                signal.severity.as_str(),
                signal.entity_id,
                signal.entity_type.as_str(),
                signal.entity_name,
                signal.metric_type,
                signal.observed_value,
                signal.baseline_value,
                signal.z_score,
                signal.source.map(|s| s.as_str()),
                serde_json::to_string(&signal.raw_data)?,
                signal.fingerprint,
                fmt_ts(signal.detected_at),
                fmt_ts(signal.expires_at),
                fmt_ts(signal.created_at),
            ],
        )
        .context("Failed to upsert anomaly signal")?;

        tx.commit()?;

        let outcome = if existing.is_some() { Emission::Refreshed } else { Emission::Created };
        debug!(
            fingerprint = %signal.fingerprint,
            entity = %signal.entity_id,
            anomaly_type = %signal.anomaly_type,
            ?outcome,
            "signal emitted"
        );
        Ok(outcome)
    }

    /// Signals still visible at `now`, newest first.
    pub fn list_active(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<AnomalySignal>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SIGNAL_COLUMNS} FROM anomaly_signals
             WHERE expires_at > ?1
             ORDER BY detected_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![fmt_ts(now), limit as i64], signal_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every stored signal, expired included, newest first.
    pub fn list_all(&self, limit: usize) -> Result<Vec<AnomalySignal>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SIGNAL_COLUMNS} FROM anomaly_signals
             ORDER BY detected_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], signal_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get(&self, fingerprint: &str) -> Result<Option<AnomalySignal>> {
        let conn = self.pool.get()?;
        let signal = conn
            .query_row(
                &format!("SELECT {SIGNAL_COLUMNS} FROM anomaly_signals WHERE fingerprint = ?1"),
                params![fingerprint],
                signal_from_row,
            )
            .optional()?;
        Ok(signal)
    }
}
