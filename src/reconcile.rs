//! Cross-source divergence detection.
//!
//! Only pairs whose epochs are close enough to compare ever reach
//! [`detect_divergence`]: a [`ComparablePair`] can only be built once the
//! epoch gap has been checked, so the comparator itself stays infallible.

use crate::observation::{RawObservation, Source};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Drag-term (B*) divergence threshold between the two orbital feeds.
pub const DEFAULT_DIVERGENCE_THRESHOLD: f64 = 0.0001;
pub const DEFAULT_MAX_EPOCH_GAP_HOURS: f64 = 6.0;

#[derive(Debug, Error, PartialEq)]
pub enum ReconcileError {
    #[error("both readings come from {0}")]
    SameSource(Source),
    #[error("epochs are {gap_hours:.2}h apart, max allowed {max_hours:.2}h")]
    EpochGapExceeded { gap_hours: f64, max_hours: f64 },
    #[error("non-finite reading from {0}")]
    NonFinite(Source),
}

/// One source's latest value for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub source: Source,
    pub value: f64,
    pub epoch: DateTime<Utc>,
}

impl From<&RawObservation> for Reading {
    fn from(o: &RawObservation) -> Self {
        Self {
            source: o.source,
            value: o.value,
            epoch: o.epoch,
        }
    }
}

/// Two readings from different sources, close enough in time to compare.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparablePair {
    entity_id: String,
    a: Reading,
    b: Reading,
}

fn gap_hours(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (a - b).num_seconds().abs() as f64 / 3600.0
}

impl ComparablePair {
    pub fn new(entity_id: &str, a: Reading, b: Reading, max_epoch_gap: Duration) -> Result<Self, ReconcileError> {
        if a.source == b.source {
            return Err(ReconcileError::SameSource(a.source));
        }
        for r in [&a, &b] {
            if !r.value.is_finite() {
                return Err(ReconcileError::NonFinite(r.source));
            }
        }
        let gap = if a.epoch >= b.epoch { a.epoch - b.epoch } else { b.epoch - a.epoch };
        if gap > max_epoch_gap {
            return Err(ReconcileError::EpochGapExceeded {
                gap_hours: gap_hours(a.epoch, b.epoch),
                max_hours: max_epoch_gap.num_seconds() as f64 / 3600.0,
            });
        }
        Ok(Self {
            entity_id: entity_id.to_string(),
            a,
            b,
        })
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub entity_id: String,
    pub source_a: Source,
    pub source_a_value: f64,
    pub source_a_epoch: DateTime<Utc>,
    pub source_b: Source,
    pub source_b_value: f64,
    pub source_b_epoch: DateTime<Utc>,
    pub delta: f64,
    pub diverged: bool,
    /// Hours between the two epochs.
    pub epoch_gap: f64,
}

/// `delta = |a - b|`, diverged when strictly above `threshold`.
pub fn detect_divergence(pair: &ComparablePair, threshold: f64) -> DivergenceRecord {
    let delta = (pair.a.value - pair.b.value).abs();
    DivergenceRecord {
        entity_id: pair.entity_id.clone(),
        source_a: pair.a.source,
        source_a_value: pair.a.value,
        source_a_epoch: pair.a.epoch,
        source_b: pair.b.source,
        source_b_value: pair.b.value,
        source_b_epoch: pair.b.epoch,
        delta,
        diverged: delta > threshold,
        epoch_gap: gap_hours(pair.a.epoch, pair.b.epoch),
    }
}

/// Which two feeds to compare for a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRule {
    pub metric_type: String,
    pub source_a: Source,
    pub source_b: Source,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_gap")]
    pub max_epoch_gap_hours: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_DIVERGENCE_THRESHOLD
}

fn default_max_gap() -> f64 {
    DEFAULT_MAX_EPOCH_GAP_HOURS
}

/// Largest epoch gap a pair rule may allow.
pub const MAX_EPOCH_GAP_HOURS: f64 = 366.0 * 24.0;

impl PairRule {
    pub fn max_epoch_gap(&self) -> Duration {
        let hours = self.max_epoch_gap_hours.min(MAX_EPOCH_GAP_HOURS);
        Duration::seconds((hours * 3600.0).round() as i64)
    }
}

/// Result of reconciling one metric across all entities.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub records: Vec<DivergenceRecord>,
    /// Entities that had both sources but could not be compared.
    pub skipped: Vec<(String, ReconcileError)>,
}

/// Pair the newest reading of each source per entity and compare.
///
/// `latest` may contain readings from any source; only the rule's two
/// sources are used, and entities missing either one are left out.
pub fn reconcile_latest(rule: &PairRule, latest: &[RawObservation]) -> Reconciliation {
    let mut by_entity: BTreeMap<&str, (Option<Reading>, Option<Reading>)> = BTreeMap::new();

    for obs in latest.iter().filter(|o| o.metric_type == rule.metric_type) {
        let slot = by_entity.entry(obs.entity_id.as_str()).or_default();
        let target = if obs.source == rule.source_a {
            &mut slot.0
        } else if obs.source == rule.source_b {
            &mut slot.1
        } else {
            continue;
        };
        let newer = target.as_ref().map_or(true, |r| obs.epoch > r.epoch);
        if newer {
            *target = Some(Reading::from(obs));
        }
    }

    let mut out = Reconciliation::default();
    for (entity_id, pair) in by_entity {
        let (Some(a), Some(b)) = pair else {
            debug!(entity = %entity_id, metric = %rule.metric_type, "single-source entity, not reconciled");
            continue;
        };
        match ComparablePair::new(entity_id, a, b, rule.max_epoch_gap()) {
            Ok(pair) => out.records.push(detect_divergence(&pair, rule.threshold)),
            Err(e) => out.skipped.push((entity_id.to_string(), e)),
        }
    }
    out
}
