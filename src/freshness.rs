//! Staleness tiers per (entity, source).

use crate::observation::{RawObservation, Source};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FreshnessTier {
    Fresh,
    Ok,
    Stale,
    Critical,
    /// Tracked pair with no observation rows at all (view only).
    NoData,
}

impl FreshnessTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessTier::Fresh => "FRESH",
            FreshnessTier::Ok => "OK",
            FreshnessTier::Stale => "STALE",
            FreshnessTier::Critical => "CRITICAL",
            FreshnessTier::NoData => "NO_DATA",
        }
    }
}

impl std::fmt::Display for FreshnessTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper bounds (exclusive, hours) of each tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessThresholds {
    pub fresh_hours: f64,
    pub ok_hours: f64,
    pub stale_hours: f64,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self {
            fresh_hours: 6.0,
            ok_hours: 12.0,
            stale_hours: 24.0,
        }
    }
}

impl FreshnessThresholds {
    /// Strict `<` comparisons: exactly 6.0h is OK, not FRESH.
    pub fn tier_for_hours(&self, hours_old: f64) -> FreshnessTier {
        if hours_old < self.fresh_hours {
            FreshnessTier::Fresh
        } else if hours_old < self.ok_hours {
            FreshnessTier::Ok
        } else if hours_old < self.stale_hours {
            FreshnessTier::Stale
        } else {
            FreshnessTier::Critical
        }
    }
}

pub fn hours_old(now: DateTime<Utc>, epoch: DateTime<Utc>) -> f64 {
    (now - epoch).num_milliseconds() as f64 / 3_600_000.0
}

/// Classify one epoch. A missing epoch is CRITICAL.
pub fn classify(now: DateTime<Utc>, epoch: Option<DateTime<Utc>>, thresholds: &FreshnessThresholds) -> (Option<f64>, FreshnessTier) {
    match epoch {
        Some(epoch) => {
            let hours = hours_old(now, epoch);
            (Some(hours), thresholds.tier_for_hours(hours))
        }
        None => (None, FreshnessTier::Critical),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    pub entity_id: String,
    pub source: Source,
    pub epoch: Option<DateTime<Utc>>,
    pub hours_old: Option<f64>,
    pub tier: FreshnessTier,
}

/// One row per (entity, source): every observed pair plus every tracked
/// pair in `roster`. Tracked pairs with no rows are NO_DATA.
pub fn freshness_view(
    now: DateTime<Utc>,
    roster: &[(String, Source)],
    observations: &[RawObservation],
    thresholds: &FreshnessThresholds,
) -> Vec<FreshnessRecord> {
    let mut newest: BTreeMap<(String, Source), DateTime<Utc>> = BTreeMap::new();
    for o in observations {
        newest
            .entry((o.entity_id.clone(), o.source))
            .and_modify(|e| {
                if o.epoch > *e {
                    *e = o.epoch;
                }
            })
            .or_insert(o.epoch);
    }

    let mut rows: BTreeMap<(String, Source), FreshnessRecord> = BTreeMap::new();
    for ((entity_id, source), epoch) in newest {
        let (hours, tier) = classify(now, Some(epoch), thresholds);
        rows.insert(
            (entity_id.clone(), source),
            FreshnessRecord {
                entity_id,
                source,
                epoch: Some(epoch),
                hours_old: hours,
                tier,
            },
        );
    }
    for (entity_id, source) in roster {
        rows.entry((entity_id.clone(), *source)).or_insert_with(|| FreshnessRecord {
            entity_id: entity_id.clone(),
            source: *source,
            epoch: None,
            hours_old: None,
            tier: FreshnessTier::NoData,
        });
    }
    rows.into_values().collect()
}
