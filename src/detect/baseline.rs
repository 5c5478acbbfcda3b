//! Descriptive statistics over a rolling window of one (entity, metric, source).

use crate::observation::{Observation, Source, SourceTag};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reference statistics for one entity/metric from a single source.
///
/// Baselines are replaced wholesale on every rebuild; there is no partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub entity_scope: String,
    pub metric_type: String,
    pub source: Source,
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub p95: f64,
    pub sample_count: u64,
    /// Per-entity override; `None` falls back to the anomaly type default.
    pub threshold_sigma: Option<f64>,
    /// Window length in days the samples were drawn from.
    pub window_size: u32,
    pub computed_at: DateTime<Utc>,
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divides by N).
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let sum_sq_diff: f64 = values.iter().map(|&x| (x - m).powi(2)).sum();
    (sum_sq_diff / values.len() as f64).sqrt()
}

fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sorted = sorted_copy(values);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Linear-interpolated percentile, `p` in [0, 100].
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sorted = sorted_copy(values);
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Inputs that belong to the baseline but not to the statistics.
#[derive(Debug, Clone)]
pub struct BaselineParams<'a> {
    pub entity_scope: &'a str,
    pub metric_type: &'a str,
    pub threshold_sigma: Option<f64>,
    pub window_days: u32,
    pub computed_at: DateTime<Utc>,
}

/// Build a baseline from plain values.
///
/// The caller is responsible for source isolation; prefer [`build_baseline`]
/// which enforces it through the type of its input.
pub fn baseline_from_values(source: Source, values: &[f64], params: &BaselineParams<'_>) -> Baseline {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    Baseline {
        entity_scope: params.entity_scope.to_string(),
        metric_type: params.metric_type.to_string(),
        source,
        mean: mean(&finite),
        std_dev: std_dev(&finite),
        median: median(&finite),
        p95: percentile(&finite, 95.0),
        sample_count: finite.len() as u64,
        threshold_sigma: params.threshold_sigma,
        window_size: params.window_days,
        computed_at: params.computed_at,
    }
}

/// Build a baseline from a single-source series.
pub fn build_baseline<S: SourceTag>(history: &[Observation<S>], params: &BaselineParams<'_>) -> Baseline {
    let values: Vec<f64> = history.iter().map(|o| o.value).collect();
    baseline_from_values(S::SOURCE, &values, params)
}
