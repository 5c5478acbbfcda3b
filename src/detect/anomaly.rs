use crate::detect::baseline::Baseline;
use crate::detect::{AnomalyType, Severity};
use serde::{Deserialize, Serialize};

/// z-score of `value` against `mean`/`std_dev`.
///
/// Zero variance means no deviation is observable, so the score is 0.
pub fn z_score(value: f64, mean: f64, std_dev: f64) -> f64 {
    if std_dev == 0.0 {
        return 0.0;
    }
    (value - mean) / std_dev
}

/// Escalate `base` by the magnitude of `z`:
/// above 6 sigma forces critical, above 4 sigma adds one rank.
pub fn escalate(base: Severity, z: f64) -> Severity {
    let abs_z = z.abs();
    if abs_z > 6.0 {
        Severity::MAX
    } else if abs_z > 4.0 {
        Severity::from_rank(base.rank() + 1)
    } else {
        base
    }
}

pub fn determine_severity(anomaly_type: AnomalyType, z: f64) -> Severity {
    escalate(anomaly_type.base_severity(), z)
}

/// Outcome of comparing one observation against its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub is_anomaly: bool,
    pub z_score: f64,
    pub severity: Severity,
    pub observed: f64,
    pub baseline_mean: f64,
    pub threshold: f64,
}

/// Threshold in effect: the baseline's override, else the type default.
pub fn effective_threshold(baseline: &Baseline, anomaly_type: AnomalyType) -> f64 {
    baseline
        .threshold_sigma
        .unwrap_or_else(|| anomaly_type.default_threshold())
}

/// Classify `observed` against `baseline`. `observed` must be finite.
pub fn detect(observed: f64, baseline: &Baseline, anomaly_type: AnomalyType) -> Detection {
    let z = z_score(observed, baseline.mean, baseline.std_dev);
    let threshold = effective_threshold(baseline, anomaly_type);
    let is_anomaly = z.abs() > threshold;
    let severity = if is_anomaly {
        determine_severity(anomaly_type, z)
    } else {
        Severity::Low
    };

    Detection {
        is_anomaly,
        z_score: z,
        severity,
        observed,
        baseline_mean: baseline.mean,
        threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::baseline::{baseline_from_values, BaselineParams};
    use crate::observation::Source;
    use chrono::Utc;

    fn baseline(values: &[f64], threshold_sigma: Option<f64>) -> Baseline {
        baseline_from_values(
            Source::SpaceTrack,
            values,
            &BaselineParams {
                entity_scope: "BW3",
                metric_type: "altitude_km",
                threshold_sigma,
                window_days: 30,
                computed_at: Utc::now(),
            },
        )
    }

    #[test]
    fn test_zero_variance_gives_zero_z() {
        for (obs, mean) in [(0.0, 0.0), (1e9, 3.0), (-5.0, 12.5)] {
            assert_eq!(z_score(obs, mean, 0.0), 0.0);
        }
    }

    #[test]
    fn test_z_score_sign() {
        assert_eq!(z_score(10.0, 3.0, 2.0), 3.5);
        assert_eq!(z_score(-1.0, 3.0, 2.0), -2.0);
    }

    #[test]
    fn test_above_six_sigma_is_always_critical() {
        for t in AnomalyType::ALL {
            assert_eq!(determine_severity(t, 6.01), Severity::Critical);
            assert_eq!(determine_severity(t, -40.0), Severity::Critical);
        }
    }

    #[test]
    fn test_four_to_six_sigma_escalates_one_rank() {
        for t in AnomalyType::ALL {
            let expected = Severity::from_rank(t.base_severity().rank() + 1);
            assert_eq!(determine_severity(t, 4.5), expected);
            assert_eq!(determine_severity(t, -6.0), expected);
        }
        assert_eq!(determine_severity(AnomalyType::OrbitalManeuver, 5.0), Severity::Critical);
    }

    #[test]
    fn test_at_or_below_four_sigma_stays_at_base() {
        for t in AnomalyType::ALL {
            assert_eq!(determine_severity(t, 4.0), t.base_severity());
            assert_eq!(determine_severity(t, 0.0), t.base_severity());
        }
    }

    #[test]
    fn test_critical_base_cannot_escalate() {
        assert_eq!(escalate(Severity::Critical, 0.0), Severity::Critical);
        assert_eq!(escalate(Severity::Critical, 5.0), Severity::Critical);
        assert_eq!(escalate(Severity::Critical, 9.0), Severity::Critical);
    }

    #[test]
    fn test_severity_monotonic_in_abs_z() {
        for t in AnomalyType::ALL {
            let mut prev = determine_severity(t, 0.0);
            for step in 1..=200 {
                let z = step as f64 * 0.05;
                let sev = determine_severity(t, z);
                assert!(sev >= prev, "{t} regressed at z={z}");
                assert!(sev >= t.base_severity());
                assert!(sev <= Severity::Critical);
                assert_eq!(determine_severity(t, -z), sev);
                prev = sev;
            }
        }
    }

    #[test]
    fn test_severity_is_idempotent() {
        let a = determine_severity(AnomalyType::MarketPrice, 4.7);
        let b = determine_severity(AnomalyType::MarketPrice, 4.7);
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_baseline_never_flags() {
        let d = detect(498.3, &baseline(&[], None), AnomalyType::OrbitalDeviation);
        assert_eq!(d.z_score, 0.0);
        assert!(!d.is_anomaly);
        assert_eq!(d.severity, Severity::Low);
    }

    #[test]
    fn test_threshold_override_wins() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        // z of 6.0 against this set is ~2.12
        let default = detect(6.0, &baseline(&values, None), AnomalyType::OrbitalDeviation);
        assert_eq!(default.threshold, 3.0);
        assert!(!default.is_anomaly);

        let tight = detect(6.0, &baseline(&values, Some(2.0)), AnomalyType::OrbitalDeviation);
        assert_eq!(tight.threshold, 2.0);
        assert!(tight.is_anomaly);
        assert_eq!(tight.severity, Severity::Medium);
    }

    #[test]
    fn test_type_default_thresholds_differ() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        // z ~2.12: over news_spike's 2.0, under market_price's 3.0
        let b = baseline(&values, None);
        assert!(detect(6.0, &b, AnomalyType::NewsSpike).is_anomaly);
        assert!(!detect(6.0, &b, AnomalyType::MarketPrice).is_anomaly);
    }

    #[test]
    fn test_threshold_is_strict() {
        let b = baseline(&[1.0, 3.0], Some(1.0));
        // mean 2, std 1: z == 1.0 exactly
        let d = detect(3.0, &b, AnomalyType::MarketVolume);
        assert_eq!(d.z_score, 1.0);
        assert!(!d.is_anomaly);
    }
}
