//! Scan orchestration: baselines, detection, reconciliation, and freshness
//! for one domain, with findings written to the signal store.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{MetricRule, SkywatchConfig};
use crate::detect::anomaly::detect;
use crate::detect::baseline::{build_baseline, BaselineParams};
use crate::detect::AnomalyType;
use crate::freshness::{freshness_view, FreshnessRecord, FreshnessTier};
use crate::observation::{narrow, Domain, EntityType, RawObservation};
use crate::reconcile::{reconcile_latest, DivergenceRecord};
use crate::signal::{collapse_by_fingerprint, Emission, Finding, SignalStore};
use crate::storage::{self, Pool};
use crate::with_source;

/// Counts from one domain scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub domain: Domain,
    pub series_scanned: usize,
    pub anomalies: usize,
    pub divergences: usize,
    pub skipped_pairs: usize,
    pub stale: usize,
    pub no_data: usize,
    pub signals_created: usize,
    pub signals_refreshed: usize,
}

impl ScanReport {
    fn new(domain: Domain) -> Self {
        Self {
            domain,
            series_scanned: 0,
            anomalies: 0,
            divergences: 0,
            skipped_pairs: 0,
            stale: 0,
            no_data: 0,
            signals_created: 0,
            signals_refreshed: 0,
        }
    }
}

#[derive(Clone)]
pub struct ScanEngine {
    pool: Pool,
    config: Arc<SkywatchConfig>,
    store: SignalStore,
}

impl ScanEngine {
    pub fn new(pool: Pool, config: Arc<SkywatchConfig>) -> Self {
        let store = SignalStore::new(pool.clone());
        Self { pool, config, store }
    }

    pub fn store(&self) -> &SignalStore {
        &self.store
    }

    /// Scan one domain now. Database work runs on the blocking pool.
    pub async fn run_scan(&self, domain: Domain) -> Result<ScanReport> {
        let engine = self.clone();
        tokio::task::spawn_blocking(move || engine.scan_at(domain, Utc::now()))
            .await
            .context("scan task panicked")?
    }

    /// Scan one domain as of `now`.
    pub fn scan_at(&self, domain: Domain, now: DateTime<Utc>) -> Result<ScanReport> {
        info!(%domain, "running anomaly scan");
        let mut report = ScanReport::new(domain);
        let mut findings = Vec::new();

        {
            let conn = self.pool.get()?;
            for rule in self.config.metric_rules(domain) {
                self.scan_metric(&conn, domain, rule, now, &mut report, &mut findings)
                    .with_context(|| format!("scan of {} failed", rule.metric_type))?;
            }

            let latest = storage::latest_per_source(&conn, None)?;
            self.scan_divergence(domain, &latest, &mut report, &mut findings)?;
            self.scan_freshness(domain, now, &latest, &mut report, &mut findings)?;
        }

        let policy = self.config.domain(domain).signal_policy();
        let signals = findings.into_iter().map(|f| f.into_signal(now, &policy)).collect();
        for signal in collapse_by_fingerprint(signals) {
            match self.store.emit(&signal)? {
                Emission::Created => report.signals_created += 1,
                Emission::Refreshed => report.signals_refreshed += 1,
            }
        }

        info!(
            %domain,
            series = report.series_scanned,
            anomalies = report.anomalies,
            divergences = report.divergences,
            stale = report.stale,
            created = report.signals_created,
            refreshed = report.signals_refreshed,
            "scan complete"
        );
        Ok(report)
    }

    fn scan_metric(
        &self,
        conn: &Connection,
        domain: Domain,
        rule: &MetricRule,
        now: DateTime<Utc>,
        report: &mut ScanReport,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        let domain_cfg = self.config.domain(domain);
        let since = now - domain_cfg.window();

        for (entity_id, source) in storage::series_keys(conn, &rule.metric_type)? {
            let mut window = storage::load_window(conn, &entity_id, &rule.metric_type, source, since)?;
            // Newest row is the value under test; the rest is history.
            let Some(current) = window.pop() else {
                continue;
            };
            report.series_scanned += 1;

            let params = BaselineParams {
                entity_scope: &entity_id,
                metric_type: &rule.metric_type,
                threshold_sigma: domain_cfg.threshold_for(rule.anomaly_type),
                window_days: domain_cfg.window_days,
                computed_at: now,
            };
            let baseline = with_source!(source, |S| narrow::<S>(window).map(|h| build_baseline(&h, &params)))?;
            storage::save_baseline(conn, &baseline)?;

            let detection = detect(current.value, &baseline, rule.anomaly_type);
            debug!(
                entity = %entity_id,
                metric = %rule.metric_type,
                %source,
                z = detection.z_score,
                samples = baseline.sample_count,
                "series checked"
            );
            if !detection.is_anomaly {
                continue;
            }

            report.anomalies += 1;
            warn!(
                entity = %entity_id,
                metric = %rule.metric_type,
                %source,
                observed = current.value,
                mean = baseline.mean,
                z = detection.z_score,
                severity = %detection.severity,
                "anomaly detected"
            );
            findings.push(Finding {
                anomaly_type: rule.anomaly_type,
                severity: detection.severity,
                entity_name: self.entity_name(&entity_id),
                entity_id,
                entity_type: current.entity_type,
                metric_type: rule.metric_type.clone(),
                observed_value: Some(current.value),
                baseline_value: Some(baseline.mean),
                z_score: Some(detection.z_score),
                source: Some(source),
                raw_data: json!({
                    "epoch": current.epoch,
                    "std_dev": baseline.std_dev,
                    "sample_count": baseline.sample_count,
                    "threshold": detection.threshold,
                }),
            });
        }
        Ok(())
    }

    fn scan_divergence(
        &self,
        domain: Domain,
        latest: &[RawObservation],
        report: &mut ScanReport,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        for rule in self.config.pair_rules(domain) {
            let outcome = reconcile_latest(rule, latest);
            for (entity_id, reason) in &outcome.skipped {
                report.skipped_pairs += 1;
                warn!(entity = %entity_id, metric = %rule.metric_type, %reason, "pair not reconciled");
            }
            for record in outcome.records.into_iter().filter(|r| r.diverged) {
                report.divergences += 1;
                let Some(entity_type) = self.entity_type(&record.entity_id, latest) else {
                    continue;
                };
                warn!(
                    entity = %record.entity_id,
                    metric = %rule.metric_type,
                    delta = record.delta,
                    "sources diverged"
                );
                findings.push(Finding {
                    anomaly_type: AnomalyType::SourceDivergence,
                    severity: AnomalyType::SourceDivergence.base_severity(),
                    entity_name: self.entity_name(&record.entity_id),
                    entity_id: record.entity_id.clone(),
                    entity_type,
                    metric_type: rule.metric_type.clone(),
                    observed_value: Some(record.source_a_value),
                    baseline_value: Some(record.source_b_value),
                    z_score: None,
                    source: None,
                    raw_data: serde_json::to_value(&record)?,
                });
            }
        }
        Ok(())
    }

    fn scan_freshness(
        &self,
        domain: Domain,
        now: DateTime<Utc>,
        latest: &[RawObservation],
        report: &mut ScanReport,
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        for record in self.domain_freshness(domain, now, latest) {
            match record.tier {
                FreshnessTier::NoData => report.no_data += 1,
                FreshnessTier::Critical => {
                    report.stale += 1;
                    let Some(entity_type) = self.entity_type(&record.entity_id, latest) else {
                        continue;
                    };
                    warn!(entity = %record.entity_id, source = %record.source, hours_old = ?record.hours_old, "feed stale");
                    findings.push(Finding {
                        anomaly_type: AnomalyType::FeedStale,
                        severity: AnomalyType::FeedStale.base_severity(),
                        entity_name: self.entity_name(&record.entity_id),
                        entity_id: record.entity_id.clone(),
                        entity_type,
                        metric_type: "hours_old".to_string(),
                        observed_value: record.hours_old,
                        baseline_value: Some(self.config.freshness.stale_hours),
                        z_score: None,
                        source: Some(record.source),
                        raw_data: serde_json::to_value(&record)?,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn domain_freshness(&self, domain: Domain, now: DateTime<Utc>, latest: &[RawObservation]) -> Vec<FreshnessRecord> {
        let sources = &self.config.domain(domain).sources;
        let roster = self.config.roster(sources);
        let observed: Vec<RawObservation> = latest
            .iter()
            .filter(|o| sources.contains(&o.source))
            .cloned()
            .collect();
        freshness_view(now, &roster, &observed, &self.config.freshness)
    }

    /// Current divergence view across every configured pair rule.
    pub fn divergence(&self) -> Result<Vec<DivergenceRecord>> {
        let conn = self.pool.get()?;
        let latest = storage::latest_per_source(&conn, None)?;
        Ok(self
            .config
            .reconcile
            .iter()
            .flat_map(|rule| reconcile_latest(rule, &latest).records)
            .collect())
    }

    /// Freshness of every observed or tracked (entity, source) pair.
    pub fn freshness(&self, now: DateTime<Utc>) -> Result<Vec<FreshnessRecord>> {
        let conn = self.pool.get()?;
        let latest = storage::latest_per_source(&conn, None)?;
        let roster = self.config.roster(&[]);
        Ok(freshness_view(now, &roster, &latest, &self.config.freshness))
    }

    fn entity_name(&self, entity_id: &str) -> Option<String> {
        self.config.entity(entity_id).map(|e| e.name.clone())
    }

    fn entity_type(&self, entity_id: &str, latest: &[RawObservation]) -> Option<EntityType> {
        self.config
            .entity(entity_id)
            .map(|e| e.entity_type)
            .or_else(|| latest.iter().find(|o| o.entity_id == entity_id).map(|o| o.entity_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackedEntity;
    use crate::detect::Severity;
    use crate::observation::Source;
    use crate::storage::test_support::temp_pool;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn obs(metric: &str, source: Source, value: f64, epoch: DateTime<Utc>) -> RawObservation {
        RawObservation {
            entity_id: "BW3".to_string(),
            entity_type: EntityType::Satellite,
            metric_type: metric.to_string(),
            source,
            value,
            epoch,
        }
    }

    fn config_with_roster() -> Arc<SkywatchConfig> {
        let mut cfg = SkywatchConfig::default();
        cfg.entities.push(TrackedEntity {
            id: "BW3".to_string(),
            name: "BlueWalker 3".to_string(),
            entity_type: EntityType::Satellite,
            sources: vec![Source::SpaceTrack, Source::Celestrak],
        });
        Arc::new(cfg)
    }

    /// 29 daily altitude readings around 507 km, then a current reading.
    fn altitude_history(source: Source, current: f64) -> Vec<RawObservation> {
        let mut rows: Vec<RawObservation> = (1..30)
            .map(|day| {
                let v = if day % 2 == 0 { 505.7 } else { 508.3 };
                obs("altitude_km", source, v, now() - Duration::days(day) - Duration::hours(1))
            })
            .collect();
        rows.push(obs("altitude_km", source, current, now() - Duration::hours(1)));
        rows
    }

    #[test]
    fn test_orbit_drop_escalates_to_critical() -> Result<()> {
        let (_dir, pool) = temp_pool();
        storage::save_observations(&pool, &altitude_history(Source::SpaceTrack, 498.3))?;
        let engine = ScanEngine::new(pool, config_with_roster());

        let report = engine.scan_at(Domain::Orbital, now())?;
        assert_eq!(report.anomalies, 1);
        assert_eq!(report.signals_created, 1);

        let signals = engine.store().list_active(now(), 10)?;
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.anomaly_type, AnomalyType::OrbitalDeviation);
        assert_eq!(s.severity, Severity::Critical);
        assert_eq!(s.entity_name.as_deref(), Some("BlueWalker 3"));
        assert!(s.z_score.unwrap() < -6.0, "z = {:?}", s.z_score);
        assert!((s.baseline_value.unwrap() - 507.0).abs() < 0.1);
        assert_eq!(s.expires_at, now() + Duration::hours(48));
        Ok(())
    }

    #[test]
    fn test_rescan_refreshes_instead_of_duplicating() -> Result<()> {
        let (_dir, pool) = temp_pool();
        storage::save_observations(&pool, &altitude_history(Source::SpaceTrack, 498.3))?;
        let engine = ScanEngine::new(pool, config_with_roster());

        engine.scan_at(Domain::Orbital, now())?;
        let second = engine.scan_at(Domain::Orbital, now() + Duration::minutes(30))?;
        assert_eq!(second.signals_created, 0);
        assert_eq!(second.signals_refreshed, 1);
        assert_eq!(engine.store().list_all(10)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_same_type_anomalies_share_one_signal() -> Result<()> {
        let (_dir, pool) = temp_pool();
        storage::save_observations(&pool, &altitude_history(Source::SpaceTrack, 498.3))?;
        let mut drag: Vec<RawObservation> = (1..30)
            .map(|day| {
                let v = if day % 2 == 0 { 0.000105 } else { 0.000115 };
                obs("bstar", Source::SpaceTrack, v, now() - Duration::days(day) - Duration::hours(1))
            })
            .collect();
        drag.push(obs("bstar", Source::SpaceTrack, 0.0009, now() - Duration::hours(1)));
        storage::save_observations(&pool, &drag)?;
        let engine = ScanEngine::new(pool, config_with_roster());

        let report = engine.scan_at(Domain::Orbital, now())?;
        assert_eq!(report.anomalies, 2);
        assert_eq!(report.signals_created, 1);
        assert_eq!(report.signals_refreshed, 0);

        // Both are critical; the larger |z| owns the row, with its own numbers.
        let signals = engine.store().list_all(10)?;
        assert_eq!(signals.len(), 1);
        let s = &signals[0];
        assert_eq!(s.severity, Severity::Critical);
        assert_eq!(s.metric_type, "bstar");
        assert_eq!(s.source, Some(Source::SpaceTrack));
        assert_eq!(s.observed_value, Some(0.0009));
        assert!((s.baseline_value.unwrap() - 0.00011).abs() < 0.000001);
        assert!(s.z_score.unwrap() > 6.0);
        assert_eq!(s.raw_data["sample_count"], 29);
        Ok(())
    }

    #[test]
    fn test_two_stale_sources_collapse_to_one_signal() -> Result<()> {
        let (_dir, pool) = temp_pool();
        storage::save_observations(
            &pool,
            &[
                obs("altitude_km", Source::SpaceTrack, 507.0, now() - Duration::hours(30)),
                obs("altitude_km", Source::Celestrak, 507.1, now() - Duration::hours(40)),
            ],
        )?;
        let engine = ScanEngine::new(pool, config_with_roster());
        let report = engine.scan_at(Domain::Orbital, now())?;
        assert_eq!(report.stale, 2);
        assert_eq!(report.signals_created, 1);
        assert_eq!(report.signals_refreshed, 0);

        let signals = engine.store().list_all(10)?;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].anomaly_type, AnomalyType::FeedStale);
        let hours = signals[0].observed_value.unwrap();
        let expected = match signals[0].source {
            Some(Source::SpaceTrack) => 30.0,
            Some(Source::Celestrak) => 40.0,
            other => panic!("unexpected source {other:?}"),
        };
        assert!((hours - expected).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_baselines_stay_per_source() -> Result<()> {
        let (_dir, pool) = temp_pool();
        storage::save_observations(&pool, &altitude_history(Source::SpaceTrack, 507.1))?;
        let offset: Vec<RawObservation> = altitude_history(Source::Celestrak, 507.0)
            .into_iter()
            .map(|mut o| {
                o.value -= 27.0;
                o
            })
            .collect();
        storage::save_observations(&pool, &offset)?;
        let engine = ScanEngine::new(pool.clone(), config_with_roster());

        let report = engine.scan_at(Domain::Orbital, now())?;
        assert_eq!(report.anomalies, 0);

        let conn = pool.get()?;
        let baselines = storage::list_baselines(&conn)?;
        let alt: Vec<_> = baselines.iter().filter(|b| b.metric_type == "altitude_km").collect();
        assert_eq!(alt.len(), 2);
        let st = alt.iter().find(|b| b.source == Source::SpaceTrack).unwrap();
        let ct = alt.iter().find(|b| b.source == Source::Celestrak).unwrap();
        assert!((st.mean - 507.0).abs() < 0.1);
        assert!((ct.mean - 480.0).abs() < 0.1);
        assert_eq!(st.sample_count, 29);
        Ok(())
    }

    #[test]
    fn test_threshold_override_reaches_baseline() -> Result<()> {
        let (_dir, pool) = temp_pool();
        storage::save_observations(&pool, &altitude_history(Source::SpaceTrack, 507.0))?;
        let mut cfg = (*config_with_roster()).clone();
        cfg.domains
            .orbital
            .threshold_sigma
            .insert(AnomalyType::OrbitalDeviation, 1.5);
        let engine = ScanEngine::new(pool.clone(), Arc::new(cfg));
        engine.scan_at(Domain::Orbital, now())?;

        let conn = pool.get()?;
        let b = storage::list_baselines(&conn)?
            .into_iter()
            .find(|b| b.metric_type == "altitude_km")
            .unwrap();
        assert_eq!(b.threshold_sigma, Some(1.5));
        Ok(())
    }

    #[test]
    fn test_divergence_emits_signal_only_past_threshold() -> Result<()> {
        let (_dir, pool) = temp_pool();
        let t = now() - Duration::hours(2);
        storage::save_observations(
            &pool,
            &[
                obs("bstar", Source::SpaceTrack, 0.000118, t),
                obs("bstar", Source::Celestrak, 0.000042, t + Duration::hours(1)),
            ],
        )?;
        let engine = ScanEngine::new(pool.clone(), config_with_roster());
        let report = engine.scan_at(Domain::Orbital, now())?;
        assert_eq!(report.divergences, 0);

        let view = engine.divergence()?;
        assert_eq!(view.len(), 1);
        assert!(!view[0].diverged);

        storage::save_observations(&pool, &[obs("bstar", Source::Celestrak, 0.000500, t + Duration::hours(1) + Duration::minutes(5))])?;
        let report = engine.scan_at(Domain::Orbital, now())?;
        assert_eq!(report.divergences, 1);
        let signals = engine.store().list_active(now(), 10)?;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].anomaly_type, AnomalyType::SourceDivergence);
        assert_eq!(signals[0].severity, Severity::Medium);
        Ok(())
    }

    #[test]
    fn test_wide_epoch_gap_is_skipped() -> Result<()> {
        let (_dir, pool) = temp_pool();
        storage::save_observations(
            &pool,
            &[
                obs("bstar", Source::SpaceTrack, 0.0001, now() - Duration::hours(10)),
                obs("bstar", Source::Celestrak, 0.0009, now() - Duration::hours(1)),
            ],
        )?;
        let engine = ScanEngine::new(pool, config_with_roster());
        let report = engine.scan_at(Domain::Orbital, now())?;
        assert_eq!(report.skipped_pairs, 1);
        assert_eq!(report.divergences, 0);
        assert!(engine.divergence()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_stale_feed_signal_and_no_data() -> Result<()> {
        let (_dir, pool) = temp_pool();
        storage::save_observations(
            &pool,
            &[obs("altitude_km", Source::SpaceTrack, 507.0, now() - Duration::hours(30))],
        )?;
        let engine = ScanEngine::new(pool, config_with_roster());
        let report = engine.scan_at(Domain::Orbital, now())?;
        assert_eq!(report.stale, 1);
        assert_eq!(report.no_data, 1);

        let signals = engine.store().list_active(now(), 10)?;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].anomaly_type, AnomalyType::FeedStale);
        assert_eq!(signals[0].source, Some(Source::SpaceTrack));

        let view = engine.freshness(now())?;
        let tiers: Vec<_> = view.iter().map(|r| (r.source, r.tier)).collect();
        assert_eq!(
            tiers,
            vec![(Source::SpaceTrack, FreshnessTier::Critical), (Source::Celestrak, FreshnessTier::NoData)]
        );
        Ok(())
    }

    #[test]
    fn test_empty_store_scans_cleanly() -> Result<()> {
        let (_dir, pool) = temp_pool();
        let engine = ScanEngine::new(pool, Arc::new(SkywatchConfig::default()));
        for domain in Domain::ALL {
            let report = engine.scan_at(domain, now())?;
            assert_eq!(report.series_scanned, 0);
            assert_eq!(report.signals_created, 0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_run_scan_on_blocking_pool() -> Result<()> {
        let (_dir, pool) = temp_pool();
        let engine = ScanEngine::new(pool, Arc::new(SkywatchConfig::default()));
        let report = engine.run_scan(Domain::Market).await?;
        assert_eq!(report.domain, Domain::Market);
        Ok(())
    }
}
