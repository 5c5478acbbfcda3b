//! TOML configuration for skywatch.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working setup. The config is passed explicitly into the scan
//! engine; nothing here is global.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::AnomalyType;
use crate::freshness::FreshnessThresholds;
use crate::observation::{Domain, EntityType, Source};
use crate::reconcile::{PairRule, DEFAULT_DIVERGENCE_THRESHOLD, DEFAULT_MAX_EPOCH_GAP_HOURS, MAX_EPOCH_GAP_HOURS};
use crate::signal::SignalPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the skywatch process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkywatchConfig {
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub freshness: FreshnessThresholds,
    pub domains: DomainsConfig,
    pub metrics: Vec<MetricRule>,
    pub reconcile: Vec<PairRule>,
    pub entities: Vec<TrackedEntity>,
}

impl Default for SkywatchConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            freshness: FreshnessThresholds::default(),
            domains: DomainsConfig::default(),
            metrics: default_metric_rules(),
            reconcile: vec![PairRule {
                metric_type: "bstar".to_string(),
                source_a: Source::SpaceTrack,
                source_b: Source::Celestrak,
                threshold: DEFAULT_DIVERGENCE_THRESHOLD,
                max_epoch_gap_hours: DEFAULT_MAX_EPOCH_GAP_HOURS,
            }],
            entities: Vec::new(),
        }
    }
}

impl SkywatchConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded skywatch configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `SKYWATCH_CONFIG` environment variable.
    /// 2. `/etc/skywatch/skywatch.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("SKYWATCH_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SKYWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/skywatch/skywatch.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Range-check values that later become durations or comparisons.
    pub fn validate(&self) -> Result<()> {
        for domain in Domain::ALL {
            let d = self.domain(domain);
            ensure!(
                (1..=MAX_WINDOW_DAYS).contains(&d.window_days),
                "domains.{domain}.window_days must be within 1..={MAX_WINDOW_DAYS}, got {}",
                d.window_days
            );
            ensure!(
                (1..=MAX_BUCKET_MINUTES).contains(&d.signal_bucket_minutes),
                "domains.{domain}.signal_bucket_minutes must be within 1..={MAX_BUCKET_MINUTES}, got {}",
                d.signal_bucket_minutes
            );
            ensure!(
                (1..=MAX_TTL_HOURS).contains(&d.signal_ttl_hours),
                "domains.{domain}.signal_ttl_hours must be within 1..={MAX_TTL_HOURS}, got {}",
                d.signal_ttl_hours
            );
            for (anomaly_type, sigma) in &d.threshold_sigma {
                ensure!(
                    sigma.is_finite() && *sigma > 0.0,
                    "domains.{domain}.threshold_sigma.{anomaly_type} must be a positive number, got {sigma}"
                );
            }
        }

        for rule in &self.reconcile {
            ensure!(
                rule.threshold.is_finite() && rule.threshold >= 0.0,
                "reconcile threshold for {} must be a non-negative number, got {}",
                rule.metric_type,
                rule.threshold
            );
            ensure!(
                rule.max_epoch_gap_hours.is_finite()
                    && rule.max_epoch_gap_hours > 0.0
                    && rule.max_epoch_gap_hours <= MAX_EPOCH_GAP_HOURS,
                "reconcile max_epoch_gap_hours for {} must be within (0, {MAX_EPOCH_GAP_HOURS}], got {}",
                rule.metric_type,
                rule.max_epoch_gap_hours
            );
        }

        let f = &self.freshness;
        ensure!(
            [f.fresh_hours, f.ok_hours, f.stale_hours].iter().all(|h| h.is_finite() && *h > 0.0)
                && f.fresh_hours <= f.ok_hours
                && f.ok_hours <= f.stale_hours,
            "freshness thresholds must be positive and ascending, got {}/{}/{}",
            f.fresh_hours,
            f.ok_hours,
            f.stale_hours
        );
        Ok(())
    }

    pub fn domain(&self, domain: Domain) -> &DomainConfig {
        self.domains.get(domain)
    }

    pub fn metric_rules(&self, domain: Domain) -> impl Iterator<Item = &MetricRule> + '_ {
        self.metrics.iter().filter(move |m| m.domain == domain)
    }

    /// Pair rules whose metric is scanned in `domain`.
    pub fn pair_rules(&self, domain: Domain) -> impl Iterator<Item = &PairRule> + '_ {
        self.reconcile.iter().filter(move |p| {
            self.metrics
                .iter()
                .any(|m| m.domain == domain && m.metric_type == p.metric_type)
        })
    }

    pub fn entity(&self, id: &str) -> Option<&TrackedEntity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Tracked (entity, source) pairs, limited to `sources` unless it is empty.
    pub fn roster(&self, sources: &[Source]) -> Vec<(String, Source)> {
        self.entities
            .iter()
            .flat_map(|e| e.sources.iter().map(move |s| (e.id.clone(), *s)))
            .filter(|(_, s)| sources.is_empty() || sources.contains(s))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Storage / API / Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/skywatch.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Upper bound on rows returned by list endpoints.
    pub max_rows: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8640".to_string(),
            max_rows: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Domains
// ---------------------------------------------------------------------------

const MAX_WINDOW_DAYS: u32 = 3650;
const MAX_BUCKET_MINUTES: i64 = 7 * 24 * 60;
const MAX_TTL_HOURS: i64 = 366 * 24;

/// Per-domain cadence, history window, and signal policy.
#[derive(Debug, Clone, Serialize)]
pub struct DomainConfig {
    /// Baseline window length (days).
    pub window_days: u32,
    /// Scan cadence, 6-field cron (`sec min hour dom month dow`).
    pub cadence: String,
    /// Width of the fingerprint time bucket (minutes).
    pub signal_bucket_minutes: i64,
    /// How long a signal stays in the active feed (hours).
    pub signal_ttl_hours: i64,
    /// Feeds this domain reads; drives the freshness view.
    pub sources: Vec<Source>,
    /// Threshold overrides keyed by anomaly type.
    #[serde(serialize_with = "threshold_map::serialize")]
    pub threshold_sigma: BTreeMap<AnomalyType, f64>,
}

impl DomainConfig {
    fn new(window_days: u32, cadence: &str, bucket_minutes: i64, ttl_hours: i64, sources: Vec<Source>) -> Self {
        Self {
            window_days,
            cadence: cadence.to_string(),
            signal_bucket_minutes: bucket_minutes,
            signal_ttl_hours: ttl_hours,
            sources,
            threshold_sigma: BTreeMap::new(),
        }
    }

    pub fn signal_policy(&self) -> SignalPolicy {
        SignalPolicy {
            bucket: Duration::minutes(self.signal_bucket_minutes.clamp(1, MAX_BUCKET_MINUTES)),
            ttl: Duration::hours(self.signal_ttl_hours.clamp(1, MAX_TTL_HOURS)),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::days(i64::from(self.window_days.min(MAX_WINDOW_DAYS)))
    }

    pub fn threshold_for(&self, anomaly_type: AnomalyType) -> Option<f64> {
        self.threshold_sigma.get(&anomaly_type).copied()
    }
}

/// TOML keys are plain strings; anomaly-type keys go through the strict parser.
mod threshold_map {
    use super::AnomalyType;
    use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(map: &BTreeMap<AnomalyType, f64>, ser: S) -> Result<S::Ok, S::Error> {
        map.iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect::<BTreeMap<&str, f64>>()
            .serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<BTreeMap<AnomalyType, f64>, D::Error> {
        BTreeMap::<String, f64>::deserialize(de)?
            .into_iter()
            .map(|(k, v)| k.parse::<AnomalyType>().map(|t| (t, v)).map_err(D::Error::custom))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainsConfig {
    pub orbital: DomainConfig,
    pub regulatory: DomainConfig,
    pub market: DomainConfig,
    pub news: DomainConfig,
}

impl Default for DomainsConfig {
    fn default() -> Self {
        Self {
            orbital: DomainConfig::new(30, "0 0 */2 * * *", 120, 48, vec![Source::SpaceTrack, Source::Celestrak]),
            regulatory: DomainConfig::new(90, "0 */15 * * * *", 15, 168, vec![Source::SecEdgar, Source::Fcc]),
            market: DomainConfig::new(20, "0 */5 * * * *", 5, 24, vec![Source::MarketFeed]),
            news: DomainConfig::new(14, "0 */30 * * * *", 30, 24, vec![Source::NewsFeed]),
        }
    }
}

/// A `[domains.<name>]` section as written; absent keys fall back to that
/// domain's own defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DomainOverride {
    window_days: Option<u32>,
    cadence: Option<String>,
    signal_bucket_minutes: Option<i64>,
    signal_ttl_hours: Option<i64>,
    sources: Option<Vec<Source>>,
    #[serde(with = "threshold_map")]
    threshold_sigma: BTreeMap<AnomalyType, f64>,
}

impl DomainOverride {
    fn apply(self, base: DomainConfig) -> DomainConfig {
        let mut threshold_sigma = base.threshold_sigma;
        threshold_sigma.extend(self.threshold_sigma);
        DomainConfig {
            window_days: self.window_days.unwrap_or(base.window_days),
            cadence: self.cadence.unwrap_or(base.cadence),
            signal_bucket_minutes: self.signal_bucket_minutes.unwrap_or(base.signal_bucket_minutes),
            signal_ttl_hours: self.signal_ttl_hours.unwrap_or(base.signal_ttl_hours),
            sources: self.sources.unwrap_or(base.sources),
            threshold_sigma,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DomainsOverride {
    orbital: DomainOverride,
    regulatory: DomainOverride,
    market: DomainOverride,
    news: DomainOverride,
}

impl<'de> Deserialize<'de> for DomainsConfig {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let overrides = DomainsOverride::deserialize(de)?;
        let base = DomainsConfig::default();
        Ok(Self {
            orbital: overrides.orbital.apply(base.orbital),
            regulatory: overrides.regulatory.apply(base.regulatory),
            market: overrides.market.apply(base.market),
            news: overrides.news.apply(base.news),
        })
    }
}

impl DomainsConfig {
    pub fn get(&self, domain: Domain) -> &DomainConfig {
        match domain {
            Domain::Orbital => &self.orbital,
            Domain::Regulatory => &self.regulatory,
            Domain::Market => &self.market,
            Domain::News => &self.news,
        }
    }
}

// ---------------------------------------------------------------------------
// Metric rules and roster
// ---------------------------------------------------------------------------

/// Which anomaly code a metric is judged under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRule {
    pub metric_type: String,
    pub domain: Domain,
    pub anomaly_type: AnomalyType,
}

fn rule(metric_type: &str, domain: Domain, anomaly_type: AnomalyType) -> MetricRule {
    MetricRule {
        metric_type: metric_type.to_string(),
        domain,
        anomaly_type,
    }
}

fn default_metric_rules() -> Vec<MetricRule> {
    vec![
        rule("altitude_km", Domain::Orbital, AnomalyType::OrbitalDeviation),
        rule("mean_motion", Domain::Orbital, AnomalyType::OrbitalManeuver),
        rule("bstar", Domain::Orbital, AnomalyType::OrbitalDeviation),
        rule("filing_count", Domain::Regulatory, AnomalyType::RegulatoryUnusual),
        rule("filing_updates", Domain::Regulatory, AnomalyType::RegulatoryUpdate),
        rule("volume", Domain::Market, AnomalyType::MarketVolume),
        rule("close_price", Domain::Market, AnomalyType::MarketPrice),
        rule("options_volume", Domain::Market, AnomalyType::MarketOptions),
        rule("article_count", Domain::News, AnomalyType::NewsSpike),
    ]
}

/// One entity in the fixed tracking roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub id: String,
    pub name: String,
    pub entity_type: EntityType,
    /// Feeds expected to report this entity.
    #[serde(default)]
    pub sources: Vec<Source>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
