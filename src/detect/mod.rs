//! Baselines, anomaly classification, and the periodic scan engine.

pub mod anomaly;
pub mod baseline;
pub mod engine;

use crate::observation::Domain;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unknown anomaly type '{0}'")]
    UnknownAnomalyType(String),
    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),
}

/// Ordered severity scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const MAX: Severity = Severity::Critical;

    pub fn rank(self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }

    /// Ranks above the maximum clamp to critical.
    pub fn from_rank(rank: u8) -> Severity {
        match rank {
            0 => Severity::Low,
            1 => Severity::Medium,
            2 => Severity::High,
            _ => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(DetectError::UnknownSeverity(other.to_string())),
        }
    }
}

/// Closed set of anomaly codes. Adding a variant forces an entry in every
/// table below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    OrbitalDeviation,
    OrbitalManeuver,
    RegulatoryUnusual,
    RegulatoryUpdate,
    MarketVolume,
    MarketPrice,
    MarketOptions,
    NewsSpike,
    SourceDivergence,
    FeedStale,
}

impl AnomalyType {
    pub const ALL: [AnomalyType; 10] = [
        AnomalyType::OrbitalDeviation,
        AnomalyType::OrbitalManeuver,
        AnomalyType::RegulatoryUnusual,
        AnomalyType::RegulatoryUpdate,
        AnomalyType::MarketVolume,
        AnomalyType::MarketPrice,
        AnomalyType::MarketOptions,
        AnomalyType::NewsSpike,
        AnomalyType::SourceDivergence,
        AnomalyType::FeedStale,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::OrbitalDeviation => "orbital_deviation",
            AnomalyType::OrbitalManeuver => "orbital_maneuver",
            AnomalyType::RegulatoryUnusual => "regulatory_unusual",
            AnomalyType::RegulatoryUpdate => "regulatory_update",
            AnomalyType::MarketVolume => "market_volume",
            AnomalyType::MarketPrice => "market_price",
            AnomalyType::MarketOptions => "market_options",
            AnomalyType::NewsSpike => "news_spike",
            AnomalyType::SourceDivergence => "source_divergence",
            AnomalyType::FeedStale => "feed_stale",
        }
    }

    pub fn base_severity(&self) -> Severity {
        match self {
            AnomalyType::OrbitalDeviation => Severity::Medium,
            AnomalyType::OrbitalManeuver => Severity::High,
            AnomalyType::RegulatoryUnusual => Severity::Medium,
            AnomalyType::RegulatoryUpdate => Severity::Low,
            AnomalyType::MarketVolume => Severity::Medium,
            AnomalyType::MarketPrice => Severity::Medium,
            AnomalyType::MarketOptions => Severity::High,
            AnomalyType::NewsSpike => Severity::Low,
            AnomalyType::SourceDivergence => Severity::Medium,
            AnomalyType::FeedStale => Severity::Low,
        }
    }

    /// Default sigma threshold when the baseline carries no override.
    pub fn default_threshold(&self) -> f64 {
        match self {
            AnomalyType::OrbitalDeviation => 3.0,
            AnomalyType::OrbitalManeuver => 2.5,
            AnomalyType::RegulatoryUnusual => 2.0,
            AnomalyType::RegulatoryUpdate => 2.0,
            AnomalyType::MarketVolume => 2.5,
            AnomalyType::MarketPrice => 3.0,
            AnomalyType::MarketOptions => 2.5,
            AnomalyType::NewsSpike => 2.0,
            AnomalyType::SourceDivergence => 3.0,
            AnomalyType::FeedStale => 3.0,
        }
    }

    /// Owning domain. `FeedStale` is cross-domain and reports `None`.
    pub fn domain(&self) -> Option<Domain> {
        match self {
            AnomalyType::OrbitalDeviation
            | AnomalyType::OrbitalManeuver
            | AnomalyType::SourceDivergence => Some(Domain::Orbital),
            AnomalyType::RegulatoryUnusual | AnomalyType::RegulatoryUpdate => Some(Domain::Regulatory),
            AnomalyType::MarketVolume | AnomalyType::MarketPrice | AnomalyType::MarketOptions => {
                Some(Domain::Market)
            }
            AnomalyType::NewsSpike => Some(Domain::News),
            AnomalyType::FeedStale => None,
        }
    }
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnomalyType {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AnomalyType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DetectError::UnknownAnomalyType(s.to_string()))
    }
}
