//! Observation records and the closed code sets they carry.
//!
//! Raw records arrive with a runtime [`Source`]. Statistics never see raw
//! records directly: they are narrowed into [`Observation<S>`], whose source is
//! part of the type, so one series can only ever hold one source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("unknown source tag '{0}'")]
    UnknownSource(String),
    #[error("unknown entity type '{0}'")]
    UnknownEntityType(String),
    #[error("unknown domain '{0}'")]
    UnknownDomain(String),
    #[error("observation from {actual} cannot be used as {expected}")]
    SourceMismatch { expected: Source, actual: Source },
}

/// Independent upstream feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    SpaceTrack,
    Celestrak,
    SecEdgar,
    Fcc,
    MarketFeed,
    NewsFeed,
}

impl Source {
    pub const ALL: [Source; 6] = [
        Source::SpaceTrack,
        Source::Celestrak,
        Source::SecEdgar,
        Source::Fcc,
        Source::MarketFeed,
        Source::NewsFeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::SpaceTrack => "space_track",
            Source::Celestrak => "celestrak",
            Source::SecEdgar => "sec_edgar",
            Source::Fcc => "fcc",
            Source::MarketFeed => "market_feed",
            Source::NewsFeed => "news_feed",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .into_iter()
            .find(|src| src.as_str() == s.trim())
            .ok_or_else(|| CodeError::UnknownSource(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Satellite,
    Company,
    Security,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Satellite => "satellite",
            EntityType::Company => "company",
            EntityType::Security => "security",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "satellite" => Ok(EntityType::Satellite),
            "company" => Ok(EntityType::Company),
            "security" => Ok(EntityType::Security),
            other => Err(CodeError::UnknownEntityType(other.to_string())),
        }
    }
}

/// Data domains, each scanned on its own cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Orbital,
    Regulatory,
    Market,
    News,
}

impl Domain {
    pub const ALL: [Domain; 4] = [Domain::Orbital, Domain::Regulatory, Domain::Market, Domain::News];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Orbital => "orbital",
            Domain::Regulatory => "regulatory",
            Domain::Market => "market",
            Domain::News => "news",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == s.trim())
            .ok_or_else(|| CodeError::UnknownDomain(s.to_string()))
    }
}

/// A normalized record as produced by collaborators and stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub metric_type: String,
    pub source: Source,
    pub value: f64,
    pub epoch: DateTime<Utc>,
}

/// Compile-time source marker.
pub trait SourceTag: Copy + Send + Sync + 'static {
    const SOURCE: Source;
}

macro_rules! source_tags {
    ($($marker:ident => $variant:ident),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            pub struct $marker;

            impl SourceTag for $marker {
                const SOURCE: Source = Source::$variant;
            }
        )*
    };
}

source_tags! {
    SpaceTrack => SpaceTrack,
    Celestrak => Celestrak,
    SecEdgar => SecEdgar,
    Fcc => Fcc,
    MarketFeed => MarketFeed,
    NewsFeed => NewsFeed,
}

/// A single-source observation. `S` pins the feed it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation<S: SourceTag> {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub metric_type: String,
    pub value: f64,
    pub epoch: DateTime<Utc>,
    _source: PhantomData<S>,
}

impl<S: SourceTag> Observation<S> {
    pub fn source(&self) -> Source {
        S::SOURCE
    }

    pub fn into_raw(self) -> RawObservation {
        RawObservation {
            entity_id: self.entity_id,
            entity_type: self.entity_type,
            metric_type: self.metric_type,
            source: S::SOURCE,
            value: self.value,
            epoch: self.epoch,
        }
    }
}

impl<S: SourceTag> TryFrom<RawObservation> for Observation<S> {
    type Error = CodeError;

    fn try_from(raw: RawObservation) -> Result<Self, Self::Error> {
        if raw.source != S::SOURCE {
            return Err(CodeError::SourceMismatch {
                expected: S::SOURCE,
                actual: raw.source,
            });
        }
        Ok(Self {
            entity_id: raw.entity_id,
            entity_type: raw.entity_type,
            metric_type: raw.metric_type,
            value: raw.value,
            epoch: raw.epoch,
            _source: PhantomData,
        })
    }
}

/// Narrow a batch of raw rows to one source. Fails on the first foreign row.
pub fn narrow<S: SourceTag>(rows: Vec<RawObservation>) -> Result<Vec<Observation<S>>, CodeError> {
    rows.into_iter().map(Observation::<S>::try_from).collect()
}

/// Run a generic, source-typed function against rows whose source is only
/// known at runtime.
///
/// ```ignore
/// let baseline = with_source!(source, |S| build_for::<S>(rows));
/// ```
#[macro_export]
macro_rules! with_source {
    ($source:expr, |$tag:ident| $body:expr) => {{
        use $crate::observation as __obs;
        match $source {
            __obs::Source::SpaceTrack => {
                type $tag = __obs::SpaceTrack;
                $body
            }
            __obs::Source::Celestrak => {
                type $tag = __obs::Celestrak;
                $body
            }
            __obs::Source::SecEdgar => {
                type $tag = __obs::SecEdgar;
                $body
            }
            __obs::Source::Fcc => {
                type $tag = __obs::Fcc;
                $body
            }
            __obs::Source::MarketFeed => {
                type $tag = __obs::MarketFeed;
                $body
            }
            __obs::Source::NewsFeed => {
                type $tag = __obs::NewsFeed;
                $body
            }
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(source: Source, value: f64) -> RawObservation {
        RawObservation {
            entity_id: "BW3".to_string(),
            entity_type: EntityType::Satellite,
            metric_type: "altitude_km".to_string(),
            source,
            value,
            epoch: Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_source_tags_parse_strictly() {
        assert_eq!("space_track".parse::<Source>().unwrap(), Source::SpaceTrack);
        assert_eq!("celestrak".parse::<Source>().unwrap(), Source::Celestrak);
        assert!("SpaceTrack".parse::<Source>().is_err());
        assert!("".parse::<Source>().is_err());
    }

    #[test]
    fn test_narrow_rejects_foreign_source() {
        let rows = vec![raw(Source::SpaceTrack, 1.0), raw(Source::Celestrak, 2.0)];
        let err = narrow::<SpaceTrack>(rows).unwrap_err();
        assert!(matches!(
            err,
            CodeError::SourceMismatch { expected: Source::SpaceTrack, actual: Source::Celestrak }
        ));
    }

    #[test]
    fn test_narrow_keeps_source() {
        let typed = narrow::<Celestrak>(vec![raw(Source::Celestrak, 2.0)]).unwrap();
        assert_eq!(typed[0].source(), Source::Celestrak);
        assert_eq!(typed[0].clone().into_raw().source, Source::Celestrak);
    }

    #[test]
    fn test_with_source_dispatch() {
        for src in Source::ALL {
            let seen = with_source!(src, |S| <S as SourceTag>::SOURCE);
            assert_eq!(seen, src);
        }
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&raw(Source::SecEdgar, 3.0)).unwrap();
        assert!(json.contains("\"sec_edgar\""));
        assert!(json.contains("\"satellite\""));
    }
}
