//! Normalization of inbound observation records.
//!
//! Collaborators deliver JSON lines. Records with unusable values are dropped
//! here so nothing downstream ever sees a null or NaN; records with unknown
//! code tags are producer bugs and fail the batch.

use crate::geometry;
use crate::observation::{CodeError, EntityType, RawObservation, Source};
use crate::storage::{self, Pool};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Metric derived from TLE mean motion at ingest time.
pub const DERIVED_ALTITUDE_METRIC: &str = "altitude_km";
const MEAN_MOTION_METRIC: &str = "mean_motion";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("line {line}: malformed record: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("line {line}: {source}")]
    Code {
        line: usize,
        #[source]
        source: CodeError,
    },
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire form of one observation, as produced by the feed adapters.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservationRecord {
    pub entity_id: String,
    pub entity_type: String,
    pub metric_type: String,
    pub source: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub epoch: Option<String>,
}

/// Accept finite numbers and numeric strings; everything else is unusable.
pub fn parse_value(value: &serde_json::Value) -> Option<f64> {
    let v = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// Validate one record. `Ok(None)` means "drop quietly".
pub fn normalize(record: &ObservationRecord) -> Result<Option<RawObservation>, CodeError> {
    let source: Source = record.source.parse()?;
    let entity_type: EntityType = record.entity_type.parse()?;

    let Some(value) = parse_value(&record.value) else {
        debug!(entity = %record.entity_id, metric = %record.metric_type, %source, "dropping non-numeric value");
        return Ok(None);
    };
    let Some(epoch) = record
        .epoch
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
    else {
        debug!(entity = %record.entity_id, metric = %record.metric_type, %source, "dropping record without epoch");
        return Ok(None);
    };
    if record.entity_id.trim().is_empty() || record.metric_type.trim().is_empty() {
        return Ok(None);
    }

    Ok(Some(RawObservation {
        entity_id: record.entity_id.trim().to_string(),
        entity_type,
        metric_type: record.metric_type.trim().to_string(),
        source,
        value,
        epoch,
    }))
}

/// Physical metrics computed from orbital elements. Same source and epoch as
/// the element they came from.
pub fn derive_metrics(obs: &RawObservation) -> Option<RawObservation> {
    if obs.metric_type != MEAN_MOTION_METRIC {
        return None;
    }
    let altitude = geometry::altitude_from_mean_motion(obs.value)?;
    Some(RawObservation {
        metric_type: DERIVED_ALTITUDE_METRIC.to_string(),
        value: altitude,
        ..obs.clone()
    })
}

#[derive(Debug, Default)]
pub struct IngestBatch {
    pub observations: Vec<RawObservation>,
    pub lines: usize,
    pub skipped: usize,
    pub derived: usize,
}

/// Parse JSON lines. Blank lines are ignored.
pub fn read_jsonl<R: BufRead>(reader: R) -> Result<IngestBatch, IngestError> {
    let mut batch = IngestBatch::default();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        batch.lines += 1;
        let line_no = idx + 1;
        let record: ObservationRecord =
            serde_json::from_str(&line).map_err(|source| IngestError::Malformed { line: line_no, source })?;
        match normalize(&record).map_err(|source| IngestError::Code { line: line_no, source })? {
            Some(obs) => {
                if let Some(derived) = derive_metrics(&obs) {
                    batch.observations.push(derived);
                    batch.derived += 1;
                }
                batch.observations.push(obs);
            }
            None => batch.skipped += 1,
        }
    }
    Ok(batch)
}

#[derive(Debug, Serialize)]
pub struct IngestReport {
    pub lines: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub derived: usize,
}

/// Read a JSON-lines file and persist every usable observation.
pub fn ingest_file(pool: &Pool, path: &Path) -> Result<IngestReport> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let batch = read_jsonl(std::io::BufReader::new(file))
        .with_context(|| format!("rejected observation file {}", path.display()))?;

    let stored = storage::save_observations(pool, &batch.observations)?;
    let report = IngestReport {
        lines: batch.lines,
        stored,
        duplicates: batch.observations.len() - stored,
        skipped: batch.skipped,
        derived: batch.derived,
    };
    if report.skipped > 0 {
        warn!(skipped = report.skipped, path = %path.display(), "dropped records with unusable values");
    }
    info!(lines = report.lines, stored = report.stored, duplicates = report.duplicates, "ingest complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> ObservationRecord {
        ObservationRecord {
            entity_id: "BW3".to_string(),
            entity_type: "satellite".to_string(),
            metric_type: "altitude_km".to_string(),
            source: "space_track".to_string(),
            value,
            epoch: Some("2026-10-01T00:00:00Z".to_string()),
        }
    }

    #[test]
    fn test_parse_value_variants() {
        assert_eq!(parse_value(&json!(507.1)), Some(507.1));
        assert_eq!(parse_value(&json!(" 507.1 ")), Some(507.1));
        assert_eq!(parse_value(&json!(null)), None);
        assert_eq!(parse_value(&json!("n/a")), None);
        assert_eq!(parse_value(&json!("NaN")), None);
        assert_eq!(parse_value(&json!("inf")), None);
        assert_eq!(parse_value(&json!([1.0])), None);
    }

    #[test]
    fn test_normalize_drops_unusable_values() {
        assert!(normalize(&record(json!(null))).unwrap().is_none());
        let obs = normalize(&record(json!(507.1))).unwrap().unwrap();
        assert_eq!(obs.source, Source::SpaceTrack);
        assert_eq!(obs.value, 507.1);
    }

    #[test]
    fn test_normalize_drops_missing_epoch() {
        let mut r = record(json!(507.1));
        r.epoch = None;
        assert!(normalize(&r).unwrap().is_none());
        r.epoch = Some("yesterday".to_string());
        assert!(normalize(&r).unwrap().is_none());
    }

    #[test]
    fn test_unknown_source_is_an_error() {
        let mut r = record(json!(507.1));
        r.source = "space-track".to_string();
        assert!(matches!(normalize(&r), Err(CodeError::UnknownSource(_))));
    }

    #[test]
    fn test_mean_motion_derives_altitude() {
        let mut r = record(json!(15.5));
        r.metric_type = "mean_motion".to_string();
        let obs = normalize(&r).unwrap().unwrap();
        let derived = derive_metrics(&obs).unwrap();
        assert_eq!(derived.metric_type, DERIVED_ALTITUDE_METRIC);
        assert_eq!(derived.source, obs.source);
        assert_eq!(derived.epoch, obs.epoch);
        assert!(derived.value > 380.0 && derived.value < 440.0);

        assert!(derive_metrics(&normalize(&record(json!(507.1))).unwrap().unwrap()).is_none());
    }

    #[test]
    fn test_read_jsonl_counts() {
        let input = r#"{"entity_id":"BW3","entity_type":"satellite","metric_type":"altitude_km","source":"space_track","value":507.1,"epoch":"2026-10-01T00:00:00Z"}

{"entity_id":"BW3","entity_type":"satellite","metric_type":"altitude_km","source":"celestrak","value":null,"epoch":"2026-10-01T00:00:00Z"}
{"entity_id":"BW3","entity_type":"satellite","metric_type":"mean_motion","source":"celestrak","value":"15.2","epoch":"2026-10-01T00:00:00Z"}
"#;
        let batch = read_jsonl(input.as_bytes()).unwrap();
        assert_eq!(batch.lines, 3);
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.derived, 1);
        assert_eq!(batch.observations.len(), 3);
    }

    #[test]
    fn test_read_jsonl_reports_line_of_bad_tag() {
        let input = "{\"entity_id\":\"BW3\",\"entity_type\":\"satellite\",\"metric_type\":\"altitude_km\",\"source\":\"space_track\",\"value\":1,\"epoch\":\"2026-10-01T00:00:00Z\"}\n\
                     {\"entity_id\":\"BW3\",\"entity_type\":\"moon\",\"metric_type\":\"altitude_km\",\"source\":\"space_track\",\"value\":1,\"epoch\":\"2026-10-01T00:00:00Z\"}\n";
        let err = read_jsonl(input.as_bytes()).unwrap_err();
        assert!(matches!(err, IngestError::Code { line: 2, .. }), "{err}");
    }

    #[test]
    fn test_read_jsonl_rejects_garbage_line() {
        let err = read_jsonl("not json\n".as_bytes()).unwrap_err();
        assert!(matches!(err, IngestError::Malformed { line: 1, .. }));
    }
}
