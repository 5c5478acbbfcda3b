//! SQLite storage layer -- schema, observation windows, baselines.

pub mod schema;

use crate::detect::baseline::Baseline;
use crate::observation::{RawObservation, Source};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Timestamps are stored as fixed-width UTC RFC3339 so text order is time order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn parsed_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse::<T>().map_err(|e| conversion_err(idx, e))
}

const OBSERVATION_COLUMNS: &str = "entity_id, entity_type, metric_type, source, value, epoch";

fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<RawObservation> {
    Ok(RawObservation {
        entity_id: row.get(0)?,
        entity_type: parsed_column(row, 1)?,
        metric_type: row.get(2)?,
        source: parsed_column(row, 3)?,
        value: row.get(4)?,
        epoch: ts_column(row, 5)?,
    })
}

/// Insert one observation. Returns false when the same
/// (entity, metric, source, epoch) was already recorded.
pub fn insert_observation(conn: &Connection, o: &RawObservation) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO observations (entity_id, entity_type, metric_type, source, value, epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            o.entity_id,
            o.entity_type.as_str(),
            o.metric_type,
            o.source.as_str(),
            o.value,
            fmt_ts(o.epoch)
        ],
    )?;
    Ok(changed > 0)
}

/// Save a batch of observations in one transaction. Returns the number inserted.
pub fn save_observations(pool: &Pool, batch: &[RawObservation]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let mut inserted = 0;
    for o in batch {
        if insert_observation(&tx, o)? {
            inserted += 1;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

/// Distinct (entity, source) series that carry `metric_type`.
pub fn series_keys(conn: &Connection, metric_type: &str) -> Result<Vec<(String, Source)>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT entity_id, source FROM observations
         WHERE metric_type = ?1
         ORDER BY entity_id, source",
    )?;
    let rows = stmt.query_map(params![metric_type], |row| {
        Ok((row.get::<_, String>(0)?, parsed_column::<Source>(row, 1)?))
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// One source's observations for an entity/metric since `since`, oldest first.
pub fn load_window(
    conn: &Connection,
    entity_id: &str,
    metric_type: &str,
    source: Source,
    since: DateTime<Utc>,
) -> Result<Vec<RawObservation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations
         WHERE entity_id = ?1 AND metric_type = ?2 AND source = ?3 AND epoch >= ?4
         ORDER BY epoch ASC"
    ))?;
    let rows = stmt.query_map(
        params![entity_id, metric_type, source.as_str(), fmt_ts(since)],
        observation_from_row,
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Newest observation per (entity, metric, source).
pub fn latest_per_source(conn: &Connection, metric_type: Option<&str>) -> Result<Vec<RawObservation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations o
         WHERE (?1 IS NULL OR o.metric_type = ?1)
           AND o.epoch = (
             SELECT MAX(i.epoch) FROM observations i
             WHERE i.entity_id = o.entity_id
               AND i.metric_type = o.metric_type
               AND i.source = o.source
           )
         ORDER BY entity_id, metric_type, source"
    ))?;
    let rows = stmt.query_map(params![metric_type], observation_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Replace the stored baseline for (scope, metric, source).
pub fn save_baseline(conn: &Connection, b: &Baseline) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO baselines
            (entity_scope, metric_type, source, mean, std_dev, median, p95,
             sample_count, threshold_sigma, window_size, computed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            b.entity_scope,
            b.metric_type,
            b.source.as_str(),
            b.mean,
            b.std_dev,
            b.median,
            b.p95,
            b.sample_count as i64,
            b.threshold_sigma,
            b.window_size,
            fmt_ts(b.computed_at)
        ],
    )?;
    Ok(())
}

pub fn list_baselines(conn: &Connection) -> Result<Vec<Baseline>> {
    let mut stmt = conn.prepare(
        "SELECT entity_scope, metric_type, source, mean, std_dev, median, p95,
                sample_count, threshold_sigma, window_size, computed_at
         FROM baselines ORDER BY entity_scope, metric_type, source",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Baseline {
            entity_scope: row.get(0)?,
            metric_type: row.get(1)?,
            source: parsed_column(row, 2)?,
            mean: row.get(3)?,
            std_dev: row.get(4)?,
            median: row.get(5)?,
            p95: row.get(6)?,
            sample_count: row.get::<_, i64>(7)? as u64,
            threshold_sigma: row.get(8)?,
            window_size: row.get(9)?,
            computed_at: ts_column(row, 10)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_pool;
    use super::*;
    use crate::observation::EntityType;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap()
    }

    fn obs(source: Source, value: f64, hours: i64) -> RawObservation {
        RawObservation {
            entity_id: "BW3".to_string(),
            entity_type: EntityType::Satellite,
            metric_type: "altitude_km".to_string(),
            source,
            value,
            epoch: t0() + Duration::hours(hours),
        }
    }

    #[test]
    fn test_duplicate_observations_ignored() -> Result<()> {
        let (_dir, pool) = temp_pool();
        let batch = vec![obs(Source::SpaceTrack, 507.0, 0), obs(Source::SpaceTrack, 507.0, 0)];
        assert_eq!(save_observations(&pool, &batch)?, 1);
        Ok(())
    }

    #[test]
    fn test_window_is_single_source_and_ordered() -> Result<()> {
        let (_dir, pool) = temp_pool();
        save_observations(
            &pool,
            &[
                obs(Source::SpaceTrack, 507.2, 5),
                obs(Source::SpaceTrack, 507.1, 1),
                obs(Source::Celestrak, 499.0, 3),
                obs(Source::SpaceTrack, 505.0, -100),
            ],
        )?;
        let conn = pool.get()?;
        let w = load_window(&conn, "BW3", "altitude_km", Source::SpaceTrack, t0())?;
        let values: Vec<f64> = w.iter().map(|o| o.value).collect();
        assert_eq!(values, vec![507.1, 507.2]);
        assert!(w.iter().all(|o| o.source == Source::SpaceTrack));

        let keys = series_keys(&conn, "altitude_km")?;
        assert_eq!(
            keys,
            vec![("BW3".to_string(), Source::Celestrak), ("BW3".to_string(), Source::SpaceTrack)]
        );
        Ok(())
    }

    #[test]
    fn test_latest_per_source() -> Result<()> {
        let (_dir, pool) = temp_pool();
        save_observations(
            &pool,
            &[
                obs(Source::SpaceTrack, 1.0, 0),
                obs(Source::SpaceTrack, 2.0, 4),
                obs(Source::Celestrak, 3.0, 2),
            ],
        )?;
        let conn = pool.get()?;
        let latest = latest_per_source(&conn, Some("altitude_km"))?;
        assert_eq!(latest.len(), 2);
        let st = latest.iter().find(|o| o.source == Source::SpaceTrack).unwrap();
        assert_eq!(st.value, 2.0);
        assert!(latest_per_source(&conn, Some("bstar"))?.is_empty());
        assert_eq!(latest_per_source(&conn, None)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_baseline_replaced_not_patched() -> Result<()> {
        let (_dir, pool) = temp_pool();
        let conn = pool.get()?;
        let mut b = Baseline {
            entity_scope: "BW3".to_string(),
            metric_type: "altitude_km".to_string(),
            source: Source::SpaceTrack,
            mean: 507.0,
            std_dev: 0.2,
            median: 507.0,
            p95: 507.3,
            sample_count: 30,
            threshold_sigma: Some(2.5),
            window_size: 30,
            computed_at: t0(),
        };
        save_baseline(&conn, &b)?;
        b.mean = 506.0;
        b.threshold_sigma = None;
        save_baseline(&conn, &b)?;

        let all = list_baselines(&conn)?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], b);
        Ok(())
    }
}
