//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS observations (
            id INTEGER PRIMARY KEY,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            metric_type TEXT NOT NULL,
            source TEXT NOT NULL,
            value REAL NOT NULL,
            epoch TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (entity_id, metric_type, source, epoch)
        );

        CREATE TABLE IF NOT EXISTS baselines (
            entity_scope TEXT NOT NULL,
            metric_type TEXT NOT NULL,
            source TEXT NOT NULL,
            mean REAL NOT NULL,
            std_dev REAL NOT NULL,
            median REAL NOT NULL,
            p95 REAL NOT NULL,
            sample_count INTEGER NOT NULL,
            threshold_sigma REAL,
            window_size INTEGER NOT NULL,
            computed_at TEXT NOT NULL,
            PRIMARY KEY (entity_scope, metric_type, source)
        );

        CREATE TABLE IF NOT EXISTS anomaly_signals (
            id TEXT PRIMARY KEY,
            anomaly_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_name TEXT,
            metric_type TEXT NOT NULL,
            observed_value REAL,
            baseline_value REAL,
            z_score REAL,
            source TEXT,
            raw_data TEXT NOT NULL,
            fingerprint TEXT NOT NULL UNIQUE,
            detected_at TEXT NOT NULL,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_observations_series
            ON observations(entity_id, metric_type, source, epoch);
        CREATE INDEX IF NOT EXISTS idx_observations_epoch ON observations(epoch);
        CREATE INDEX IF NOT EXISTS idx_signals_expires ON anomaly_signals(expires_at);
        CREATE INDEX IF NOT EXISTS idx_signals_entity ON anomaly_signals(entity_id, anomaly_type);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}
