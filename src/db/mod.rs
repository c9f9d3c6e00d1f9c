// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! Database module for the local event store

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::detection::NoiseEvent;

/// SQLite event store keyed by event id
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.path)?;
        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;

        info!("Database opened at {:?}", config.path);
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                peak_db REAL NOT NULL,
                duration_ms INTEGER NOT NULL,
                sample_count INTEGER NOT NULL,
                device_name TEXT NOT NULL,
                location TEXT NOT NULL,
                image_ref TEXT,
                degraded TEXT,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_start ON events(start_time);
        "#)?;

        Ok(())
    }

    /// Insert or replace the row for `event.id`; a retried write leaves one row
    pub fn upsert_event(&self, event: &NoiseEvent) -> Result<()> {
        let data = serde_json::to_string(event)?;
        let degraded = event.degraded.map(|d| format!("{:?}", d));
        let conn = self.conn.lock();

        conn.execute(
            r#"INSERT INTO events
               (id, start_time, end_time, peak_db, duration_ms, sample_count,
                device_name, location, image_ref, degraded, data, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
               ON CONFLICT(id) DO UPDATE SET
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                peak_db = excluded.peak_db,
                duration_ms = excluded.duration_ms,
                sample_count = excluded.sample_count,
                device_name = excluded.device_name,
                location = excluded.location,
                image_ref = COALESCE(excluded.image_ref, events.image_ref),
                degraded = excluded.degraded,
                data = excluded.data,
                updated_at = excluded.updated_at"#,
            params![
                event.id as i64,
                event.start.to_rfc3339(),
                event.end.to_rfc3339(),
                event.peak_db,
                event.duration_ms,
                event.sample_count as i64,
                event.device_name,
                event.location,
                event.image_ref,
                degraded,
                data,
                Utc::now().to_rfc3339(),
            ],
        )?;

        debug!("Stored event {}", event.id);
        Ok(())
    }

    pub fn get_event(&self, id: u64) -> Result<Option<NoiseEvent>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row("SELECT data FROM events WHERE id = ?1", params![id as i64], |row| row.get(0))
            .optional()?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Events whose start falls in `[start, end]`, newest first
    pub fn query_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>> {
        let conn = self.conn.lock();

        let sql = format!(
            "SELECT id, start_time, end_time, peak_db, duration_ms, device_name, image_ref, degraded
             FROM events
             WHERE start_time >= ?1 AND start_time <= ?2
             ORDER BY start_time DESC LIMIT {}",
            limit.unwrap_or(100)
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![start.to_rfc3339(), end.to_rfc3339()], |row| {
            Ok(StoredEvent {
                id: row.get::<_, i64>(0)? as u64,
                start_time: row.get(1)?,
                end_time: row.get(2)?,
                peak_db: row.get(3)?,
                duration_ms: row.get(4)?,
                device_name: row.get(5)?,
                image_ref: row.get(6)?,
                degraded: row.get(7)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Get database statistics
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let conn = self.conn.lock();

        let event_count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        let size_bytes: i64 = conn
            .query_row(
                "SELECT page_count * page_size as size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        Ok(DatabaseStats {
            event_count: event_count as usize,
            size_bytes: size_bytes as u64,
        })
    }

    /// Delete events older than the retention window
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        let conn = self.conn.lock();
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);

        let deleted = conn.execute(
            "DELETE FROM events WHERE start_time < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        if deleted > 0 {
            conn.execute("VACUUM", [])?;
            info!("Cleaned up {} events older than {} days", deleted, retention_days);
        }
        Ok(deleted)
    }
}

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: u64,
    pub start_time: String,
    pub end_time: String,
    pub peak_db: f64,
    pub duration_ms: i64,
    pub device_name: String,
    pub image_ref: Option<String>,
    pub degraded: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub event_count: usize,
    pub size_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::DegradedReason;
    use crate::dispatch::testing::test_event;

    #[test]
    fn test_upsert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let event = test_event(5, 90.0);

        db.upsert_event(&event).unwrap();
        db.upsert_event(&event).unwrap();
        assert_eq!(db.get_stats().unwrap().event_count, 1);
        assert_eq!(db.get_event(5).unwrap(), Some(event));
    }

    #[test]
    fn test_image_ref_is_kept_on_later_write_without_one() {
        let db = Database::open_in_memory().unwrap();
        let event = test_event(6, 97.0);

        db.upsert_event(&event.with_image_ref(Some("/img/6.jpg".into()))).unwrap();
        db.upsert_event(&event).unwrap();

        let rows = db
            .query_events(event.start - chrono::Duration::seconds(1), event.start, None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].image_ref.as_deref(), Some("/img/6.jpg"));
    }

    #[test]
    fn test_query_and_cleanup() {
        let db = Database::open_in_memory().unwrap();
        let mut old = test_event(1, 85.0);
        old.start = Utc::now() - chrono::Duration::days(40);
        let mut recent = test_event(2, 88.0);
        recent.start = Utc::now() - chrono::Duration::hours(1);
        recent.degraded = Some(DegradedReason::SampleGap);
        db.upsert_event(&old).unwrap();
        db.upsert_event(&recent).unwrap();

        let rows = db
            .query_events(Utc::now() - chrono::Duration::days(1), Utc::now(), Some(10))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 2);
        assert_eq!(rows[0].degraded.as_deref(), Some("SampleGap"));

        assert_eq!(db.cleanup(30).unwrap(), 1);
        assert_eq!(db.get_stats().unwrap().event_count, 1);
    }
}
