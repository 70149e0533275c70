use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{CanonicalRow, ProcessedFileRecord, RunEvent, Source, StoredEvent};
use crate::traits::{AuditLog, DedupTracker, ResultStore, SourceCatalog};

/// SQLite-backed catalog, result store, audit log and dedup tracker.
pub struct Database {
    conn: Mutex<Connection>,
}

pub struct Stats {
    pub sources: i64,
    pub results: i64,
    pub processed_files: i64,
    pub events: i64,
    pub failed_events: i64,
    pub last_run: Option<String>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::Database(format!("create {}: {}", dir.display(), e)))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sources (
                id         INTEGER PRIMARY KEY,
                url        TEXT UNIQUE NOT NULL,
                comment    TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS auction_results (
                id                       INTEGER PRIMARY KEY,
                source_file              TEXT NOT NULL,
                participants             INTEGER NOT NULL,
                year                     INTEGER NOT NULL,
                month                    INTEGER NOT NULL CHECK(month BETWEEN 1 AND 12),
                region                   TEXT NOT NULL,
                technology               TEXT NOT NULL,
                total_volume_auctioned   REAL NOT NULL,
                total_volume_sold        REAL NOT NULL,
                weighted_avg_price       REAL NOT NULL,
                owner_volume             REAL,
                owner_weighted_avg_price REAL,
                winner_count             INTEGER,
                stored_at                TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_results_period ON auction_results(year, month);
            CREATE INDEX IF NOT EXISTS idx_results_file ON auction_results(source_file);

            CREATE TABLE IF NOT EXISTS processed_files (
                id           INTEGER PRIMARY KEY,
                filename     TEXT UNIQUE NOT NULL,
                processed_at TEXT NOT NULL
            );

            -- Append-only audit trail
            CREATE TABLE IF NOT EXISTS run_events (
                id       INTEGER PRIMARY KEY,
                run_id   TEXT,
                datetime TEXT NOT NULL,
                stage    TEXT NOT NULL,
                outcome  TEXT NOT NULL CHECK(outcome IN ('SUCCESS','FAIL')),
                message  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_run ON run_events(run_id);
            ",
        )?;
        Ok(())
    }

    // ── Sources ──

    /// Returns false when the url is already in the catalog.
    pub fn add_source(&self, url: &str, comment: Option<&str>) -> Result<bool> {
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::Source("url is empty".into()));
        }
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO sources (url, comment) VALUES (?1, ?2)",
            params![url, comment],
        )?;
        Ok(inserted > 0)
    }

    pub fn seed_sources(&self, sources: &[(String, Option<String>)]) -> Result<usize> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO sources (url, comment) VALUES (?1, ?2)")?;
            for (url, comment) in sources {
                count += stmt.execute(params![url.trim(), comment])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn sources(&self) -> Result<Vec<Source>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, url, comment FROM sources ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Source {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    comment: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Results ──

    pub fn insert_rows(&self, source_file: &str, participants: i64, rows: &[CanonicalRow]) -> Result<usize> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let stored_at = Utc::now().to_rfc3339();
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO auction_results
                 (source_file, participants, year, month, region, technology,
                  total_volume_auctioned, total_volume_sold, weighted_avg_price,
                  owner_volume, owner_weighted_avg_price, winner_count, stored_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            )?;
            for r in rows {
                count += stmt.execute(params![
                    source_file, participants, r.year, r.month, r.region, r.technology,
                    r.total_volume_auctioned, r.total_volume_sold, r.weighted_avg_price,
                    r.owner_volume, r.owner_weighted_avg_price, r.winner_count, stored_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn count_rows(&self, source_file: &str) -> Result<i64> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM auction_results WHERE source_file = ?1",
            [source_file],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Drop stored results and processed markers so the next run re-ingests.
    pub fn delete_results(&self) -> Result<(usize, usize)> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let results = tx.execute("DELETE FROM auction_results", [])?;
        let processed = tx.execute("DELETE FROM processed_files", [])?;
        tx.commit()?;
        Ok((results, processed))
    }

    // ── Processed files ──

    pub fn processed_file(&self, filename: &str) -> Result<Option<ProcessedFileRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT filename, processed_at FROM processed_files WHERE filename = ?1",
                [filename],
                |row| {
                    Ok(ProcessedFileRecord {
                        filename: row.get(0)?,
                        processed_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ── Run events ──

    pub fn recent_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT run_id, datetime, stage, outcome, message
             FROM run_events ORDER BY id DESC LIMIT ?1",
        )?;
        let mut rows = stmt
            .query_map([limit as i64], |row| {
                Ok(StoredEvent {
                    run_id: row.get(0)?,
                    datetime: row.get(1)?,
                    stage: row.get(2)?,
                    outcome: row.get(3)?,
                    message: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    pub fn stats(&self) -> Result<Stats> {
        let conn = self.conn();
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
        Ok(Stats {
            sources: count("SELECT COUNT(*) FROM sources")?,
            results: count("SELECT COUNT(*) FROM auction_results")?,
            processed_files: count("SELECT COUNT(*) FROM processed_files")?,
            events: count("SELECT COUNT(*) FROM run_events")?,
            failed_events: count("SELECT COUNT(*) FROM run_events WHERE outcome = 'FAIL'")?,
            last_run: conn
                .query_row(
                    "SELECT run_id FROM run_events WHERE run_id IS NOT NULL ORDER BY id DESC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?,
        })
    }
}

#[async_trait]
impl SourceCatalog for Database {
    async fn list_sources(&self) -> Result<Vec<Source>> {
        self.sources()
    }
}

#[async_trait]
impl ResultStore for Database {
    async fn store_rows(&self, source_filename: &str, participant_count: i64, rows: &[CanonicalRow]) -> Result<usize> {
        self.insert_rows(source_filename, participant_count, rows)
    }
}

#[async_trait]
impl AuditLog for Database {
    async fn append(&self, event: &RunEvent) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO run_events (run_id, datetime, stage, outcome, message)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.run_id,
                    Utc::now(),
                    event.stage.as_str(),
                    event.outcome.as_str(),
                    event.message,
                ],
            )
            .map_err(|e| Error::AuditLog(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DedupTracker for Database {
    async fn is_processed(&self, filename: &str) -> Result<bool> {
        Ok(self.processed_file(filename)?.is_some())
    }

    async fn mark_processed(&self, filename: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO processed_files (filename, processed_at) VALUES (?1, ?2)",
            params![filename, Utc::now()],
        )?;
        Ok(())
    }
}
