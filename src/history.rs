use chrono::{DateTime, Local};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::app_dirs::AppDirs;
use crate::challenge::{ChallengeConfig, ChallengeResults};
use crate::error::HistoryError;

/// One completed challenge as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub finished_at: String,
    pub score: u64,
    pub time_in_target: f64,
    pub time_below_target: f64,
    pub percent_in_target: f64,
    pub max_consecutive_target: f64,
    pub baseline: f64,
    pub ramp_delta: f64,
    pub max_duration: f64,
}

/// Completed-challenge history
#[derive(Debug)]
pub struct HistoryDb {
    conn: Connection,
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS challenge_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        finished_at TEXT NOT NULL,
        score INTEGER NOT NULL,
        time_in_target REAL NOT NULL,
        time_below_target REAL NOT NULL,
        percent_in_target REAL NOT NULL,
        max_consecutive_target REAL NOT NULL,
        baseline REAL NOT NULL,
        ramp_delta REAL NOT NULL,
        max_duration REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_challenge_results_finished
        ON challenge_results(finished_at);
"#;

const SELECT_COLUMNS: &str = "id, finished_at, score, time_in_target, time_below_target, \
     percent_in_target, max_consecutive_target, baseline, ramp_delta, max_duration";

impl HistoryDb {
    /// Open the database at the default location under $HOME/.local/state/ppgquest
    pub fn open_default() -> Result<Self, HistoryError> {
        let path = Self::default_path();
        Self::open(path)
    }

    pub fn default_path() -> PathBuf {
        AppDirs::db_path().unwrap_or_else(|| PathBuf::from("ppgquest_history.db"))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, HistoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(HistoryDb { conn })
    }

    pub fn record(
        &self,
        results: &ChallengeResults,
        config: &ChallengeConfig,
    ) -> Result<i64, HistoryError> {
        self.record_at(results, config, Local::now())
    }

    pub fn record_at(
        &self,
        results: &ChallengeResults,
        config: &ChallengeConfig,
        finished_at: DateTime<Local>,
    ) -> Result<i64, HistoryError> {
        self.conn.execute(
            r#"
            INSERT INTO challenge_results
            (finished_at, score, time_in_target, time_below_target, percent_in_target,
             max_consecutive_target, baseline, ramp_delta, max_duration)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                finished_at.to_rfc3339(),
                results.score as i64,
                results.time_in_target,
                results.time_below_target,
                results.percent_in_target,
                results.max_consecutive_target,
                results.baseline,
                config.ramp_delta,
                config.max_duration,
            ],
        )?;
        log::debug!("Recorded challenge result (score {})", results.score);
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent entries first
    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        let sql = format!(
            "SELECT {} FROM challenge_results ORDER BY finished_at DESC, id DESC LIMIT ?1",
            SELECT_COLUMNS
        );
        self.query(&sql, limit as i64)
    }

    /// Entry with the highest percent in target, earliest wins ties
    pub fn best(&self) -> Result<Option<HistoryEntry>, HistoryError> {
        let sql = format!(
            "SELECT {} FROM challenge_results ORDER BY percent_in_target DESC, id ASC LIMIT ?1",
            SELECT_COLUMNS
        );
        Ok(self.query(&sql, 1)?.into_iter().next())
    }

    pub fn count(&self) -> Result<usize, HistoryError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM challenge_results", [], |row| {
                row.get(0)
            })?;
        Ok(n as usize)
    }

    pub fn clear(&self) -> Result<(), HistoryError> {
        self.conn.execute("DELETE FROM challenge_results", [])?;
        Ok(())
    }

    /// Write every entry, oldest first, as CSV with a header row.
    /// Returns the number of rows written.
    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<usize, HistoryError> {
        let sql = format!(
            "SELECT {} FROM challenge_results ORDER BY id ASC LIMIT ?1",
            SELECT_COLUMNS
        );
        let entries = self.query(&sql, -1)?;

        let mut writer = csv::Writer::from_path(path)?;
        for entry in &entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        Ok(entries.len())
    }

    fn query(&self, sql: &str, limit: i64) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([limit], |row| {
            Ok(HistoryEntry {
                id: row.get(0)?,
                finished_at: row.get(1)?,
                score: row.get::<_, i64>(2)? as u64,
                time_in_target: row.get(3)?,
                time_below_target: row.get(4)?,
                percent_in_target: row.get(5)?,
                max_consecutive_target: row.get(6)?,
                baseline: row.get(7)?,
                ramp_delta: row.get(8)?,
                max_duration: row.get(9)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}
