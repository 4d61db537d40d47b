//! SQLite journal implementation
//!
//! This module provides a SQLite-based implementation of the Journal trait.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Journal, StorageError, StorageResult};
use crate::storage::{ItemFailureRecord, RunRecord, RunStatus, StageResultRecord, StageStatus};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// SQLite journal backend
pub struct SqliteJournal {
    conn: Connection,
}

impl SqliteJournal {
    /// Opens (creating if needed) the journal database at `path`
    pub fn new(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory journal (for tests and dry runs)
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: row.get(1)?,
        finished_at: row.get(2)?,
        config_hash: row.get(3)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(RunStatus::Running),
    })
}

const RUN_COLUMNS: &str = "id, started_at, finished_at, config_hash, status";

impl Journal for SqliteJournal {
    // ===== Run Management =====

    fn start_run(&mut self, config_hash: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn finish_run(&mut self, run_id: i64, status: RunStatus) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), now, run_id],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                params![run_id],
                run_from_row,
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let run = self
            .conn
            .query_row(
                &format!("SELECT {} FROM runs ORDER BY id DESC LIMIT 1", RUN_COLUMNS),
                [],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    fn list_runs(&self, limit: usize) -> StorageResult<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY id DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let runs = stmt
            .query_map(params![limit as i64], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    // ===== Stage Results =====

    fn record_stage_result(
        &mut self,
        run_id: i64,
        result: &StageResultRecord,
    ) -> StorageResult<()> {
        // A resumed stage reports again within the same run lineage; keep the latest.
        self.conn.execute(
            "INSERT INTO stage_results
                (run_id, stage, succeeded, failed, skipped, denied, persistence_errors, status, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(run_id, stage) DO UPDATE SET
                succeeded = excluded.succeeded,
                failed = excluded.failed,
                skipped = excluded.skipped,
                denied = excluded.denied,
                persistence_errors = excluded.persistence_errors,
                status = excluded.status,
                finished_at = excluded.finished_at",
            params![
                run_id,
                result.stage,
                result.succeeded as i64,
                result.failed as i64,
                result.skipped as i64,
                result.denied as i64,
                result.persistence_errors as i64,
                result.status.to_db_string(),
                result.finished_at,
            ],
        )?;
        Ok(())
    }

    fn get_stage_results(&self, run_id: i64) -> StorageResult<Vec<StageResultRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT stage, succeeded, failed, skipped, denied, persistence_errors, status, finished_at
             FROM stage_results WHERE run_id = ?1 ORDER BY id",
        )?;

        let results = stmt
            .query_map(params![run_id], |row| {
                Ok(StageResultRecord {
                    stage: row.get(0)?,
                    succeeded: row.get::<_, i64>(1)? as u64,
                    failed: row.get::<_, i64>(2)? as u64,
                    skipped: row.get::<_, i64>(3)? as u64,
                    denied: row.get::<_, i64>(4)? as u64,
                    persistence_errors: row.get::<_, i64>(5)? as u64,
                    status: StageStatus::from_db_string(&row.get::<_, String>(6)?)
                        .unwrap_or(StageStatus::Failed),
                    finished_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(results)
    }

    // ===== Item Failures =====

    fn record_failure(&mut self, run_id: i64, failure: &ItemFailureRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO item_failures
                (run_id, stage, item_id, url, kind, message, attempts, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id,
                failure.stage,
                failure.item_id,
                failure.url,
                failure.kind,
                failure.message,
                failure.attempts,
                failure.recorded_at,
            ],
        )?;
        Ok(())
    }

    fn get_failures(&self, run_id: i64) -> StorageResult<Vec<ItemFailureRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT stage, item_id, url, kind, message, attempts, recorded_at
             FROM item_failures WHERE run_id = ?1 ORDER BY id",
        )?;

        let failures = stmt
            .query_map(params![run_id], |row| {
                Ok(ItemFailureRecord {
                    stage: row.get(0)?,
                    item_id: row.get(1)?,
                    url: row.get(2)?,
                    kind: row.get(3)?,
                    message: row.get(4)?,
                    attempts: row.get(5)?,
                    recorded_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(failures)
    }
}
