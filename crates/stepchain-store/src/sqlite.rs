use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use stepchain_core::config::DuplicatePolicy;
use stepchain_core::error::{Result, StepchainError};
use stepchain_core::traits::RunStore;
use stepchain_core::types::{
    RunId, RunSnapshot, RunStatus, Scenario, StepSnapshot, MAX_LIST_LIMIT,
};

use crate::StoreOptions;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        scenario TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_runs_started
        ON runs(started_at DESC, seq DESC);

    CREATE INDEX IF NOT EXISTS idx_runs_scenario
        ON runs(scenario, started_at DESC);

    CREATE TABLE IF NOT EXISTS run_steps (
        run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
        step INTEGER NOT NULL,
        status TEXT NOT NULL,
        duration_ms INTEGER,
        error TEXT,
        started_at TEXT,
        completed_at TEXT,
        PRIMARY KEY (run_id, step)
    );";

/// SQLite-backed run store.
///
/// One connection behind a mutex; every conditional transition runs in its
/// own transaction so a kill and a step completion racing on the same run
/// are serialized and exactly one precondition wins.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
    options: StoreOptions,
}

impl SqliteRunStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StepchainError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db)?;

        let store = Self::init(conn, options)?;
        debug!(path = %path.display(), "SQLite run store opened");
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(options: StoreOptions) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db)?;
        Self::init(conn, options)
    }

    fn init(conn: Connection, options: StoreOptions) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
            options,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StepchainError::Database(e.to_string()))
    }

    fn create(&self, scenario: Scenario, id: RunId, strict: bool) -> Result<RunSnapshot> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        if let Some(existing) = load_run(&tx, id.as_str())? {
            if strict && self.options.on_duplicate == DuplicatePolicy::Reject {
                return Err(StepchainError::DuplicateId(id.0));
            }
            return Ok(existing);
        }

        let now = ts(Utc::now());
        tx.execute(
            "INSERT INTO runs (id, scenario, status, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.as_str(), scenario.as_str(), RunStatus::Pending.as_str(), now],
        )
        .map_err(db)?;

        for step in 1..=self.options.total_steps {
            tx.execute(
                "INSERT INTO run_steps (run_id, step, status) VALUES (?1, ?2, ?3)",
                params![id.as_str(), step as i64, RunStatus::Pending.as_str()],
            )
            .map_err(db)?;
        }

        let run = load_run(&tx, id.as_str())?
            .ok_or_else(|| StepchainError::RunNotFound(id.0.clone()))?;
        tx.commit().map_err(db)?;

        debug!(run_id = %id, scenario = %scenario, steps = self.options.total_steps, "Run created");
        Ok(run)
    }

    fn fetch(&self, id: &str) -> Result<Option<RunSnapshot>> {
        let conn = self.lock()?;
        load_run(&conn, id)
    }

    fn list(&self, limit: usize, scenario: Option<Scenario>) -> Result<Vec<RunSnapshot>> {
        let limit = limit.min(MAX_LIST_LIMIT) as i64;
        let conn = self.lock()?;

        let ids: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM runs
                     WHERE ?1 IS NULL OR scenario = ?1
                     ORDER BY started_at DESC, seq DESC
                     LIMIT ?2",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![scenario.map(|s| s.as_str()), limit], |row| row.get(0))
                .map_err(db)?;
            let ids = rows.collect::<rusqlite::Result<Vec<String>>>().map_err(db)?;
            ids
        };

        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(run) = load_run(&conn, &id)? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    fn step_ongoing(&self, id: &str, step: u32) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        let run_rows = tx
            .execute(
                "UPDATE runs SET status = ?2, error = NULL, completed_at = NULL
                 WHERE id = ?1 AND status IN (?3, ?2)",
                params![id, RunStatus::Ongoing.as_str(), RunStatus::Pending.as_str()],
            )
            .map_err(db)?;
        if run_rows == 0 {
            // Dropping the transaction rolls back.
            return Ok(false);
        }

        let step_rows = tx
            .execute(
                "UPDATE run_steps
                 SET status = ?3, started_at = ?5, completed_at = NULL, duration_ms = NULL, error = NULL
                 WHERE run_id = ?1 AND step = ?2 AND status = ?4",
                params![
                    id,
                    step as i64,
                    RunStatus::Ongoing.as_str(),
                    RunStatus::Pending.as_str(),
                    ts(Utc::now()),
                ],
            )
            .map_err(db)?;
        if step_rows == 0 {
            return Ok(false);
        }

        tx.commit().map_err(db)?;
        Ok(true)
    }

    fn step_complete(&self, id: &str, step: u32, duration_ms: u64) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        let rows = tx
            .execute(
                "UPDATE run_steps
                 SET status = ?3, duration_ms = ?4, completed_at = ?5, error = NULL
                 WHERE run_id = ?1 AND step = ?2 AND status = ?6
                   AND EXISTS (
                       SELECT 1 FROM runs WHERE id = ?1 AND status IN (?7, ?6)
                   )",
                params![
                    id,
                    step as i64,
                    RunStatus::Completed.as_str(),
                    duration_ms as i64,
                    ts(Utc::now()),
                    RunStatus::Ongoing.as_str(),
                    RunStatus::Pending.as_str(),
                ],
            )
            .map_err(db)?;
        if rows == 0 {
            return Ok(false);
        }

        tx.commit().map_err(db)?;
        Ok(true)
    }

    fn run_complete(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE runs SET status = ?2, completed_at = ?3, error = NULL
                 WHERE id = ?1 AND status IN (?4, ?5)",
                params![
                    id,
                    RunStatus::Completed.as_str(),
                    ts(Utc::now()),
                    RunStatus::Pending.as_str(),
                    RunStatus::Ongoing.as_str(),
                ],
            )
            .map_err(db)?;
        Ok(rows > 0)
    }

    fn run_failed(&self, id: &str, message: &str, step: Option<u32>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;
        let now = ts(Utc::now());

        let rows = tx
            .execute(
                "UPDATE runs SET status = ?2, error = ?3, completed_at = ?4 WHERE id = ?1",
                params![id, RunStatus::Failed.as_str(), message, now],
            )
            .map_err(db)?;
        if rows == 0 {
            return Err(StepchainError::RunNotFound(id.to_string()));
        }

        if let Some(step) = step {
            tx.execute(
                "UPDATE run_steps SET status = ?3, error = ?4, completed_at = ?5
                 WHERE run_id = ?1 AND step = ?2",
                params![id, step as i64, RunStatus::Failed.as_str(), message, now],
            )
            .map_err(db)?;
        }

        tx.commit().map_err(db)?;
        Ok(())
    }

    fn kill(&self, id: &str, message: &str) -> Result<Option<RunSnapshot>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db)?;

        let Some(run) = load_run(&tx, id)? else {
            return Ok(None);
        };
        if run.is_terminal() {
            return Ok(Some(run));
        }

        let now = ts(Utc::now());
        tx.execute(
            "UPDATE run_steps SET status = ?2, error = ?3, completed_at = ?4
             WHERE run_id = ?1 AND status IN (?5, ?6)",
            params![
                id,
                RunStatus::Failed.as_str(),
                message,
                now,
                RunStatus::Pending.as_str(),
                RunStatus::Ongoing.as_str(),
            ],
        )
        .map_err(db)?;
        tx.execute(
            "UPDATE runs SET status = ?2, error = ?3, completed_at = ?4 WHERE id = ?1",
            params![id, RunStatus::Failed.as_str(), message, now],
        )
        .map_err(db)?;

        let killed = load_run(&tx, id)?;
        tx.commit().map_err(db)?;
        Ok(killed)
    }
}

impl RunStore for SqliteRunStore {
    fn create_run(&self, scenario: Scenario, id: Option<RunId>) -> BoxFuture<'_, Result<RunSnapshot>> {
        let id = id.unwrap_or_default();
        Box::pin(async move { self.create(scenario, id, true) })
    }

    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<RunSnapshot>>> {
        let id = id.clone();
        Box::pin(async move { self.fetch(id.as_str()) })
    }

    fn get_or_create_run(&self, id: &RunId, scenario: Scenario) -> BoxFuture<'_, Result<RunSnapshot>> {
        let id = id.clone();
        Box::pin(async move { self.create(scenario, id, false) })
    }

    fn list_runs(
        &self,
        limit: usize,
        scenario: Option<Scenario>,
    ) -> BoxFuture<'_, Result<Vec<RunSnapshot>>> {
        Box::pin(async move { self.list(limit, scenario) })
    }

    fn mark_step_ongoing(&self, id: &RunId, step: u32) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move { self.step_ongoing(id.as_str(), step) })
    }

    fn mark_step_complete(&self, id: &RunId, step: u32, duration_ms: u64) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move { self.step_complete(id.as_str(), step, duration_ms) })
    }

    fn mark_run_complete(&self, id: &RunId) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move { self.run_complete(id.as_str()) })
    }

    fn mark_run_failed(&self, id: &RunId, message: &str, step: Option<u32>) -> BoxFuture<'_, Result<()>> {
        let id = id.clone();
        let message = message.to_string();
        Box::pin(async move { self.run_failed(id.as_str(), &message, step) })
    }

    fn kill_run(&self, id: &RunId, message: &str) -> BoxFuture<'_, Result<Option<RunSnapshot>>> {
        let id = id.clone();
        let message = message.to_string();
        Box::pin(async move { self.kill(id.as_str(), &message) })
    }
}

fn db(e: rusqlite::Error) -> StepchainError {
    StepchainError::Database(e.to_string())
}

/// Fixed-width timestamps so lexical order matches chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StepchainError::Database(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_status(s: &str) -> Result<RunStatus> {
    RunStatus::parse(s).ok_or_else(|| StepchainError::Database(format!("unknown status '{}'", s)))
}

fn parse_scenario(s: &str) -> Result<Scenario> {
    s.parse()
        .map_err(|_| StepchainError::Database(format!("unknown scenario '{}'", s)))
}

fn load_run(conn: &Connection, id: &str) -> Result<Option<RunSnapshot>> {
    let row = conn
        .query_row(
            "SELECT id, scenario, status, error, started_at, completed_at
             FROM runs WHERE id = ?1",
            params![id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()
        .map_err(db)?;

    let Some((id, scenario, status, error, started_at, completed_at)) = row else {
        return Ok(None);
    };

    let steps = load_steps(conn, &id)?;
    Ok(Some(RunSnapshot {
        id: RunId(id),
        scenario: parse_scenario(&scenario)?,
        status: parse_status(&status)?,
        error,
        started_at: parse_ts(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        steps,
    }))
}

fn load_steps(conn: &Connection, run_id: &str) -> Result<Vec<StepSnapshot>> {
    let mut stmt = conn
        .prepare(
            "SELECT step, status, duration_ms, error, started_at, completed_at
             FROM run_steps
             WHERE run_id = ?1
             ORDER BY step ASC",
        )
        .map_err(db)?;

    let rows = stmt
        .query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })
        .map_err(db)?;

    let mut steps = Vec::new();
    for row in rows {
        let (step, status, duration_ms, error, started_at, completed_at) = row.map_err(db)?;
        steps.push(StepSnapshot {
            step: step as u32,
            status: parse_status(&status)?,
            duration_ms: duration_ms.map(|d| d as u64),
            error,
            started_at: started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        });
    }
    Ok(steps)
}
