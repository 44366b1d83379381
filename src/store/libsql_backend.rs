//! libSQL implementation of the job table and event log.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::event::{Event, EventKind};
use crate::jobs::model::{Checkpoint, Job, JobState, StateTransition};
use crate::store::migrations;
use crate::store::traits::{Database, EventStore, JobStore, JobWrite};

/// Single shared connection; libSQL connections are safe to use from
/// concurrent tasks. Writes take `write_lock` so a transaction never picks
/// up another task's statements.
pub struct LibSqlBackend {
    // Held so the database outlives its connection.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a database file, creating its directory if needed.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("open {}: {e}", path.display())))?;
        let backend = Self::with_database(db).await?;
        info!(path = %path.display(), "Job database ready");
        Ok(backend)
    }

    /// Private in-memory database. Used by tests.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("open in-memory database: {e}")))?;
        Self::with_database(db).await
    }

    async fn with_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("connect: {e}")))?;
        let backend = Self {
            _db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that text comparison in SQL orders correctly.
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("{column} parse: {e}")))
}

fn parse_json(s: &str, column: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn to_json(value: &serde_json::Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn text(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

fn int(row: &libsql::Row, idx: i32, name: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

const JOB_COLUMNS: &str = "id, owner_id, job_type, params, state, progress, current_step, attempt, created_at, updated_at, last_activity_at";

const EVENT_COLUMNS: &str = "job_id, sequence, kind, payload, created_at";

const CHECKPOINT_COLUMNS: &str = "job_id, sequence, progress, step, payload, created_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id = text(row, 0, "jobs.id")?;
    let params = text(row, 3, "jobs.params")?;
    let state = text(row, 4, "jobs.state")?;
    let progress = int(row, 5, "jobs.progress")?;
    let attempt = int(row, 7, "jobs.attempt")?;
    let created = text(row, 8, "jobs.created_at")?;
    let updated = text(row, 9, "jobs.updated_at")?;
    let activity = text(row, 10, "jobs.last_activity_at")?;

    Ok(Job {
        id: parse_uuid(&id, "jobs.id")?,
        owner_id: text(row, 1, "jobs.owner_id")?,
        job_type: text(row, 2, "jobs.job_type")?,
        params: parse_json(&params, "jobs.params")?,
        state: state.parse().map_err(DatabaseError::Query)?,
        progress: progress.clamp(0, 100) as u8,
        current_step: row.get(6).ok(),
        attempt: attempt.max(0) as u32,
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
        last_activity_at: parse_ts(&activity),
    })
}

fn row_to_event(row: &libsql::Row) -> Result<Event, DatabaseError> {
    let job_id = text(row, 0, "events.job_id")?;
    let sequence = int(row, 1, "events.sequence")?;
    let kind = text(row, 2, "events.kind")?;
    let payload = text(row, 3, "events.payload")?;
    let created = text(row, 4, "events.created_at")?;

    Ok(Event {
        job_id: parse_uuid(&job_id, "events.job_id")?,
        sequence: sequence as u64,
        kind: kind.parse().map_err(DatabaseError::Query)?,
        payload: parse_json(&payload, "events.payload")?,
        timestamp: parse_ts(&created),
    })
}

fn row_to_checkpoint(row: &libsql::Row) -> Result<Checkpoint, DatabaseError> {
    let job_id = text(row, 0, "checkpoints.job_id")?;
    let sequence = int(row, 1, "checkpoints.sequence")?;
    let progress = int(row, 2, "checkpoints.progress")?;
    let payload = text(row, 4, "checkpoints.payload")?;
    let created = text(row, 5, "checkpoints.created_at")?;

    Ok(Checkpoint {
        job_id: parse_uuid(&job_id, "checkpoints.job_id")?,
        sequence: sequence as u64,
        progress: progress.clamp(0, 100) as u8,
        step: text(row, 3, "checkpoints.step")?,
        payload: parse_json(&payload, "checkpoints.payload")?,
        created_at: parse_ts(&created),
    })
}

fn row_to_transition(row: &libsql::Row) -> Result<StateTransition, DatabaseError> {
    let job_id = text(row, 0, "job_transitions.job_id")?;
    let from = text(row, 1, "job_transitions.from_state")?;
    let to = text(row, 2, "job_transitions.to_state")?;
    let actor = text(row, 3, "job_transitions.actor")?;
    let created = text(row, 5, "job_transitions.created_at")?;

    Ok(StateTransition {
        job_id: parse_uuid(&job_id, "job_transitions.job_id")?,
        from: from.parse().map_err(DatabaseError::Query)?,
        to: to.parse().map_err(DatabaseError::Query)?,
        actor: actor.parse().map_err(DatabaseError::Query)?,
        reason: row.get(4).ok(),
        at: parse_ts(&created),
    })
}

// ── Write statements ────────────────────────────────────────────────
//
// Shared by the single-row trait methods and by `commit`, which runs them
// inside one transaction.

async fn exec_update_job(conn: &Connection, job: &Job) -> Result<(), DatabaseError> {
    let count = conn
        .execute(
            "UPDATE jobs SET state = ?1, progress = ?2, current_step = ?3, attempt = ?4, updated_at = ?5, last_activity_at = ?6 WHERE id = ?7",
            params![
                job.state.as_str(),
                job.progress as i64,
                opt_text(job.current_step.as_deref()),
                job.attempt as i64,
                fmt_ts(&job.updated_at),
                fmt_ts(&job.last_activity_at),
                job.id.to_string(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("update_job: {e}")))?;

    if count == 0 {
        return Err(DatabaseError::NotFound {
            entity: "job".to_string(),
            id: job.id.to_string(),
        });
    }
    Ok(())
}

async fn exec_record_transition(
    conn: &Connection,
    transition: &StateTransition,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO job_transitions (job_id, from_state, to_state, actor, reason, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            transition.job_id.to_string(),
            transition.from.as_str(),
            transition.to.as_str(),
            transition.actor.as_str(),
            opt_text(transition.reason.as_deref()),
            fmt_ts(&transition.at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("record_transition: {e}")))?;
    Ok(())
}

async fn exec_insert_checkpoint(
    conn: &Connection,
    checkpoint: &Checkpoint,
) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO checkpoints ({CHECKPOINT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
        ),
        params![
            checkpoint.job_id.to_string(),
            checkpoint.sequence as i64,
            checkpoint.progress as i64,
            checkpoint.step.as_str(),
            to_json(&checkpoint.payload)?,
            fmt_ts(&checkpoint.created_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_checkpoint: {e}")))?;

    debug!(job_id = %checkpoint.job_id, sequence = checkpoint.sequence, "Checkpoint stored");
    Ok(())
}

async fn exec_append_event(
    conn: &Connection,
    job_id: Uuid,
    kind: EventKind,
    payload: &serde_json::Value,
    timestamp: DateTime<Utc>,
) -> Result<Event, DatabaseError> {
    // Next sequence is computed inside the INSERT itself; the
    // (job_id, sequence) primary key rejects any concurrent duplicate.
    let mut rows = conn
        .query(
            "INSERT INTO events (job_id, sequence, kind, payload, created_at)
             SELECT ?1, COALESCE(MAX(sequence), 0) + 1, ?2, ?3, ?4 FROM events WHERE job_id = ?1
             RETURNING sequence",
            params![
                job_id.to_string(),
                kind.as_str(),
                to_json(payload)?,
                fmt_ts(&timestamp),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_event: {e}")))?;

    let sequence: i64 = match rows.next().await {
        Ok(Some(row)) => int(&row, 0, "events.sequence")?,
        Ok(None) => {
            return Err(DatabaseError::Query(
                "append_event: insert returned no sequence".to_string(),
            ));
        }
        Err(e) => return Err(DatabaseError::Query(format!("append_event row: {e}"))),
    };

    Ok(Event {
        job_id,
        sequence: sequence as u64,
        kind,
        payload: payload.clone(),
        timestamp,
    })
}

async fn apply_write(
    conn: &Connection,
    write: &JobWrite<'_>,
) -> Result<Option<Event>, DatabaseError> {
    let event = match write.event {
        Some(new) => Some(
            exec_append_event(conn, write.job.id, new.kind, new.payload, new.timestamp).await?,
        ),
        None => None,
    };
    exec_update_job(conn, write.job).await?;
    if let Some(checkpoint) = write.checkpoint {
        exec_insert_checkpoint(conn, checkpoint).await?;
    }
    if let Some(transition) = write.transition {
        exec_record_transition(conn, transition).await?;
    }
    Ok(event)
}

// ── Store impls ─────────────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn commit(&self, write: JobWrite<'_>) -> Result<Option<Event>, DatabaseError> {
        let _write = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;

        match apply_write(&tx, &write).await {
            Ok(event) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
                Ok(event)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(job_id = %write.job.id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let _write = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    job.id.to_string(),
                    job.owner_id.as_str(),
                    job.job_type.as_str(),
                    to_json(&job.params)?,
                    job.state.as_str(),
                    job.progress as i64,
                    opt_text(job.current_step.as_deref()),
                    job.attempt as i64,
                    fmt_ts(&job.created_at),
                    fmt_ts(&job.updated_at),
                    fmt_ts(&job.last_activity_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, job_type = %job.job_type, "Job inserted into DB");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job row: {e}"))),
        }
    }

    async fn update_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let _write = self.write_lock.lock().await;
        exec_update_job(self.conn(), job).await
    }

    async fn list_jobs_for_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE owner_id = ?1 ORDER BY created_at DESC LIMIT ?2"
                ),
                params![owner_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs_for_owner: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs_for_owner row: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn list_inactive_jobs(
        &self,
        state: JobState,
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 AND last_activity_at < ?2 ORDER BY last_activity_at ASC"
                ),
                params![state.as_str(), fmt_ts(&before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_inactive_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_inactive_jobs row: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn record_transition(&self, transition: &StateTransition) -> Result<(), DatabaseError> {
        let _write = self.write_lock.lock().await;
        exec_record_transition(self.conn(), transition).await
    }

    async fn list_transitions(&self, job_id: Uuid) -> Result<Vec<StateTransition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT job_id, from_state, to_state, actor, reason, created_at FROM job_transitions WHERE job_id = ?1 ORDER BY id ASC",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_transitions: {e}")))?;

        let mut transitions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_transitions row: {e}")))?
        {
            transitions.push(row_to_transition(&row)?);
        }
        Ok(transitions)
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), DatabaseError> {
        let _write = self.write_lock.lock().await;
        exec_insert_checkpoint(self.conn(), checkpoint).await
    }
}

#[async_trait]
impl EventStore for LibSqlBackend {
    async fn append_event(
        &self,
        job_id: Uuid,
        kind: EventKind,
        payload: &serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Result<Event, DatabaseError> {
        let _write = self.write_lock.lock().await;
        exec_append_event(self.conn(), job_id, kind, payload, timestamp).await
    }

    async fn read_events(
        &self,
        job_id: Uuid,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<Event>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE job_id = ?1 AND sequence > ?2 ORDER BY sequence ASC LIMIT ?3"
                ),
                params![job_id.to_string(), after_sequence as i64, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("read_events: {e}")))?;

        let mut events = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("read_events row: {e}")))?
        {
            events.push(row_to_event(&row)?);
        }
        Ok(events)
    }

    async fn last_sequence(&self, job_id: Uuid) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("last_sequence: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let sequence = int(&row, 0, "last_sequence")?;
                Ok(sequence as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("last_sequence row: {e}"))),
        }
    }

    async fn latest_checkpoint(&self, job_id: Uuid) -> Result<Option<Checkpoint>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE job_id = ?1 ORDER BY sequence DESC LIMIT 1"
                ),
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_checkpoint: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_checkpoint(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_checkpoint row: {e}"))),
        }
    }
}
