//! Schema migrations for the job store.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "jobs_and_event_log",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                job_type TEXT NOT NULL,
                params TEXT NOT NULL DEFAULT 'null',
                state TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                current_step TEXT,
                attempt INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_activity_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_state_activity ON jobs(state, last_activity_at);

            CREATE TABLE IF NOT EXISTS events (
                job_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (job_id, sequence)
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                job_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                progress INTEGER NOT NULL,
                step TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (job_id, sequence)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "job_transition_audit",
        sql: r#"
            CREATE TABLE IF NOT EXISTS job_transitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                actor TEXT NOT NULL,
                reason TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_job_transitions_job ON job_transitions(job_id);
        "#,
    },
];

/// Bring the schema up to the newest version. Applied versions are
/// recorded in `_migrations` and never re-run.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("_migrations table: {e}")))?;

    let applied = schema_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying schema migration");
        conn.execute_batch(step.sql)
            .await
            .map_err(|e| DatabaseError::Migration(format!("v{} {}: {e}", step.version, step.name)))?;
        conn.execute(
            "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![step.version, step.name],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("record v{}: {e}", step.version)))?;
    }

    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("schema version column: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("read schema version: {e}"))),
    }
}
