//! Store schema.
//!
//! Two tables: `generations` holds one row per `(name, version)` with the
//! active flag, and `entries` holds the stored responses of each generation.
//! Entries reference their generation with `ON DELETE CASCADE`, so deleting a
//! generation row drops its entries in the same statement.
//!
//! Each applied step is recorded in `schema_version`; a step runs inside its
//! own transaction together with that record.

use tokio_rusqlite::{Connection, params};

use super::Error;

struct Step {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[
    Step { version: 1, name: "generations", sql: include_str!("../../migrations/001_generations.sql") },
    Step { version: 2, name: "entries", sql: include_str!("../../migrations/002_entries.sql") },
];

/// Bring the schema up to the newest step.
pub async fn run(conn: &Connection) -> Result<(), Error> {
    conn.call(|conn| -> Result<(), Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let applied: i64 =
            conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))?;

        for step in STEPS.iter().filter(|step| step.version > applied) {
            let tx = conn.transaction()?;
            tx.execute_batch(step.sql)
                .map_err(|e| Error::MigrationFailed(format!("{} ({}): {e}", step.version, step.name)))?;
            tx.execute(
                "INSERT INTO schema_version (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![step.version, step.name, chrono::Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            tracing::debug!("applied schema step {} ({})", step.version, step.name);
        }

        Ok(())
    })
    .await
    .map_err(Error::from)
}
