//! Versioned schema migrations.
//!
//! Applied versions are recorded in `_migrations`, so running the set again
//! is a no-op.

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// Append new migrations at the end; versions must strictly increase.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "auth_state key/value table",
        sql: r#"
            CREATE TABLE auth_state (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        description: "auth_events audit trail",
        sql: r#"
            CREATE TABLE auth_events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                kind       TEXT NOT NULL,
                detail     TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX idx_auth_events_created ON auth_events(created_at);
        "#,
    },
];

/// Bring the schema up to the latest version.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        debug!(current_version = current, "auth state schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );
    for migration in pending {
        apply(conn, migration)?;
    }
    Ok(())
}

/// Highest applied migration version, `0` on a fresh database.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: Option<u32> = conn
        .query_row("SELECT MAX(version) FROM _migrations", [], |row| {
            row.get::<_, Option<u32>>(0)
        })
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    let fail = |stage: &str, e: rusqlite::Error| StoreError::Migration {
        version: migration.version,
        message: format!("{stage}: {e}"),
    };

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail("begin", e))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(|e| fail("execute", e))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.description,
                    chrono::Utc::now().timestamp()
                ],
            )
            .map(|_| ())
            .map_err(|e| fail("record", e))
        });

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT;").map_err(|e| fail("commit", e))?;
            Ok(())
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────
