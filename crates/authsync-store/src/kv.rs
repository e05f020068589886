//! Key/value table holding the persisted auth state documents.
//!
//! Each store owns one key and keeps its whole state as a single JSON
//! document, so a write either lands completely or not at all. Writes that
//! touch several keys go through [`KvStore::apply`], which runs them in one
//! SQLite transaction.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::StoreResult;

/// One pending mutation of the `auth_state` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvWrite {
    /// Insert or replace `key` with an already-encoded JSON document.
    Put { key: &'static str, value: String },
    /// Remove `key`.
    Delete { key: &'static str },
}

impl KvWrite {
    /// Encode `value` as JSON and wrap it in a [`KvWrite::Put`].
    pub fn put_json<T: Serialize>(key: &'static str, value: &T) -> StoreResult<Self> {
        Ok(Self::Put {
            key,
            value: serde_json::to_string(value)?,
        })
    }

    fn key(&self) -> &'static str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Persistent string key/value store.
#[derive(Clone)]
pub struct KvStore {
    db: Database,
}

impl KvStore {
    /// Create a key/value store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get the raw value of `key`.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT value FROM auth_state WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                );
                match result {
                    Ok(value) => Ok(Some(value)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// Get and decode the JSON document stored at `key`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Apply every write in `writes` inside one transaction.
    #[instrument(skip(self, writes), fields(count = writes.len()))]
    pub async fn apply(&self, writes: Vec<KvWrite>) -> StoreResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        self.db
            .execute_mut(move |conn| {
                let now = chrono::Utc::now().timestamp();
                let tx = conn.transaction()?;
                for write in &writes {
                    match write {
                        KvWrite::Put { key, value } => {
                            tx.execute(
                                "INSERT INTO auth_state (key, value, updated_at) VALUES (?1, ?2, ?3) \
                                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                                 updated_at = excluded.updated_at",
                                rusqlite::params![key, value, now],
                            )?;
                        }
                        KvWrite::Delete { key } => {
                            tx.execute(
                                "DELETE FROM auth_state WHERE key = ?1",
                                rusqlite::params![key],
                            )?;
                        }
                    }
                }
                tx.commit()?;
                debug!(
                    keys = ?writes.iter().map(KvWrite::key).collect::<Vec<_>>(),
                    "auth state committed"
                );
                Ok(())
            })
            .await
    }

    /// Record an entry in the `auth_events` audit trail.
    pub async fn record_event(&self, kind: &str, detail: Option<&str>) -> StoreResult<()> {
        let kind = kind.to_string();
        let detail = detail.map(str::to_string);
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO auth_events (kind, detail, created_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![kind, detail, chrono::Utc::now().timestamp()],
                )?;
                Ok(())
            })
            .await
    }

    /// Most recent audit entries, newest first.
    pub async fn recent_events(&self, limit: u32) -> StoreResult<Vec<AuthEvent>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, kind, detail, created_at FROM auth_events \
                     ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], |row| {
                        Ok(AuthEvent {
                            id: row.get(0)?,
                            kind: row.get(1)?,
                            detail: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

/// A row of the `auth_events` audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthEvent {
    pub id: i64,
    /// Short machine-readable kind, e.g. `sync_completed`.
    pub kind: String,
    pub detail: Option<String>,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

// ── tests ────────────────────────────────────────────────────────────
