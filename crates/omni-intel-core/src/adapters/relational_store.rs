//! Relational store adapter (specification §6, §4.8).
//!
//! Three operations are required of any adapter: `lookup_by_position`,
//! `insert_item`, `update_item_fingerprint`. The default implementation is
//! a `rusqlite`-backed store with a unique index on the position triple,
//! directly grounded in the teacher crate's `MetadataIndex`
//! schema-via-`include_str!` pattern (WAL mode, `foreign_keys` pragma).

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

use crate::error::{OmniError, OmniResult};

/// A row as stored by the relational store, keyed by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextItemRow {
    /// Relational-store item id.
    pub item_id: String,
    /// Stored content fingerprint.
    pub fingerprint: String,
    /// Stored version hash.
    pub version_hash: String,
}

/// A new row to insert on the `CREATED` path (§4.8 step 2).
#[derive(Debug, Clone)]
pub struct NewContextItem {
    /// Fresh item id assigned by the writer.
    pub item_id: String,
    /// Canonical path within the repository.
    pub source_ref: String,
    /// Inclusive start offset.
    pub character_offset_start: u64,
    /// Exclusive end offset.
    pub character_offset_end: u64,
    /// Content fingerprint.
    pub fingerprint: String,
    /// Version hash.
    pub version_hash: String,
}

/// The relational store operations required by the core (§6).
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Look up the existing row at `(source_ref, start, end)`, if any
    /// (§4.8 step 1).
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure.
    async fn lookup_by_position(
        &self,
        source_ref: &str,
        start: u64,
        end: u64,
    ) -> OmniResult<Option<ContextItemRow>>;

    /// Insert a new row (`CREATED` outcome).
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure, including a
    /// unique-constraint violation on the position triple (§8 Positional
    /// uniqueness).
    async fn insert_item(&self, row: NewContextItem) -> OmniResult<()>;

    /// Update the fingerprint and version hash of an existing row
    /// (`UPDATED` outcome).
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure.
    async fn update_item_fingerprint(
        &self,
        item_id: &str,
        fingerprint: &str,
        version_hash: &str,
    ) -> OmniResult<()>;
}

const SCHEMA: &str = include_str!("relational_schema.sql");

/// SQLite-backed [`RelationalStore`] implementation.
pub struct SqliteRelationalStore {
    conn: Mutex<Connection>,
}

impl SqliteRelationalStore {
    /// Open or create a store at `db_path`, applying the schema if absent.
    ///
    /// # Errors
    /// Returns an [`OmniError`] if the database cannot be opened or the
    /// schema cannot be applied.
    pub fn open(db_path: &Path) -> OmniResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open an in-memory store, used by tests and the deterministic test
    /// harness.
    ///
    /// # Errors
    /// Returns an [`OmniError`] if the schema cannot be applied.
    pub fn open_in_memory() -> OmniResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl RelationalStore for SqliteRelationalStore {
    async fn lookup_by_position(
        &self,
        source_ref: &str,
        start: u64,
        end: u64,
    ) -> OmniResult<Option<ContextItemRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT item_id, fingerprint, version_hash FROM context_items \
             WHERE source_ref = ?1 AND char_start = ?2 AND char_end = ?3",
        )?;
        let mut rows = stmt.query(params![source_ref, start as i64, end as i64])?;
        if let Some(row) = rows.next()? {
            Ok(Some(ContextItemRow {
                item_id: row.get(0)?,
                fingerprint: row.get(1)?,
                version_hash: row.get(2)?,
            }))
        } else {
            Ok(None)
        }
    }

    async fn insert_item(&self, row: NewContextItem) -> OmniResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO context_items \
             (item_id, source_ref, char_start, char_end, fingerprint, version_hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.item_id,
                row.source_ref,
                row.character_offset_start as i64,
                row.character_offset_end as i64,
                row.fingerprint,
                row.version_hash,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                OmniError::Validation(format!(
                    "position ({}, {}, {}) already has an item",
                    row.source_ref, row.character_offset_start, row.character_offset_end
                ))
            }
            other => OmniError::Database(other),
        })?;
        Ok(())
    }

    async fn update_item_fingerprint(
        &self,
        item_id: &str,
        fingerprint: &str,
        version_hash: &str,
    ) -> OmniResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE context_items SET fingerprint = ?2, version_hash = ?3 WHERE item_id = ?1",
            params![item_id, fingerprint, version_hash],
        )?;
        Ok(())
    }
}
