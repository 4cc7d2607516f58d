//! SQLite-based persistent storage for reflected schema metadata.
//!
//! All databases share one store file; rows are discriminated by `db_key`.
//! The layout is two related tables:
//! - `dbtable`: one row per (db_key, table name), with the time of the last reflection
//! - `dbfield`: one row per (table, column), carrying the column's foreign key
//!   attributes (constraint name, position in the constraint, referenced table/column)
//!
//! Writes are upserts: inserting a row that already exists is caught and turned
//! into an update, so writing the same table twice leaves the store unchanged.
//!
//! # Examples
//!
//! ```
//! use schemacache::{SchemaStore, Table};
//!
//! let store = SchemaStore::in_memory().unwrap();
//!
//! let mut users = Table::new("users");
//! users.add_field("id", "INTEGER");
//! users.add_field("email", "TEXT");
//! store.write_table("db1", &users).unwrap();
//!
//! let db = store.read("db1").unwrap();
//! assert_eq!(db.get_fields(Some("users")), vec!["id", "email"]);
//! assert!(store.read("db2").unwrap().is_empty());
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::model::{Database, ForeignKey, Table};
use crate::Result;

/// Current store schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Default store filename within the cache directory
pub const DEFAULT_STORE_NAME: &str = "metadata.db";

/// Durable store of schema snapshots, one shared SQLite file for all databases.
///
/// The connection sits behind a mutex: every write is a single transaction, so a
/// reader holding the lock never observes a half-written table.
pub struct SchemaStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SchemaStore {
    /// Open (or create) a store file, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.configure()?;
        store.create_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        store.configure()?;
        store.create_schema()?;
        Ok(store)
    }

    fn configure(&self) -> Result<()> {
        // WAL lets a second process (e.g. the CLI) read while a reflection writes
        self.conn.lock().execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }

    /// Path of the backing file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Create tables if absent. Resets the store if it was written by an
    /// incompatible schema version.
    pub fn create_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA_SQL)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored.and_then(|v| v.parse::<u32>().ok()) {
            Some(v) if v == SCHEMA_VERSION => return Ok(()),
            Some(v) => {
                tracing::warn!(
                    stored = v,
                    current = SCHEMA_VERSION,
                    "Store schema version mismatch, discarding cached metadata"
                );
                conn.execute_batch(DROP_SQL)?;
                conn.execute_batch(SCHEMA_SQL)?;
            }
            None => {}
        }

        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    }

    /// Delete persisted metadata: every database when `db_key` is `None`
    /// (tables are dropped, call [`create_schema`](Self::create_schema) after),
    /// otherwise only the rows belonging to `db_key`.
    pub fn delete_schema(&self, db_key: Option<&str>) -> Result<()> {
        let mut conn = self.conn.lock();
        match db_key {
            None => conn.execute_batch(DROP_SQL)?,
            Some(key) => {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM dbfield WHERE table_id IN
                        (SELECT id FROM dbtable WHERE db_key = ?1)",
                    params![key],
                )?;
                tx.execute("DELETE FROM dbtable WHERE db_key = ?1", params![key])?;
                tx.commit()?;
            }
        }
        Ok(())
    }

    /// Upsert one table and its fields in a single transaction.
    ///
    /// Existing rows are updated in place; columns no longer present in `table`
    /// are removed. Writing identical input twice leaves the store unchanged.
    pub fn write_table(&self, db_key: &str, table: &Table) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM dbtable WHERE db_key = ?1 AND name = ?2",
                params![db_key, table.name()],
                |row| row.get(0),
            )
            .optional()?;

        let table_id = match existing {
            Some(id) => id,
            None => {
                tx.execute(
                    "INSERT INTO dbtable (db_key, name, created) VALUES (?1, ?2, ?3)",
                    params![db_key, table.name(), Utc::now().timestamp()],
                )?;
                tx.last_insert_rowid()
            }
        };

        for field in table.fields() {
            let link = constraint_for(table.foreign_keys(), &field.name);
            let (constraint_name, position, reftable, refcolumn) = match link {
                Some((fk, pos)) => (
                    fk.name.as_deref(),
                    Some(pos as i64 + 1),
                    Some(fk.reftable.as_str()),
                    fk.refcolumns.get(pos).map(String::as_str),
                ),
                None => (None, None, None, None),
            };

            let inserted = tx.execute(
                "INSERT INTO dbfield (table_id, name, type, constraint_name,
                    position_in_constraint, referenced_table, referenced_column)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    table_id,
                    field.name,
                    field.type_name,
                    constraint_name,
                    position,
                    reftable,
                    refcolumn,
                ],
            );

            match inserted {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    tx.execute(
                        "UPDATE dbfield SET
                            type = ?3,
                            constraint_name = ?4,
                            position_in_constraint = ?5,
                            referenced_table = ?6,
                            referenced_column = ?7
                         WHERE table_id = ?1 AND name = ?2",
                        params![
                            table_id,
                            field.name,
                            field.type_name,
                            constraint_name,
                            position,
                            reftable,
                            refcolumn,
                        ],
                    )?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Drop columns that disappeared from the source table
        let stored_fields: Vec<String> = {
            let mut stmt = tx.prepare("SELECT name FROM dbfield WHERE table_id = ?1")?;
            let names = stmt
                .query_map(params![table_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            names
        };
        for name in stored_fields {
            if table.field(&name).is_none() {
                tx.execute(
                    "DELETE FROM dbfield WHERE table_id = ?1 AND name = ?2",
                    params![table_id, name],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Close out a full reflection: remove tables for `db_key` that are not in
    /// `keep` and stamp the remaining ones with `completed_at`.
    ///
    /// Returns the number of tables removed.
    pub fn finish_reflection(
        &self,
        db_key: &str,
        keep: &[String],
        completed_at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();

        let stored: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, name FROM dbtable WHERE db_key = ?1")?;
            let rows = stmt
                .query_map(params![db_key], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut pruned = 0;
        for (id, name) in stored {
            if !keep.contains(name.as_str()) {
                tx.execute("DELETE FROM dbfield WHERE table_id = ?1", params![id])?;
                tx.execute("DELETE FROM dbtable WHERE id = ?1", params![id])?;
                pruned += 1;
            }
        }

        tx.execute(
            "UPDATE dbtable SET created = ?1 WHERE db_key = ?2",
            params![completed_at.timestamp(), db_key],
        )?;
        tx.commit()?;
        Ok(pruned)
    }

    /// Reconstruct the full snapshot for `db_key`.
    ///
    /// An unknown key yields an empty [`Database`].
    pub fn read(&self, db_key: &str) -> Result<Database> {
        let conn = self.conn.lock();

        let mut tables: BTreeMap<String, Table> = BTreeMap::new();
        // (table, constraint) -> [(position, column, reftable, refcolumn)]
        let mut constraints: BTreeMap<(String, String), Vec<FkColumn>> = BTreeMap::new();

        {
            let mut stmt = conn.prepare(
                "SELECT t.name, f.name, f.type, f.constraint_name,
                        f.position_in_constraint, f.referenced_table, f.referenced_column
                 FROM dbtable t
                 LEFT JOIN dbfield f ON f.table_id = t.id
                 WHERE t.db_key = ?1
                 ORDER BY t.name, f.id",
            )?;
            let rows = stmt.query_map(params![db_key], row_to_stored_field)?;

            for row in rows {
                let row = row?;
                let table = tables
                    .entry(row.table.clone())
                    .or_insert_with(|| Table::new(row.table.clone()));

                let Some(field) = row.field else {
                    continue;
                };
                table.add_field(field.clone(), row.type_name.unwrap_or_default());

                if let (Some(constraint), Some(reftable), Some(refcolumn)) =
                    (row.constraint_name, row.referenced_table, row.referenced_column)
                {
                    constraints
                        .entry((row.table, constraint))
                        .or_default()
                        .push(FkColumn {
                            position: row.position.unwrap_or(0),
                            column: field,
                            reftable,
                            refcolumn,
                        });
                }
            }
        }

        for ((table_name, constraint), mut columns) in constraints {
            columns.sort_by_key(|c| c.position);
            let reftable = columns[0].reftable.clone();
            let fk = ForeignKey::new(
                table_name.clone(),
                columns.iter().map(|c| c.column.clone()).collect(),
                reftable,
                columns.iter().map(|c| c.refcolumn.clone()).collect(),
            )
            .with_name(Some(constraint));
            if let Some(table) = tables.get_mut(&table_name) {
                table.add_foreign_key(fk);
            }
        }

        let created: Option<i64> = conn.query_row(
            "SELECT MAX(created) FROM dbtable WHERE db_key = ?1",
            params![db_key],
            |row| row.get(0),
        )?;
        let created = created.and_then(|secs| DateTime::from_timestamp(secs, 0));

        Ok(Database::from_tables(db_key, tables.into_values(), created))
    }

    /// All database keys with persisted metadata
    pub fn db_keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT db_key FROM dbtable ORDER BY db_key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Number of tables persisted for `db_key`
    pub fn table_count(&self, db_key: &str) -> Result<usize> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM dbtable WHERE db_key = ?1",
            params![db_key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

// ============================================================================
// Schema
// ============================================================================

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- One row per reflected table
CREATE TABLE IF NOT EXISTS dbtable (
    id INTEGER PRIMARY KEY,
    db_key TEXT NOT NULL,
    name TEXT NOT NULL,
    created INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
    CONSTRAINT dbtable_unique UNIQUE (db_key, name)
);

-- One row per column, with its foreign key attributes (if any)
CREATE TABLE IF NOT EXISTS dbfield (
    id INTEGER PRIMARY KEY,
    table_id INTEGER NOT NULL
        REFERENCES dbtable(id)
        ON DELETE CASCADE
        ON UPDATE CASCADE,
    name TEXT NOT NULL,
    type TEXT,
    constraint_name TEXT,
    position_in_constraint INTEGER,
    referenced_table TEXT,
    referenced_column TEXT,
    CONSTRAINT dbfield_unique UNIQUE (table_id, name)
);
"#;

const DROP_SQL: &str = "DROP TABLE IF EXISTS dbfield;
                        DROP TABLE IF EXISTS dbtable;";

// ============================================================================
// Helper Functions
// ============================================================================

struct StoredField {
    table: String,
    field: Option<String>,
    type_name: Option<String>,
    constraint_name: Option<String>,
    position: Option<i64>,
    referenced_table: Option<String>,
    referenced_column: Option<String>,
}

struct FkColumn {
    position: i64,
    column: String,
    reftable: String,
    refcolumn: String,
}

fn row_to_stored_field(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredField> {
    Ok(StoredField {
        table: row.get(0)?,
        field: row.get(1)?,
        type_name: row.get(2)?,
        constraint_name: row.get(3)?,
        position: row.get(4)?,
        referenced_table: row.get(5)?,
        referenced_column: row.get(6)?,
    })
}

/// The first foreign key containing `column`, with the column's index in it.
fn constraint_for<'a>(fks: &'a [ForeignKey], column: &str) -> Option<(&'a ForeignKey, usize)> {
    fks.iter()
        .find_map(|fk| fk.columns.iter().position(|c| c == column).map(|pos| (fk, pos)))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}
