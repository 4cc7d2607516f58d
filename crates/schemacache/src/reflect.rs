//! Schema reflection: reading table, column and foreign key definitions from a
//! live database.
//!
//! The cache is agnostic to how a database is inspected; anything implementing
//! [`Reflector`] can feed it. [`SqliteReflector`] covers SQLite files.

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionDescriptor;
use crate::model::{ForeignKey, Table};

/// Errors raised while reflecting a database
#[derive(Debug, thiserror::Error)]
pub enum ReflectError {
    #[error("Failed to connect: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("Unsupported driver: {0}")]
    UnsupportedDriver(String),
}

/// A column as reported by the source database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedColumn {
    pub name: String,
    pub type_name: String,
}

/// A foreign key as reported by the source database. Columns pair up by position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedForeignKey {
    pub name: Option<String>,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

/// A table as reported by the source database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectedTable {
    pub name: String,
    pub columns: Vec<ReflectedColumn>,
    pub foreign_keys: Vec<ReflectedForeignKey>,
}

/// Normalize into the cached model: identifiers are lowercased and unnamed
/// foreign keys get a synthesized `fk_<table>_<reftable>_<n>` name.
impl From<ReflectedTable> for Table {
    fn from(reflected: ReflectedTable) -> Self {
        let name = reflected.name.to_lowercase();
        let mut table = Table::new(name.clone());

        for column in reflected.columns {
            table.add_field(column.name.to_lowercase(), column.type_name);
        }

        for (n, fk) in reflected.foreign_keys.into_iter().enumerate() {
            let reftable = fk.referenced_table.to_lowercase();
            let constraint = match fk.name {
                Some(constraint) => constraint.to_lowercase(),
                None => format!("fk_{}_{}_{}", name, reftable, n),
            };
            table.add_foreign_key(
                ForeignKey::new(
                    name.clone(),
                    lowercase_all(fk.columns),
                    reftable,
                    lowercase_all(fk.referenced_columns),
                )
                .with_name(Some(constraint)),
            );
        }

        table
    }
}

fn lowercase_all(names: Vec<String>) -> Vec<String> {
    names.into_iter().map(|n| n.to_lowercase()).collect()
}

/// Reads the full schema of a database.
///
/// Implementations are called from background threads and may block for a
/// long time. Tables should be returned sorted by name.
pub trait Reflector: Send + Sync {
    fn reflect(&self, conn: &ConnectionDescriptor) -> Result<Vec<ReflectedTable>, ReflectError>;
}

/// Reflects SQLite database files. The descriptor's `database` is the file path.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteReflector;

impl Reflector for SqliteReflector {
    fn reflect(&self, conn: &ConnectionDescriptor) -> Result<Vec<ReflectedTable>, ReflectError> {
        if conn.driver != "sqlite" {
            return Err(ReflectError::UnsupportedDriver(conn.driver.clone()));
        }

        let path = Path::new(&conn.database);
        if !path.exists() {
            return Err(ReflectError::Connection(format!(
                "database file not found: {}",
                path.display()
            )));
        }

        let db = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ReflectError::Connection(e.to_string()))?;

        let names = list_tables(&db)?;
        tracing::debug!("Reflecting {} tables from {}", names.len(), path.display());

        names.iter().map(|name| reflect_table(&db, name)).collect()
    }
}

fn list_tables(db: &Connection) -> Result<Vec<String>, ReflectError> {
    let mut stmt = db.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

fn reflect_table(db: &Connection, name: &str) -> Result<ReflectedTable, ReflectError> {
    let columns = {
        let mut stmt =
            db.prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
        let columns = stmt
            .query_map(params![name], |row| {
                Ok(ReflectedColumn {
                    name: row.get(0)?,
                    type_name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        columns
    };

    // (id, seq, table, from, to); one id per constraint, seq orders its columns
    let rows: Vec<(i64, String, String, Option<String>)> = {
        let mut stmt = db.prepare(
            "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1)
             ORDER BY id, seq",
        )?;
        let rows = stmt
            .query_map(params![name], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut foreign_keys: Vec<ReflectedForeignKey> = Vec::new();
    let mut current_id = None;
    let mut pending_targets: Vec<Option<String>> = Vec::new();

    for (id, reftable, from, to) in rows {
        if current_id != Some(id) {
            if let Some(fk) = foreign_keys.last_mut() {
                fk.referenced_columns = resolve_targets(db, &fk.referenced_table, &pending_targets)?;
            }
            pending_targets.clear();
            current_id = Some(id);
            foreign_keys.push(ReflectedForeignKey {
                name: None,
                columns: Vec::new(),
                referenced_table: reftable,
                referenced_columns: Vec::new(),
            });
        }
        if let Some(fk) = foreign_keys.last_mut() {
            fk.columns.push(from);
        }
        pending_targets.push(to);
    }
    if let Some(fk) = foreign_keys.last_mut() {
        fk.referenced_columns = resolve_targets(db, &fk.referenced_table, &pending_targets)?;
    }

    Ok(ReflectedTable {
        name: name.to_string(),
        columns,
        foreign_keys,
    })
}

/// `REFERENCES parent` without columns targets the parent's primary key, or
/// its `rowid` when none is declared.
fn resolve_targets(
    db: &Connection,
    reftable: &str,
    targets: &[Option<String>],
) -> Result<Vec<String>, ReflectError> {
    if targets.iter().all(Option::is_some) {
        return Ok(targets.iter().flatten().cloned().collect());
    }

    let mut stmt =
        db.prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")?;
    let pk = stmt
        .query_map(params![reftable], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    Ok(targets
        .iter()
        .enumerate()
        .map(|(i, target)| match target {
            Some(column) => column.clone(),
            None => pk.get(i).cloned().unwrap_or_else(|| "rowid".to_string()),
        })
        .collect())
}
