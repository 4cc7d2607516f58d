//! Schema model: tables, fields, foreign keys and the per-database snapshot.
//!
//! A [`Database`] is an immutable-by-convention snapshot of one source database.
//! The cache hands out `Arc<Database>` values and replaces them wholesale when a
//! reflection completes, so every accessor here is a pure lookup.
//!
//! # Examples
//!
//! ```
//! use schemacache::{Database, ForeignKey, Table};
//!
//! let mut customers = Table::new("customers");
//! customers.add_field("id", "INTEGER");
//!
//! let mut orders = Table::new("orders");
//! orders.add_field("id", "INTEGER");
//! orders.add_field("customer_id", "INTEGER");
//! orders.add_foreign_key(ForeignKey::new(
//!     "orders",
//!     vec!["customer_id".to_string()],
//!     "customers",
//!     vec!["id".to_string()],
//! ));
//!
//! let db = Database::from_tables("key", vec![customers, orders], None);
//! let joins = db.get_joins("orders", "customers");
//! assert_eq!(joins.len(), 1);
//! assert_eq!(
//!     joins[0].as_join(),
//!     "customers inner join orders on customers.id = orders.customer_id"
//! );
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// A column of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Column name: "customer_id"
    pub name: String,
    /// Declared type as reported by the reflector: "INTEGER", "VARCHAR(20)"
    pub type_name: String,
    /// Owning table name
    pub table: String,
}

impl Field {
    pub fn new(
        table: impl Into<String>,
        name: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            table: table.into(),
        }
    }

    /// Name qualified by its table: "orders.customer_id"
    pub fn dotted(&self) -> String {
        format!("{}.{}", self.table, self.name)
    }
}

/// A foreign key constraint from `table.columns` to `reftable.refcolumns`.
///
/// Columns are paired positionally; composite keys carry several columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    pub table: String,
    pub columns: Vec<String>,
    pub reftable: String,
    pub refcolumns: Vec<String>,
    /// Constraint name, when the source database reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ForeignKey {
    pub fn new(
        table: impl Into<String>,
        columns: Vec<String>,
        reftable: impl Into<String>,
        refcolumns: Vec<String>,
    ) -> Self {
        Self {
            table: table.into(),
            columns,
            reftable: reftable.into(),
            refcolumns,
            name: None,
        }
    }

    /// Create a foreign key with a constraint name
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// True if `table` is the source or the target of this key.
    pub fn touches(&self, table: &str) -> bool {
        self.table == table || self.reftable == table
    }

    /// Whether `other` describes the same constraint (and should replace this one).
    fn same_constraint(&self, other: &ForeignKey) -> bool {
        if self.table != other.table {
            return false;
        }
        match (&self.name, &other.name) {
            (Some(a), Some(b)) => a == b,
            _ => {
                self.columns == other.columns
                    && self.reftable == other.reftable
                    && self.refcolumns == other.refcolumns
            }
        }
    }

    /// Render as an inner join clause:
    /// `"a inner join b on a.x = b.y and a.z = b.w"`
    pub fn as_join(&self) -> String {
        let conditions = self
            .columns
            .iter()
            .zip(&self.refcolumns)
            .map(|(col, refcol)| {
                format!("{}.{} = {}.{}", self.reftable, refcol, self.table, col)
            })
            .collect::<Vec<_>>()
            .join(" and ");
        format!(
            "{} inner join {} on {}",
            self.reftable, self.table, conditions
        )
    }
}

/// Render a foreign key as an inner join clause. See [`ForeignKey::as_join`].
pub fn fk_as_join(fk: &ForeignKey) -> String {
    fk.as_join()
}

/// A table with its fields and the foreign keys it owns (as the source side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    name: String,
    fields: Vec<Field>,
    foreign_keys: Vec<ForeignKey>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Add a field, replacing any existing field with the same name.
    pub fn add_field(&mut self, name: impl Into<String>, type_name: impl Into<String>) {
        let field = Field::new(self.name.clone(), name, type_name);
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    /// Add a foreign key, replacing an existing key for the same constraint.
    pub fn add_foreign_key(&mut self, fk: ForeignKey) {
        match self
            .foreign_keys
            .iter_mut()
            .find(|existing| existing.same_constraint(&fk))
        {
            Some(existing) => *existing = fk,
            None => self.foreign_keys.push(fk),
        }
    }
}

/// Snapshot of one source database's schema plus derived lookup indices.
#[derive(Debug, Clone, Default)]
pub struct Database {
    db_key: String,
    tables: BTreeMap<String, Table>,
    fields: BTreeSet<String>,
    dotted_fields: BTreeSet<String>,
    types: BTreeMap<String, String>,
    foreign_keys: Vec<ForeignKey>,
    created: Option<DateTime<Utc>>,
}

impl Database {
    /// An empty, never-populated snapshot.
    pub fn new(db_key: impl Into<String>) -> Self {
        Self {
            db_key: db_key.into(),
            ..Default::default()
        }
    }

    /// Build a snapshot from a complete set of tables.
    pub fn from_tables(
        db_key: impl Into<String>,
        tables: impl IntoIterator<Item = Table>,
        created: Option<DateTime<Utc>>,
    ) -> Self {
        let mut db = Self::new(db_key);
        db.created = created;
        db.update_tables(tables);
        db
    }

    /// Set the time of the last successful full reflection
    pub fn with_created(mut self, created: Option<DateTime<Utc>>) -> Self {
        self.created = created;
        self
    }

    /// Merge tables into this snapshot, replacing tables with the same name.
    pub fn update_tables(&mut self, tables: impl IntoIterator<Item = Table>) {
        for table in tables {
            self.tables.insert(table.name.clone(), table);
        }
        self.reindex();
    }

    fn reindex(&mut self) {
        self.fields.clear();
        self.dotted_fields.clear();
        self.types.clear();
        self.foreign_keys.clear();

        for table in self.tables.values() {
            for field in &table.fields {
                let dotted = field.dotted();
                self.fields.insert(field.name.clone());
                self.types.insert(dotted.clone(), field.type_name.clone());
                self.dotted_fields.insert(dotted);
            }
            self.foreign_keys.extend(table.foreign_keys.iter().cloned());
        }
    }

    pub fn db_key(&self) -> &str {
        &self.db_key
    }

    /// True until the snapshot has been populated from the store or a reflection.
    pub fn is_empty(&self) -> bool {
        self.created.is_none() && self.tables.is_empty()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    /// Time since the last full reflection, `None` if never reflected.
    pub fn age(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.created.map(|created| now - created)
    }

    /// Whether the snapshot is older than `max_age` (never-reflected snapshots are stale).
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: TimeDelta) -> bool {
        match self.age(now) {
            Some(age) => age > max_age,
            None => true,
        }
    }

    /// Table names in sorted order
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// All distinct field names across tables
    pub fn fields(&self) -> &BTreeSet<String> {
        &self.fields
    }

    /// All "table.field" names
    pub fn dotted_fields(&self) -> &BTreeSet<String> {
        &self.dotted_fields
    }

    /// Mapping of "table.field" to declared type
    pub fn types(&self) -> &BTreeMap<String, String> {
        &self.types
    }

    pub fn type_of(&self, dotted: &str) -> Option<&str> {
        self.types.get(dotted).map(String::as_str)
    }

    /// Every foreign key across all tables
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Field names, either all of them or only those belonging to `table`.
    pub fn get_fields(&self, table: Option<&str>) -> Vec<&str> {
        match table {
            Some(table) => self
                .tables
                .get(table)
                .map(|t| t.fields.iter().map(|f| f.name.as_str()).collect())
                .unwrap_or_default(),
            None => self.fields.iter().map(String::as_str).collect(),
        }
    }

    /// Dotted field names, either all of them or only those belonging to `table`.
    pub fn get_dotted_fields(&self, table: Option<&str>) -> Vec<&str> {
        match table {
            Some(table) => {
                let prefix = format!("{}.", table);
                self.dotted_fields
                    .iter()
                    .filter(|df| df.starts_with(&prefix))
                    .map(String::as_str)
                    .collect()
            }
            None => self.dotted_fields.iter().map(String::as_str).collect(),
        }
    }

    /// Names of tables joined to `table` by any foreign key, in either direction.
    pub fn tables_referencing(&self, table: &str) -> BTreeSet<&str> {
        let mut refs = BTreeSet::new();
        for fk in &self.foreign_keys {
            if fk.table == table {
                refs.insert(fk.reftable.as_str());
            } else if fk.reftable == table {
                refs.insert(fk.table.as_str());
            }
        }
        refs
    }

    /// Foreign keys pointing at `table`, optionally only those referencing `field`.
    pub fn fields_referencing(&self, table: &str, field: Option<&str>) -> Vec<&ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(|fk| fk.reftable == table)
            .filter(|fk| match field {
                Some(field) => fk.refcolumns.iter().any(|c| c == field),
                None => true,
            })
            .collect()
    }

    /// Every foreign key to or from `table`.
    pub fn get_all_joins(&self, table: &str) -> Vec<&ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(|fk| fk.touches(table))
            .collect()
    }

    /// Foreign keys connecting `t1` and `t2`, in either direction.
    pub fn get_joins(&self, t1: &str, t2: &str) -> Vec<&ForeignKey> {
        self.foreign_keys
            .iter()
            .filter(|fk| {
                (fk.table == t1 && fk.reftable == t2) || (fk.table == t2 && fk.reftable == t1)
            })
            .collect()
    }
}
