#![allow(deprecated)] // cargo_bin is deprecated in assert_cmd but replacement not yet stable

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;
use std::{
    error::Error,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

type TestResult<T = ()> = std::result::Result<T, Box<dyn Error>>;

/// A throwaway SQLite database plus a private metadata store.
///
/// Commands run with the temp dir as working directory so no user config leaks in.
struct SampleDatabase {
    dir: TempDir,
}

impl SampleDatabase {
    fn new() -> TestResult<Self> {
        let dir = TempDir::new()?;
        rusqlite::Connection::open(dir.path().join("shop.db"))?.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE orders (
                 id INTEGER PRIMARY KEY,
                 customer_id INTEGER REFERENCES customers(id),
                 total REAL
             );
             CREATE TABLE audit_log (message TEXT);",
        )?;
        Ok(Self { dir })
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn db_path(&self) -> PathBuf {
        self.root().join("shop.db")
    }

    fn store_path(&self) -> PathBuf {
        self.root().join("store").join("metadata.db")
    }

    fn cmd(&self) -> TestResult<Command> {
        let mut cmd = Command::cargo_bin("schemacache")?;
        cmd.current_dir(self.root())
            .env_remove("SCHEMACACHE_STORE_PATH")
            .arg("--db")
            .arg(self.db_path())
            .arg("--store")
            .arg(self.store_path());
        Ok(cmd)
    }
}

#[test]
fn joins_command_prints_join_clause() -> TestResult {
    let sample = SampleDatabase::new()?;

    sample
        .cmd()?
        .args(["joins", "orders", "--with", "customers", "--format", "text"])
        .assert()
        .success()
        .stdout(contains(
            "customers inner join orders on customers.id = orders.customer_id",
        ));

    assert!(sample.store_path().exists());
    Ok(())
}

#[test]
fn tables_command_lists_tables_as_json() -> TestResult {
    let sample = SampleDatabase::new()?;

    let output = sample.cmd()?.args(["tables"]).output()?;
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(
        json["tables"],
        serde_json::json!(["audit_log", "customers", "orders"])
    );
    Ok(())
}

#[test]
fn fields_command_filters_by_table() -> TestResult {
    let sample = SampleDatabase::new()?;

    sample
        .cmd()?
        .args(["fields", "--table", "orders", "--dotted", "--format", "text"])
        .assert()
        .success()
        .stdout(contains("orders.customer_id INTEGER"))
        .stdout(contains("customers.").not());
    Ok(())
}

#[test]
fn unknown_table_exits_not_found() -> TestResult {
    let sample = SampleDatabase::new()?;

    sample
        .cmd()?
        .args(["fields", "--table", "missing", "--format", "text"])
        .assert()
        .code(1)
        .stderr(contains("Table not found: missing"));
    Ok(())
}

#[test]
fn table_without_joins_exits_not_found() -> TestResult {
    let sample = SampleDatabase::new()?;

    sample
        .cmd()?
        .args(["joins", "audit_log"])
        .assert()
        .code(1)
        .stdout(contains("No joins found"));
    Ok(())
}

#[test]
fn missing_database_is_an_error() -> TestResult {
    let sample = SampleDatabase::new()?;

    Command::cargo_bin("schemacache")?
        .current_dir(sample.root())
        .args(["tables", "--db", "nope.db", "--store"])
        .arg(sample.store_path())
        .args(["--format", "text"])
        .assert()
        .code(2)
        .stderr(contains("Database not found"));
    Ok(())
}

#[test]
fn refresh_then_status_reports_cached_tables() -> TestResult {
    let sample = SampleDatabase::new()?;

    sample
        .cmd()?
        .args(["refresh", "--format", "text"])
        .assert()
        .success()
        .stdout(contains("Reflected 3 tables"));

    let output = sample.cmd()?.args(["status"]).output()?;
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(json["tables"], 3);
    assert_eq!(json["foreign_keys"], 1);
    assert_eq!(json["stale"], false);
    Ok(())
}

#[test]
fn refresh_picks_up_schema_changes() -> TestResult {
    let sample = SampleDatabase::new()?;
    sample.cmd()?.args(["tables"]).assert().success();

    rusqlite::Connection::open(sample.db_path())?
        .execute_batch("CREATE TABLE invoices (id INTEGER PRIMARY KEY);")?;

    // Still fresh: served from the store
    sample
        .cmd()?
        .args(["tables", "--format", "text"])
        .assert()
        .success()
        .stdout(contains("invoices").not());

    sample.cmd()?.args(["refresh"]).assert().success();

    sample
        .cmd()?
        .args(["tables", "--format", "text"])
        .assert()
        .success()
        .stdout(contains("invoices"));
    Ok(())
}

#[test]
fn flush_forgets_cached_metadata() -> TestResult {
    let sample = SampleDatabase::new()?;
    sample.cmd()?.args(["refresh"]).assert().success();

    sample
        .cmd()?
        .args(["flush", "--format", "text"])
        .assert()
        .success()
        .stdout(contains("Flushed cached metadata"));

    sample
        .cmd()?
        .args(["status", "--format", "text"])
        .assert()
        .code(1)
        .stderr(contains("No cached metadata"));
    Ok(())
}

#[test]
fn flush_all_without_database() -> TestResult {
    let sample = SampleDatabase::new()?;
    sample.cmd()?.args(["refresh"]).assert().success();

    Command::cargo_bin("schemacache")?
        .current_dir(sample.root())
        .arg("--store")
        .arg(sample.store_path())
        .args(["flush", "--all"])
        .assert()
        .success()
        .stdout(contains("\"flushed\":\"all\""));

    Command::cargo_bin("schemacache")?
        .current_dir(sample.root())
        .arg("--store")
        .arg(sample.store_path())
        .args(["status", "--format", "text"])
        .assert()
        .success()
        .stdout(contains("Cached databases: 0"));
    Ok(())
}

#[test]
fn flush_after_database_deleted() -> TestResult {
    let sample = SampleDatabase::new()?;
    sample.cmd()?.args(["refresh"]).assert().success();
    std::fs::remove_file(sample.db_path())?;

    // Relative path to a file that is gone still maps to the cached key
    Command::cargo_bin("schemacache")?
        .current_dir(sample.root())
        .args(["--db", "shop.db", "--store"])
        .arg(sample.store_path())
        .args(["flush"])
        .assert()
        .success();

    Command::cargo_bin("schemacache")?
        .current_dir(sample.root())
        .arg("--store")
        .arg(sample.store_path())
        .args(["status", "--format", "text"])
        .assert()
        .success()
        .stdout(contains("Cached databases: 0"));
    Ok(())
}
