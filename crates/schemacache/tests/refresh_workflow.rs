//! End-to-end cache behaviour with real thread pools and on-disk stores.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use schemacache::{
    CacheSettings, ConnectionDescriptor, Database, InlineExecutor, MetadataCache, PoolExecutor,
    ReflectError, ReflectedColumn, ReflectedTable, Reflector, SchemaStore, SqliteReflector,
};
use tempfile::TempDir;

type TestResult<T = ()> = std::result::Result<T, Box<dyn Error>>;

// ============================================================================
// Test reflectors
// ============================================================================

/// Blocks every reflection until released, counting calls.
struct GatedReflector {
    open: AtomicBool,
    calls: AtomicUsize,
}

impl GatedReflector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    fn release(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Reflector for GatedReflector {
    fn reflect(&self, conn: &ConnectionDescriptor) -> Result<Vec<ReflectedTable>, ReflectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        while !self.open.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(2));
        }
        Ok(vec![ReflectedTable {
            name: conn.database.clone(),
            columns: vec![ReflectedColumn {
                name: "id".to_string(),
                type_name: "INTEGER".to_string(),
            }],
            foreign_keys: vec![],
        }])
    }
}

/// Delegates to SQLite until told to fail.
struct FlakyReflector {
    failing: AtomicBool,
}

impl Reflector for FlakyReflector {
    fn reflect(&self, conn: &ConnectionDescriptor) -> Result<Vec<ReflectedTable>, ReflectError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ReflectError::Connection("server went away".to_string()));
        }
        SqliteReflector.reflect(conn)
    }
}

/// Fails the test if the cache reflects at all.
struct NeverReflector;

impl Reflector for NeverReflector {
    fn reflect(&self, _conn: &ConnectionDescriptor) -> Result<Vec<ReflectedTable>, ReflectError> {
        panic!("reflection should not be needed");
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn create_shop_db(dir: &Path) -> TestResult<PathBuf> {
    let path = dir.join("shop.db");
    rusqlite::Connection::open(&path)?.execute_batch(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE orders (
             id INTEGER PRIMARY KEY,
             customer_id INTEGER REFERENCES customers(id),
             total REAL
         );
         CREATE TABLE order_items (
             order_id INTEGER REFERENCES orders(id),
             sku TEXT
         );",
    )?;
    Ok(path)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn assert_same_schema(a: &Database, b: &Database) {
    assert_eq!(a.tables().collect::<Vec<_>>(), b.tables().collect::<Vec<_>>());
    assert_eq!(a.fields(), b.fields());
    assert_eq!(a.dotted_fields(), b.dotted_fields());
    assert_eq!(a.types(), b.types());
    assert_eq!(a.foreign_keys(), b.foreign_keys());
    for table in a.tables() {
        assert_eq!(a.get_fields(Some(table)), b.get_fields(Some(table)));
        assert_eq!(a.tables_referencing(table), b.tables_referencing(table));
        assert_eq!(a.get_all_joins(table), b.get_all_joins(table));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn concurrent_callers_share_one_reflection() -> TestResult {
    let reflector = GatedReflector::new();
    let cache = MetadataCache::new(
        Arc::new(SchemaStore::in_memory()?),
        reflector.clone(),
        Arc::new(PoolExecutor::new(4)?),
        CacheSettings::default(),
    )?;
    let conn = ConnectionDescriptor::new("test", "orders");

    thread::scope(|scope| {
        for _ in 0..16 {
            scope.spawn(|| {
                let db = cache.get_metadata(&conn, false).unwrap();
                assert!(db.is_empty());
            });
        }
    });

    assert!(wait_until(|| reflector.calls() == 1));
    assert!(cache.reflecting(&conn)?);
    // Forcing while a reflection is in flight does not start another
    assert!(cache.get_metadata(&conn, true)?.is_empty());

    reflector.release();
    cache.wait_idle();

    assert_eq!(reflector.calls(), 1);
    assert!(!cache.reflecting(&conn)?);
    let db = cache.get_metadata(&conn, false)?;
    assert_eq!(db.get_fields(Some("orders")), vec!["id"]);
    Ok(())
}

#[test]
fn persisted_snapshot_survives_restart() -> TestResult {
    let temp = TempDir::new()?;
    let db_path = create_shop_db(temp.path())?;
    let store_path = temp.path().join("cache").join("metadata.db");
    let conn = ConnectionDescriptor::sqlite(&db_path);

    let reflected = {
        let cache = MetadataCache::new(
            Arc::new(SchemaStore::open(&store_path)?),
            Arc::new(SqliteReflector),
            Arc::new(InlineExecutor),
            CacheSettings::default(),
        )?;
        cache.get_metadata(&conn, false)?;
        let db = cache.get_metadata(&conn, false)?;
        cache.shutdown();
        db
    };
    assert_eq!(reflected.table_count(), 3);

    let cache = MetadataCache::new(
        Arc::new(SchemaStore::open(&store_path)?),
        Arc::new(NeverReflector),
        Arc::new(InlineExecutor),
        CacheSettings::default(),
    )?;
    let restored = cache.get_metadata(&conn, false)?;

    assert_same_schema(&reflected, &restored);
    assert_eq!(
        restored.get_joins("customers", "orders")[0].as_join(),
        "customers inner join orders on customers.id = orders.customer_id"
    );
    Ok(())
}

#[test]
fn failed_refresh_keeps_previous_snapshot() -> TestResult {
    let temp = TempDir::new()?;
    let conn = ConnectionDescriptor::sqlite(&create_shop_db(temp.path())?);
    let reflector = Arc::new(FlakyReflector {
        failing: AtomicBool::new(false),
    });
    let cache = MetadataCache::new(
        Arc::new(SchemaStore::in_memory()?),
        reflector.clone(),
        Arc::new(PoolExecutor::new(2)?),
        CacheSettings::default(),
    )?;

    cache.get_metadata(&conn, false)?;
    cache.wait_idle();
    let before = cache.get_metadata(&conn, false)?;
    assert_eq!(before.table_count(), 3);

    reflector.failing.store(true, Ordering::SeqCst);
    cache.get_metadata(&conn, true)?;
    cache.wait_idle();

    let after = cache.get_metadata(&conn, false)?;
    assert!(Arc::ptr_eq(&before, &after));
    assert!(!cache.reflecting(&conn)?);
    Ok(())
}

#[test]
fn schema_changes_appear_after_forced_refresh() -> TestResult {
    let temp = TempDir::new()?;
    let db_path = create_shop_db(temp.path())?;
    let conn = ConnectionDescriptor::sqlite(&db_path);
    let store = Arc::new(SchemaStore::in_memory()?);
    let cache = MetadataCache::new(
        Arc::clone(&store),
        Arc::new(SqliteReflector),
        Arc::new(PoolExecutor::new(2)?),
        CacheSettings::default(),
    )?;

    cache.get_metadata(&conn, false)?;
    cache.wait_idle();

    rusqlite::Connection::open(&db_path)?.execute_batch(
        "DROP TABLE order_items;
         ALTER TABLE customers ADD COLUMN email TEXT;",
    )?;

    let before = cache.get_metadata(&conn, true)?;
    assert!(before.table("order_items").is_some());
    cache.wait_idle();

    let after = cache.get_metadata(&conn, false)?;
    assert!(after.table("order_items").is_none());
    assert_eq!(after.get_fields(Some("customers")), vec!["id", "name", "email"]);

    // The store was pruned too
    let stored = store.read(&conn.db_key()?)?;
    assert_eq!(stored.table_count(), 2);
    Ok(())
}

#[test]
fn flush_waits_for_in_flight_reflection() -> TestResult {
    let reflector = GatedReflector::new();
    let store = Arc::new(SchemaStore::in_memory()?);
    let cache = MetadataCache::new(
        Arc::clone(&store),
        reflector.clone(),
        Arc::new(PoolExecutor::new(2)?),
        CacheSettings::default(),
    )?;
    let conn = ConnectionDescriptor::new("test", "orders");

    cache.get_metadata(&conn, false)?;
    assert!(wait_until(|| reflector.calls() == 1));

    thread::scope(|scope| -> TestResult {
        let flush = scope.spawn(|| cache.flush(&conn));
        thread::sleep(Duration::from_millis(20));
        assert!(!flush.is_finished());

        reflector.release();
        flush
            .join()
            .map_err(|_| "flush thread panicked")?
            .map_err(|e| e.to_string())?;
        Ok(())
    })?;

    // The reflection finished before the flush, so nothing survives it
    assert!(store.read(&conn.db_key()?)?.is_empty());
    assert!(!cache.reflecting(&conn)?);
    assert!(cache.get_metadata(&conn, false)?.is_empty());
    cache.wait_idle();
    assert_eq!(reflector.calls(), 2);
    Ok(())
}

#[test]
fn empty_entry_picks_up_store_filled_by_another_cache() -> TestResult {
    let temp = TempDir::new()?;
    let conn = ConnectionDescriptor::sqlite(&create_shop_db(temp.path())?);
    let store_path = temp.path().join("cache").join("metadata.db");

    let offline = MetadataCache::new(
        Arc::new(SchemaStore::open(&store_path)?),
        Arc::new(FlakyReflector {
            failing: AtomicBool::new(true),
        }),
        Arc::new(InlineExecutor),
        CacheSettings::default(),
    )?;
    assert!(offline.get_metadata(&conn, false)?.is_empty());
    assert!(offline.get_metadata(&conn, false)?.is_empty());

    let online = MetadataCache::new(
        Arc::new(SchemaStore::open(&store_path)?),
        Arc::new(SqliteReflector),
        Arc::new(InlineExecutor),
        CacheSettings::default(),
    )?;
    online.get_metadata(&conn, false)?;
    online.shutdown();

    let db = offline.get_metadata(&conn, false)?;
    assert_eq!(db.table_count(), 3);
    assert_eq!(
        db.get_joins("customers", "orders")[0].as_join(),
        "customers inner join orders on customers.id = orders.customer_id"
    );
    Ok(())
}

#[test]
fn concurrent_first_lookups_wait_for_store_read() -> TestResult {
    let temp = TempDir::new()?;
    let conn = ConnectionDescriptor::sqlite(&create_shop_db(temp.path())?);
    let store_path = temp.path().join("metadata.db");

    {
        let cache = MetadataCache::new(
            Arc::new(SchemaStore::open(&store_path)?),
            Arc::new(SqliteReflector),
            Arc::new(InlineExecutor),
            CacheSettings::default(),
        )?;
        cache.get_metadata(&conn, false)?;
        cache.shutdown();
    }

    let reflector = GatedReflector::new();
    reflector.release();
    let cache = MetadataCache::new(
        Arc::new(SchemaStore::open(&store_path)?),
        reflector.clone(),
        Arc::new(PoolExecutor::new(4)?),
        CacheSettings::default(),
    )?;

    let tables: Vec<usize> = thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|_| scope.spawn(|| cache.get_metadata(&conn, false).map(|db| db.table_count())))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().ok().and_then(|r| r.ok()).unwrap_or(0))
            .collect()
    });
    cache.wait_idle();

    // Every caller got the stored snapshot and nobody needed a reflection
    assert!(tables.iter().all(|&n| n == 3));
    assert_eq!(reflector.calls(), 0);
    Ok(())
}
