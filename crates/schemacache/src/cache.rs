//! Process-wide metadata cache.
//!
//! [`MetadataCache::get_metadata`] never blocks on reflection. It returns the
//! newest snapshot it has (possibly empty) and, when that snapshot is missing
//! or older than `max_age`, schedules at most one background refresh per
//! database. Snapshots are immutable `Arc<Database>` values swapped wholesale,
//! so a caller keeps a consistent view for as long as it holds one.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use schemacache::{
//!     CacheSettings, ConnectionDescriptor, InlineExecutor, MetadataCache, SchemaStore,
//!     SqliteReflector,
//! };
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("app.db");
//! rusqlite::Connection::open(&path)
//!     .unwrap()
//!     .execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT);")
//!     .unwrap();
//!
//! let cache = MetadataCache::new(
//!     Arc::new(SchemaStore::in_memory().unwrap()),
//!     Arc::new(SqliteReflector),
//!     Arc::new(InlineExecutor),
//!     CacheSettings::default(),
//! )
//! .unwrap();
//!
//! let conn = ConnectionDescriptor::sqlite(&path);
//! // First call schedules the reflection and returns what was cached before it
//! assert!(cache.get_metadata(&conn, false).unwrap().is_empty());
//! let db = cache.get_metadata(&conn, false).unwrap();
//! assert_eq!(db.get_fields(Some("users")), vec!["id", "email"]);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::ConnectionDescriptor;
use crate::coordinator::ReflectionCoordinator;
use crate::executor::{Executor, PoolExecutor};
use crate::model::Database;
use crate::reflect::Reflector;
use crate::store::SchemaStore;
use crate::writer::DEFAULT_QUEUE_CAPACITY;
use crate::Result;

/// Snapshots older than this are refreshed in the background
pub const CACHE_MAX_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_age: Duration,
    pub write_queue_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_age: CACHE_MAX_AGE,
            write_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Per-database cache slot
pub(crate) struct CacheEntry {
    snapshot: RwLock<Arc<Database>>,
    reflecting: AtomicBool,
    /// Serializes store reads while the snapshot is empty
    loading: Mutex<()>,
}

impl CacheEntry {
    pub(crate) fn new(db_key: &str) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Database::new(db_key))),
            reflecting: AtomicBool::new(false),
            loading: Mutex::new(()),
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<Database> {
        Arc::clone(&self.snapshot.read())
    }

    /// Install a reflected snapshot unless the current one is newer.
    pub(crate) fn publish(&self, db: Arc<Database>) -> bool {
        let mut current = self.snapshot.write();
        if let (Some(cur), Some(new)) = (current.created(), db.created()) {
            if new < cur {
                return false;
            }
        }
        *current = db;
        true
    }

    /// Install a snapshot read from the store, only if nothing was published meanwhile.
    fn publish_loaded(&self, db: Arc<Database>) {
        let mut current = self.snapshot.write();
        if current.is_empty() {
            *current = db;
        }
    }

    /// Fill an empty snapshot from the store. Callers arriving during the
    /// read wait for it instead of seeing the entry as empty.
    fn load_from(&self, store: &SchemaStore, db_key: &str) -> Result<()> {
        if !self.snapshot().is_empty() {
            return Ok(());
        }
        let _loading = self.loading.lock();
        if !self.snapshot().is_empty() {
            return Ok(());
        }

        let stored = store.read(db_key)?;
        if !stored.is_empty() {
            debug!(tables = stored.table_count(), "Loaded cached metadata for {}", db_key);
            self.publish_loaded(Arc::new(stored));
        }
        Ok(())
    }

    pub(crate) fn try_start_reflecting(&self) -> bool {
        self.reflecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_reflecting(&self) {
        self.reflecting.store(false, Ordering::Release);
    }

    pub(crate) fn is_reflecting(&self) -> bool {
        self.reflecting.load(Ordering::Acquire)
    }
}

/// Resumes the coordinator when dropped
struct Paused<'a>(&'a ReflectionCoordinator);

impl Drop for Paused<'_> {
    fn drop(&mut self) {
        self.0.resume();
    }
}

/// Cache of schema snapshots keyed by database identity.
pub struct MetadataCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    store: Arc<SchemaStore>,
    coordinator: Arc<ReflectionCoordinator>,
    max_age: TimeDelta,
}

impl MetadataCache {
    pub fn new(
        store: Arc<SchemaStore>,
        reflector: Arc<dyn Reflector>,
        executor: Arc<dyn Executor>,
        settings: CacheSettings,
    ) -> Result<Self> {
        let coordinator = ReflectionCoordinator::new(
            reflector,
            Arc::clone(&store),
            executor,
            settings.write_queue_capacity,
        )?;
        Ok(Self {
            entries: DashMap::new(),
            store,
            coordinator: Arc::new(coordinator),
            max_age: TimeDelta::from_std(settings.max_age).unwrap_or(TimeDelta::MAX),
        })
    }

    /// Build a cache with an on-disk store and a thread pool as configured.
    pub fn from_config(config: &Config, reflector: Arc<dyn Reflector>) -> Result<Self> {
        let store = Arc::new(SchemaStore::open(&config.resolve_store_path())?);
        let executor = Arc::new(PoolExecutor::new(config.worker_threads)?);
        Self::new(store, reflector, executor, config.cache_settings())
    }

    pub fn store(&self) -> &SchemaStore {
        &self.store
    }

    pub fn max_age(&self) -> TimeDelta {
        self.max_age
    }

    fn entry(&self, db_key: &str) -> Arc<CacheEntry> {
        Arc::clone(
            &*self
                .entries
                .entry(db_key.to_string())
                .or_insert_with(|| Arc::new(CacheEntry::new(db_key))),
        )
    }

    /// Current snapshot for `conn`, scheduling a background refresh when it is
    /// missing, stale, or `force` is set.
    ///
    /// Returns immediately with the snapshot as it was before any refresh this
    /// call schedules. Fails only for an invalid descriptor or an unreadable store.
    pub fn get_metadata(&self, conn: &ConnectionDescriptor, force: bool) -> Result<Arc<Database>> {
        let db_key = conn.db_key()?;
        let entry = self.entry(&db_key);

        entry.load_from(&self.store, &db_key)?;

        let snapshot = entry.snapshot();
        let stale = snapshot.is_stale(Utc::now(), self.max_age);

        if (force || stale) && entry.try_start_reflecting() {
            debug!(force, stale, "Scheduling reflection of {}", conn);
            if !self
                .coordinator
                .spawn(Arc::clone(&entry), db_key, conn.clone())
            {
                entry.finish_reflecting();
                debug!("Reflection of {} not scheduled, cache is paused", conn);
            }
        }

        Ok(snapshot)
    }

    /// The snapshot held in memory for `conn`, without consulting the store or
    /// scheduling a refresh.
    pub fn peek(&self, conn: &ConnectionDescriptor) -> Result<Option<Arc<Database>>> {
        let db_key = conn.db_key()?;
        Ok(self.entries.get(&db_key).map(|entry| entry.snapshot()))
    }

    /// Whether a reflection of `conn` is in flight
    pub fn reflecting(&self, conn: &ConnectionDescriptor) -> Result<bool> {
        let db_key = conn.db_key()?;
        Ok(self
            .entries
            .get(&db_key)
            .map(|entry| entry.is_reflecting())
            .unwrap_or(false))
    }

    /// Forget everything cached for `conn`, in memory and on disk.
    pub fn flush(&self, conn: &ConnectionDescriptor) -> Result<()> {
        let db_key = conn.db_key()?;
        let _paused = self.pause_and_drain();

        self.entries.remove(&db_key);
        self.store.delete_schema(Some(&db_key))?;
        self.store.create_schema()?;

        info!("Flushed cached metadata for {}", conn);
        Ok(())
    }

    /// Forget everything cached for every database.
    pub fn flush_all(&self) -> Result<()> {
        let _paused = self.pause_and_drain();

        self.entries.clear();
        self.store.delete_schema(None)?;
        self.store.create_schema()?;

        info!("Flushed all cached metadata");
        Ok(())
    }

    fn pause_and_drain(&self) -> Paused<'_> {
        self.coordinator.pause();
        let paused = Paused(&self.coordinator);
        self.coordinator.drain();
        paused
    }

    /// Block until no reflection is in flight.
    pub fn wait_idle(&self) {
        self.coordinator.drain();
    }

    /// Stop background work; later refreshes are not scheduled.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}
