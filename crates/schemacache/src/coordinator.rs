//! Background reflection: runs the reflector off the caller's thread, persists
//! the result through the writer and publishes the fresh snapshot.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cache::CacheEntry;
use crate::connection::ConnectionDescriptor;
use crate::executor::Executor;
use crate::model::{Database, Table};
use crate::reflect::Reflector;
use crate::store::SchemaStore;
use crate::writer::MetadataWriter;
use crate::Result;

/// Owns the reflector, the job executor and the single store writer.
pub struct ReflectionCoordinator {
    reflector: Arc<dyn Reflector>,
    store: Arc<SchemaStore>,
    writer: MetadataWriter,
    executor: Arc<dyn Executor>,
    /// Whether new jobs may be scheduled. Held for reading while a job is handed
    /// to the executor, so `pause` returns only once no submission is in progress.
    accepting: RwLock<bool>,
}

/// Clears the entry's reflecting flag when the job ends, however it ends.
struct ReflectingGuard(Arc<CacheEntry>);

impl Drop for ReflectingGuard {
    fn drop(&mut self) {
        self.0.finish_reflecting();
    }
}

impl ReflectionCoordinator {
    pub fn new(
        reflector: Arc<dyn Reflector>,
        store: Arc<SchemaStore>,
        executor: Arc<dyn Executor>,
        queue_capacity: usize,
    ) -> Result<Self> {
        let writer = MetadataWriter::spawn(Arc::clone(&store), queue_capacity)?;
        Ok(Self {
            reflector,
            store,
            writer,
            executor,
            accepting: RwLock::new(true),
        })
    }

    /// Schedule a background reflection that publishes into `entry`.
    ///
    /// The caller must already own the entry's reflecting flag. Returns false
    /// (and leaves the flag to the caller) if jobs are not being accepted.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        entry: Arc<CacheEntry>,
        db_key: String,
        conn: ConnectionDescriptor,
    ) -> bool {
        let accepting = self.accepting.read();
        if !*accepting {
            return false;
        }

        let coordinator = Arc::clone(self);
        self.executor.execute(Box::new(move || {
            let guard = ReflectingGuard(entry);
            match coordinator.reflect(&db_key, &conn) {
                Ok(db) => {
                    if !guard.0.publish(Arc::new(db)) {
                        debug!("Discarded reflection of {} older than cached snapshot", conn);
                    }
                }
                Err(e) => warn!("Reflection of {} failed, keeping cached metadata: {}", conn, e),
            }
        }));
        true
    }

    /// Reflect `conn`, persist the result and return the new snapshot.
    ///
    /// If the writer is unavailable the snapshot is built from the reflected
    /// tables directly and nothing is persisted.
    pub fn reflect(&self, db_key: &str, conn: &ConnectionDescriptor) -> Result<Database> {
        let start = Instant::now();
        let reflected = self.reflector.reflect(conn)?;

        let tables: Vec<Table> = reflected.into_par_iter().map(Table::from).collect();
        let keep: Vec<String> = tables.iter().map(|t| t.name().to_string()).collect();
        let completed_at = Utc::now();

        let mut persisted = tables
            .iter()
            .all(|table| self.writer.write_table(db_key, table.clone()));
        if persisted {
            if let Err(e) = self.writer.finish(db_key, keep, completed_at) {
                warn!("Could not persist metadata for {}: {}", conn, e);
                persisted = false;
            }
        }

        let db = if persisted {
            let db = self.store.read(db_key)?;
            match db.created() {
                Some(_) => db,
                // Nothing stored (no tables), but the reflection did complete
                None => db.with_created(Some(completed_at)),
            }
        } else {
            Database::from_tables(db_key, tables, Some(completed_at))
        };

        info!(
            tables = db.table_count(),
            persisted,
            "Reflected {} in {:.2}s",
            conn,
            start.elapsed().as_secs_f64()
        );
        Ok(db)
    }

    /// Stop accepting jobs. Waits for any submission in progress.
    pub fn pause(&self) {
        *self.accepting.write() = false;
    }

    pub fn resume(&self) {
        *self.accepting.write() = true;
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.read()
    }

    /// Block until every scheduled job has finished.
    pub fn drain(&self) {
        self.executor.wait_idle();
    }

    pub fn writer_alive(&self) -> bool {
        self.writer.is_alive()
    }

    /// Stop accepting jobs, finish in-flight ones and stop the writer.
    pub fn shutdown(&self) {
        self.pause();
        self.drain();
        self.writer.shutdown();
        debug!("Reflection coordinator stopped");
    }
}
