//! Single writer thread that serializes all store writes.
//!
//! Reflection jobs run concurrently but never touch the store directly; they
//! queue [`WriteRequest`]s on a bounded channel drained by one named thread.
//! [`WriteRequest::Shutdown`] is the stop sentinel: everything queued before it
//! is written first.
//!
//! A store error kills the writer. It is logged once, pending acknowledgements
//! fail, and later submissions are dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::model::Table;
use crate::store::SchemaStore;
use crate::{CacheError, Result};

/// Default bound on queued write requests
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// A request to the writer thread
pub enum WriteRequest {
    /// Upsert one table
    Table { db_key: String, table: Table },
    /// Prune tables not in `keep`, stamp the rest with `completed_at`, then
    /// acknowledge on `ack`
    Finish {
        db_key: String,
        keep: Vec<String>,
        completed_at: DateTime<Utc>,
        ack: mpsc::Sender<Result<()>>,
    },
    /// Stop after handling every earlier request
    Shutdown,
}

/// Handle to the writer thread
pub struct MetadataWriter {
    sender: SyncSender<WriteRequest>,
    alive: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MetadataWriter {
    /// Start the writer thread with a queue of `capacity` requests.
    pub fn spawn(store: Arc<SchemaStore>, capacity: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let alive = Arc::new(AtomicBool::new(true));

        let thread_alive = Arc::clone(&alive);
        let handle = thread::Builder::new()
            .name("schemacache-writer".to_string())
            .spawn(move || {
                run(&store, receiver);
                thread_alive.store(false, Ordering::SeqCst);
            })?;

        Ok(Self {
            sender,
            alive,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queue a request, blocking while the queue is full.
    ///
    /// Returns false if the writer has stopped; the request is dropped.
    pub fn submit(&self, request: WriteRequest) -> bool {
        if !self.is_alive() {
            return false;
        }
        match self.sender.send(request) {
            Ok(()) => true,
            Err(_) => {
                debug!("Metadata writer has stopped, dropping write request");
                false
            }
        }
    }

    pub fn write_table(&self, db_key: &str, table: Table) -> bool {
        self.submit(WriteRequest::Table {
            db_key: db_key.to_string(),
            table,
        })
    }

    /// Queue a finish request and wait until it (and every earlier write) is durable.
    pub fn finish(&self, db_key: &str, keep: Vec<String>, completed_at: DateTime<Utc>) -> Result<()> {
        let (ack, done) = mpsc::channel();
        let queued = self.submit(WriteRequest::Finish {
            db_key: db_key.to_string(),
            keep,
            completed_at,
            ack,
        });
        if !queued {
            return Err(CacheError::WriterUnavailable);
        }
        // A dropped ack means the writer died before reaching our request
        done.recv().map_err(|_| CacheError::WriterUnavailable)?
    }

    /// Send the sentinel and join the thread. Safe to call more than once.
    pub fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.sender.send(WriteRequest::Shutdown);
        if handle.join().is_err() {
            error!("Metadata writer thread panicked");
        }
    }
}

impl Drop for MetadataWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(store: &SchemaStore, receiver: Receiver<WriteRequest>) {
    debug!("Metadata writer started");

    for request in receiver.iter() {
        match request {
            WriteRequest::Table { db_key, table } => {
                if let Err(e) = store.write_table(&db_key, &table) {
                    error!(table = table.name(), "Metadata writer failed, stopping: {}", e);
                    return;
                }
            }
            WriteRequest::Finish {
                db_key,
                keep,
                completed_at,
                ack,
            } => match store.finish_reflection(&db_key, &keep, completed_at) {
                Ok(pruned) => {
                    if pruned > 0 {
                        debug!("Pruned {} dropped tables", pruned);
                    }
                    let _ = ack.send(Ok(()));
                }
                Err(e) => {
                    error!("Metadata writer failed, stopping: {}", e);
                    let _ = ack.send(Err(e));
                    return;
                }
            },
            WriteRequest::Shutdown => break,
        }
    }

    debug!("Metadata writer stopped");
}
