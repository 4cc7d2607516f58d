//! schemacache: persistent, background-refreshed schema metadata for SQL completion
//!
//! Reflecting a live database schema can take seconds to minutes, so this crate keeps
//! the result in a SQLite-backed store and refreshes it off the caller's thread:
//! - Schema model (tables, fields, foreign keys) with join lookups
//! - Persistent store with upsert-on-conflict writes
//! - Process-wide metadata cache with a staleness policy
//! - Reflection coordinator with single-flight refresh per database

pub mod cache;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod executor;
pub mod model;
pub mod reflect;
pub mod store;
pub mod writer;

// Re-export main types
pub use cache::{CacheSettings, MetadataCache, CACHE_MAX_AGE};
pub use config::Config;
pub use connection::ConnectionDescriptor;
pub use coordinator::ReflectionCoordinator;
pub use executor::{Executor, InlineExecutor, PoolExecutor};
pub use model::{fk_as_join, Database, Field, ForeignKey, Table};
pub use reflect::{
    ReflectError, ReflectedColumn, ReflectedForeignKey, ReflectedTable, Reflector,
    SqliteReflector,
};
pub use store::SchemaStore;

/// Errors that can occur while caching metadata
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Database error: {0}")]
    StoreError(#[from] rusqlite::Error),

    #[error("Reflection failed: {0}")]
    ReflectionError(#[from] ReflectError),

    #[error("Failed to access store file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to start worker pool: {0}")]
    PoolError(#[from] rayon::ThreadPoolBuildError),

    #[error("Metadata writer is not running")]
    WriterUnavailable,
}

pub type Result<T> = std::result::Result<T, CacheError>;
