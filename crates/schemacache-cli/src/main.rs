//! schemacache: inspect, refresh and flush cached database schema metadata.
//!
//! This CLI drives the schemacache library against SQLite databases:
//! - Listing cached tables, fields and join clauses
//! - Forcing a fresh reflection
//! - Reporting what the store holds
//! - Flushing cached metadata

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use schemacache::{Config, ConnectionDescriptor, Database, MetadataCache, SqliteReflector};

/// Exit codes for the CLI
///
/// - 0: Success
/// - 1: Not found (valid query, no results)
/// - 2: Error (invalid input, missing file, etc.)
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const NOT_FOUND: u8 = 1;
    pub const ERROR: u8 = 2;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
    Text,
}

/// Cached database schema metadata for SQL completion
#[derive(Parser)]
#[command(name = "schemacache")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file to inspect
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Metadata store file (overrides config)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List tables
    Tables,

    /// List field names
    Fields {
        /// Only fields of this table
        #[arg(long)]
        table: Option<String>,

        /// Qualify names with their table ("orders.id")
        #[arg(long)]
        dotted: bool,
    },

    /// Show join clauses for a table
    Joins {
        /// Table to find joins for
        table: String,

        /// Only joins to this table
        #[arg(long)]
        with: Option<String>,
    },

    /// Reflect the database now and store the result
    Refresh,

    /// Show what the store holds
    Status,

    /// Delete cached metadata
    Flush {
        /// Flush every database, not just --db
        #[arg(long)]
        all: bool,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = cli.format;

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            if format == OutputFormat::Json {
                let error_json = serde_json::json!({
                    "error": "CommandFailed",
                    "message": format!("{:#}", e),
                });
                eprintln!("{}", error_json);
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let cache = open_cache(cli.store.as_deref())?;
    let db = cli.db.as_deref();
    let (format, quiet) = (cli.format, cli.quiet);

    let result = match cli.command {
        Commands::Tables => cmd_tables(&cache, db, format, quiet),
        Commands::Fields { table, dotted } => {
            cmd_fields(&cache, db, table.as_deref(), dotted, format, quiet)
        }
        Commands::Joins { table, with } => {
            cmd_joins(&cache, db, &table, with.as_deref(), format, quiet)
        }
        Commands::Refresh => cmd_refresh(&cache, db, format, quiet),
        Commands::Status => cmd_status(&cache, db, format, quiet),
        Commands::Flush { all } => cmd_flush(&cache, db, all, format, quiet),
    };

    cache.shutdown();
    result
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_tables(
    cache: &MetadataCache,
    db: Option<&Path>,
    format: OutputFormat,
    quiet: bool,
) -> Result<u8> {
    let conn = descriptor(db, true)?;
    let metadata = load_metadata(cache, &conn, false)?;
    let tables: Vec<&str> = metadata.tables().collect();

    if format != OutputFormat::Text {
        print_json(&serde_json::json!({ "tables": tables }), format);
    } else if !quiet {
        for table in &tables {
            println!("{}", table);
        }
    }
    Ok(exit_codes::SUCCESS)
}

fn cmd_fields(
    cache: &MetadataCache,
    db: Option<&Path>,
    table: Option<&str>,
    dotted: bool,
    format: OutputFormat,
    quiet: bool,
) -> Result<u8> {
    let conn = descriptor(db, true)?;
    let metadata = load_metadata(cache, &conn, false)?;

    if let Some(name) = table {
        if metadata.table(name).is_none() {
            return Ok(table_not_found(name, format));
        }
    }

    let fields = if dotted {
        metadata.get_dotted_fields(table)
    } else {
        metadata.get_fields(table)
    };

    if format != OutputFormat::Text {
        if dotted {
            let typed: Vec<_> = fields
                .iter()
                .map(|f| serde_json::json!({ "field": f, "type": metadata.type_of(f) }))
                .collect();
            print_json(&serde_json::json!({ "fields": typed }), format);
        } else {
            print_json(&serde_json::json!({ "fields": fields }), format);
        }
    } else if !quiet {
        for field in &fields {
            match metadata.type_of(field) {
                Some(type_name) if dotted => println!("{} {}", field, type_name),
                _ => println!("{}", field),
            }
        }
    }
    Ok(exit_codes::SUCCESS)
}

fn cmd_joins(
    cache: &MetadataCache,
    db: Option<&Path>,
    table: &str,
    with: Option<&str>,
    format: OutputFormat,
    quiet: bool,
) -> Result<u8> {
    let conn = descriptor(db, true)?;
    let metadata = load_metadata(cache, &conn, false)?;

    for name in std::iter::once(table).chain(with) {
        if metadata.table(name).is_none() {
            return Ok(table_not_found(name, format));
        }
    }

    let joins = match with {
        Some(other) => metadata.get_joins(table, other),
        None => metadata.get_all_joins(table),
    };

    if joins.is_empty() {
        if format != OutputFormat::Text {
            print_json(
                &serde_json::json!({ "error": "No joins found", "table": table, "with": with }),
                format,
            );
        } else {
            eprintln!("No joins found for {}", table);
        }
        return Ok(exit_codes::NOT_FOUND);
    }

    if format != OutputFormat::Text {
        let list: Vec<_> = joins
            .iter()
            .map(|fk| serde_json::json!({ "join": fk.as_join(), "foreign_key": fk }))
            .collect();
        print_json(&serde_json::json!({ "joins": list }), format);
    } else if !quiet {
        for fk in joins {
            println!("{}", fk.as_join());
        }
    }
    Ok(exit_codes::SUCCESS)
}

fn cmd_refresh(
    cache: &MetadataCache,
    db: Option<&Path>,
    format: OutputFormat,
    quiet: bool,
) -> Result<u8> {
    let conn = descriptor(db, true)?;
    let metadata = load_metadata(cache, &conn, true)?;

    if format != OutputFormat::Text {
        print_json(&summary(&conn, &metadata), format);
    } else if !quiet {
        println!(
            "Reflected {} tables from {}",
            metadata.table_count(),
            conn
        );
    }
    Ok(exit_codes::SUCCESS)
}

fn cmd_status(
    cache: &MetadataCache,
    db: Option<&Path>,
    format: OutputFormat,
    quiet: bool,
) -> Result<u8> {
    let store = cache.store();

    let Some(path) = db else {
        let counts = store
            .db_keys()
            .and_then(|keys| {
                keys.into_iter()
                    .map(|key| -> schemacache::Result<(String, usize)> {
                        let tables = store.table_count(&key)?;
                        Ok((key, tables))
                    })
                    .collect::<schemacache::Result<Vec<_>>>()
            })
            .context("Failed to read store")?;

        if format != OutputFormat::Text {
            let databases: Vec<_> = counts
                .iter()
                .map(|(key, tables)| serde_json::json!({ "db_key": key, "tables": tables }))
                .collect();
            print_json(
                &serde_json::json!({
                    "store": store.path().map(|p| p.display().to_string()),
                    "databases": databases,
                }),
                format,
            );
        } else if !quiet {
            if let Some(path) = store.path() {
                println!("Store: {}", path.display());
            }
            println!("Cached databases: {}", counts.len());
            for (key, tables) in &counts {
                println!("  {} ({} tables)", key, tables);
            }
        }
        return Ok(exit_codes::SUCCESS);
    };

    let conn = descriptor(Some(path), false)?;
    let stored = store
        .read(&conn.db_key()?)
        .context("Failed to read store")?;

    if stored.is_empty() {
        if format != OutputFormat::Text {
            print_json(
                &serde_json::json!({ "error": "Not cached", "database": conn.to_string() }),
                format,
            );
        } else {
            eprintln!("No cached metadata for {}", conn);
        }
        return Ok(exit_codes::NOT_FOUND);
    }

    let stale = stored.is_stale(Utc::now(), cache.max_age());
    if format != OutputFormat::Text {
        let mut json = summary(&conn, &stored);
        json["stale"] = serde_json::json!(stale);
        print_json(&json, format);
    } else if !quiet {
        println!("Database: {}", conn);
        println!("  Key: {}", stored.db_key());
        println!("  Tables: {}", stored.table_count());
        println!("  Foreign keys: {}", stored.foreign_keys().len());
        if let Some(age) = stored.age(Utc::now()) {
            println!(
                "  Reflected: {}s ago{}",
                age.num_seconds(),
                if stale { " (stale)" } else { "" }
            );
        }
    }
    Ok(exit_codes::SUCCESS)
}

fn cmd_flush(
    cache: &MetadataCache,
    db: Option<&Path>,
    all: bool,
    format: OutputFormat,
    quiet: bool,
) -> Result<u8> {
    let flushed = if all {
        cache.flush_all().context("Failed to flush store")?;
        "all".to_string()
    } else {
        let conn = descriptor(db, false)?;
        cache.flush(&conn).context("Failed to flush store")?;
        conn.to_string()
    };

    if format != OutputFormat::Text {
        print_json(&serde_json::json!({ "flushed": flushed }), format);
    } else if !quiet {
        println!("Flushed cached metadata for {}", flushed);
    }
    Ok(exit_codes::SUCCESS)
}

// ============================================================================
// Helpers
// ============================================================================

fn open_cache(store: Option<&Path>) -> Result<MetadataCache> {
    let cwd = std::env::current_dir().context("Failed to resolve working directory")?;
    let mut config = Config::load(&cwd);
    if let Some(store) = store {
        config.store_path = Some(store.to_path_buf());
    }

    MetadataCache::from_config(&config, Arc::new(SqliteReflector)).with_context(|| {
        format!(
            "Failed to open metadata store at {}",
            config.resolve_store_path().display()
        )
    })
}

/// Descriptor for `--db`. The path is canonicalized so the cache key does not
/// depend on the working directory; `must_exist` rejects missing files.
fn descriptor(db: Option<&Path>, must_exist: bool) -> Result<ConnectionDescriptor> {
    let db = db.context("No database given, pass --db <path>")?;
    let path = match db.canonicalize() {
        Ok(path) => path,
        Err(_) if !must_exist => canonical_missing(db),
        Err(e) => {
            return Err(e).with_context(|| format!("Database not found: {}", db.display()));
        }
    };
    Ok(ConnectionDescriptor::sqlite(&path))
}

/// Canonical form of a file that no longer exists: its directory resolved,
/// the file name kept.
fn canonical_missing(db: &Path) -> PathBuf {
    let parent = match db.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    match (parent.canonicalize(), db.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => db.to_path_buf(),
    }
}

/// Cached metadata, waiting for the reflection a one-shot command would
/// otherwise exit before seeing.
fn load_metadata(
    cache: &MetadataCache,
    conn: &ConnectionDescriptor,
    force: bool,
) -> Result<Arc<Database>> {
    let previous = cache.get_metadata(conn, force)?;
    if !force && !previous.is_empty() {
        return Ok(previous);
    }

    tracing::debug!("Waiting for reflection of {}", conn);
    cache.wait_idle();

    let metadata = cache.peek(conn)?.unwrap_or_else(|| Arc::clone(&previous));
    // A failed reflection leaves the previous snapshot in place
    if metadata.is_empty() || (force && Arc::ptr_eq(&metadata, &previous)) {
        anyhow::bail!("Failed to reflect {}", conn);
    }
    Ok(metadata)
}

fn summary(conn: &ConnectionDescriptor, metadata: &Database) -> serde_json::Value {
    serde_json::json!({
        "database": conn.to_string(),
        "db_key": metadata.db_key(),
        "tables": metadata.table_count(),
        "foreign_keys": metadata.foreign_keys().len(),
        "created": metadata.created().map(|c| c.to_rfc3339()),
    })
}

fn table_not_found(table: &str, format: OutputFormat) -> u8 {
    if format != OutputFormat::Text {
        print_json(
            &serde_json::json!({ "error": "Table not found", "table": table }),
            format,
        );
    } else {
        eprintln!("Table not found: {}", table);
    }
    exit_codes::NOT_FOUND
}

fn print_json(value: &serde_json::Value, format: OutputFormat) {
    if format == OutputFormat::Pretty {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        );
    } else {
        println!("{}", value);
    }
}
