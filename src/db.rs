//! Database connection.
//!
//! Opens the SQLite file (WAL mode, created if missing) and, when a vector
//! extension is configured, tries to load it on every pooled connection.
//! If the extension cannot be loaded or does not answer `vec_version()`,
//! the pool is reopened without it and the store runs on the brute-force
//! vector backend instead. A missing extension is never an error.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use crate::config::DbConfig;

/// An open database and the vector capability detected at open time.
#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
    /// True when the native `vec0` extension loaded and answered.
    pub native_vectors: bool,
}

pub async fn connect(config: &DbConfig) -> Result<Database> {
    let db_path = &config.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    if !config.vector_extension.is_empty() {
        let with_ext = options.clone().extension(config.vector_extension.clone());
        match open_pool(with_ext).await {
            Ok(pool) => {
                if probe_vec(&pool).await {
                    debug!(extension = %config.vector_extension, "native vector extension loaded");
                    return Ok(Database {
                        pool,
                        native_vectors: true,
                    });
                }
                warn!(
                    extension = %config.vector_extension,
                    "vector extension loaded but vec_version() failed; using brute-force vector search"
                );
                pool.close().await;
            }
            Err(e) => {
                warn!(
                    extension = %config.vector_extension,
                    error = %e,
                    "vector extension unavailable; using brute-force vector search"
                );
            }
        }
    }

    let pool = open_pool(options)
        .await
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
    Ok(Database {
        pool,
        native_vectors: false,
    })
}

async fn open_pool(options: SqliteConnectOptions) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn probe_vec(pool: &SqlitePool) -> bool {
    sqlx::query_scalar::<_, String>("SELECT vec_version()")
        .fetch_one(pool)
        .await
        .is_ok()
}
