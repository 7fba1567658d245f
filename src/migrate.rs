//! Schema creation and in-place upgrades.
//!
//! [`ensure_schema`] runs at every open. It creates the base (version 1)
//! tables if they are missing, reads the stored version from `meta`
//! (absent means 1), and applies each pending upgrade inside a transaction
//! that writes the new version last. Running it again at the current
//! version is a no-op, and no upgrade drops primary data: the full-text
//! index is rebuilt from `chunks`, never the other way around.

use anyhow::{Context, Result};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: i64 = 2;

const VERSION_KEY: &str = "schema_version";

pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    create_base_schema(pool).await?;

    let version = schema_version(pool).await?;
    if version < 2 {
        migrate_to_v2(pool)
            .await
            .context("Schema migration to version 2 failed")?;
        info!(from = version, to = 2, "schema migrated");
    }
    Ok(())
}

/// Stored schema version; databases without one are version 1.
pub async fn schema_version(pool: &SqlitePool) -> Result<i64> {
    let value = get_meta(pool, VERSION_KEY).await?;
    Ok(value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(1))
}

pub(crate) async fn get_meta(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub(crate) async fn set_meta(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO meta (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Version 1 layout. Safe to run against any later version.
pub(crate) async fn create_base_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'docs',
            chunk_index INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 1,
            start_line INTEGER NOT NULL DEFAULT 0,
            end_line INTEGER NOT NULL DEFAULT 0,
            heading_context TEXT,
            hash TEXT NOT NULL,
            model TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is checked explicitly so the v1 shape is only created on
    // databases that have no index yet.
    if !table_exists(pool, "chunks_fts").await? {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                text,
                id UNINDEXED,
                path UNINDEXED,
                model UNINDEXED,
                start_line UNINDEXED,
                end_line UNINDEXED
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_model ON chunks(model)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Version 2: memory columns, area-aware FTS, consolidation log.
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;

    let existing: Vec<String> = sqlx::query("SELECT name FROM pragma_table_info('chunks')")
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();

    let columns = [
        ("area", "TEXT NOT NULL DEFAULT 'main'"),
        ("importance", "REAL NOT NULL DEFAULT 0.5"),
        ("consolidated_from", "TEXT DEFAULT NULL"),
    ];
    for (name, decl) in columns {
        if !existing.iter().any(|c| c == name) {
            sqlx::query(&format!("ALTER TABLE chunks ADD COLUMN {} {}", name, decl))
                .execute(&mut *tx)
                .await?;
        }
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_area ON chunks(area)")
        .execute(&mut *tx)
        .await?;

    sqlx::query("DROP TABLE IF EXISTS chunks_fts")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE chunks_fts USING fts5(
            text,
            id UNINDEXED,
            path UNINDEXED,
            model UNINDEXED,
            area UNINDEXED,
            start_line UNINDEXED,
            end_line UNINDEXED
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    let reindexed = sqlx::query(
        r#"
        INSERT INTO chunks_fts (text, id, path, model, area, start_line, end_line)
        SELECT text, id, path, model, area, start_line, end_line FROM chunks
        "#,
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS consolidation_log (
            id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            action TEXT NOT NULL,
            source_ids TEXT NOT NULL DEFAULT '[]',
            result_id TEXT,
            area TEXT NOT NULL,
            model TEXT NOT NULL,
            reasoning TEXT,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_consolidation_log_area ON consolidation_log(area, timestamp DESC)",
    )
    .execute(&mut *tx)
    .await?;

    set_meta(&mut tx, VERSION_KEY, "2").await?;
    tx.commit().await?;

    info!(rows = reindexed, "full-text index rebuilt");
    Ok(())
}

async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?")
            .bind(name)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}
