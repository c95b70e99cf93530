//! Idempotent schema migrations.
//!
//! Every statement is `IF NOT EXISTS`, so running migrations on an
//! existing database is a no-op.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One manifest row per indexed source.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            name TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            origin TEXT NOT NULL,
            unit_count INTEGER NOT NULL,
            chunk_count INTEGER NOT NULL,
            volume INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Pages or files of each source.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS units (
            source_name TEXT NOT NULL,
            unit_index INTEGER NOT NULL,
            unit_ref TEXT NOT NULL,
            title TEXT NOT NULL,
            word_count INTEGER NOT NULL,
            line_count INTEGER NOT NULL,
            PRIMARY KEY (source_name, unit_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            source_name TEXT NOT NULL,
            unit_index INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            word_count INTEGER NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            UNIQUE (source_name, unit_index, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Single-row table describing the whole index.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            embedding_model TEXT,
            embedding_dims INTEGER,
            chunk_size INTEGER,
            chunk_overlap INTEGER,
            last_updated INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_units_source ON units(source_name)")
        .execute(pool)
        .await?;

    Ok(())
}
