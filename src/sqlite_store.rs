//! SQLite implementation of [`IndexStore`].
//!
//! Each source write is a single transaction: old rows for the name are
//! deleted, then chunks, units, the manifest row and `index_meta` are
//! written, and the transaction commits. A failure at any point drops
//! the transaction, which rolls it back, so readers see either the old
//! source or the new one. Writers are additionally serialized inside the
//! process so SQLite never has to arbitrate between them.
//!
//! Vector search loads every candidate vector and scores it with cosine
//! similarity in Rust.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use docdex_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use docdex_core::models::{
    ChunkSummary, EmbeddingStamp, IndexMeta, Manifest, Source, SourceKind, UnitLocator, UnitPage,
};
use docdex_core::store::{
    check_chunking_compat, check_embedding_compat, check_query_dims, rank_candidates,
    ChunkCandidate, IndexStore, ReconcileReport, StagedSource,
};
use docdex_core::IndexError;

use crate::db;
use crate::migrate;

pub struct SqliteStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// Open the database at `path`, creating and migrating it if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        debug!(path = %path.display(), "opened index database");
        Ok(Self::from_pool(pool))
    }

    /// Wrap an already migrated pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    let kind_str: String = row.get("kind");
    let kind = SourceKind::parse(&kind_str).ok_or_else(|| {
        IndexError::StoreCorruption(format!("unknown source type '{}'", kind_str))
    })?;
    Ok(Source::new(
        row.get::<String, _>("name"),
        kind,
        row.get::<String, _>("origin"),
        row.get::<i64, _>("unit_count") as u64,
        row.get::<i64, _>("volume") as u64,
        row.get::<i64, _>("chunk_count") as u64,
        ts_to_datetime(row.get("indexed_at")),
    ))
}

async fn read_meta(conn: &mut SqliteConnection) -> Result<IndexMeta> {
    let row = sqlx::query(
        "SELECT embedding_model, embedding_dims, chunk_size, chunk_overlap, last_updated \
         FROM index_meta WHERE id = 1",
    )
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(IndexMeta::default());
    };
    let model: Option<String> = row.get("embedding_model");
    let dims: Option<i64> = row.get("embedding_dims");
    Ok(IndexMeta {
        embedding: match (model, dims) {
            (Some(model), Some(dims)) => Some(EmbeddingStamp {
                model,
                dims: dims as usize,
            }),
            _ => None,
        },
        chunk_size: row.get::<Option<i64>, _>("chunk_size").map(|v| v as usize),
        chunk_overlap: row
            .get::<Option<i64>, _>("chunk_overlap")
            .map(|v| v as usize),
        last_updated: row.get::<Option<i64>, _>("last_updated").map(ts_to_datetime),
    })
}

async fn touch_meta(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("UPDATE index_meta SET last_updated = ? WHERE id = 1")
        .bind(Utc::now().timestamp())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn delete_rows(conn: &mut SqliteConnection, name: &str) -> Result<u64> {
    let removed = sqlx::query("DELETE FROM chunks WHERE source_name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM units WHERE source_name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM sources WHERE name = ?")
        .bind(name)
        .execute(&mut *conn)
        .await?;
    Ok(removed)
}

/// Stored counts next to the counts recomputed from unit and chunk rows.
struct SourceTally {
    source: Source,
    actual_units: u64,
    actual_volume: u64,
    actual_chunks: u64,
}

impl SourceTally {
    fn is_consistent(&self) -> bool {
        self.source.unit_count() == self.actual_units
            && self.source.volume() == self.actual_volume
            && self.source.chunks == self.actual_chunks
    }
}

async fn tally_sources(conn: &mut SqliteConnection) -> Result<Vec<SourceTally>> {
    let rows = sqlx::query(
        r#"
        SELECT s.name, s.kind, s.origin, s.unit_count, s.chunk_count, s.volume, s.indexed_at,
               (SELECT COUNT(*) FROM units u WHERE u.source_name = s.name) AS actual_units,
               (SELECT COALESCE(SUM(CASE WHEN s.kind = 'documentation'
                                         THEN u.word_count ELSE u.line_count END), 0)
                  FROM units u WHERE u.source_name = s.name) AS actual_volume,
               (SELECT COUNT(*) FROM chunks c WHERE c.source_name = s.name) AS actual_chunks
        FROM sources s
        ORDER BY s.name
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(SourceTally {
                source: source_from_row(row)?,
                actual_units: row.get::<i64, _>("actual_units") as u64,
                actual_volume: row.get::<i64, _>("actual_volume") as u64,
                actual_chunks: row.get::<i64, _>("actual_chunks") as u64,
            })
        })
        .collect()
}

const ORPHAN_UNITS: &str = "FROM units WHERE source_name NOT IN (SELECT name FROM sources)";
const ORPHAN_CHUNKS: &str = "FROM chunks WHERE NOT EXISTS (\
     SELECT 1 FROM units u WHERE u.source_name = chunks.source_name \
     AND u.unit_index = chunks.unit_index)";

/// Fail with [`IndexError::StoreCorruption`] if any manifest row disagrees
/// with the unit and chunk rows, or rows exist with no owner. Returns the
/// tallies so callers can reuse the source rows.
async fn check_consistency(conn: &mut SqliteConnection) -> Result<Vec<SourceTally>> {
    let orphan_units: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) {}", ORPHAN_UNITS))
        .fetch_one(&mut *conn)
        .await?;
    let orphan_chunks: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) {}", ORPHAN_CHUNKS))
        .fetch_one(&mut *conn)
        .await?;
    let tallies = tally_sources(conn).await?;

    let mut problems = Vec::new();
    if orphan_units > 0 {
        problems.push(format!("{} units belong to no source", orphan_units));
    }
    if orphan_chunks > 0 {
        problems.push(format!("{} chunks belong to no unit", orphan_chunks));
    }
    for t in tallies.iter().filter(|t| !t.is_consistent()) {
        problems.push(format!(
            "manifest for '{}' records {} chunks but {} are stored",
            t.source.name, t.source.chunks, t.actual_chunks
        ));
    }

    if problems.is_empty() {
        Ok(tallies)
    } else {
        warn!(problems = problems.len(), "index store is inconsistent; run repair");
        Err(IndexError::StoreCorruption(problems.join("; ")).into())
    }
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn upsert_chunks(&self, staged: &StagedSource) -> Result<u64> {
        staged.validate()?;
        let _writer = self.write_lock.lock().await;
        let name = staged.source.name.as_str();

        let mut tx = self.pool.begin().await?;
        let meta = read_meta(&mut tx).await?;
        let others: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE source_name != ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
        check_embedding_compat(meta.embedding.as_ref(), &staged.embedding, others as u64)?;
        check_chunking_compat(&meta, &staged.chunking, others as u64)?;

        let replaced = delete_rows(&mut tx, name).await?;

        for c in &staged.chunks {
            sqlx::query(
                "INSERT INTO chunks (id, source_name, unit_index, chunk_index, content, word_count, hash, embedding) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&c.id)
            .bind(&c.source_name)
            .bind(c.unit_index as i64)
            .bind(c.chunk_index as i64)
            .bind(&c.content)
            .bind(c.word_count as i64)
            .bind(&c.hash)
            .bind(vec_to_blob(&c.embedding))
            .execute(&mut *tx)
            .await?;
        }

        for u in &staged.units {
            sqlx::query(
                "INSERT INTO units (source_name, unit_index, unit_ref, title, word_count, line_count) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(name)
            .bind(u.index as i64)
            .bind(u.locator.as_str())
            .bind(&u.title)
            .bind(u.word_count as i64)
            .bind(u.line_count as i64)
            .execute(&mut *tx)
            .await?;
        }

        let source = &staged.source;
        sqlx::query(
            "INSERT INTO sources (name, kind, origin, unit_count, chunk_count, volume, indexed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(source.kind().as_str())
        .bind(source.origin())
        .bind(source.unit_count() as i64)
        .bind(source.chunks as i64)
        .bind(source.volume() as i64)
        .bind(source.indexed_at.timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO index_meta (id, embedding_model, embedding_dims, chunk_size, chunk_overlap, last_updated)
            VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                embedding_model = excluded.embedding_model,
                embedding_dims = excluded.embedding_dims,
                chunk_size = excluded.chunk_size,
                chunk_overlap = excluded.chunk_overlap,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&staged.embedding.model)
        .bind(staged.embedding.dims as i64)
        .bind(staged.chunking.chunk_size as i64)
        .bind(staged.chunking.chunk_overlap as i64)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(source = name, chunks = staged.chunks.len(), replaced, "committed source");
        Ok(replaced)
    }

    async fn delete_source(&self, name: &str) -> Result<u64> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
        if exists == 0 {
            return Err(IndexError::NotFound(name.to_string()).into());
        }

        let removed = delete_rows(&mut tx, name).await?;
        touch_meta(&mut tx).await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn get_source(&self, name: &str) -> Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn manifest(&self) -> Result<Manifest> {
        let mut tx = self.pool.begin().await?;
        let meta = read_meta(&mut tx).await?;
        let tallies = check_consistency(&mut tx).await?;
        tx.commit().await?;

        let sources = tallies.into_iter().map(|t| t.source).collect();
        Ok(Manifest::from_sources(&meta, sources))
    }

    async fn list_source_pages(&self, name: &str) -> Result<Vec<UnitPage>> {
        let mut tx = self.pool.begin().await?;

        let source = sqlx::query("SELECT * FROM sources WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| IndexError::NotFound(name.to_string()))?;
        let kind = source_from_row(&source)?.kind();

        let unit_rows = sqlx::query(
            "SELECT unit_index, unit_ref, title, word_count, line_count \
             FROM units WHERE source_name = ? ORDER BY unit_index",
        )
        .bind(name)
        .fetch_all(&mut *tx)
        .await?;

        let chunk_rows = sqlx::query(
            "SELECT id, unit_index, chunk_index, content, word_count \
             FROM chunks WHERE source_name = ? ORDER BY unit_index, chunk_index",
        )
        .bind(name)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut by_unit: HashMap<i64, Vec<ChunkSummary>> = HashMap::new();
        for row in &chunk_rows {
            by_unit
                .entry(row.get("unit_index"))
                .or_default()
                .push(ChunkSummary {
                    id: row.get("id"),
                    chunk_index: row.get::<i64, _>("chunk_index") as u64,
                    content: row.get("content"),
                    word_count: row.get::<i64, _>("word_count") as u64,
                });
        }

        Ok(unit_rows
            .iter()
            .map(|row| {
                let chunks = by_unit
                    .remove(&row.get::<i64, _>("unit_index"))
                    .unwrap_or_default();
                UnitPage {
                    title: row.get("title"),
                    locator: UnitLocator::for_kind(kind, row.get("unit_ref")),
                    chunk_count: chunks.len() as u64,
                    total_words: row.get::<i64, _>("word_count") as u64,
                    total_lines: row.get::<i64, _>("line_count") as u64,
                    chunks,
                }
            })
            .collect())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        source_filter: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>> {
        let mut tx = self.pool.begin().await?;
        let meta = read_meta(&mut tx).await?;
        check_consistency(&mut tx).await?;

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.source_name, c.unit_index, c.content, c.word_count, c.hash, c.embedding,
                   u.unit_ref, u.title, s.kind
            FROM chunks c
            LEFT JOIN units u ON u.source_name = c.source_name AND u.unit_index = c.unit_index
            LEFT JOIN sources s ON s.name = c.source_name
            WHERE (? IS NULL OR c.source_name = ?)
            "#,
        )
        .bind(source_filter)
        .bind(source_filter)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        if !rows.is_empty() {
            check_query_dims(meta.embedding.as_ref(), vector)?;
        }

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk_id: String = row.get("id");
            let source_name: String = row.get("source_name");
            let kind = row
                .get::<Option<String>, _>("kind")
                .and_then(|k| SourceKind::parse(&k))
                .ok_or_else(|| {
                    IndexError::StoreCorruption(format!(
                        "chunk {} belongs to source '{}' which has no manifest entry",
                        chunk_id, source_name
                    ))
                })?;
            let (unit_ref, title) = match (
                row.get::<Option<String>, _>("unit_ref"),
                row.get::<Option<String>, _>("title"),
            ) {
                (Some(unit_ref), Some(title)) => (unit_ref, title),
                _ => {
                    return Err(IndexError::StoreCorruption(format!(
                        "chunk {} references missing unit {} of '{}'",
                        chunk_id,
                        row.get::<i64, _>("unit_index"),
                        source_name
                    ))
                    .into())
                }
            };

            let blob: Vec<u8> = row.get("embedding");
            candidates.push(ChunkCandidate {
                similarity: cosine_similarity(vector, &blob_to_vec(&blob)),
                chunk_id,
                source_name,
                title,
                locator: UnitLocator::for_kind(kind, unit_ref),
                content: row.get("content"),
                word_count: row.get::<i64, _>("word_count") as u64,
                hash: row.get("hash"),
            });
        }

        rank_candidates(&mut candidates);
        candidates.truncate(k);
        Ok(candidates)
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut report = ReconcileReport {
            orphan_units_removed: sqlx::query(&format!("DELETE {}", ORPHAN_UNITS))
                .execute(&mut *tx)
                .await?
                .rows_affected(),
            ..Default::default()
        };
        report.orphan_chunks_removed = sqlx::query(&format!("DELETE {}", ORPHAN_CHUNKS))
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for tally in tally_sources(&mut tx).await? {
            if tally.is_consistent() {
                continue;
            }
            warn!(
                source = %tally.source.name,
                stored_chunks = tally.source.chunks,
                actual_chunks = tally.actual_chunks,
                "recomputing manifest row"
            );
            sqlx::query(
                "UPDATE sources SET unit_count = ?, volume = ?, chunk_count = ? WHERE name = ?",
            )
            .bind(tally.actual_units as i64)
            .bind(tally.actual_volume as i64)
            .bind(tally.actual_chunks as i64)
            .bind(&tally.source.name)
            .execute(&mut *tx)
            .await?;
            report.sources_corrected.push(tally.source.name);
        }

        if !report.is_clean() {
            touch_meta(&mut tx).await?;
        }
        tx.commit().await?;

        info!(
            orphan_chunks = report.orphan_chunks_removed,
            orphan_units = report.orphan_units_removed,
            corrected = report.sources_corrected.len(),
            "reconciled index store"
        );
        Ok(report)
    }

    async fn verify(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let checked = check_consistency(&mut tx).await;
        tx.commit().await?;
        checked.map(|_| ())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
