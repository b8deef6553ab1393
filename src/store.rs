// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Embedded index store.
//!
//! A single sqlite file holds the `files`, `chunks`, `vectors` and
//! `index_meta` tables, an FTS5 inverted index over chunk text, and a `vec0`
//! virtual table (sqlite-vec) for KNN when the extension is available.
//! Vector search falls back to a brute-force cosine scan otherwise.
//!
//! The store runs in WAL mode. One writer at a time; the Manager serializes
//! access through a mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Once;

use rusqlite::{params, Connection, OptionalExtension};
use zerocopy::AsBytes;

use crate::chunker::Chunk;
use crate::error::{MemoryError, ProviderError};
use crate::types::{SourceCount, SourceKind};

/// Store file name under the configured store directory.
pub const STORE_FILE_NAME: &str = "index.sqlite";

const SCHEMA_VERSION: i64 = 1;

static VEC_EXTENSION_INIT: Once = Once::new();

/// Register sqlite-vec as an auto extension, once per process.
///
/// SAFETY: `sqlite3_vec_init` is the extension entry point provided by the
/// sqlite-vec crate. `sqlite3_auto_extension` expects a function pointer with
/// the SQLite extension init signature; the transmute converts the concrete
/// fn pointer into the FFI-expected shape. This is the documented usage
/// pattern from the sqlite-vec crate.
fn register_vec_extension() {
    VEC_EXTENSION_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

/// File row as stored.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: i64,
    pub rel_path: String,
    pub source: SourceKind,
    pub mtime_ns: i64,
    pub size_bytes: u64,
    pub file_sha256: String,
}

/// File metadata for insert/update.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub rel_path: String,
    pub source: SourceKind,
    pub mtime_ns: i64,
    pub size_bytes: u64,
    pub file_sha256: String,
}

/// One file plus its chunk rows and optional vectors, used by `replace_all`.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub meta: FileMeta,
    pub chunks: Vec<(Chunk, Option<Vec<f32>>)>,
}

/// Context hydrated for a search hit.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub rel_path: String,
    pub source: SourceKind,
    pub byte_offset: usize,
    pub text: String,
}

/// Embedded relational + vector store.
pub struct IndexStore {
    conn: Connection,
    db_path: PathBuf,
    fts_available: bool,
    vec_available: bool,
    fingerprint: String,
    /// Vector dimension once known; mirrors `index_meta.dim`.
    dim: Option<usize>,
    /// Chunks exist whose vectors were dropped (model change or earlier
    /// crash); the next sync must rebuild before vector queries answer.
    needs_reindex: bool,
}

impl IndexStore {
    /// Open or create the store, migrating in place.
    ///
    /// A fingerprint change drops every stored vector; callers must reindex
    /// before vector queries return anything again.
    pub fn open_or_migrate(store_dir: &Path, fingerprint: &str) -> Result<Self, MemoryError> {
        register_vec_extension();
        std::fs::create_dir_all(store_dir)?;
        let db_path = store_dir.join(STORE_FILE_NAME);

        let conn = Connection::open(&db_path)
            .map_err(|e| MemoryError::StoreCorrupt(format!("failed to open store: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA cache_size = -64000;",
        )
        .map_err(|e| MemoryError::StoreCorrupt(format!("failed to set pragmas: {}", e)))?;

        let ok: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| MemoryError::StoreCorrupt(format!("integrity check failed: {}", e)))?;
        if ok != "ok" {
            return Err(MemoryError::StoreCorrupt(format!(
                "integrity check reported: {}",
                ok
            )));
        }

        let fts_available = probe_fts(&conn);
        let vec_available = probe_vec(&conn);

        let mut store = Self {
            conn,
            db_path,
            fts_available,
            vec_available,
            fingerprint: fingerprint.to_string(),
            dim: None,
            needs_reindex: false,
        };
        store.create_schema()?;
        store.drop_staging_tables()?;
        store.migrate_meta()?;

        tracing::debug!(
            fts = store.fts_available,
            vec = store.vec_available,
            fingerprint,
            "index store opened"
        );
        Ok(store)
    }

    fn create_schema(&mut self) -> Result<(), MemoryError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                 id INTEGER PRIMARY KEY,
                 rel_path TEXT NOT NULL UNIQUE,
                 source TEXT NOT NULL,
                 mtime_ns INTEGER NOT NULL,
                 size_bytes INTEGER NOT NULL,
                 file_sha256 TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS chunks (
                 id INTEGER PRIMARY KEY,
                 file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
                 chunk_index INTEGER NOT NULL,
                 byte_offset INTEGER NOT NULL,
                 byte_len INTEGER NOT NULL,
                 text TEXT NOT NULL,
                 chunk_sha256 TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id);

             CREATE TABLE IF NOT EXISTS vectors (
                 chunk_id INTEGER PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
                 provider_id TEXT NOT NULL,
                 model_id TEXT NOT NULL,
                 dim INTEGER NOT NULL,
                 embedding BLOB NOT NULL
             );

             CREATE TABLE IF NOT EXISTS index_meta (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 schema_version INTEGER NOT NULL,
                 embedding_model_fingerprint TEXT NOT NULL,
                 dim INTEGER,
                 created_at TEXT NOT NULL,
                 last_synced_at TEXT
             );",
        )?;

        if self.fts_available {
            self.conn.execute_batch(
                "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts
                 USING fts5(text, tokenize = 'unicode61');",
            )?;
        }
        Ok(())
    }

    fn migrate_meta(&mut self) -> Result<(), MemoryError> {
        let existing: Option<(i64, String, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT schema_version, embedding_model_fingerprint, dim
                 FROM index_meta WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO index_meta
                     (id, schema_version, embedding_model_fingerprint, dim, created_at)
                     VALUES (1, ?1, ?2, NULL, ?3)",
                    params![SCHEMA_VERSION, self.fingerprint, now_rfc3339()],
                )?;
            }
            Some((version, _, _)) if version > SCHEMA_VERSION => {
                return Err(MemoryError::StoreCorrupt(format!(
                    "store schema version {} is newer than supported {}",
                    version, SCHEMA_VERSION
                )));
            }
            Some((_, stored_fingerprint, dim)) => {
                if stored_fingerprint != self.fingerprint {
                    tracing::info!(
                        from = %stored_fingerprint,
                        to = %self.fingerprint,
                        "embedding model changed, dropping stored vectors"
                    );
                    self.conn.execute("DELETE FROM vectors", [])?;
                    self.drop_vec_table()?;
                    self.conn.execute(
                        "UPDATE index_meta
                         SET embedding_model_fingerprint = ?1, dim = NULL
                         WHERE id = 1",
                        params![self.fingerprint],
                    )?;
                    self.needs_reindex = true;
                } else {
                    self.dim = dim.map(|d| d as usize);
                    if let Some(d) = self.dim {
                        if self.vec_available {
                            self.ensure_vec_table(d)?;
                        }
                    }
                    // A crash between a fingerprint-driven drop and its
                    // reindex leaves chunks without vectors.
                    if self.count_chunks()? > 0 {
                        let vector_count: i64 = self.conn.query_row(
                            "SELECT COUNT(*) FROM vectors",
                            [],
                            |row| row.get(0),
                        )?;
                        if vector_count == 0 {
                            self.needs_reindex = true;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether vector rows were dropped and a reindex is required before
    /// vector queries can answer again.
    pub fn needs_reindex(&self) -> bool {
        self.needs_reindex
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn fts_available(&self) -> bool {
        self.fts_available
    }

    pub fn vec_available(&self) -> bool {
        self.vec_available
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    /// Size of the store file on disk.
    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0)
    }

    // ===== vec0 table management =====

    fn vec_table_exists(&self) -> Result<bool, MemoryError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'chunks_vec'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn drop_vec_table(&self) -> Result<(), MemoryError> {
        self.conn
            .execute_batch("DROP TABLE IF EXISTS chunks_vec")?;
        Ok(())
    }

    /// Create (or recreate at a new dimension) the vec0 KNN table.
    fn ensure_vec_table(&self, dim: usize) -> Result<(), MemoryError> {
        if self.vec_table_exists()? {
            let create_sql: String = self.conn.query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'chunks_vec'",
                [],
                |row| row.get(0),
            )?;
            match parse_vec_dimension(&create_sql) {
                Some(existing) if existing == dim => return Ok(()),
                _ => self.drop_vec_table()?,
            }
        }
        self.conn.execute_batch(&format!(
            "CREATE VIRTUAL TABLE chunks_vec
             USING vec0(embedding float[{dim}] distance_metric=cosine)"
        ))?;
        Ok(())
    }

    /// Record the vector dimension for this index. A disagreeing dimension is
    /// a fatal classification error for the sync that produced it.
    fn commit_dim(&mut self, dim: usize) -> Result<(), MemoryError> {
        if dim == 0 {
            return Err(MemoryError::Provider(ProviderError::DimMismatch {
                expected: self.dim.unwrap_or(1),
                actual: 0,
            }));
        }
        match self.dim {
            Some(existing) if existing != dim => {
                Err(MemoryError::Provider(ProviderError::DimMismatch {
                    expected: existing,
                    actual: dim,
                }))
            }
            Some(_) => Ok(()),
            None => {
                self.conn.execute(
                    "UPDATE index_meta SET dim = ?1 WHERE id = 1",
                    params![dim as i64],
                )?;
                if self.vec_available {
                    self.ensure_vec_table(dim)?;
                }
                self.dim = Some(dim);
                Ok(())
            }
        }
    }

    // ===== file/chunk writes =====

    /// Insert or update a file row without touching its chunks.
    pub fn upsert_file(&mut self, meta: &FileMeta) -> Result<i64, MemoryError> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO files (rel_path, source, mtime_ns, size_bytes, file_sha256)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(rel_path) DO UPDATE SET
                 source = excluded.source,
                 mtime_ns = excluded.mtime_ns,
                 size_bytes = excluded.size_bytes,
                 file_sha256 = excluded.file_sha256
             RETURNING id",
            params![
                meta.rel_path,
                meta.source.as_str(),
                meta.mtime_ns,
                meta.size_bytes as i64,
                meta.file_sha256,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Replace one file's rows (chunks, fts entries, vectors) atomically.
    pub fn replace_file_rows(
        &mut self,
        meta: &FileMeta,
        chunks: &[(Chunk, Option<Vec<f32>>)],
    ) -> Result<i64, MemoryError> {
        if let Some(dim) = chunks.iter().find_map(|(_, v)| v.as_ref().map(Vec::len)) {
            self.commit_dim(dim)?;
        }
        let fts = self.fts_available;
        let vec_live = self.vec_available && self.vec_table_exists()?;
        let dim = self.dim;
        let fingerprint = self.fingerprint.clone();

        let tx = self.conn.transaction()?;
        let file_id: i64 = tx.query_row(
            "INSERT INTO files (rel_path, source, mtime_ns, size_bytes, file_sha256)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(rel_path) DO UPDATE SET
                 source = excluded.source,
                 mtime_ns = excluded.mtime_ns,
                 size_bytes = excluded.size_bytes,
                 file_sha256 = excluded.file_sha256
             RETURNING id",
            params![
                meta.rel_path,
                meta.source.as_str(),
                meta.mtime_ns,
                meta.size_bytes as i64,
                meta.file_sha256,
            ],
            |row| row.get(0),
        )?;

        delete_chunk_rows(&tx, file_id, fts, vec_live)?;

        let (provider_id, model_id) = split_fingerprint(&fingerprint);
        for (chunk, vector) in chunks {
            tx.execute(
                "INSERT INTO chunks (file_id, chunk_index, byte_offset, byte_len, text, chunk_sha256)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    file_id,
                    chunk.chunk_index,
                    chunk.byte_offset as i64,
                    chunk.byte_len as i64,
                    chunk.text,
                    chunk.sha256,
                ],
            )?;
            let chunk_id = tx.last_insert_rowid();

            if fts {
                tx.execute(
                    "INSERT INTO chunks_fts (rowid, text) VALUES (?1, ?2)",
                    params![chunk_id, chunk.text],
                )?;
            }
            if let Some(vector) = vector {
                if Some(vector.len()) != dim {
                    return Err(MemoryError::Provider(ProviderError::DimMismatch {
                        expected: dim.unwrap_or(0),
                        actual: vector.len(),
                    }));
                }
                tx.execute(
                    "INSERT INTO vectors (chunk_id, provider_id, model_id, dim, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        chunk_id,
                        provider_id,
                        model_id,
                        vector.len() as i64,
                        vector.as_bytes(),
                    ],
                )?;
                if vec_live {
                    tx.execute(
                        "INSERT INTO chunks_vec (rowid, embedding) VALUES (?1, ?2)",
                        params![chunk_id, vector.as_bytes()],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(file_id)
    }

    /// Delete a file and cascade to its chunks, vectors and fts entries.
    pub fn delete_file(&mut self, rel_path: &str) -> Result<bool, MemoryError> {
        let fts = self.fts_available;
        let vec_live = self.vec_available && self.vec_table_exists()?;

        let tx = self.conn.transaction()?;
        let file_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM files WHERE rel_path = ?1",
                params![rel_path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(file_id) = file_id else {
            return Ok(false);
        };

        delete_chunk_rows(&tx, file_id, fts, vec_live)?;
        tx.execute("DELETE FROM files WHERE id = ?1", params![file_id])?;
        tx.commit()?;
        Ok(true)
    }

    /// All file rows keyed by rel_path, for sync reconciliation.
    pub fn file_records(&self) -> Result<HashMap<String, StoredFile>, MemoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, rel_path, source, mtime_ns, size_bytes, file_sha256 FROM files",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredFile {
                id: row.get(0)?,
                rel_path: row.get(1)?,
                source: SourceKind::parse(&row.get::<_, String>(2)?),
                mtime_ns: row.get(3)?,
                size_bytes: row.get::<_, i64>(4)? as u64,
                file_sha256: row.get(5)?,
            })
        })?;

        let mut records = HashMap::new();
        for row in rows {
            let record = row?;
            records.insert(record.rel_path.clone(), record);
        }
        Ok(records)
    }

    // ===== forced reindex =====

    /// Atomically replace the whole index with `staged`.
    ///
    /// Rows are written into staging tables first; the live tables are only
    /// touched inside the final swap transaction. On any error the staging
    /// tables are dropped and the live content is untouched.
    pub fn replace_all(&mut self, staged: &[StagedFile]) -> Result<(), MemoryError> {
        if let Some(dim) = staged
            .iter()
            .flat_map(|f| f.chunks.iter())
            .find_map(|(_, v)| v.as_ref().map(Vec::len))
        {
            self.commit_dim(dim)?;
        }

        let result = self.replace_all_inner(staged);
        if result.is_err() {
            let _ = self.drop_staging_tables();
        } else {
            self.needs_reindex = false;
        }
        result
    }

    fn replace_all_inner(&mut self, staged: &[StagedFile]) -> Result<(), MemoryError> {
        self.drop_staging_tables()?;
        self.conn.execute_batch(
            "CREATE TABLE files_staging (
                 id INTEGER PRIMARY KEY,
                 rel_path TEXT NOT NULL UNIQUE,
                 source TEXT NOT NULL,
                 mtime_ns INTEGER NOT NULL,
                 size_bytes INTEGER NOT NULL,
                 file_sha256 TEXT NOT NULL
             );
             CREATE TABLE chunks_staging (
                 id INTEGER PRIMARY KEY,
                 file_id INTEGER NOT NULL,
                 chunk_index INTEGER NOT NULL,
                 byte_offset INTEGER NOT NULL,
                 byte_len INTEGER NOT NULL,
                 text TEXT NOT NULL,
                 chunk_sha256 TEXT NOT NULL
             );
             CREATE TABLE vectors_staging (
                 chunk_id INTEGER PRIMARY KEY,
                 provider_id TEXT NOT NULL,
                 model_id TEXT NOT NULL,
                 dim INTEGER NOT NULL,
                 embedding BLOB NOT NULL
             );",
        )?;

        let dim = self.dim;
        let (provider_id, model_id) = split_fingerprint(&self.fingerprint.clone());

        // Stage everything in its own transaction; the live tables stay
        // untouched until the swap below.
        let tx = self.conn.transaction()?;
        for file in staged {
            tx.execute(
                "INSERT INTO files_staging (rel_path, source, mtime_ns, size_bytes, file_sha256)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    file.meta.rel_path,
                    file.meta.source.as_str(),
                    file.meta.mtime_ns,
                    file.meta.size_bytes as i64,
                    file.meta.file_sha256,
                ],
            )?;
            let file_id = tx.last_insert_rowid();

            for (chunk, vector) in &file.chunks {
                tx.execute(
                    "INSERT INTO chunks_staging
                     (file_id, chunk_index, byte_offset, byte_len, text, chunk_sha256)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        file_id,
                        chunk.chunk_index,
                        chunk.byte_offset as i64,
                        chunk.byte_len as i64,
                        chunk.text,
                        chunk.sha256,
                    ],
                )?;
                let chunk_id = tx.last_insert_rowid();

                if let Some(vector) = vector {
                    if Some(vector.len()) != dim {
                        return Err(MemoryError::Provider(ProviderError::DimMismatch {
                            expected: dim.unwrap_or(0),
                            actual: vector.len(),
                        }));
                    }
                    tx.execute(
                        "INSERT INTO vectors_staging (chunk_id, provider_id, model_id, dim, embedding)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            chunk_id,
                            provider_id,
                            model_id,
                            vector.len() as i64,
                            vector.as_bytes(),
                        ],
                    )?;
                }
            }
        }
        tx.commit()?;

        // Swap: one transaction that clears the live tables and copies the
        // staged rows (ids carry over, so chunk/vector joins stay intact).
        let fts = self.fts_available;
        let vec_live = self.vec_available && self.vec_table_exists()?;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM vectors", [])?;
        tx.execute("DELETE FROM chunks", [])?;
        tx.execute("DELETE FROM files", [])?;
        if fts {
            tx.execute("DELETE FROM chunks_fts", [])?;
        }
        if vec_live {
            tx.execute("DELETE FROM chunks_vec", [])?;
        }

        tx.execute("INSERT INTO files SELECT * FROM files_staging", [])?;
        tx.execute("INSERT INTO chunks SELECT * FROM chunks_staging", [])?;
        tx.execute("INSERT INTO vectors SELECT * FROM vectors_staging", [])?;
        if fts {
            tx.execute(
                "INSERT INTO chunks_fts (rowid, text) SELECT id, text FROM chunks",
                [],
            )?;
        }
        if vec_live {
            tx.execute(
                "INSERT INTO chunks_vec (rowid, embedding)
                 SELECT chunk_id, embedding FROM vectors",
                [],
            )?;
        }
        tx.commit()?;

        self.drop_staging_tables()?;
        Ok(())
    }

    fn drop_staging_tables(&self) -> Result<(), MemoryError> {
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS files_staging;
             DROP TABLE IF EXISTS chunks_staging;
             DROP TABLE IF EXISTS vectors_staging;",
        )?;
        Ok(())
    }

    // ===== queries =====

    /// K-nearest chunks by cosine similarity. Scores are in `[-1, 1]`.
    pub fn vector_search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>, MemoryError> {
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if let Some(dim) = self.dim {
            if dim != query.len() {
                tracing::warn!(
                    expected = dim,
                    actual = query.len(),
                    "query vector dimension disagrees with index, skipping vector search"
                );
                return Ok(Vec::new());
            }
        }

        if self.vec_available && self.vec_table_exists()? {
            let has_rows: bool = self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM chunks_vec LIMIT 1)",
                [],
                |row| row.get(0),
            )?;
            if !has_rows {
                return Ok(Vec::new());
            }
            let mut stmt = self.conn.prepare(
                "SELECT rowid, distance FROM chunks_vec
                 WHERE embedding MATCH ?1 AND k = ?2",
            )?;
            let rows = stmt.query_map(params![query.as_bytes(), k as i64], |row| {
                let id: i64 = row.get(0)?;
                let distance: f64 = row.get(1)?;
                // cosine distance = 1 - cosine similarity
                Ok((id, 1.0 - distance as f32))
            })?;
            let mut results = Vec::new();
            for row in rows {
                results.push(row?);
            }
            return Ok(results);
        }

        // Brute-force scan over stored vectors.
        let mut stmt = self
            .conn
            .prepare("SELECT chunk_id, embedding FROM vectors")?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, blob))
        })?;

        let mut scored = Vec::new();
        for row in rows {
            let (id, blob) = row?;
            let stored = deserialize_vector(&blob);
            scored.push((id, cosine_similarity(query, &stored)));
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Full-text candidates with raw bm25-derived relevance (higher is
    /// better). Returns empty when FTS is unavailable or the query has no
    /// searchable tokens.
    pub fn text_search(&self, query: &str, k: usize) -> Result<Vec<(i64, f32)>, MemoryError> {
        if !self.fts_available || k == 0 {
            return Ok(Vec::new());
        }
        let Some(match_expr) = fts_match_expr(query) else {
            return Ok(Vec::new());
        };

        let mut stmt = self.conn.prepare(
            "SELECT rowid, bm25(chunks_fts) FROM chunks_fts
             WHERE chunks_fts MATCH ?1
             ORDER BY bm25(chunks_fts)
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![match_expr, k as i64], |row| {
            let id: i64 = row.get(0)?;
            let rank: f64 = row.get(1)?;
            // fts5 bm25() is better-is-lower (negative); flip so higher wins.
            Ok((id, -rank as f32))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Hydrate file context for one chunk.
    pub fn load_chunk_context(&self, chunk_id: i64) -> Result<Option<ChunkContext>, MemoryError> {
        let context = self
            .conn
            .query_row(
                "SELECT f.rel_path, f.source, c.byte_offset, c.text
                 FROM chunks c JOIN files f ON f.id = c.file_id
                 WHERE c.id = ?1",
                params![chunk_id],
                |row| {
                    Ok(ChunkContext {
                        rel_path: row.get(0)?,
                        source: SourceKind::parse(&row.get::<_, String>(1)?),
                        byte_offset: row.get::<_, i64>(2)? as usize,
                        text: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(context)
    }

    // ===== status =====

    pub fn count_files(&self) -> Result<u64, MemoryError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn count_chunks(&self) -> Result<u64, MemoryError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn source_counts(&self) -> Result<Vec<SourceCount>, MemoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT f.source, COUNT(DISTINCT f.id), COUNT(c.id)
             FROM files f LEFT JOIN chunks c ON c.file_id = f.id
             GROUP BY f.source
             ORDER BY f.source",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SourceCount {
                source: SourceKind::parse(&row.get::<_, String>(0)?),
                files: row.get::<_, i64>(1)? as u64,
                chunks: row.get::<_, i64>(2)? as u64,
            })
        })?;

        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    pub fn last_synced_at(&self) -> Result<Option<String>, MemoryError> {
        let value: Option<String> = self.conn.query_row(
            "SELECT last_synced_at FROM index_meta WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(value)
    }

    pub fn touch_last_synced(&mut self) -> Result<(), MemoryError> {
        self.conn.execute(
            "UPDATE index_meta SET last_synced_at = ?1 WHERE id = 1",
            params![now_rfc3339()],
        )?;
        Ok(())
    }

    /// Flush the WAL before the Manager drops the store.
    pub fn checkpoint(&self) -> Result<(), MemoryError> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
        Ok(())
    }
}

fn delete_chunk_rows(
    tx: &rusqlite::Transaction<'_>,
    file_id: i64,
    fts: bool,
    vec_live: bool,
) -> Result<(), MemoryError> {
    if fts {
        tx.execute(
            "DELETE FROM chunks_fts WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?1)",
            params![file_id],
        )?;
    }
    if vec_live {
        tx.execute(
            "DELETE FROM chunks_vec WHERE rowid IN (SELECT id FROM chunks WHERE file_id = ?1)",
            params![file_id],
        )?;
    }
    tx.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])?;
    Ok(())
}

/// Check whether this sqlite build serves FTS5.
fn probe_fts(conn: &Connection) -> bool {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS _fts_probe USING fts5(text);
         DROP TABLE _fts_probe;",
    )
    .is_ok()
}

/// Check whether the vec0 extension is loadable.
fn probe_vec(conn: &Connection) -> bool {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS _vec_probe USING vec0(embedding float[2]);
         DROP TABLE _vec_probe;",
    )
    .is_ok()
}

/// Parse the dimension out of a vec0 CREATE statement (`float[N]`).
fn parse_vec_dimension(create_sql: &str) -> Option<usize> {
    let start = create_sql.find("float[")?;
    let after = &create_sql[start + 6..];
    let end = after.find(']')?;
    after[..end].parse().ok()
}

fn split_fingerprint(fingerprint: &str) -> (String, String) {
    match fingerprint.split_once('/') {
        Some((provider, model)) => (provider.to_string(), model.to_string()),
        None => (fingerprint.to_string(), String::new()),
    }
}

/// Build an FTS5 MATCH expression from free text: quoted tokens OR-ed
/// together. Returns None when the query has no searchable tokens.
fn fts_match_expr(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Decode a little-endian f32 blob.
fn deserialize_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap_or([0; 4]);
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Compute cosine similarity between two vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::hash_text;
    use tempfile::tempdir;

    fn open(dir: &Path) -> IndexStore {
        IndexStore::open_or_migrate(dir, "ollama/nomic-embed-text").unwrap()
    }

    fn chunk(index: u32, text: &str) -> Chunk {
        Chunk {
            chunk_index: index,
            byte_offset: 0,
            byte_len: text.len(),
            text: text.to_string(),
            sha256: hash_text(text),
        }
    }

    fn file_meta(rel: &str, sha: &str) -> FileMeta {
        FileMeta {
            rel_path: rel.to_string(),
            source: SourceKind::Memory,
            mtime_ns: 1,
            size_bytes: 10,
            file_sha256: sha.to_string(),
        }
    }

    #[test]
    fn test_open_creates_store_file() {
        let temp = tempdir().unwrap();
        let store = open(temp.path());
        assert!(store.db_path().exists());
        assert!(store.fts_available());
        assert!(store.vec_available());
    }

    #[test]
    fn test_replace_and_query_roundtrip() {
        let temp = tempdir().unwrap();
        let mut store = open(temp.path());

        let chunks = vec![
            (chunk(0, "alpha memory line"), Some(vec![1.0, 0.0, 0.0])),
            (chunk(1, "zebra memory line"), Some(vec![0.0, 1.0, 0.0])),
        ];
        store
            .replace_file_rows(&file_meta("memory/log.md", "sha-1"), &chunks)
            .unwrap();

        assert_eq!(store.count_files().unwrap(), 1);
        assert_eq!(store.count_chunks().unwrap(), 2);

        let hits = store.vector_search(&[1.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].1 > hits[1].1);
        let context = store.load_chunk_context(hits[0].0).unwrap().unwrap();
        assert_eq!(context.text, "alpha memory line");
        assert_eq!(context.rel_path, "memory/log.md");
    }

    #[test]
    fn test_text_search_ranks_matching_chunk() {
        let temp = tempdir().unwrap();
        let mut store = open(temp.path());

        let chunks = vec![
            (chunk(0, "alpha memory line"), None),
            (chunk(1, "unrelated content entirely"), None),
        ];
        store
            .replace_file_rows(&file_meta("memory/log.md", "sha-1"), &chunks)
            .unwrap();

        let hits = store.text_search("alpha", 10).unwrap();
        assert_eq!(hits.len(), 1);
        let context = store.load_chunk_context(hits[0].0).unwrap().unwrap();
        assert!(context.text.contains("alpha"));
    }

    #[test]
    fn test_text_search_survives_operator_queries() {
        let temp = tempdir().unwrap();
        let mut store = open(temp.path());
        store
            .replace_file_rows(
                &file_meta("a.md", "sha"),
                &[(chunk(0, "alpha beta"), None)],
            )
            .unwrap();

        // Raw FTS operators must not reach the MATCH expression.
        assert!(store.text_search("alpha AND) OR \"", 10).is_ok());
        assert!(store.text_search("***", 10).unwrap().is_empty());
    }

    #[test]
    fn test_delete_file_cascades() {
        let temp = tempdir().unwrap();
        let mut store = open(temp.path());

        store
            .replace_file_rows(
                &file_meta("a.md", "sha-a"),
                &[(chunk(0, "alpha content"), Some(vec![1.0, 0.0]))],
            )
            .unwrap();
        store
            .replace_file_rows(
                &file_meta("b.md", "sha-b"),
                &[(chunk(0, "beta content"), Some(vec![0.0, 1.0]))],
            )
            .unwrap();

        assert!(store.delete_file("a.md").unwrap());
        assert!(!store.delete_file("a.md").unwrap());
        assert_eq!(store.count_files().unwrap(), 1);
        assert_eq!(store.count_chunks().unwrap(), 1);
        assert!(store.text_search("alpha", 10).unwrap().is_empty());
        let hits = store.vector_search(&[1.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_fingerprint_change_drops_vectors() {
        let temp = tempdir().unwrap();
        {
            let mut store = open(temp.path());
            store
                .replace_file_rows(
                    &file_meta("a.md", "sha"),
                    &[(chunk(0, "alpha content"), Some(vec![1.0, 0.0]))],
                )
                .unwrap();
            assert_eq!(store.dim(), Some(2));
        }

        let store = IndexStore::open_or_migrate(temp.path(), "openai/text-embedding-3-small")
            .unwrap();
        // Chunks survive, vectors are gone, dimension resets.
        assert_eq!(store.count_chunks().unwrap(), 1);
        assert_eq!(store.dim(), None);
        assert!(store.needs_reindex());
        assert!(store.vector_search(&[1.0, 0.0], 10).unwrap().is_empty());
        // Text search still works.
        assert_eq!(store.text_search("alpha", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_dim_mismatch_rejected() {
        let temp = tempdir().unwrap();
        let mut store = open(temp.path());
        store
            .replace_file_rows(
                &file_meta("a.md", "sha"),
                &[(chunk(0, "alpha content"), Some(vec![1.0, 0.0]))],
            )
            .unwrap();

        let err = store
            .replace_file_rows(
                &file_meta("b.md", "sha-b"),
                &[(chunk(0, "beta content"), Some(vec![1.0, 0.0, 0.0]))],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Provider(ProviderError::DimMismatch { expected: 2, actual: 3 })
        ));
        // The failed file was not half-written.
        assert_eq!(store.count_files().unwrap(), 1);
    }

    #[test]
    fn test_replace_all_swaps_content() {
        let temp = tempdir().unwrap();
        let mut store = open(temp.path());
        store
            .replace_file_rows(
                &file_meta("old.md", "sha-old"),
                &[(chunk(0, "old content"), Some(vec![1.0, 0.0]))],
            )
            .unwrap();

        let staged = vec![StagedFile {
            meta: file_meta("new.md", "sha-new"),
            chunks: vec![
                (chunk(0, "new alpha content"), Some(vec![0.0, 1.0])),
                (chunk(1, "new zebra content"), Some(vec![1.0, 0.0])),
            ],
        }];
        store.replace_all(&staged).unwrap();

        let records = store.file_records().unwrap();
        assert!(records.contains_key("new.md"));
        assert!(!records.contains_key("old.md"));
        assert_eq!(store.count_chunks().unwrap(), 2);
        assert!(store.text_search("old", 10).unwrap().is_empty());
        assert_eq!(store.vector_search(&[0.0, 1.0], 10).unwrap().len(), 2);
    }

    #[test]
    fn test_replace_all_failure_preserves_live_tables() {
        let temp = tempdir().unwrap();
        let mut store = open(temp.path());
        store
            .replace_file_rows(
                &file_meta("keep.md", "sha-keep"),
                &[(chunk(0, "kept content"), Some(vec![1.0, 0.0]))],
            )
            .unwrap();

        // Mismatched dimension inside the staged batch aborts the swap.
        let staged = vec![StagedFile {
            meta: file_meta("bad.md", "sha-bad"),
            chunks: vec![(chunk(0, "bad content"), Some(vec![1.0, 0.0, 0.0]))],
        }];
        assert!(store.replace_all(&staged).is_err());

        let records = store.file_records().unwrap();
        assert!(records.contains_key("keep.md"));
        assert_eq!(store.count_chunks().unwrap(), 1);
        assert_eq!(store.text_search("kept", 10).unwrap().len(), 1);
        // No staging tables left behind.
        let staging_count: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE '%_staging'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(staging_count, 0);
    }

    #[test]
    fn test_zero_chunk_file_recorded() {
        let temp = tempdir().unwrap();
        let mut store = open(temp.path());
        store
            .replace_file_rows(&file_meta("empty.md", "sha-empty"), &[])
            .unwrap();
        assert_eq!(store.count_files().unwrap(), 1);
        assert_eq!(store.count_chunks().unwrap(), 0);
    }

    #[test]
    fn test_source_counts() {
        let temp = tempdir().unwrap();
        let mut store = open(temp.path());
        store
            .replace_file_rows(
                &file_meta("memory/a.md", "sha-a"),
                &[(chunk(0, "alpha"), None), (chunk(1, "beta"), None)],
            )
            .unwrap();
        let mut ws = file_meta("notes.md", "sha-n");
        ws.source = SourceKind::Workspace;
        store.replace_file_rows(&ws, &[(chunk(0, "gamma"), None)]).unwrap();

        let counts = store.source_counts().unwrap();
        let memory = counts
            .iter()
            .find(|c| c.source == SourceKind::Memory)
            .unwrap();
        assert_eq!(memory.files, 1);
        assert_eq!(memory.chunks, 2);
        let workspace = counts
            .iter()
            .find(|c| c.source == SourceKind::Workspace)
            .unwrap();
        assert_eq!(workspace.files, 1);
        assert_eq!(workspace.chunks, 1);
    }

    #[test]
    fn test_last_synced_roundtrip() {
        let temp = tempdir().unwrap();
        let mut store = open(temp.path());
        assert!(store.last_synced_at().unwrap().is_none());
        store.touch_last_synced().unwrap();
        assert!(store.last_synced_at().unwrap().is_some());
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_fts_match_expr() {
        assert_eq!(
            fts_match_expr("alpha beta-id123").unwrap(),
            "\"alpha\" OR \"beta\" OR \"id123\""
        );
        assert!(fts_match_expr("  !!! ").is_none());
    }

    #[test]
    fn test_parse_vec_dimension() {
        assert_eq!(
            parse_vec_dimension("CREATE VIRTUAL TABLE chunks_vec USING vec0(embedding float[768] distance_metric=cosine)"),
            Some(768)
        );
        assert_eq!(parse_vec_dimension("no match"), None);
    }
}
