// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent embedding cache.
//!
//! Maps `(providerId, modelId, chunkSha256)` to a vector. Lives in its own
//! sqlite file next to the index so it survives forced reindexes and
//! fingerprint-driven vector drops. Pruned by LRU when over capacity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use zerocopy::AsBytes;

use crate::error::MemoryError;

/// Entry cap before LRU pruning kicks in.
const DEFAULT_MAX_ENTRIES: u64 = 100_000;

/// Thread-safe persistent embedding cache.
pub struct EmbeddingCache {
    conn: Mutex<Connection>,
    path: PathBuf,
    max_entries: u64,
}

/// Cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: u64,
    pub max_entries: u64,
}

impl EmbeddingCache {
    /// Open or create the cache database at the given path.
    pub fn open(path: &Path) -> Result<Self, MemoryError> {
        Self::open_with_capacity(path, DEFAULT_MAX_ENTRIES)
    }

    pub fn open_with_capacity(path: &Path, max_entries: u64) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| MemoryError::StoreCorrupt(format!("failed to open cache: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS embeddings (
                 provider_id TEXT NOT NULL,
                 model_id TEXT NOT NULL,
                 chunk_sha256 TEXT NOT NULL,
                 dim INTEGER NOT NULL,
                 vector BLOB NOT NULL,
                 last_used_at INTEGER NOT NULL,
                 PRIMARY KEY (provider_id, model_id, chunk_sha256)
             );",
        )
        .map_err(|e| MemoryError::StoreCorrupt(format!("cache schema init failed: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            max_entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up one vector.
    pub fn get(
        &self,
        provider_id: &str,
        model_id: &str,
        chunk_sha256: &str,
    ) -> Result<Option<Vec<f32>>, MemoryError> {
        let conn = self.lock();
        let row: Option<Vec<u8>> = conn
            .query_row(
                "SELECT vector FROM embeddings
                 WHERE provider_id = ?1 AND model_id = ?2 AND chunk_sha256 = ?3",
                params![provider_id, model_id, chunk_sha256],
                |row| row.get(0),
            )
            .optional()
            .map_err(MemoryError::from)?;

        if row.is_some() {
            conn.execute(
                "UPDATE embeddings SET last_used_at = strftime('%s','now')
                 WHERE provider_id = ?1 AND model_id = ?2 AND chunk_sha256 = ?3",
                params![provider_id, model_id, chunk_sha256],
            )
            .map_err(MemoryError::from)?;
        }
        Ok(row.map(|bytes| deserialize_vector(&bytes)))
    }

    /// Look up many vectors, keyed by chunk sha. Touches `last_used_at` for
    /// every hit.
    pub fn get_batch(
        &self,
        provider_id: &str,
        model_id: &str,
        chunk_shas: &[String],
    ) -> Result<HashMap<String, Vec<f32>>, MemoryError> {
        let conn = self.lock();
        let mut hits = HashMap::new();

        let mut select = conn
            .prepare_cached(
                "SELECT vector FROM embeddings
                 WHERE provider_id = ?1 AND model_id = ?2 AND chunk_sha256 = ?3",
            )
            .map_err(MemoryError::from)?;
        let mut touch = conn
            .prepare_cached(
                "UPDATE embeddings SET last_used_at = strftime('%s','now')
                 WHERE provider_id = ?1 AND model_id = ?2 AND chunk_sha256 = ?3",
            )
            .map_err(MemoryError::from)?;

        for sha in chunk_shas {
            let row: Option<Vec<u8>> = select
                .query_row(params![provider_id, model_id, sha], |row| row.get(0))
                .optional()
                .map_err(MemoryError::from)?;
            if let Some(bytes) = row {
                touch
                    .execute(params![provider_id, model_id, sha])
                    .map_err(MemoryError::from)?;
                hits.insert(sha.clone(), deserialize_vector(&bytes));
            }
        }
        Ok(hits)
    }

    /// Insert a batch of vectors in one transaction, then prune if over
    /// capacity.
    pub fn put_batch(
        &self,
        provider_id: &str,
        model_id: &str,
        entries: &[(String, Vec<f32>)],
    ) -> Result<(), MemoryError> {
        if entries.is_empty() {
            return Ok(());
        }
        {
            let mut conn = self.lock();
            let tx = conn.transaction().map_err(MemoryError::from)?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT OR REPLACE INTO embeddings
                         (provider_id, model_id, chunk_sha256, dim, vector, last_used_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, strftime('%s','now'))",
                    )
                    .map_err(MemoryError::from)?;
                for (sha, vector) in entries {
                    stmt.execute(params![
                        provider_id,
                        model_id,
                        sha,
                        vector.len() as i64,
                        vector.as_bytes(),
                    ])
                    .map_err(MemoryError::from)?;
                }
            }
            tx.commit().map_err(MemoryError::from)?;
        }
        self.prune()?;
        Ok(())
    }

    /// Number of cached vectors.
    pub fn len(&self) -> Result<u64, MemoryError> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
            .map_err(MemoryError::from)?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool, MemoryError> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<CacheStats, MemoryError> {
        Ok(CacheStats {
            entries: self.len()?,
            max_entries: self.max_entries,
        })
    }

    /// Drop least-recently-used entries beyond the capacity cap.
    pub fn prune(&self) -> Result<(), MemoryError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM embeddings WHERE rowid IN (
                 SELECT rowid FROM embeddings
                 ORDER BY last_used_at DESC
                 LIMIT -1 OFFSET ?1
             )",
            params![self.max_entries as i64],
        )
        .map_err(MemoryError::from)?;
        Ok(())
    }

    /// Remove everything.
    pub fn clear(&self) -> Result<(), MemoryError> {
        let conn = self.lock();
        conn.execute("DELETE FROM embeddings", [])
            .map_err(MemoryError::from)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-write; the
        // connection itself is still usable for our single-statement ops.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_cache(dir: &Path) -> EmbeddingCache {
        EmbeddingCache::open(&dir.join("cache").join("embeddings.sqlite")).unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let temp = tempdir().unwrap();
        let cache = open_cache(temp.path());

        cache
            .put_batch(
                "ollama",
                "nomic-embed-text",
                &[("sha-a".to_string(), vec![1.5, -2.25, 0.0])],
            )
            .unwrap();

        let hit = cache.get("ollama", "nomic-embed-text", "sha-a").unwrap();
        assert_eq!(hit, Some(vec![1.5, -2.25, 0.0]));
    }

    #[test]
    fn test_miss_on_other_model() {
        let temp = tempdir().unwrap();
        let cache = open_cache(temp.path());

        cache
            .put_batch("ollama", "model-a", &[("sha".to_string(), vec![1.0])])
            .unwrap();

        assert!(cache.get("ollama", "model-b", "sha").unwrap().is_none());
        assert!(cache.get("openai", "model-a", "sha").unwrap().is_none());
    }

    #[test]
    fn test_get_batch_partial_hits() {
        let temp = tempdir().unwrap();
        let cache = open_cache(temp.path());

        cache
            .put_batch(
                "ollama",
                "m",
                &[
                    ("a".to_string(), vec![1.0]),
                    ("b".to_string(), vec![2.0]),
                ],
            )
            .unwrap();

        let hits = cache
            .get_batch(
                "ollama",
                "m",
                &["a".to_string(), "b".to_string(), "c".to_string()],
            )
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits["b"], vec![2.0]);
        assert!(!hits.contains_key("c"));
    }

    #[test]
    fn test_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("cache").join("embeddings.sqlite");

        {
            let cache = EmbeddingCache::open(&path).unwrap();
            cache
                .put_batch("openai", "m", &[("sha".to_string(), vec![0.5, 0.5])])
                .unwrap();
        }

        let cache = EmbeddingCache::open(&path).unwrap();
        assert_eq!(
            cache.get("openai", "m", "sha").unwrap(),
            Some(vec![0.5, 0.5])
        );
    }

    #[test]
    fn test_prune_caps_entries() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("embeddings.sqlite");
        let cache = EmbeddingCache::open_with_capacity(&path, 3).unwrap();

        let entries: Vec<(String, Vec<f32>)> =
            (0..10).map(|i| (format!("sha-{i}"), vec![i as f32])).collect();
        cache.put_batch("p", "m", &entries).unwrap();

        assert!(cache.len().unwrap() <= 3);
    }

    #[test]
    fn test_clear() {
        let temp = tempdir().unwrap();
        let cache = open_cache(temp.path());
        cache
            .put_batch("p", "m", &[("sha".to_string(), vec![1.0])])
            .unwrap();
        cache.clear().unwrap();
        assert!(cache.is_empty().unwrap());
    }
}
