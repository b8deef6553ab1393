// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sync engine: reconciles scanner output with the index store.
//!
//! Incremental syncs plan adds/updates/deletes per file, each committed in
//! its own transaction. Forced syncs rebuild everything through the store's
//! staging swap, so a provider failure mid-rebuild leaves the live index
//! byte-identical.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::chunker::{Chunk, Chunker};
use crate::embeddings::{EmbeddingCache, EmbeddingProvider};
use crate::error::MemoryError;
use crate::path_gate::PathGate;
use crate::scanner::{hash_file, ScannedFile, Scanner};
use crate::store::{FileMeta, IndexStore, StagedFile};
use crate::types::{SyncOptions, SyncReport};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Coordinates scanner, chunker, embeddings and the store for one Manager.
pub struct SyncEngine {
    gate: Arc<PathGate>,
    scanner: Scanner,
    chunker: Chunker,
    provider: Arc<dyn EmbeddingProvider>,
    cache: Option<Arc<EmbeddingCache>>,
    store: Arc<Mutex<IndexStore>>,
    vector_enabled: bool,
    max_in_flight: usize,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gate: Arc<PathGate>,
        scanner: Scanner,
        chunker: Chunker,
        provider: Arc<dyn EmbeddingProvider>,
        cache: Option<Arc<EmbeddingCache>>,
        store: Arc<Mutex<IndexStore>>,
        vector_enabled: bool,
        max_in_flight: usize,
    ) -> Self {
        Self {
            gate,
            scanner,
            chunker,
            provider,
            cache,
            store,
            vector_enabled,
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Run one sync. Callers serialize through the Manager's single-flight.
    pub async fn run(&self, opts: &SyncOptions) -> Result<SyncReport, MemoryError> {
        let start = Instant::now();
        let reason = opts.reason.as_deref().unwrap_or("manual");
        tracing::debug!(force = opts.force, reason, "sync started");

        // A model change dropped every vector; an incremental pass would see
        // unchanged files and never repopulate them.
        let mut force = opts.force;
        if !force && self.vector_enabled && self.store.lock().await.needs_reindex() {
            tracing::info!("stored vectors are stale, escalating to forced reindex");
            force = true;
        }

        let mut report = if force {
            self.run_forced(&opts.cancel).await?
        } else {
            self.run_incremental(&opts.cancel).await?
        };
        report.forced = force;
        report.duration_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            reason,
            force,
            files_indexed = report.files_indexed,
            files_unchanged = report.files_unchanged,
            files_deleted = report.files_deleted,
            chunks_indexed = report.chunks_indexed,
            chunks_embedded = report.chunks_embedded,
            vectors_reused = report.vectors_reused,
            duration_ms = report.duration_ms,
            "sync finished"
        );

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("memsearch.sync", start.elapsed());

        Ok(report)
    }

    async fn run_forced(&self, cancel: &CancellationToken) -> Result<SyncReport, MemoryError> {
        let mut report = SyncReport::default();
        let scanned = self.scanner.scan(&self.gate)?;

        // Chunk everything up front; the staging swap needs the whole batch.
        let mut prepared: Vec<(FileMeta, Vec<Chunk>)> = Vec::with_capacity(scanned.len());
        for file in &scanned {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }
            match self.read_and_chunk(file) {
                Some((meta, chunks)) => prepared.push((meta, chunks)),
                None => continue,
            }
        }

        let vectors = if self.vector_enabled {
            let wanted: Vec<(String, String)> = prepared
                .iter()
                .flat_map(|(_, chunks)| chunks.iter())
                .map(|c| (c.sha256.clone(), c.text.clone()))
                .collect();
            self.resolve_vectors(&wanted, &mut report, cancel).await?
        } else {
            HashMap::new()
        };

        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }

        let staged: Vec<StagedFile> = prepared
            .into_iter()
            .map(|(meta, chunks)| StagedFile {
                chunks: chunks
                    .into_iter()
                    .map(|chunk| {
                        let vector = vectors.get(&chunk.sha256).cloned();
                        (chunk, vector)
                    })
                    .collect(),
                meta,
            })
            .collect();

        report.files_indexed = staged.len() as u64;
        report.chunks_indexed = staged.iter().map(|f| f.chunks.len() as u64).sum();

        let mut store = self.store.lock().await;
        store.replace_all(&staged)?;
        store.touch_last_synced()?;
        Ok(report)
    }

    async fn run_incremental(&self, cancel: &CancellationToken) -> Result<SyncReport, MemoryError> {
        let mut report = SyncReport::default();
        let scanned = self.scanner.scan(&self.gate)?;
        let records = { self.store.lock().await.file_records()? };

        // Deletions first: anything in the store that the scan no longer saw.
        let scanned_paths: std::collections::HashSet<&str> =
            scanned.iter().map(|f| f.rel_path.as_str()).collect();
        for rel_path in records.keys() {
            if !scanned_paths.contains(rel_path.as_str()) {
                tracing::debug!(path = %rel_path, "file removed, deleting from index");
                self.store.lock().await.delete_file(rel_path)?;
                report.files_deleted += 1;
            }
        }

        for file in &scanned {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }

            if let Some(record) = records.get(&file.rel_path) {
                // Cheap check first: identical (mtime, size) means untouched.
                if record.mtime_ns == file.mtime_ns && record.size_bytes == file.size_bytes {
                    report.files_unchanged += 1;
                    continue;
                }
                let sha = match hash_file(&file.abs_path) {
                    Ok(sha) => sha,
                    Err(err) => {
                        tracing::warn!(path = %file.rel_path, error = %err, "hash failed, skipping");
                        continue;
                    }
                };
                if sha == record.file_sha256 {
                    // Touched but not modified; refresh the metadata row only.
                    let meta = self.file_meta(file, sha);
                    self.store.lock().await.upsert_file(&meta)?;
                    report.files_unchanged += 1;
                    continue;
                }
                tracing::debug!(path = %file.rel_path, "file modified, reindexing");
                self.index_file(file, sha, &mut report, cancel).await?;
            } else {
                tracing::debug!(path = %file.rel_path, "file added, indexing");
                let sha = match hash_file(&file.abs_path) {
                    Ok(sha) => sha,
                    Err(err) => {
                        tracing::warn!(path = %file.rel_path, error = %err, "hash failed, skipping");
                        continue;
                    }
                };
                self.index_file(file, sha, &mut report, cancel).await?;
            }
        }

        self.store.lock().await.touch_last_synced()?;
        Ok(report)
    }

    /// Chunk, embed (cache first) and commit one file in its own transaction.
    async fn index_file(
        &self,
        file: &ScannedFile,
        sha: String,
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<(), MemoryError> {
        let text = match std::fs::read_to_string(&file.abs_path) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(path = %file.rel_path, error = %err, "read failed, skipping");
                return Ok(());
            }
        };
        let chunks = self.chunker.chunk(&text);

        let vectors = if self.vector_enabled {
            let wanted: Vec<(String, String)> = chunks
                .iter()
                .map(|c| (c.sha256.clone(), c.text.clone()))
                .collect();
            self.resolve_vectors(&wanted, report, cancel).await?
        } else {
            HashMap::new()
        };

        let pairs: Vec<(Chunk, Option<Vec<f32>>)> = chunks
            .into_iter()
            .map(|chunk| {
                let vector = vectors.get(&chunk.sha256).cloned();
                (chunk, vector)
            })
            .collect();

        let meta = self.file_meta(file, sha);
        self.store.lock().await.replace_file_rows(&meta, &pairs)?;
        report.files_indexed += 1;
        report.chunks_indexed += pairs.len() as u64;
        Ok(())
    }

    /// Resolve vectors for `(chunkSha, text)` pairs: embedding cache first,
    /// then provider batches with bounded fan-out.
    async fn resolve_vectors(
        &self,
        wanted: &[(String, String)],
        report: &mut SyncReport,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Vec<f32>>, MemoryError> {
        // Dedup by chunk sha; identical content embeds once.
        let mut unique: Vec<(String, String)> = Vec::new();
        {
            let mut seen = std::collections::HashSet::new();
            for (sha, text) in wanted {
                if seen.insert(sha.as_str()) {
                    unique.push((sha.clone(), text.clone()));
                }
            }
        }

        let mut resolved: HashMap<String, Vec<f32>> = HashMap::new();
        let provider_id = self.provider.provider_id().to_string();
        let model_id = self.provider.model().to_string();

        if let Some(cache) = &self.cache {
            let shas: Vec<String> = unique.iter().map(|(sha, _)| sha.clone()).collect();
            let hits = cache.get_batch(&provider_id, &model_id, &shas)?;
            report.vectors_reused += hits.len() as u64;
            resolved.extend(hits);
        }

        let missing: Vec<(String, String)> = unique
            .into_iter()
            .filter(|(sha, _)| !resolved.contains_key(sha))
            .collect();
        if missing.is_empty() {
            return Ok(resolved);
        }
        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let batch_size = self.provider.max_batch().max(1);
        let mut handles = Vec::new();

        for batch in missing.chunks(batch_size) {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            let shas: Vec<String> = batch.iter().map(|(sha, _)| sha.clone()).collect();
            let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let vectors = provider.embed_batch(&texts).await?;
                Ok::<_, crate::error::ProviderError>((shas, vectors))
            }));
        }

        let mut fresh: Vec<(String, Vec<f32>)> = Vec::new();
        let mut first_error: Option<MemoryError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok((shas, vectors))) => {
                    if vectors.len() != shas.len() {
                        first_error.get_or_insert(MemoryError::Provider(
                            crate::error::ProviderError::RequestFailed(format!(
                                "expected {} embeddings, got {}",
                                shas.len(),
                                vectors.len()
                            )),
                        ));
                        continue;
                    }
                    for (sha, vector) in shas.into_iter().zip(vectors) {
                        fresh.push((sha, vector));
                    }
                }
                Ok(Err(err)) => {
                    first_error.get_or_insert(MemoryError::Provider(err));
                }
                Err(err) => {
                    first_error
                        .get_or_insert(MemoryError::Io(format!("embedding task failed: {}", err)));
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        report.chunks_embedded += fresh.len() as u64;
        if let Some(cache) = &self.cache {
            cache.put_batch(&provider_id, &model_id, &fresh)?;
        }
        resolved.extend(fresh);
        Ok(resolved)
    }

    fn read_and_chunk(&self, file: &ScannedFile) -> Option<(FileMeta, Vec<Chunk>)> {
        let sha = match hash_file(&file.abs_path) {
            Ok(sha) => sha,
            Err(err) => {
                tracing::warn!(path = %file.rel_path, error = %err, "hash failed, skipping");
                return None;
            }
        };
        let text = match std::fs::read_to_string(&file.abs_path) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(path = %file.rel_path, error = %err, "read failed, skipping");
                return None;
            }
        };
        Some((self.file_meta(file, sha), self.chunker.chunk(&text)))
    }

    fn file_meta(&self, file: &ScannedFile, sha: String) -> FileMeta {
        FileMeta {
            rel_path: file.rel_path.clone(),
            source: file.source,
            mtime_ns: file.mtime_ns,
            size_bytes: file.size_bytes,
            file_sha256: sha,
        }
    }
}
