// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Query planner: hybrid vector + keyword retrieval with weighted fusion.
//!
//! Vector scores are normalized from cosine `[-1, 1]` to `[0, 1]`; keyword
//! scores are min-max normalized over the returned batch. A failing or
//! information-free query embedding degrades to keyword-only ranking, and a
//! missing FTS index degrades to vector-only; both failing yields an empty
//! result, never an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::config::QueryConfig;
use crate::embeddings::EmbeddingProvider;
use crate::error::MemoryError;
use crate::store::IndexStore;
use crate::types::{SearchHit, SearchOptions};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

/// Executes search queries against the store.
pub struct QueryPlanner {
    store: Arc<Mutex<IndexStore>>,
    provider: Arc<dyn EmbeddingProvider>,
    config: QueryConfig,
    vector_enabled: bool,
}

impl QueryPlanner {
    pub fn new(
        store: Arc<Mutex<IndexStore>>,
        provider: Arc<dyn EmbeddingProvider>,
        config: QueryConfig,
        vector_enabled: bool,
    ) -> Self {
        Self {
            store,
            provider,
            config,
            vector_enabled,
        }
    }

    /// Run one search.
    pub async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let start = Instant::now();

        let max_results = opts.max_results.unwrap_or(self.config.max_results).max(1);
        let min_score = opts.min_score.unwrap_or(self.config.min_score);
        let k = max_results * self.config.hybrid.candidate_multiplier.max(1);

        if opts.cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }

        // Query embedding failures are a soft signal, not a caller error.
        let query_vec = if self.vector_enabled {
            match self.provider.embed_query(query).await {
                Ok(vector) if vector.iter().any(|v| *v != 0.0) => Some(vector),
                Ok(_) => {
                    tracing::debug!("query embedding is all zeros, skipping vector side");
                    None
                }
                Err(err) => {
                    tracing::warn!(error = %err, "query embedding failed, falling back to keyword search");
                    None
                }
            }
        } else {
            None
        };

        if opts.cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }

        let store = self.store.lock().await;
        let fts_available = store.fts_available();

        let vector_hits = match &query_vec {
            Some(vector) => store.vector_search(vector, k)?,
            None => Vec::new(),
        };

        // Keyword side runs when hybrid is on, and also as the fallback
        // ranking when the vector side produced nothing.
        let run_text = fts_available && (self.config.hybrid.enabled || query_vec.is_none());
        let text_hits = if run_text {
            store.text_search(query, k)?
        } else {
            Vec::new()
        };

        let (vector_weight, text_weight) = self.weights(query_vec.is_some());
        let fused = fuse(
            &vector_hits,
            &text_hits,
            vector_weight,
            text_weight,
            min_score,
            max_results,
        );

        let mut hits = Vec::with_capacity(fused.len());
        for (chunk_id, score) in fused {
            if let Some(context) = store.load_chunk_context(chunk_id)? {
                hits.push(SearchHit {
                    path: context.rel_path,
                    source: context.source,
                    byte_offset: context.byte_offset,
                    text: context.text,
                    score,
                });
            }
        }

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("memsearch.search", start.elapsed());
        #[cfg(not(feature = "telemetry"))]
        let _ = start;

        Ok(hits)
    }

    /// Effective fusion weights for this query.
    fn weights(&self, have_query_vec: bool) -> (f32, f32) {
        if !have_query_vec {
            // Keyword-only fallback ranking.
            return (0.0, 1.0);
        }
        if self.config.hybrid.enabled {
            (
                self.config.hybrid.vector_weight,
                self.config.hybrid.text_weight,
            )
        } else {
            (1.0, 0.0)
        }
    }
}

/// Fuse the two candidate lists with weighted normalized scores.
///
/// Vector scores arrive as cosine in `[-1, 1]` and are mapped to `[0, 1]`;
/// text scores are min-max normalized over the batch. A chunk missing from a
/// side contributes 0 for that side.
fn fuse(
    vector_hits: &[(i64, f32)],
    text_hits: &[(i64, f32)],
    vector_weight: f32,
    text_weight: f32,
    min_score: f32,
    max_results: usize,
) -> Vec<(i64, f32)> {
    let mut sides: HashMap<i64, (f32, f32)> = HashMap::new();

    for (chunk_id, cosine) in vector_hits {
        let normalized = (cosine + 1.0) / 2.0;
        let entry = sides.entry(*chunk_id).or_insert((0.0, 0.0));
        entry.0 = entry.0.max(normalized);
    }

    if !text_hits.is_empty() {
        let max = text_hits.iter().map(|(_, s)| *s).fold(f32::MIN, f32::max);
        let min = text_hits.iter().map(|(_, s)| *s).fold(f32::MAX, f32::min);
        let range = max - min;
        for (chunk_id, raw) in text_hits {
            let normalized = if range > 0.0 { (raw - min) / range } else { 1.0 };
            let entry = sides.entry(*chunk_id).or_insert((0.0, 0.0));
            entry.1 = entry.1.max(normalized);
        }
    }

    let mut fused: Vec<(i64, f32)> = sides
        .into_iter()
        .map(|(chunk_id, (v, t))| (chunk_id, vector_weight * v + text_weight * t))
        .filter(|(_, score)| *score >= min_score)
        .collect();

    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    fused.truncate(max_results);
    fused
}
