// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end scenarios for the memory search manager, driven by a
//! deterministic hashed bag-of-words embedding provider so no network is
//! involved.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use memsearch::{
    EmbeddingProvider, MemoryError, MemorySearchConfig, MemorySearchManager, ProviderError,
    ProviderKind, SearchOptions, SourceKind, StoreConfig, SyncOptions, VectorConfig,
};

const DIM: usize = 256;

/// Deterministic embedding provider: tokens hashed into buckets.
struct HashEmbedder {
    model: String,
    batch_calls: AtomicU64,
    fail: AtomicBool,
}

impl HashEmbedder {
    fn new(model: &str) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            batch_calls: AtomicU64::new(0),
            fail: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> u64 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn embed_text(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; DIM];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = (fnv1a(&token.to_lowercase()) % DIM as u64) as usize;
            vector[bucket] += 1.0;
        }
        vector
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn provider_id(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        DIM
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::RequestFailed(
                "connection reset by peer".to_string(),
            ));
        }
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::embed_text(t)).collect())
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

fn test_config(workspace: &Path, store: &Path) -> MemorySearchConfig {
    MemorySearchConfig {
        workspace: workspace.to_path_buf(),
        provider: ProviderKind::Ollama,
        model: None,
        store: StoreConfig {
            path: store.to_path_buf(),
            vector: VectorConfig::default(),
        },
        sync: Default::default(),
        query: Default::default(),
        cache: Default::default(),
        scan: Default::default(),
        chunk: Default::default(),
        extra_paths: vec![],
        providers: HashMap::new(),
    }
}

/// Workspace from scenario S1: a dated memory log plus the MEMORY.md sentinel.
fn write_s1_workspace(workspace: &Path) {
    write(
        workspace,
        "memory/2026-01-12.md",
        "# Log\nAlpha memory line.\nZebra memory line.\nAnother line.\n",
    );
    write(workspace, "MEMORY.md", "Beta knowledge base entry.\n");
}

async fn s1_manager() -> (TempDir, TempDir, Arc<HashEmbedder>, MemorySearchManager) {
    let workspace = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write_s1_workspace(workspace.path());

    let provider = HashEmbedder::new("model-a");
    let manager = MemorySearchManager::with_provider(
        test_config(workspace.path(), store.path()),
        provider.clone(),
    )
    .await
    .unwrap();
    (workspace, store, provider, manager)
}

#[tokio::test]
async fn s1_search_finds_memory_log() {
    let (_ws, _store, _provider, manager) = s1_manager().await;
    manager.sync(SyncOptions::forced()).await.unwrap();

    let hits = manager
        .search("alpha", SearchOptions::default())
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(
        hits.iter().any(|h| h.path.contains("memory/2026-01-12.md")),
        "expected the dated memory log among: {:?}",
        hits.iter().map(|h| &h.path).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn s2_status_source_counts_match_totals() {
    let (_ws, _store, _provider, manager) = s1_manager().await;
    manager.sync(SyncOptions::forced()).await.unwrap();

    let status = manager.status().await.unwrap();
    assert_eq!(status.files, 2);
    assert!(status.chunks >= 2);
    assert!(status.last_synced_at.is_some());
    assert_eq!(status.embedding_model, "mock/model-a");

    let memory = status
        .source_counts
        .iter()
        .find(|c| c.source == SourceKind::Memory)
        .expect("memory source entry");
    assert_eq!(memory.files, status.files);
    assert_eq!(memory.chunks, status.chunks);
}

#[tokio::test]
async fn s3_forced_reindex_preserves_index_on_provider_failure() {
    let (workspace, store, provider, manager) = s1_manager().await;
    manager.sync(SyncOptions::forced()).await.unwrap();

    // A new file guarantees at least one cache miss on the next rebuild.
    write(workspace.path(), "memory/fresh.md", "Fresh unseen content line.\n");
    provider.set_fail(true);

    let before = serde_json::to_value(manager.status().await.unwrap()).unwrap();
    let err = manager.sync(SyncOptions::forced()).await.unwrap_err();
    assert!(
        matches!(
            err,
            MemoryError::Provider(ProviderError::RequestFailed(_))
        ),
        "unexpected error: {err}"
    );

    let after = serde_json::to_value(manager.status().await.unwrap()).unwrap();
    assert_eq!(before, after, "failed forced reindex must not change status");

    // No stray temp files under the store directory.
    for entry in walkdir::WalkDir::new(store.path()) {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy();
        assert!(!name.contains(".tmp-"), "unexpected temp file: {name}");
    }
}

#[tokio::test]
async fn cache_reuse_second_forced_sync_issues_no_embedding_calls() {
    let (_ws, _store, provider, manager) = s1_manager().await;
    manager.sync(SyncOptions::forced()).await.unwrap();
    let calls_after_first = provider.calls();
    assert!(calls_after_first > 0);

    manager.sync(SyncOptions::forced()).await.unwrap();
    assert_eq!(
        provider.calls(),
        calls_after_first,
        "warm forced reindex must be served from the embedding cache"
    );
}

#[tokio::test]
async fn s4_hybrid_weights_control_ranking() {
    let workspace = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write(
        workspace.path(),
        "vector-only.md",
        "Alpha beta. Alpha beta. Alpha beta. Alpha beta.\n",
    );
    let keyword_content = format!("{}beta id123.\n", "Alpha ".repeat(200));
    write(workspace.path(), "keyword-only.md", &keyword_content);

    let provider = HashEmbedder::new("model-a");

    let score_of = |hits: &[memsearch::SearchHit], path: &str| -> f32 {
        hits.iter()
            .find(|h| h.path.contains(path))
            .unwrap_or_else(|| panic!("missing {path} in {:?}", hits.iter().map(|h| &h.path).collect::<Vec<_>>()))
            .score
    };

    // Vector-dominant weights rank the semantically-close file first.
    let mut config = test_config(workspace.path(), store.path());
    config.query.hybrid.vector_weight = 0.99;
    config.query.hybrid.text_weight = 0.01;
    config.query.hybrid.candidate_multiplier = 10;
    let manager = MemorySearchManager::with_provider(config, provider.clone())
        .await
        .unwrap();
    manager.sync(SyncOptions::forced()).await.unwrap();
    let hits = manager
        .search("alpha beta id123", SearchOptions::default())
        .await
        .unwrap();
    assert!(score_of(&hits, "vector-only.md") > score_of(&hits, "keyword-only.md"));
    manager.close().await.unwrap();
    drop(manager);

    // Swapping the weights inverts the order.
    let mut config = test_config(workspace.path(), store.path());
    config.query.hybrid.vector_weight = 0.01;
    config.query.hybrid.text_weight = 0.99;
    config.query.hybrid.candidate_multiplier = 10;
    let manager = MemorySearchManager::with_provider(config, provider)
        .await
        .unwrap();
    let hits = manager
        .search("alpha beta id123", SearchOptions::default())
        .await
        .unwrap();
    assert!(score_of(&hits, "keyword-only.md") > score_of(&hits, "vector-only.md"));
}

#[tokio::test]
async fn s5_query_embedding_failure_falls_back_to_keywords() {
    let (_ws, _store, provider, manager) = s1_manager().await;
    manager.sync(SyncOptions::forced()).await.unwrap();

    provider.set_fail(true);
    let hits = manager
        .search("zebra", SearchOptions::default())
        .await
        .unwrap();
    assert!(
        hits.iter().any(|h| h.path.contains("memory/2026-01-12.md")),
        "keyword fallback should still find the zebra line"
    );
}

#[tokio::test]
async fn s6_read_file_is_gated() {
    let workspace = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let extra = TempDir::new().unwrap();
    write_s1_workspace(workspace.path());
    write(workspace.path(), "NOTES.md", "workspace-only notes\n");
    write(extra.path(), "inner.md", "extra root content\n");
    #[cfg(unix)]
    std::os::unix::fs::symlink(extra.path().join("inner.md"), extra.path().join("alias.md"))
        .unwrap();

    let mut config = test_config(workspace.path(), store.path());
    config.extra_paths = vec![extra.path().to_path_buf()];
    let manager = MemorySearchManager::with_provider(config, HashEmbedder::new("model-a"))
        .await
        .unwrap();

    // Memory and extra files are served.
    let content = manager.read_file("memory/2026-01-12.md").await.unwrap();
    assert!(content.contains("Alpha memory line."));
    assert!(manager.read_file("inner.md").await.is_ok());

    // Workspace files outside memory/, escapes and symlinks are refused.
    assert!(matches!(
        manager.read_file("NOTES.md").await,
        Err(MemoryError::PathDenied(_))
    ));
    assert!(matches!(
        manager.read_file("../outside.md").await,
        Err(MemoryError::PathDenied(_))
    ));
    #[cfg(unix)]
    assert!(matches!(
        manager.read_file("alias.md").await,
        Err(MemoryError::PathDenied(_))
    ));
}

#[tokio::test]
async fn model_change_drops_vectors_and_next_sync_repopulates() {
    let workspace = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write_s1_workspace(workspace.path());

    {
        let manager = MemorySearchManager::with_provider(
            test_config(workspace.path(), store.path()),
            HashEmbedder::new("model-a"),
        )
        .await
        .unwrap();
        manager.sync(SyncOptions::forced()).await.unwrap();
        manager.close().await.unwrap();
    }

    // Same store, different model: vectors are stale and must be rebuilt.
    let provider = HashEmbedder::new("model-b");
    let manager = MemorySearchManager::with_provider(
        test_config(workspace.path(), store.path()),
        provider.clone(),
    )
    .await
    .unwrap();

    let report = manager.sync(SyncOptions::default()).await.unwrap();
    assert!(report.forced, "model change should escalate to a forced pass");
    assert!(provider.calls() > 0, "new model must re-embed");

    let hits = manager
        .search("alpha", SearchOptions::default())
        .await
        .unwrap();
    assert!(hits.iter().any(|h| h.path.contains("memory/2026-01-12.md")));
    let status = manager.status().await.unwrap();
    assert_eq!(status.embedding_model, "mock/model-b");
}

#[tokio::test]
async fn incremental_sync_tracks_adds_updates_deletes() {
    let (workspace, _store, _provider, manager) = s1_manager().await;
    let first = manager.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(first.files_indexed, 2);
    assert_eq!(first.files_deleted, 0);

    // Unchanged tree: nothing to do.
    let second = manager.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(second.files_indexed, 0);
    assert_eq!(second.files_unchanged, 2);

    // One add, one delete.
    write(workspace.path(), "memory/new.md", "Gamma note line.\n");
    std::fs::remove_file(workspace.path().join("MEMORY.md")).unwrap();
    let third = manager.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(third.files_indexed, 1);
    assert_eq!(third.files_deleted, 1);

    let hits = manager
        .search("gamma", SearchOptions::default())
        .await
        .unwrap();
    assert!(hits.iter().any(|h| h.path.contains("memory/new.md")));
    let hits = manager
        .search("beta knowledge", SearchOptions::default())
        .await
        .unwrap();
    assert!(!hits.iter().any(|h| h.path.contains("MEMORY.md")));
}

#[tokio::test]
async fn zero_information_query_returns_empty_without_error() {
    let (_ws, _store, _provider, manager) = s1_manager().await;
    manager.sync(SyncOptions::forced()).await.unwrap();

    // No alphanumeric tokens: zero query vector and no FTS tokens.
    let hits = manager
        .search("!!! ??? ***", SearchOptions::default())
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn vector_disabled_runs_without_provider() {
    let workspace = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    write_s1_workspace(workspace.path());

    let provider = HashEmbedder::new("model-a");
    provider.set_fail(true); // would error if the sync ever embedded

    let mut config = test_config(workspace.path(), store.path());
    config.store.vector.enabled = false;
    let manager = MemorySearchManager::with_provider(config, provider.clone())
        .await
        .unwrap();

    manager.sync(SyncOptions::forced()).await.unwrap();
    assert_eq!(provider.calls(), 0);

    let status = manager.status().await.unwrap();
    assert!(!status.vector.enabled);

    // Keyword-only ranking still answers.
    let hits = manager
        .search("zebra", SearchOptions::default())
        .await
        .unwrap();
    assert!(hits.iter().any(|h| h.path.contains("memory/2026-01-12.md")));
}

#[tokio::test]
async fn concurrent_syncs_coalesce() {
    let (_ws, _store, _provider, manager) = s1_manager().await;
    let manager = Arc::new(manager);

    let a = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.sync(SyncOptions::default()).await })
    };
    let b = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.sync(SyncOptions::default()).await })
    };

    let (a, b) = tokio::join!(a, b);
    assert!(a.unwrap().is_ok());
    assert!(b.unwrap().is_ok());
}

#[tokio::test]
async fn close_refuses_further_operations() {
    let (_ws, _store, _provider, manager) = s1_manager().await;
    manager.sync(SyncOptions::forced()).await.unwrap();
    manager.close().await.unwrap();

    assert!(manager.status().await.is_err());
    assert!(manager
        .search("alpha", SearchOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn search_hits_carry_context() {
    let (_ws, _store, _provider, manager) = s1_manager().await;
    manager.sync(SyncOptions::forced()).await.unwrap();

    let hits = manager
        .search("alpha memory", SearchOptions::default())
        .await
        .unwrap();
    let hit = hits
        .iter()
        .find(|h| h.path.contains("memory/2026-01-12.md"))
        .unwrap();
    assert_eq!(hit.source, SourceKind::Memory);
    assert!(hit.text.contains("Alpha memory line."));
    assert!(hit.score > 0.0 && hit.score <= 1.0);
}

#[tokio::test]
async fn probe_vector_availability_reports_extension() {
    let (_ws, _store, _provider, manager) = s1_manager().await;
    // sqlite-vec is statically registered, so the probe should succeed.
    assert!(manager.probe_vector_availability().await);
    let status = manager.status().await.unwrap();
    assert!(status.vector.available);
    assert!(status.fts.available);
}
