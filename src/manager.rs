// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Manager facade: wires the components together and exposes the public
//! surface (`sync`, `search`, `read_file`, `status`,
//! `probe_vector_availability`, `close`).
//!
//! Writers are serialized through a single-flight slot: concurrent `sync`
//! callers join the in-flight run and share its result. A `force` caller
//! that joins a non-force run waits for it, then starts its own forced run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::Mutex;

use crate::config::MemorySearchConfig;
use crate::embeddings::{create_embedding_provider, EmbeddingCache, EmbeddingProvider};
use crate::error::MemoryError;
use crate::path_gate::PathGate;
use crate::scanner::Scanner;
use crate::search::QueryPlanner;
use crate::store::IndexStore;
use crate::sync::SyncEngine;
use crate::types::{
    FtsStatus, SearchHit, SearchOptions, StatusReport, SyncOptions, SyncReport, VectorStatus,
};
use crate::chunker::Chunker;

type SharedSyncResult = Result<SyncReport, Arc<MemoryError>>;
type SharedSyncFuture = Shared<BoxFuture<'static, SharedSyncResult>>;

#[derive(Clone)]
struct SyncFlight {
    id: u64,
    forced: bool,
    future: SharedSyncFuture,
}

/// The memory search index facade.
pub struct MemorySearchManager {
    config: MemorySearchConfig,
    gate: Arc<PathGate>,
    store: Arc<Mutex<IndexStore>>,
    engine: Arc<SyncEngine>,
    planner: QueryPlanner,
    flight: Mutex<Option<SyncFlight>>,
    flight_counter: AtomicU64,
    closed: AtomicBool,
}

impl MemorySearchManager {
    /// Validate the configuration and open (or migrate) the store.
    pub async fn new(config: MemorySearchConfig) -> Result<Self, MemoryError> {
        let provider = create_embedding_provider(&config)?;
        Self::with_provider(config, provider).await
    }

    /// Like [`Self::new`], but with a caller-supplied embedding provider.
    pub async fn with_provider(
        config: MemorySearchConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, MemoryError> {
        config.validate()?;

        let gate = Arc::new(PathGate::new(
            &config.workspace,
            &config.extra_paths,
            config.scan.max_file_bytes,
        ));
        let scanner = Scanner::new(&config.scan)?;
        let chunker = Chunker::new(&config.chunk);

        let cache = if config.cache.enabled {
            let cache_path = config.store.path.join("cache").join("embeddings.sqlite");
            Some(Arc::new(EmbeddingCache::open(&cache_path)?))
        } else {
            None
        };

        let fingerprint = format!("{}/{}", provider.provider_id(), provider.model());
        let store = IndexStore::open_or_migrate(&config.store.path, &fingerprint)?;
        let store = Arc::new(Mutex::new(store));

        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&gate),
            scanner,
            chunker,
            Arc::clone(&provider),
            cache,
            Arc::clone(&store),
            config.store.vector.enabled,
            config.sync.max_in_flight,
        ));
        let planner = QueryPlanner::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            config.query.clone(),
            config.store.vector.enabled,
        );

        Ok(Self {
            config,
            gate,
            store,
            engine,
            planner,
            flight: Mutex::new(None),
            flight_counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MemorySearchConfig {
        &self.config
    }

    /// Synchronize the index with the file tree.
    ///
    /// Concurrent callers coalesce into one in-flight run; everyone gets the
    /// same result. On failure the live index is preserved.
    pub async fn sync(&self, opts: SyncOptions) -> Result<SyncReport, MemoryError> {
        self.ensure_open()?;

        loop {
            let existing = { self.flight.lock().await.clone() };
            if let Some(flight) = existing {
                let joined = flight.future.clone().await;
                if opts.force && !flight.forced {
                    // A force caller never settles for a non-force run:
                    // wait it out, then start the forced pass.
                    tokio::task::yield_now().await;
                    continue;
                }
                return unshare(joined);
            }

            let mut slot = self.flight.lock().await;
            if slot.is_some() {
                // Lost the race; join whatever just started.
                drop(slot);
                tokio::task::yield_now().await;
                continue;
            }

            let id = self.flight_counter.fetch_add(1, Ordering::SeqCst);
            let engine = Arc::clone(&self.engine);
            let run_opts = opts.clone();
            let handle = tokio::spawn(async move { engine.run(&run_opts).await });
            let future: SharedSyncFuture = async move {
                match handle.await {
                    Ok(result) => result.map_err(Arc::new),
                    Err(err) => Err(Arc::new(MemoryError::Io(format!(
                        "sync task failed: {}",
                        err
                    )))),
                }
            }
            .boxed()
            .shared();

            *slot = Some(SyncFlight {
                id,
                forced: opts.force,
                future: future.clone(),
            });
            drop(slot);

            let result = future.await;

            let mut slot = self.flight.lock().await;
            if slot.as_ref().map(|f| f.id) == Some(id) {
                *slot = None;
            }
            return unshare(result);
        }
    }

    /// Search the index for passages matching a natural-language query.
    pub async fn search(
        &self,
        query: &str,
        opts: SearchOptions,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        self.ensure_open()?;

        if self.config.sync.on_search {
            let sync_opts = SyncOptions {
                reason: Some("on-search".to_string()),
                cancel: opts.cancel.clone(),
                ..Default::default()
            };
            if let Err(err) = self.sync(sync_opts).await {
                if matches!(err, MemoryError::Cancelled) {
                    return Err(err);
                }
                tracing::warn!(error = %err, "on-search sync failed, searching stale index");
            }
        }

        self.planner.search(query, &opts).await
    }

    /// Read a file through the path gate.
    ///
    /// Only memory files (under `memory/`, or the top-level sentinel) and
    /// files under extra roots are served; plain workspace files are indexed
    /// for search but not readable through this surface.
    pub async fn read_file(&self, rel_path: &str) -> Result<String, MemoryError> {
        self.ensure_open()?;
        let resolved = self.gate.resolve(rel_path)?;
        let source = crate::scanner::classify_source(resolved.root_kind, &resolved.rel);
        if source == crate::types::SourceKind::Workspace {
            return Err(MemoryError::PathDenied(rel_path.to_string()));
        }
        tokio::fs::read_to_string(&resolved.abs)
            .await
            .map_err(MemoryError::from)
    }

    /// Snapshot index counts and subsystem availability.
    pub async fn status(&self) -> Result<StatusReport, MemoryError> {
        self.ensure_open()?;
        let store = self.store.lock().await;
        Ok(StatusReport {
            files: store.count_files()?,
            chunks: store.count_chunks()?,
            source_counts: store.source_counts()?,
            vector: VectorStatus {
                enabled: self.config.store.vector.enabled,
                available: store.vec_available(),
            },
            fts: FtsStatus {
                available: store.fts_available(),
            },
            last_synced_at: store.last_synced_at()?,
            embedding_model: store.fingerprint().to_string(),
            index_size_bytes: store.size_bytes(),
        })
    }

    /// Whether the native vector extension was detected at open time.
    pub async fn probe_vector_availability(&self) -> bool {
        self.store.lock().await.vec_available()
    }

    /// Flush and refuse further operations.
    pub async fn close(&self) -> Result<(), MemoryError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let store = self.store.lock().await;
        store.checkpoint()
    }

    fn ensure_open(&self) -> Result<(), MemoryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MemoryError::Io("manager is closed".to_string()));
        }
        Ok(())
    }
}

/// Clone a shared sync outcome back into an owned error.
fn unshare(result: SharedSyncResult) -> Result<SyncReport, MemoryError> {
    result.map_err(|err| clone_error(&err))
}

fn clone_error(err: &MemoryError) -> MemoryError {
    match err {
        MemoryError::ConfigInvalid(msg) => MemoryError::ConfigInvalid(msg.clone()),
        MemoryError::PathDenied(msg) => MemoryError::PathDenied(msg.clone()),
        MemoryError::Io(msg) => MemoryError::Io(msg.clone()),
        MemoryError::StoreCorrupt(msg) => MemoryError::StoreCorrupt(msg.clone()),
        MemoryError::Provider(inner) => MemoryError::Provider(inner.clone()),
        MemoryError::Cancelled => MemoryError::Cancelled,
    }
}
