//! Service wiring shared by every command.
//!
//! One [`Services`] value holds the connected stores, the queue, and the
//! pluggable backends (blob storage, embedder). Commands build it once from
//! config; tests assemble it over a temp database with synthetic backends.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::blob::{self, BlobStore};
use crate::collections::CollectionManager;
use crate::config::Config;
use crate::db;
use crate::embedding::{Embedder, HttpEmbedder};
use crate::error::Result;
use crate::locks::LeaseStore;
use crate::metadata::MetadataStore;
use crate::progress::ProgressStore;
use crate::queue::Queue;
use crate::search::SearchEngine;

pub struct Services {
    pub config: Config,
    pub pool: SqlitePool,
    pub queue: Queue,
    pub locks: LeaseStore,
    pub progress: ProgressStore,
    pub metadata: MetadataStore,
    pub collections: Arc<CollectionManager>,
    pub search: SearchEngine,
    pub blob: Arc<dyn BlobStore>,
    pub embedder: Arc<dyn Embedder>,
}

impl Services {
    /// Connect everything from configuration.
    pub async fn connect(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        let blob = blob::from_config(&config.blob)?;
        let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(&config.embedding)?);
        Ok(Self::assemble(config, pool, blob, embedder))
    }

    /// Wire services over explicit backends. Used by tests to inject a temp
    /// database, a filesystem blob store, and a synthetic embedder.
    pub fn assemble(
        config: Config,
        pool: SqlitePool,
        blob: Arc<dyn BlobStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let queue = Queue::new(pool.clone(), config.queue.partitions);
        let locks = LeaseStore::new(pool.clone());
        let progress = ProgressStore::new(pool.clone(), config.queue.progress_ttl_secs);
        let metadata = MetadataStore::new(pool.clone());
        let collections = Arc::new(CollectionManager::new(
            pool.clone(),
            config.index.dim,
            config.index.ef_construction,
        ));
        let search = SearchEngine::new(collections.clone(), &config.search);
        Self {
            config,
            pool,
            queue,
            locks,
            progress,
            metadata,
            collections,
            search,
            blob,
            embedder,
        }
    }

    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}
