use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::catalog::{init_db, CatalogStats, EntityStore, StoreError};
use crate::config::Config;
use crate::embeddings::{model_id_hash, ClipEmbedder, EmbeddingProvider};
use crate::index::{Modality, ServingIndexes, SnapshotSpec};
use crate::indexer::Indexer;
use crate::search::QueryRouter;

/// Long-lived handles of one process: catalog, served indices and the
/// embedding provider. Built once at startup and passed to whatever needs them.
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub store: EntityStore,
    pub indexes: Arc<ServingIndexes>,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

impl AppContext {
    /// Open the catalog and the snapshot files and load the embedding models.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let store = open_catalog(&config).await?;
        let embedder = ClipEmbedder::new(&config.embedding, config.models_dir())
            .context("failed to load embedding models")?;

        Self::with_embedder(config, store, Arc::new(embedder))
    }

    /// Assemble a context around an existing store and provider.
    pub fn with_embedder(
        config: Config,
        store: EntityStore,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> anyhow::Result<Self> {
        let indexes = open_indexes(&config)?;

        Ok(Self {
            config,
            store,
            indexes: Arc::new(indexes),
            embedder,
        })
    }

    pub fn router(&self) -> QueryRouter {
        QueryRouter::new(
            self.embedder.clone(),
            self.indexes.clone(),
            self.store.clone(),
            self.config.search.clone(),
        )
    }

    pub fn indexer(&self) -> Indexer {
        Indexer::new(
            self.store.clone(),
            self.embedder.clone(),
            self.indexes.clone(),
        )
    }
}

pub async fn open_catalog(config: &Config) -> anyhow::Result<EntityStore> {
    let path = config.database_path();
    let db = init_db(&path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;

    Ok(EntityStore::new(db))
}

pub fn open_indexes(config: &Config) -> anyhow::Result<ServingIndexes> {
    ServingIndexes::open(&config.index_dir(), snapshot_spec(config))
        .context("failed to load index snapshots")
}

pub fn snapshot_spec(config: &Config) -> SnapshotSpec {
    SnapshotSpec {
        model_id: model_id_hash(&config.embedding),
        dimensions: config.embedding.dimensions,
        metric: config.search.metric,
    }
}

/// Served index sizes and catalog counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub image_rows: usize,
    pub text_rows: usize,
    pub catalog: CatalogStats,
}

pub async fn collect_status(
    store: &EntityStore,
    indexes: &ServingIndexes,
) -> Result<Status, StoreError> {
    Ok(Status {
        image_rows: indexes.get(Modality::Image).len(),
        text_rows: indexes.get(Modality::Text).len(),
        catalog: store.stats().await?,
    })
}
