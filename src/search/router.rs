use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::EntityStore;
use crate::config::SearchConfig;
use crate::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::index::{Modality, ServingIndexes};
use crate::search::{AdResult, RawHits, ResultFinalizer, SearchAggregator, SearchError};

/// Raw query input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Text(String),
    /// Path of an image file.
    Image(PathBuf),
}

impl Query {
    pub fn modality(&self) -> Modality {
        match self {
            Query::Text(_) => Modality::Text,
            Query::Image(_) => Modality::Image,
        }
    }

    fn embed(&self, embedder: &dyn EmbeddingProvider) -> Result<Vec<f32>, EmbeddingError> {
        match self {
            Query::Text(text) => embedder.embed_text(text),
            Query::Image(path) => embedder.embed_image(path),
        }
    }
}

/// The four cross-modal search modes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    TextToImage,
    ImageToImage,
    ImageToText,
    TextToText,
}

impl SearchMode {
    pub const ALL: [SearchMode; 4] = [
        SearchMode::TextToImage,
        SearchMode::ImageToImage,
        SearchMode::ImageToText,
        SearchMode::TextToText,
    ];

    /// Modality of the query input.
    pub fn query_modality(self) -> Modality {
        match self {
            SearchMode::TextToImage | SearchMode::TextToText => Modality::Text,
            SearchMode::ImageToImage | SearchMode::ImageToText => Modality::Image,
        }
    }

    /// Index searched.
    pub fn target(self) -> Modality {
        match self {
            SearchMode::TextToImage | SearchMode::ImageToImage => Modality::Image,
            SearchMode::ImageToText | SearchMode::TextToText => Modality::Text,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SearchMode::TextToImage => "text-to-image",
            SearchMode::ImageToImage => "image-to-image",
            SearchMode::ImageToText => "image-to-text",
            SearchMode::TextToText => "text-to-text",
        }
    }
}

impl std::fmt::Display for SearchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Entry point of every search: embed, search the target index, aggregate,
/// finalize.
///
/// Built once per process and shared; every dependency is passed in.
pub struct QueryRouter {
    embedder: Arc<dyn EmbeddingProvider>,
    indexes: Arc<ServingIndexes>,
    aggregator: SearchAggregator,
    finalizer: ResultFinalizer,
    settings: SearchConfig,
}

impl QueryRouter {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        indexes: Arc<ServingIndexes>,
        store: EntityStore,
        settings: SearchConfig,
    ) -> Self {
        Self {
            embedder,
            indexes,
            aggregator: SearchAggregator::new(store.clone()),
            finalizer: ResultFinalizer::new(store),
            settings,
        }
    }

    pub fn indexes(&self) -> &Arc<ServingIndexes> {
        &self.indexes
    }

    /// `top_k` clamped to the configured maximum, or the default when absent.
    pub fn effective_top_k(&self, top_k: Option<usize>) -> usize {
        top_k
            .unwrap_or(self.settings.default_top_k)
            .min(self.settings.max_top_k)
    }

    pub async fn text_to_image(
        &self,
        text: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<AdResult>, SearchError> {
        self.search(SearchMode::TextToImage, Query::Text(text.to_string()), top_k)
            .await
    }

    pub async fn image_to_image(
        &self,
        image: &Path,
        top_k: Option<usize>,
    ) -> Result<Vec<AdResult>, SearchError> {
        self.search(SearchMode::ImageToImage, Query::Image(image.to_path_buf()), top_k)
            .await
    }

    pub async fn image_to_text(
        &self,
        image: &Path,
        top_k: Option<usize>,
    ) -> Result<Vec<AdResult>, SearchError> {
        self.search(SearchMode::ImageToText, Query::Image(image.to_path_buf()), top_k)
            .await
    }

    pub async fn text_to_text(
        &self,
        text: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<AdResult>, SearchError> {
        self.search(SearchMode::TextToText, Query::Text(text.to_string()), top_k)
            .await
    }

    /// Run `query` in `mode`.
    ///
    /// An empty target index, a zero `top_k` or a query the provider cannot
    /// embed all give an empty list. Catalog and index failures are errors.
    pub async fn search(
        &self,
        mode: SearchMode,
        query: Query,
        top_k: Option<usize>,
    ) -> Result<Vec<AdResult>, SearchError> {
        if query.modality() != mode.query_modality() {
            return Err(SearchError::ModeMismatch {
                mode,
                expected: mode.query_modality(),
                got: query.modality(),
            });
        }

        let k = self.effective_top_k(top_k);
        if k == 0 {
            return Ok(vec![]);
        }

        // one snapshot per index for the whole request
        let target = mode.target();
        let image_index = self.indexes.get(Modality::Image);
        let index = match target {
            Modality::Image => image_index.clone(),
            Modality::Text => self.indexes.get(Modality::Text),
        };
        if index.is_empty() {
            log::debug!("{} index is empty, nothing to search", target);
            return Ok(vec![]);
        }

        let Some(vector) = self.embed(query).await else {
            return Ok(vec![]);
        };

        let raw = RawHits::search(&index, &vector, k, self.settings.oversample_factor(target))?;
        let aggregation = self.aggregator.aggregate(&raw, target).await?;

        let results = self
            .finalizer
            .finalize(&aggregation.ranked, &vector, &image_index)
            .await?;

        log::debug!("{} search: {} results (k = {})", mode, results.len(), k);
        Ok(results)
    }

    /// Embed `query` off the async executor. Failures are logged and give
    /// `None`.
    async fn embed(&self, query: Query) -> Option<Vec<f32>> {
        let embedder = self.embedder.clone();
        let modality = query.modality();

        match tokio::task::spawn_blocking(move || query.embed(embedder.as_ref())).await {
            Ok(Ok(vector)) => Some(vector),
            Ok(Err(err)) => {
                log::warn!("Failed to embed {} query: {}", modality, err);
                None
            }
            Err(err) => {
                log::warn!("Embedding task for {} query failed: {}", modality, err);
                None
            }
        }
    }
}
