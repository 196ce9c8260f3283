//! Offline rebuild of the vector indices and their row mapping tables.
//!
//! A rebuild embeds the whole catalog, stages the new snapshot file next to
//! the current one, commits the new row mapping, moves the staged file into
//! place and finally swaps the new snapshot into serving. A failed mapping
//! write discards the staged file, so the snapshot on disk always matches the
//! committed mapping.

use std::sync::Arc;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::catalog::{rows, AdId, EntityStore, ImageId};
use crate::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::index::{Modality, RowId, ServingIndexes, VectorIndex};
use crate::preprocess::compose_ad_text;

/// Rows written and inputs skipped by a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub image_rows: usize,
    pub image_skipped: usize,
    pub text_rows: usize,
    pub text_skipped: usize,
}

pub struct Indexer {
    store: EntityStore,
    embedder: Arc<dyn EmbeddingProvider>,
    indexes: Arc<ServingIndexes>,
    show_progress: bool,
}

impl Indexer {
    pub fn new(
        store: EntityStore,
        embedder: Arc<dyn EmbeddingProvider>,
        indexes: Arc<ServingIndexes>,
    ) -> Self {
        Self {
            store,
            embedder,
            indexes,
            show_progress: true,
        }
    }

    /// Hide progress bars.
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    /// Rebuild both indices, or only `only`.
    pub async fn rebuild(&self, only: Option<Modality>) -> anyhow::Result<BuildReport> {
        let mut report = BuildReport::default();

        if only.map_or(true, |m| m == Modality::Image) {
            let (rows, skipped) = self.rebuild_images().await?;
            report.image_rows = rows;
            report.image_skipped = skipped;
        }

        if only.map_or(true, |m| m == Modality::Text) {
            let (rows, skipped) = self.rebuild_text().await?;
            report.text_rows = rows;
            report.text_skipped = skipped;
        }

        log::info!(
            "Rebuild finished: {} image rows ({} skipped), {} text rows ({} skipped)",
            report.image_rows,
            report.image_skipped,
            report.text_rows,
            report.text_skipped
        );

        Ok(report)
    }

    async fn rebuild_images(&self) -> anyhow::Result<(usize, usize)> {
        let images = self
            .store
            .completed_images()
            .await
            .context("failed to list completed images")?;
        log::info!("Embedding {} images", images.len());

        let embedder = self.embedder.clone();
        let progress = self.progress_bar(images.len(), "images");
        let (embedded, skipped) = tokio::task::spawn_blocking(move || {
            embed_all(images, &progress, |image| {
                embedder.embed_image(std::path::Path::new(&image.local_path))
            })
        })
        .await
        .context("image embedding task failed")?;

        let mut vectors = Vec::with_capacity(embedded.len());
        let mut assignments: Vec<(ImageId, RowId)> = Vec::with_capacity(embedded.len());
        for (row, (image, vector)) in embedded.into_iter().enumerate() {
            assignments.push((image.id, row as RowId));
            vectors.push(vector);
        }

        let index = self.build_index(&vectors)?;
        let staged = self
            .indexes
            .stage(Modality::Image, &index)
            .context("failed to write image snapshot")?;
        rows::assign_image_rows(self.store.database(), &assignments)
            .await
            .context("failed to store image rows")?;
        staged
            .commit()
            .context("failed to move image snapshot into place")?;
        self.indexes.swap(Modality::Image, index);

        Ok((assignments.len(), skipped))
    }

    async fn rebuild_text(&self) -> anyhow::Result<(usize, usize)> {
        let ads = self.store.all_ads().await.context("failed to list ads")?;

        let mut skipped = 0;
        let mut texts: Vec<(AdId, String)> = Vec::with_capacity(ads.len());
        for ad in &ads {
            match compose_ad_text(ad.text_fields()) {
                Some(text) => texts.push((ad.id, text)),
                None => {
                    log::debug!("Ad {} has no text, skipping", ad.id);
                    skipped += 1;
                }
            }
        }
        log::info!("Embedding text of {} ads", texts.len());

        let embedder = self.embedder.clone();
        let progress = self.progress_bar(texts.len(), "ads");
        let (embedded, failed) = tokio::task::spawn_blocking(move || {
            embed_all(texts, &progress, |(_, text)| embedder.embed_text(text))
        })
        .await
        .context("text embedding task failed")?;

        let mut vectors = Vec::with_capacity(embedded.len());
        let mut mapping: Vec<(RowId, AdId)> = Vec::with_capacity(embedded.len());
        for (row, ((ad_id, _), vector)) in embedded.into_iter().enumerate() {
            mapping.push((row as RowId, ad_id));
            vectors.push(vector);
        }

        let index = self.build_index(&vectors)?;
        let staged = self
            .indexes
            .stage(Modality::Text, &index)
            .context("failed to write text snapshot")?;
        rows::replace_text_rows(self.store.database(), &mapping)
            .await
            .context("failed to store text rows")?;
        staged
            .commit()
            .context("failed to move text snapshot into place")?;
        self.indexes.swap(Modality::Text, index);

        Ok((mapping.len(), skipped + failed))
    }

    fn build_index(&self, vectors: &[Vec<f32>]) -> anyhow::Result<VectorIndex> {
        let spec = self.indexes.spec();
        let mut index = VectorIndex::new(spec.dimensions, spec.metric);
        index
            .build(vectors)
            .context("embedding provider returned vectors of the wrong length")?;
        Ok(index)
    }

    fn progress_bar(&self, len: usize, unit: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");

        ProgressBar::new(len as u64)
            .with_style(style)
            .with_message(unit.to_string())
    }
}

/// Embed every item in order, dropping the ones that fail.
///
/// Returns the embedded items and the number of failures.
fn embed_all<T>(
    items: Vec<T>,
    progress: &ProgressBar,
    embed: impl Fn(&T) -> Result<Vec<f32>, EmbeddingError>,
) -> (Vec<(T, Vec<f32>)>, usize) {
    let mut embedded = Vec::with_capacity(items.len());
    let mut failed = 0;

    for item in items {
        match embed(&item) {
            Ok(vector) => embedded.push((item, vector)),
            Err(err) => {
                log::warn!("{err}");
                failed += 1;
            }
        }
        progress.inc(1);
    }

    progress.finish_and_clear();
    (embedded, failed)
}
