//! Cross-module scenarios and shared test helpers.


use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::catalog::{AdId, Database, DownloadStatus, ImageId};
use crate::embeddings::{normalize, EmbeddingError, EmbeddingProvider};
use crate::index::{Metric, SnapshotSpec};

/// `v` scaled to unit length.
pub fn unit(v: &[f32]) -> Vec<f32> {
    let mut v = v.to_vec();
    normalize(&mut v);
    v
}

/// Standard basis vector `i` of `dimensions`.
pub fn basis(dimensions: usize, i: usize) -> Vec<f32> {
    let mut v = vec![0.0; dimensions];
    v[i] = 1.0;
    v
}

pub fn snapshot_spec(dimensions: usize) -> SnapshotSpec {
    SnapshotSpec {
        model_id: [1u8; 32],
        dimensions,
        metric: Metric::InnerProduct,
    }
}

pub async fn insert_ad(db: &Database, title: &str, creative: &str) -> AdId {
    sqlx::query("INSERT INTO advertisements (name, title, creative) VALUES (?, ?, ?)")
        .bind(title.to_lowercase())
        .bind(title)
        .bind(creative)
        .execute(db)
        .await
        .unwrap()
        .last_insert_rowid()
}

pub async fn insert_image(
    db: &Database,
    ad_id: AdId,
    local_path: Option<&str>,
    status: DownloadStatus,
    embedding_id: Option<i64>,
) -> ImageId {
    sqlx::query(
        "INSERT INTO images (ad_id, image_url, local_path, download_status, embedding_id) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(ad_id)
    .bind(format!("https://cdn.example.com/{ad_id}"))
    .bind(local_path)
    .bind(status.as_str())
    .bind(embedding_id)
    .execute(db)
    .await
    .unwrap()
    .last_insert_rowid()
}

pub async fn insert_text_row(db: &Database, row: i64, ad_id: AdId) {
    sqlx::query("INSERT INTO text_rows (row_id, ad_id) VALUES (?, ?)")
        .bind(row)
        .bind(ad_id)
        .execute(db)
        .await
        .unwrap();
}

/// Lookup table embedder. Unknown inputs fail.
pub struct StaticEmbedder {
    dimensions: usize,
    texts: HashMap<String, Vec<f32>>,
    images: HashMap<PathBuf, Vec<f32>>,
    /// Used for images not in `images`, e.g. uploaded temp files
    image_fallback: Option<Vec<f32>>,
    calls: AtomicUsize,
}

impl StaticEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            texts: HashMap::new(),
            images: HashMap::new(),
            image_fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_text(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.texts.insert(text.to_string(), vector);
        self
    }

    pub fn with_image(mut self, path: impl Into<PathBuf>, vector: Vec<f32>) -> Self {
        self.images.insert(path.into(), vector);
        self
    }

    pub fn with_image_fallback(mut self, vector: Vec<f32>) -> Self {
        self.image_fallback = Some(vector);
        self
    }

    /// Number of embed calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingProvider for StaticEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts
            .get(text)
            .cloned()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed(format!("unknown text: {text}")))
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.images
            .get(path)
            .or(self.image_fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                EmbeddingError::EmbeddingFailed(format!("unknown image: {}", path.display()))
            })
    }
}
