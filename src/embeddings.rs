//! Embedding providers.
//!
//! Queries and catalog assets are turned into vectors by an
//! [`EmbeddingProvider`]. The production provider wraps fastembed's CLIP
//! models, which embed images and text into one shared space.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions, TextEmbedding};

use crate::config::EmbeddingConfig;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Maps an image or a piece of text to a fixed-length vector.
pub trait EmbeddingProvider: Send + Sync {
    /// Length of every vector this provider returns.
    fn dimensions(&self) -> usize;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError>;
}

/// SHA256 of the model pair, stored in snapshot headers so an index is never
/// queried with vectors from a different model.
pub fn model_id_hash(config: &EmbeddingConfig) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(config.image_model.as_bytes());
    hasher.update(b"|");
    hasher.update(config.text_model.as_bytes());
    hasher.finalize().into()
}

/// Scale `vector` to unit length. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// fastembed CLIP image and text models.
///
/// Uses Mutexes because fastembed's embed() requires &mut self.
pub struct ClipEmbedder {
    text: Mutex<TextEmbedding>,
    image: Mutex<ImageEmbedding>,
    dimensions: usize,
}

impl ClipEmbedder {
    /// Load both models, downloading them into `cache_dir` on first use.
    ///
    /// Fails if either model does not produce `config.dimensions` long vectors.
    pub fn new(config: &EmbeddingConfig, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let text_model = parse_text_model(&config.text_model)?;
        let image_model = parse_image_model(&config.image_model)?;

        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        log::info!(
            "Loading embedding models: image={}, text={}",
            config.image_model,
            config.text_model
        );

        let mut text = TextEmbedding::try_new(
            InitOptions::new(text_model)
                .with_cache_dir(cache_dir.clone())
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let image = ImageEmbedding::try_new(
            ImageInitOptions::new(image_model)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(true),
        )
        .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let text_dimensions = probe_dimensions(&mut text)?;
        if text_dimensions != config.dimensions {
            return Err(EmbeddingError::InitFailed(format!(
                "text model {} produces {} dimensions, configured {}",
                config.text_model, text_dimensions, config.dimensions
            )));
        }

        Ok(Self {
            text: Mutex::new(text),
            image: Mutex::new(image),
            dimensions: config.dimensions,
        })
    }

    fn checked(&self, embeddings: Vec<Vec<f32>>) -> Result<Vec<f32>, EmbeddingError> {
        let mut embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))?;

        if embedding.len() != self.dimensions {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "expected {} dimensions, model returned {}",
                self.dimensions,
                embedding.len()
            )));
        }

        normalize(&mut embedding);
        Ok(embedding)
    }
}

impl EmbeddingProvider for ClipEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.text.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

        self.checked(embeddings)
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        let mut model = self.image.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![path], None)
            .map_err(|e| {
                EmbeddingError::EmbeddingFailed(format!("{}: {}", path.display(), e))
            })?;

        self.checked(embeddings)
    }
}

/// Parse text model name to fastembed enum.
fn parse_text_model(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => Ok(fastembed::EmbeddingModel::ClipVitB32),
        "nomic-embed-text-v1.5" | "nomicembedtextv15" => {
            Ok(fastembed::EmbeddingModel::NomicEmbedTextV15)
        }
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown text model: {}. Supported models: clip-vit-b-32, nomic-embed-text-v1.5",
            name
        ))),
    }
}

/// Parse image model name to fastembed enum.
fn parse_image_model(name: &str) -> Result<ImageEmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => Ok(ImageEmbeddingModel::ClipVitB32),
        "nomic-embed-vision-v1.5" | "nomicembedvisionv15" => {
            Ok(ImageEmbeddingModel::NomicEmbedVisionV15)
        }
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown image model: {}. Supported models: clip-vit-b-32, nomic-embed-vision-v1.5",
            name
        ))),
    }
}

/// Probe the model to determine embedding dimensions.
fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
    let test_embeddings = model
        .embed(vec!["test"], None)
        .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

    test_embeddings
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
}
