use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

use crate::index::{Metric, Modality};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_DATABASE: &str = "advertisements.db";
const DEFAULT_INDEX_DIR: &str = "index";
/// CLIP shares one embedding space between images and text
const DEFAULT_MODEL: &str = "clip-vit-b-32";
const DEFAULT_DIMENSIONS: usize = 512;
const DEFAULT_TOP_K: usize = 10;
const DEFAULT_MAX_TOP_K: usize = 50;
/// Ads usually own several images, so image searches fetch extra rows
const DEFAULT_IMAGE_OVERSAMPLE_FACTOR: usize = 5;
const DEFAULT_TEXT_OVERSAMPLE_FACTOR: usize = 1;
const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Embedding models used to build and query the indices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_model")]
    pub image_model: String,

    #[serde(default = "default_model")]
    pub text_model: String,

    /// Length of every vector produced by both models
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            image_model: default_model(),
            text_model: default_model(),
            dimensions: DEFAULT_DIMENSIONS,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    /// Raw image rows fetched per requested ad
    #[serde(default = "default_image_oversample_factor")]
    pub image_oversample_factor: usize,

    /// Raw text rows fetched per requested ad
    #[serde(default = "default_text_oversample_factor")]
    pub text_oversample_factor: usize,

    #[serde(default)]
    pub metric: Metric,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: DEFAULT_TOP_K,
            max_top_k: DEFAULT_MAX_TOP_K,
            image_oversample_factor: DEFAULT_IMAGE_OVERSAMPLE_FACTOR,
            text_oversample_factor: DEFAULT_TEXT_OVERSAMPLE_FACTOR,
            metric: Metric::default(),
        }
    }
}

impl SearchConfig {
    pub fn oversample_factor(&self, modality: Modality) -> usize {
        match modality {
            Modality::Image => self.image_oversample_factor,
            Modality::Text => self.text_oversample_factor,
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_max_top_k() -> usize {
    DEFAULT_MAX_TOP_K
}

fn default_image_oversample_factor() -> usize {
    DEFAULT_IMAGE_OVERSAMPLE_FACTOR
}

fn default_text_oversample_factor() -> usize {
    DEFAULT_TEXT_OVERSAMPLE_FACTOR
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Catalog database, relative to the base path unless absolute
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Directory holding `image.index` and `text.index`
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database(),
            index_dir: default_index_dir(),
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            server: ServerConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from(DEFAULT_DATABASE)
}

fn default_index_dir() -> PathBuf {
    PathBuf::from(DEFAULT_INDEX_DIR)
}

/// `$ADSEARCH_BASE_PATH`, or `~/.local/share/adsearch`.
pub fn default_base_path() -> anyhow::Result<PathBuf> {
    if let Ok(base_path) = std::env::var("ADSEARCH_BASE_PATH") {
        return Ok(PathBuf::from(base_path));
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;

    Ok(home.join(".local/share/adsearch"))
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.embedding.dimensions == 0 {
            bail!("embedding.dimensions must be greater than 0");
        }

        let search = &self.search;
        if search.default_top_k == 0 {
            bail!("search.default_top_k must be at least 1");
        }

        if search.max_top_k < search.default_top_k {
            bail!(
                "search.max_top_k ({}) must not be smaller than search.default_top_k ({})",
                search.max_top_k,
                search.default_top_k
            );
        }

        for modality in Modality::ALL {
            if search.oversample_factor(modality) == 0 {
                bail!("search.{modality}_oversample_factor must be at least 1");
            }
        }

        self.server
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("server.listen '{}' is not an address", self.server.listen))?;

        Ok(())
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::load_with(&default_base_path()?)
    }

    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let config_path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !config_path.exists() {
            std::fs::create_dir_all(base_path)
                .with_context(|| format!("failed to create {}", base_path.display()))?;
            std::fs::write(&config_path, serde_yml::to_string(&Self::default())?)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
            log::info!("Created default config at {}", config_path.display());
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", config_path.display()))?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = self.base_path.join(CONFIG_FILE);
        let config_str = serde_yml::to_string(&self)?;

        std::fs::write(&config_path, config_str)
            .with_context(|| format!("failed to write {}", config_path.display()))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn database_path(&self) -> PathBuf {
        self.base_path.join(&self.database)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.base_path.join(&self.index_dir)
    }

    /// Where embedding models are cached.
    pub fn models_dir(&self) -> PathBuf {
        self.base_path.join("models")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();

        let config = Config::load_with(dir.path()).unwrap();

        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(config.search, SearchConfig::default());
        assert_eq!(config.embedding.dimensions, 512);
        assert_eq!(config.search.oversample_factor(Modality::Image), 5);
        assert_eq!(config.search.oversample_factor(Modality::Text), 1);
        assert_eq!(config.database_path(), dir.path().join("advertisements.db"));
        assert_eq!(config.index_dir(), dir.path().join("index"));
    }

    #[test]
    fn test_partial_config_is_filled_and_resaved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "search:\n  max_top_k: 20\n  metric: squared_l2\n").unwrap();

        let config = Config::load_with(dir.path()).unwrap();

        assert_eq!(config.search.max_top_k, 20);
        assert_eq!(config.search.default_top_k, 10);
        assert_eq!(config.search.metric, Metric::SquaredL2);

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("image_oversample_factor: 5"));
        assert!(saved.contains("dimensions: 512"));
    }

    #[test]
    fn test_absolute_database_path_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("elsewhere").join("ads.db");
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            format!("database: {}\n", db.display()),
        )
        .unwrap();

        let config = Config::load_with(dir.path()).unwrap();
        assert_eq!(config.database_path(), db);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases = [
            "embedding:\n  dimensions: 0\n",
            "search:\n  default_top_k: 0\n",
            "search:\n  default_top_k: 20\n  max_top_k: 5\n",
            "search:\n  image_oversample_factor: 0\n",
            "search:\n  text_oversample_factor: 0\n",
            "server:\n  listen: nowhere\n",
        ];

        for case in cases {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join(CONFIG_FILE), case).unwrap();
            assert!(Config::load_with(dir.path()).is_err(), "accepted: {case}");
        }
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "search: [1, 2").unwrap();

        assert!(Config::load_with(dir.path()).is_err());
    }
}
