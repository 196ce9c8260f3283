use serde::{Deserialize, Serialize};

use crate::index::RowId;

/// Advertisement id (`advertisements.id`)
pub type AdId = i64;
/// Image id (`images.id`)
pub type ImageId = i64;

/// Download lifecycle of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }
}

/// Advertisement record
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Ad {
    pub id: AdId,
    pub name: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub background: Option<String>,
    pub insight: Option<String>,
    pub creative: Option<String>,
    pub result: Option<String>,
    pub score: Option<f64>,
    pub favorites: Option<i64>,
    pub comments: Option<i64>,
    pub publish_time: Option<String>,
    pub category: Option<String>,
    pub created_at: Option<String>,
}

impl Ad {
    /// Text shown alongside the title in search results.
    pub fn display_text(&self) -> Option<&str> {
        self.creative.as_deref()
    }

    /// Fields that make up the text embedding, in order.
    pub fn text_fields(&self) -> [Option<&str>; 4] {
        [
            self.title.as_deref(),
            self.background.as_deref(),
            self.insight.as_deref(),
            self.creative.as_deref(),
        ]
    }
}

/// A completed image that owns a row in the image index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageAsset {
    pub image_id: ImageId,
    pub location: String,
    pub row: RowId,
}

/// A completed image waiting to be embedded by the index build.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SourceImage {
    pub id: ImageId,
    pub ad_id: AdId,
    pub local_path: String,
}
