//! Cross-modal ad search.
//!
//! # Architecture
//!
//! - `aggregate`: row hits -> deduplicated, ranked ads
//! - `finalize`: ranked ads -> results with metadata and a representative image
//! - `router`: the four search modes wiring embedder, index, aggregator and finalizer

pub mod aggregate;
pub mod finalize;
pub mod router;

use serde::Serialize;

use crate::catalog::{AdId, StoreError};
use crate::index::{IndexError, Modality};

pub use aggregate::{Aggregation, RawHits, SearchAggregator};
pub use finalize::ResultFinalizer;
pub use router::{Query, QueryRouter, SearchMode};

/// An ad with its best score across all of its matching rows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedAd {
    pub ad_id: AdId,
    pub score: f32,
}

/// One search result as handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdResult {
    pub ad_id: AdId,
    pub score: f32,
    pub title: Option<String>,
    pub text: Option<String>,
    /// Location of the image most similar to the query, if the ad has any.
    pub representative_image: Option<String>,
    /// Remaining images of the ad in stored order.
    pub other_images: Vec<String>,
}

/// Errors that can occur while answering a query.
///
/// Embedding failures are not here: a query that cannot be embedded
/// yields no results.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Mode {mode} expects a {expected} query, got {got}")]
    ModeMismatch {
        mode: SearchMode,
        expected: Modality,
        got: Modality,
    },

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Catalog error: {0}")]
    Store(#[from] StoreError),
}
