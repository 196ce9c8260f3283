//! Per-modality vector indices.
//!
//! # Architecture
//!
//! - `vector_index`: exact nearest-neighbour search over contiguous rows
//! - `storage`: binary snapshot files (`image.index`, `text.index`)
//! - `snapshot`: immutable snapshot handles and the atomic swap used by serving

mod snapshot;
mod storage;
mod vector_index;

use serde::{Deserialize, Serialize};

pub use snapshot::{ServingIndexes, SnapshotCell};
pub use storage::{SnapshotError, SnapshotFile, SnapshotSpec, StagedSnapshot};
pub use vector_index::{dot, Hit, IndexError, Metric, RowId, VectorIndex};

pub(crate) use vector_index::compare_scores;

/// Which embedding space a query, an asset or an index lives in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Image,
    Text,
}

impl Modality {
    pub const ALL: [Modality; 2] = [Modality::Image, Modality::Text];

    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Image => "image",
            Modality::Text => "text",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
