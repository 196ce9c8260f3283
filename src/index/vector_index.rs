//! Exact (flat) vector index with similarity search.
//!
//! Vectors are stored row-major in one contiguous buffer. Row ids are dense and
//! zero-based, assigned in input order by [`VectorIndex::build`].

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Zero-based position of a vector inside an index.
pub type RowId = u64;

/// Scans over at least this many rows are split across the rayon pool.
const PARALLEL_SCAN_MIN_ROWS: usize = 4096;

/// Scoring convention of an index.
///
/// Whatever the metric, [`VectorIndex::search`] reports a similarity where
/// larger means closer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// `dot(q, v)`; cosine similarity for unit vectors.
    #[default]
    InnerProduct,
    /// `1 - ||q - v||² / 2`; equals the dot product for unit vectors.
    SquaredL2,
}

impl Metric {
    pub fn similarity(self, query: &[f32], row: &[f32]) -> f32 {
        match self {
            Metric::InnerProduct => dot(query, row),
            Metric::SquaredL2 => {
                let distance: f32 = query
                    .iter()
                    .zip(row.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                1.0 - distance / 2.0
            }
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Metric::InnerProduct => 0,
            Metric::SquaredL2 => 1,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Metric::InnerProduct),
            1 => Some(Metric::SquaredL2),
            _ => None,
        }
    }
}

/// Dot product of two equally sized vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// A single row-level match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub row: RowId,
    /// Similarity, larger is better.
    pub score: f32,
}

/// Descending by score, NaN last.
pub(crate) fn compare_scores(a: f32, b: f32) -> Ordering {
    let key = |s: f32| if s.is_nan() { f32::NEG_INFINITY } else { s };
    key(b).total_cmp(&key(a))
}

fn rank_order(a: &Hit, b: &Hit) -> Ordering {
    compare_scores(a.score, b.score).then(a.row.cmp(&b.row))
}

/// Errors that can occur during index operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid row id {row}: index holds {rows} rows")]
    InvalidRowId { row: RowId, rows: usize },
}

/// In-memory exact nearest-neighbour index.
///
/// Read operations take `&self` and never mutate, so a loaded index can be
/// shared between threads behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    data: Vec<f32>,
    rows: usize,
    dimensions: usize,
    metric: Metric,
}

impl VectorIndex {
    /// Create an empty index.
    pub fn new(dimensions: usize, metric: Metric) -> Self {
        Self {
            data: Vec::new(),
            rows: 0,
            dimensions,
            metric,
        }
    }

    /// Create an index holding `vectors` as rows `0..vectors.len()`.
    pub fn with_rows(
        dimensions: usize,
        metric: Metric,
        vectors: &[Vec<f32>],
    ) -> Result<Self, IndexError> {
        let mut index = Self::new(dimensions, metric);
        index.build(vectors)?;
        Ok(index)
    }

    /// Rebuild from a raw row-major buffer. The caller guarantees
    /// `data.len() == rows * dimensions`.
    pub(crate) fn from_raw(dimensions: usize, metric: Metric, rows: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), rows * dimensions);
        Self {
            data,
            rows,
            dimensions,
            metric,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Number of rows in the index.
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Replace the content of the index.
    ///
    /// Row ids are assigned in input order. Every vector is checked before
    /// anything is replaced, so a failed build leaves the index untouched.
    pub fn build(&mut self, vectors: &[Vec<f32>]) -> Result<usize, IndexError> {
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: bad.len(),
            });
        }

        let mut data = Vec::with_capacity(vectors.len() * self.dimensions);
        for vector in vectors {
            data.extend_from_slice(vector);
        }

        self.data = data;
        self.rows = vectors.len();
        Ok(self.rows)
    }

    /// Find the `k` rows most similar to `query`, best first.
    ///
    /// Returns `min(k, len)` hits. Equal scores are ordered by ascending row id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit>, IndexError> {
        if k == 0 || self.is_empty() {
            return Ok(vec![]);
        }

        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let score = |row: usize| Hit {
            row: row as RowId,
            score: self.metric.similarity(query, self.row(row)),
        };

        let mut hits: Vec<Hit> = if self.rows >= PARALLEL_SCAN_MIN_ROWS {
            (0..self.rows).into_par_iter().map(score).collect()
        } else {
            (0..self.rows).map(score).collect()
        };

        let k = k.min(hits.len());
        if k < hits.len() {
            hits.select_nth_unstable_by(k - 1, rank_order);
            hits.truncate(k);
        }
        hits.sort_unstable_by(rank_order);

        Ok(hits)
    }

    /// The exact stored vector of `row`.
    pub fn reconstruct(&self, row: RowId) -> Result<&[f32], IndexError> {
        match usize::try_from(row) {
            Ok(position) if position < self.rows => Ok(self.row(position)),
            _ => Err(IndexError::InvalidRowId {
                row,
                rows: self.rows,
            }),
        }
    }

    /// The underlying row-major buffer.
    pub(crate) fn as_slice(&self) -> &[f32] {
        &self.data
    }

    fn row(&self, position: usize) -> &[f32] {
        let start = position * self.dimensions;
        &self.data[start..start + self.dimensions]
    }
}
