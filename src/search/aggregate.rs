use std::cmp::Ordering;
use std::collections::HashMap;

use crate::catalog::{AdId, EntityStore, StoreError};
use crate::index::{compare_scores, Hit, IndexError, Modality, RowId, VectorIndex};
use crate::search::RankedAd;

/// Row-level hits of one oversampled index search.
#[derive(Debug, Clone, PartialEq)]
pub struct RawHits {
    pub hits: Vec<Hit>,
    /// Ads wanted after aggregation.
    pub k: usize,
    pub oversample_factor: usize,
    /// Rows in the searched index.
    pub index_rows: usize,
}

impl RawHits {
    /// Search `index` for `k * oversample_factor` rows.
    pub fn search(
        index: &VectorIndex,
        query: &[f32],
        k: usize,
        oversample_factor: usize,
    ) -> Result<Self, IndexError> {
        let oversample_factor = oversample_factor.max(1);
        let hits = index.search(query, k.saturating_mul(oversample_factor))?;

        Ok(Self {
            hits,
            k,
            oversample_factor,
            index_rows: index.len(),
        })
    }

    /// Rows asked of the index.
    pub fn requested(&self) -> usize {
        self.k.saturating_mul(self.oversample_factor)
    }
}

/// Outcome of aggregating one search.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub ranked: Vec<RankedAd>,
    /// The oversampling margin ran out before `k` distinct ads were found.
    pub underfilled: bool,
}

/// Collapse row hits into ads, keeping each ad's best score.
///
/// Rows without an owner are dropped. Ads are ordered by score descending,
/// then by ascending ad id, and the list is cut at `k`.
pub fn rank_entities(hits: &[Hit], owners: &HashMap<RowId, AdId>, k: usize) -> Vec<RankedAd> {
    let mut best: HashMap<AdId, f32> = HashMap::new();

    for hit in hits {
        let Some(&ad_id) = owners.get(&hit.row) else {
            continue;
        };

        best.entry(ad_id)
            .and_modify(|score| {
                if compare_scores(hit.score, *score) == Ordering::Less {
                    *score = hit.score;
                }
            })
            .or_insert(hit.score);
    }

    let mut ranked: Vec<RankedAd> = best
        .into_iter()
        .map(|(ad_id, score)| RankedAd { ad_id, score })
        .collect();

    ranked.sort_by(|a, b| compare_scores(a.score, b.score).then(a.ad_id.cmp(&b.ad_id)));
    ranked.truncate(k);
    ranked
}

/// Whether fewer than `k` distinct ads came out of a search that could have
/// returned more rows.
pub fn is_underfilled(distinct: usize, raw: &RawHits) -> bool {
    distinct < raw.k && raw.hits.len() == raw.requested() && raw.index_rows > raw.requested()
}

/// Turns raw index hits into ranked ads.
#[derive(Clone)]
pub struct SearchAggregator {
    store: EntityStore,
}

impl SearchAggregator {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    /// Resolve, deduplicate and rank `raw` hits of the `modality` index.
    pub async fn aggregate(
        &self,
        raw: &RawHits,
        modality: Modality,
    ) -> Result<Aggregation, StoreError> {
        if raw.hits.is_empty() || raw.k == 0 {
            return Ok(Aggregation {
                ranked: vec![],
                underfilled: false,
            });
        }

        let rows: Vec<RowId> = raw.hits.iter().map(|hit| hit.row).collect();
        let owners = self.store.resolve_rows(&rows, modality).await?;

        if owners.len() < rows.len() {
            log::debug!(
                "{} of {} {} rows have no owning ad",
                rows.len() - owners.len(),
                rows.len(),
                modality
            );
        }

        let ranked = rank_entities(&raw.hits, &owners, raw.k);
        let underfilled = is_underfilled(ranked.len(), raw);

        if underfilled {
            log::warn!(
                "Only {} of {} ads found in the top {} {} rows; oversample factor {} is too small",
                ranked.len(),
                raw.k,
                raw.requested(),
                modality,
                raw.oversample_factor
            );
        }

        Ok(Aggregation {
            ranked,
            underfilled,
        })
    }
}
