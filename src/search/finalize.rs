use std::cmp::Ordering;

use crate::catalog::{AdId, EntityStore, ImageAsset};
use crate::index::{compare_scores, dot, IndexError, VectorIndex};
use crate::search::{AdResult, RankedAd, SearchError};

/// Index into `assets` of the image whose stored vector has the largest dot
/// product with `query`. The first of equal maxima wins.
///
/// Images are always scored against the image index, whatever index drove
/// the search.
pub fn select_representative(
    assets: &[ImageAsset],
    query: &[f32],
    image_index: &VectorIndex,
) -> Result<Option<usize>, IndexError> {
    if assets.is_empty() {
        return Ok(None);
    }

    if query.len() != image_index.dimensions() {
        return Err(IndexError::DimensionMismatch {
            expected: image_index.dimensions(),
            got: query.len(),
        });
    }

    let mut best: Option<(usize, f32)> = None;
    for (position, asset) in assets.iter().enumerate() {
        let score = dot(query, image_index.reconstruct(asset.row)?);
        match best {
            Some((_, top)) if compare_scores(score, top) != Ordering::Less => {}
            _ => best = Some((position, score)),
        }
    }

    Ok(best.map(|(position, _)| position))
}

/// Attaches metadata and images to ranked ads.
#[derive(Clone)]
pub struct ResultFinalizer {
    store: EntityStore,
}

impl ResultFinalizer {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    /// Build results for `ranked`, keeping its order.
    ///
    /// Ads missing from the catalog are left out. A stored row id outside the
    /// image index means the catalog and the index disagree; the request fails.
    pub async fn finalize(
        &self,
        ranked: &[RankedAd],
        query: &[f32],
        image_index: &VectorIndex,
    ) -> Result<Vec<AdResult>, SearchError> {
        if ranked.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<AdId> = ranked.iter().map(|ad| ad.ad_id).collect();
        let mut ads = self.store.get_ads(&ids).await?;
        let mut images = self.store.completed_images_by_ad(&ids).await?;

        let mut results = Vec::with_capacity(ranked.len());
        for entry in ranked {
            let Some(ad) = ads.remove(&entry.ad_id) else {
                log::debug!("Ad {} has no catalog record, skipping", entry.ad_id);
                continue;
            };
            let assets = images.remove(&entry.ad_id).unwrap_or_default();

            let representative =
                select_representative(&assets, query, image_index).inspect_err(|err| {
                    if let IndexError::InvalidRowId { .. } = err {
                        log::error!(
                            "Image rows of ad {} do not match the image index: {}",
                            entry.ad_id,
                            err
                        );
                    }
                })?;

            let mut representative_image = None;
            let mut other_images = Vec::with_capacity(assets.len().saturating_sub(1));
            for (position, asset) in assets.into_iter().enumerate() {
                if Some(position) == representative {
                    representative_image = Some(asset.location);
                } else {
                    other_images.push(asset.location);
                }
            }

            results.push(AdResult {
                ad_id: entry.ad_id,
                score: entry.score,
                text: ad.display_text().map(str::to_string),
                title: ad.title,
                representative_image,
                other_images,
            });
        }

        Ok(results)
    }
}
