//! Writes of the row id mapping tables.
//!
//! Each write replaces the whole mapping of one modality in a single
//! transaction, so readers see either the previous mapping or the new one.

use super::model::{AdId, ImageId};
use super::{Database, StoreError};
use crate::index::RowId;

/// Replace the image row assignment: every `images.embedding_id` is cleared,
/// then set for the listed images.
pub async fn assign_image_rows(
    db: &Database,
    assignments: &[(ImageId, RowId)],
) -> Result<(), StoreError> {
    let mut tx = db.begin().await?;

    sqlx::query("UPDATE images SET embedding_id = NULL")
        .execute(&mut *tx)
        .await?;

    for &(image_id, row) in assignments {
        sqlx::query("UPDATE images SET embedding_id = ? WHERE id = ?")
            .bind(row as i64)
            .bind(image_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    log::debug!("Assigned {} image rows", assignments.len());

    Ok(())
}

/// Replace the text row mapping with `rows`.
pub async fn replace_text_rows(db: &Database, rows: &[(RowId, AdId)]) -> Result<(), StoreError> {
    let mut tx = db.begin().await?;

    sqlx::query("DELETE FROM text_rows")
        .execute(&mut *tx)
        .await?;

    for &(row, ad_id) in rows {
        sqlx::query("INSERT INTO text_rows (row_id, ad_id) VALUES (?, ?)")
            .bind(row as i64)
            .bind(ad_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    log::debug!("Stored {} text rows", rows.len());

    Ok(())
}
