//! Relational catalog of ads and their images.
//!
//! - `model`: row types and id aliases
//! - `store`: read-only queries used at search time
//! - `rows`: row id mapping writes used by the offline index build

use std::path::Path;

use sqlx::{sqlite::*, SqlitePool};

pub mod model;
pub mod rows;
pub mod store;

pub use model::*;
pub use store::{CatalogStats, EntityStore};

pub type Database = SqlitePool;

/// Errors that can occur during catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub async fn init_db(filename: impl AsRef<Path>) -> Result<Database, StoreError> {
    let filename = filename.as_ref();
    log::info!("Opening catalog database: {}", filename.display());

    let options = SqliteConnectOptions::new()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .filename(filename)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;

    log::debug!("Running catalog migrations");
    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}

/// A migrated catalog that lives only as long as the pool.
#[cfg(test)]
pub async fn init_memory_db() -> Result<Database, StoreError> {
    use std::str::FromStr;

    // one connection: every in-memory connection is its own database
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}
