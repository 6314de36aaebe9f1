//! Error taxonomy for the reconciliation and freshness engine.
//!
//! Storefront failures, malformed payloads and uniqueness conflicts are *soft*:
//! callers skip the item and keep going with whatever the durable store already
//! holds. Everything else that comes out of sqlx is fatal for the operation that
//! raised it.

use thiserror::Error;

use crate::models::StoreTag;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Incoming storefront payload lacks a required field. Nothing was written.
    #[error("malformed source data from {store}/{external_id}: {reason}")]
    MalformedSourceData {
        store: StoreTag,
        external_id: String,
        reason: String,
    },

    #[error("external fetch failed for {store}/{external_id}: {source}")]
    ExternalFetch {
        store: StoreTag,
        external_id: String,
        #[source]
        source: FetchError,
    },

    /// A concurrent writer already holds the row keyed by `key`. Re-read instead of failing.
    #[error("persistence conflict on {key}")]
    PersistenceConflict { key: String },

    #[error("persistence failure: {0}")]
    Persistence(#[source] sqlx::Error),

    #[error("game {0} not found")]
    GameNotFound(i64),

    #[error("no price source registered for store {0}")]
    UnknownStore(StoreTag),
}

impl EngineError {
    /// Soft errors leave cached state authoritative and never abort a batch.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            EngineError::ExternalFetch { .. }
                | EngineError::PersistenceConflict { .. }
                | EngineError::MalformedSourceData { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::PersistenceConflict { .. })
    }

    /// Classify a sqlx error, turning uniqueness violations into conflicts on `key`.
    pub(crate) fn from_sqlx(err: sqlx::Error, key: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                EngineError::PersistenceConflict { key: key.into() }
            }
            _ => EngineError::Persistence(err),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::from_sqlx(err, "unknown")
    }
}

/// Failure reported by an [`ExternalPriceSource`](crate::database_ops::sources::ExternalPriceSource).
///
/// "No discount" and "free" are not errors; those come back as quotes with zero values.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status}")]
    Http { status: u16 },

    #[error("rate limited by storefront")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A recent listing refresh failed and there is nothing cached to serve.
    #[error("storefront listing unavailable; next attempt in {retry_after_secs}s")]
    CoolingDown { retry_after_secs: u64 },
}

impl FetchError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        FetchError::Malformed(reason.into())
    }
}
