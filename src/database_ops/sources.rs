//! Storefront capability boundary.
//!
//! Each storefront sits behind [`ExternalPriceSource`]; the engine selects the
//! implementation through the store tag recorded next to the game's external id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, Response, StatusCode};
use serde_json::Value;

use crate::error::FetchError;
use crate::models::{GameAttributes, PriceQuote, StoreTag};

#[cfg(any(test, feature = "test_utils"))]
mod scripted;
#[cfg(any(test, feature = "test_utils"))]
pub use scripted::{ScriptedPriceSource, ScriptedResponse};

#[async_trait]
pub trait ExternalPriceSource: Send + Sync {
    fn store(&self) -> StoreTag;

    /// Current price for `external_id`. `Ok(None)` means the storefront does not
    /// know the item; free and undiscounted items come back as quotes.
    async fn fetch_price(&self, external_id: &str) -> Result<Option<PriceQuote>, FetchError>;

    /// Descriptive metadata used to seed the catalog. Sources without a metadata
    /// endpoint return `Ok(None)`.
    async fn fetch_attributes(
        &self,
        _external_id: &str,
    ) -> Result<Option<GameAttributes>, FetchError> {
        Ok(None)
    }
}

/// Price sources keyed by store tag.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<StoreTag, Arc<dyn ExternalPriceSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` under its own tag, replacing any previous one.
    pub fn with(mut self, source: Arc<dyn ExternalPriceSource>) -> Self {
        self.register(source);
        self
    }

    pub fn register(&mut self, source: Arc<dyn ExternalPriceSource>) {
        self.sources.insert(source.store(), source);
    }

    pub fn get(&self, store: StoreTag) -> Option<Arc<dyn ExternalPriceSource>> {
        self.sources.get(&store).cloned()
    }

    pub fn stores(&self) -> Vec<StoreTag> {
        let mut out: Vec<StoreTag> = self.sources.keys().copied().collect();
        out.sort();
        out
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("stores", &self.stores())
            .finish()
    }
}

/// Shared HTTP client for storefront sources.
pub(crate) fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("bargain-engine/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Map a storefront response to JSON, turning 429 and other non-2xx statuses into
/// distinguishable fetch errors. Storefront retries are left to the caller.
pub(crate) async fn read_json(resp: Response) -> Result<Value, FetchError> {
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        return Err(FetchError::RateLimited { retry_after_secs });
    }
    if !status.is_success() {
        return Err(FetchError::Http {
            status: status.as_u16(),
        });
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| FetchError::malformed(format!("invalid json: {e}")))
}
