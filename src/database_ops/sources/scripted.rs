//! Scripted storefront for offline runs and tests. Built only with `cfg(test)`
//! or the `test_utils` feature.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::ExternalPriceSource;
use crate::error::FetchError;
use crate::models::{GameAttributes, PriceQuote, StoreTag};

#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Quote(PriceQuote),
    NotFound,
    /// Surfaces as an HTTP 503 from the storefront.
    Unavailable,
}

/// In-memory source answering from a fixed script. Counts every fetch, which makes
/// it the fixture of choice for offline runs and tests.
#[derive(Debug)]
pub struct ScriptedPriceSource {
    store: StoreTag,
    responses: Mutex<HashMap<String, ScriptedResponse>>,
    attributes: Mutex<HashMap<String, GameAttributes>>,
    calls: AtomicUsize,
    calls_by_id: Mutex<BTreeMap<String, usize>>,
}

impl ScriptedPriceSource {
    pub fn new(store: StoreTag) -> Self {
        Self {
            store,
            responses: Mutex::new(HashMap::new()),
            attributes: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            calls_by_id: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_response(&self, external_id: &str, response: ScriptedResponse) {
        lock(&self.responses).insert(external_id.to_string(), response);
    }

    pub fn set_quote(&self, external_id: &str, quote: PriceQuote) {
        self.set_response(external_id, ScriptedResponse::Quote(quote));
    }

    pub fn set_attributes(&self, external_id: &str, attributes: GameAttributes) {
        lock(&self.attributes).insert(external_id.to_string(), attributes);
    }

    /// Price fetches served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, external_id: &str) -> usize {
        lock(&self.calls_by_id)
            .get(external_id)
            .copied()
            .unwrap_or(0)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ExternalPriceSource for ScriptedPriceSource {
    fn store(&self) -> StoreTag {
        self.store
    }

    async fn fetch_price(&self, external_id: &str) -> Result<Option<PriceQuote>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.calls_by_id)
            .entry(external_id.to_string())
            .or_insert(0) += 1;
        let response = lock(&self.responses).get(external_id).cloned();
        match response {
            Some(ScriptedResponse::Quote(q)) => Ok(Some(q)),
            Some(ScriptedResponse::NotFound) | None => Ok(None),
            Some(ScriptedResponse::Unavailable) => Err(FetchError::Http { status: 503 }),
        }
    }

    async fn fetch_attributes(
        &self,
        external_id: &str,
    ) -> Result<Option<GameAttributes>, FetchError> {
        Ok(lock(&self.attributes).get(external_id).cloned())
    }
}
