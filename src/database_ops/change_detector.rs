//! Price delta classification and the batch sweeps that pull prices proactively.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use crate::database_ops::catalog::CatalogReconciler;
use crate::database_ops::prices::{stale_records, PriceFreshnessCache, RefreshOutcome};
use crate::error::{EngineError, EngineResult};
use crate::models::{ChangeType, Game, PriceChange, PriceQuote, PriceRecord, StoreTag};
use crate::util::db::Db;

/// Classify `fetched` against the cached `previous` record.
///
/// Sale transitions win over numeric comparison: a sale that starts at the old
/// price is still a `sale_start`.
pub fn classify(previous: Option<&PriceRecord>, fetched: &PriceQuote) -> ChangeType {
    let Some(previous) = previous else {
        return ChangeType::New;
    };
    match (previous.is_on_sale, fetched.is_on_sale) {
        (false, true) => ChangeType::SaleStart,
        (true, false) => ChangeType::SaleEnd,
        _ => match fetched.price_minor.cmp(&previous.current_price_minor()) {
            std::cmp::Ordering::Greater => ChangeType::Increase,
            std::cmp::Ordering::Less => ChangeType::Decrease,
            std::cmp::Ordering::Equal => ChangeType::NoChange,
        },
    }
}

/// Relative change in percent; 0 when there is no usable old price.
pub fn change_percent(old_minor: Option<i64>, new_minor: i64) -> f64 {
    match old_minor {
        Some(old) if old > 0 => (new_minor - old) as f64 * 100.0 / old as f64,
        _ => 0.0,
    }
}

pub fn detect(
    game: &Game,
    store: StoreTag,
    previous: Option<&PriceRecord>,
    fetched: &PriceQuote,
) -> PriceChange {
    detect_at(game, store, previous, fetched, Utc::now())
}

pub fn detect_at(
    game: &Game,
    store: StoreTag,
    previous: Option<&PriceRecord>,
    fetched: &PriceQuote,
    detected_at: DateTime<Utc>,
) -> PriceChange {
    let old_price_minor = previous.map(PriceRecord::current_price_minor);
    PriceChange {
        game_id: game.id,
        game_title: game.title.clone(),
        store,
        old_price_minor,
        new_price_minor: fetched.price_minor,
        currency: fetched.currency.trim().to_ascii_uppercase(),
        change_type: classify(previous, fetched),
        change_percent: change_percent(old_price_minor, fetched.price_minor),
        detected_at,
    }
}

/// Batch driver for the two pull paths: first prices for games that have none,
/// and re-pricing of records that went stale.
#[derive(Clone, Debug)]
pub struct PriceChangeDetector {
    db: Db,
    catalog: CatalogReconciler,
    cache: PriceFreshnessCache,
    page_size: i64,
    request_delay: StdDuration,
}

impl PriceChangeDetector {
    pub fn new(
        db: Db,
        cache: PriceFreshnessCache,
        page_size: i64,
        request_delay: StdDuration,
    ) -> Self {
        Self {
            catalog: CatalogReconciler::new(db.clone()),
            db,
            cache,
            page_size: page_size.max(1),
            request_delay,
        }
    }

    /// Price up to one page of active games that have no price record yet and are
    /// linked to a store with a registered source.
    ///
    /// Soft failures skip the store. Every attempted game is stamped, so one that
    /// stays unpriced goes to the back of the backlog instead of blocking the page.
    #[instrument(skip(self), fields(page_size = self.page_size))]
    pub async fn run_freshness_sweep(&self) -> EngineResult<Vec<PriceChange>> {
        let sourced = self.cache.sources().stores();
        let games = self
            .catalog
            .games_without_prices(&sourced, self.page_size)
            .await?;
        let mut changes = Vec::new();
        let mut failures = 0usize;
        let mut fetches = 0usize;

        for game in &games {
            self.catalog.mark_backfill_attempt(game.id, Utc::now()).await?;
            let stores: Vec<StoreTag> = game
                .linked_stores()
                .filter(|store| sourced.contains(store))
                .collect();
            for store in stores {
                if fetches > 0 {
                    self.pause().await;
                }
                fetches += 1;
                match self.cache.refresh_store(game, store, None).await {
                    Ok(RefreshOutcome::Updated { change, .. }) => changes.push(change),
                    Ok(RefreshOutcome::NotFound) => {
                        debug!(game_id = game.id, store = %store, "no quote on storefront")
                    }
                    Ok(RefreshOutcome::Skipped) => {}
                    Err(e) if e.is_soft() => {
                        failures += 1;
                        warn!(game_id = game.id, store = %store, error = %e, "backfill fetch failed")
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        info!(
            games = games.len(),
            changes = changes.len(),
            failures,
            "freshness sweep finished"
        );
        Ok(changes)
    }

    /// Refresh up to `limit` records older than `max_age`, oldest first, and
    /// return every change except `no_change`.
    #[instrument(skip(self))]
    pub async fn run_stale_sweep(
        &self,
        max_age: Duration,
        limit: i64,
    ) -> EngineResult<Vec<PriceChange>> {
        let cutoff = Utc::now() - max_age;
        let records = stale_records(&self.db, cutoff, limit).await?;
        let mut games: HashMap<i64, Game> = HashMap::new();
        let mut changes = Vec::new();
        let mut failures = 0usize;

        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                self.pause().await;
            }
            if !games.contains_key(&record.game_id) {
                match self.catalog.get_game(record.game_id).await {
                    Ok(game) => {
                        games.insert(record.game_id, game);
                    }
                    Err(EngineError::GameNotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            let Some(game) = games.get(&record.game_id) else {
                continue;
            };
            match self.cache.refresh_store(game, record.store, Some(record)).await {
                Ok(RefreshOutcome::Updated { change, .. }) => {
                    if change.change_type != ChangeType::NoChange {
                        changes.push(change);
                    }
                }
                Ok(RefreshOutcome::NotFound | RefreshOutcome::Skipped) => {}
                Err(e) if e.is_soft() => {
                    failures += 1;
                    warn!(game_id = record.game_id, store = %record.store, error = %e, "stale refresh failed")
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            scanned = records.len(),
            changes = changes.len(),
            failures,
            "stale sweep finished"
        );
        Ok(changes)
    }

    async fn pause(&self) {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
    }
}
