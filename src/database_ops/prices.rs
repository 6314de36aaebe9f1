//! Per-(game, store) price cache with staleness-checked reads.
//!
//! A read runs in two explicit phases: decide which linked stores are stale, then
//! refresh those through their [`ExternalPriceSource`](crate::database_ops::sources::ExternalPriceSource)
//! and re-read. Refresh failures never reach the caller; the cached row stays
//! authoritative until a later fetch succeeds.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::{debug, instrument, warn};

use crate::database_ops::catalog::CatalogReconciler;
use crate::database_ops::change_detector::detect_at;
use crate::database_ops::sources::SourceRegistry;
use crate::error::{EngineError, EngineResult};
use crate::models::{Game, PriceChange, PriceQuote, PriceRecord, StoreTag};
use crate::util::db::Db;

const PRICE_COLUMNS: &str = "id, game_id, store, regular_price_minor, sale_price_minor, \
     discount_rate, is_on_sale, currency, created_at, updated_at";

/// All price records for a game, ordered by store name.
pub async fn load_prices(db: &Db, game_id: i64) -> EngineResult<Vec<PriceRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {PRICE_COLUMNS} FROM price_records WHERE game_id = ? ORDER BY store"
    ))
    .bind(game_id)
    .fetch_all(&db.pool)
    .await?;
    rows.iter().map(price_from_row).collect()
}

pub async fn load_price(db: &Db, game_id: i64, store: StoreTag) -> EngineResult<Option<PriceRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {PRICE_COLUMNS} FROM price_records WHERE game_id = ? AND store = ?"
    ))
    .bind(game_id)
    .bind(store.as_str())
    .fetch_optional(&db.pool)
    .await?;
    row.as_ref().map(price_from_row).transpose()
}

/// Write `quote` as the authoritative record for `(game_id, store)` in one statement.
///
/// An observation older than the stored row loses: the row is left as is and
/// returned unchanged, so two overlapping refreshes settle on the newest quote.
pub async fn upsert_price(
    db: &Db,
    game_id: i64,
    store: StoreTag,
    quote: &PriceQuote,
    observed_at: DateTime<Utc>,
) -> EngineResult<PriceRecord> {
    let key = format!("price_records({game_id}, {store})");
    let row = sqlx::query(&format!(
        "INSERT INTO price_records (game_id, store, regular_price_minor, sale_price_minor,
                                    discount_rate, is_on_sale, currency, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(game_id, store) DO UPDATE SET
            regular_price_minor = excluded.regular_price_minor,
            sale_price_minor = excluded.sale_price_minor,
            discount_rate = excluded.discount_rate,
            is_on_sale = excluded.is_on_sale,
            currency = excluded.currency,
            updated_at = excluded.updated_at
         WHERE excluded.updated_at >= price_records.updated_at
         RETURNING {PRICE_COLUMNS}"
    ))
    .bind(game_id)
    .bind(store.as_str())
    .bind(quote.regular_price_minor())
    .bind(quote.sale_price_minor())
    .bind(quote.discount_percent)
    .bind(quote.is_on_sale)
    .bind(quote.currency.trim().to_ascii_uppercase())
    .bind(observed_at)
    .bind(observed_at)
    .fetch_optional(&db.pool)
    .await
    .map_err(|e| EngineError::from_sqlx(e, key.clone()))?;

    match row {
        Some(row) => price_from_row(&row),
        None => {
            debug!(game_id, store = %store, "newer price already stored; keeping it");
            load_price(db, game_id, store)
                .await?
                .ok_or(EngineError::PersistenceConflict { key })
        }
    }
}

/// Records of active games last refreshed before `cutoff`, oldest first.
pub async fn stale_records(
    db: &Db,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> EngineResult<Vec<PriceRecord>> {
    let rows = sqlx::query(
        "SELECT p.id, p.game_id, p.store, p.regular_price_minor, p.sale_price_minor,
                p.discount_rate, p.is_on_sale, p.currency, p.created_at, p.updated_at
         FROM price_records p
         JOIN games g ON g.id = p.game_id
         WHERE g.is_active = 1 AND p.updated_at < ?
         ORDER BY p.updated_at, p.id
         LIMIT ?",
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(&db.pool)
    .await?;
    rows.iter().map(price_from_row).collect()
}

/// Cheapest record by current price; ties go to the store name that sorts first.
pub fn lowest_price(records: &[PriceRecord]) -> Option<&PriceRecord> {
    records.iter().min_by(|a, b| {
        a.current_price_minor()
            .cmp(&b.current_price_minor())
            .then_with(|| a.store.as_str().cmp(b.store.as_str()))
    })
}

fn price_from_row(row: &SqliteRow) -> EngineResult<PriceRecord> {
    let raw_store: String = row.try_get("store")?;
    let store = raw_store
        .parse::<StoreTag>()
        .map_err(|e| EngineError::Persistence(sqlx::Error::Decode(Box::new(e))))?;
    Ok(PriceRecord {
        id: row.try_get("id")?,
        game_id: row.try_get("game_id")?,
        store,
        regular_price_minor: row.try_get("regular_price_minor")?,
        sale_price_minor: row.try_get("sale_price_minor")?,
        discount_rate: row.try_get("discount_rate")?,
        is_on_sale: row.try_get("is_on_sale")?,
        currency: row.try_get("currency")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// What a single store refresh did.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Updated {
        record: PriceRecord,
        change: PriceChange,
    },
    /// The storefront does not know the item; cached data untouched.
    NotFound,
    /// The game has no id on this store, or no source is registered for it.
    Skipped,
}

/// Records returned by a read, plus the changes its refreshes detected.
#[derive(Debug, Clone, Default)]
pub struct PriceRefresh {
    pub records: Vec<PriceRecord>,
    pub changes: Vec<PriceChange>,
}

#[derive(Clone, Debug)]
pub struct PriceFreshnessCache {
    db: Db,
    catalog: CatalogReconciler,
    sources: SourceRegistry,
    default_max_age: Duration,
}

impl PriceFreshnessCache {
    pub fn new(db: Db, sources: SourceRegistry, default_max_age: Duration) -> Self {
        Self {
            catalog: CatalogReconciler::new(db.clone()),
            db,
            sources,
            default_max_age,
        }
    }

    pub fn default_max_age(&self) -> Duration {
        self.default_max_age
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Current prices for `game_id`, refreshing stale or missing stores first.
    pub async fn get_prices(
        &self,
        game_id: i64,
        max_age: Option<Duration>,
    ) -> EngineResult<Vec<PriceRecord>> {
        Ok(self.refresh_game(game_id, max_age).await?.records)
    }

    pub async fn get_lowest(
        &self,
        game_id: i64,
        max_age: Option<Duration>,
    ) -> EngineResult<Option<PriceRecord>> {
        let records = self.get_prices(game_id, max_age).await?;
        Ok(lowest_price(&records).cloned())
    }

    /// Check staleness per linked store, refresh the stale ones concurrently, re-read.
    #[instrument(skip(self))]
    pub async fn refresh_game(
        &self,
        game_id: i64,
        max_age: Option<Duration>,
    ) -> EngineResult<PriceRefresh> {
        let game = self.catalog.get_game(game_id).await?;
        let cached = load_prices(&self.db, game_id).await?;
        if !game.is_active {
            return Ok(PriceRefresh {
                records: cached,
                changes: Vec::new(),
            });
        }

        let max_age = max_age.unwrap_or(self.default_max_age);
        let stale = stale_stores(&game, &cached, Utc::now(), max_age);
        if stale.is_empty() {
            return Ok(PriceRefresh {
                records: cached,
                changes: Vec::new(),
            });
        }
        debug!(game_id, stale = ?stale, "refreshing stale stores");

        let by_store: HashMap<StoreTag, &PriceRecord> =
            cached.iter().map(|r| (r.store, r)).collect();
        let outcomes = join_all(stale.iter().map(|store| {
            self.refresh_store(&game, *store, by_store.get(store).copied())
        }))
        .await;

        let mut changes = Vec::new();
        for (store, outcome) in stale.iter().zip(outcomes) {
            match outcome {
                Ok(RefreshOutcome::Updated { change, .. }) => changes.push(change),
                Ok(RefreshOutcome::NotFound) => {
                    debug!(game_id, store = %store, "storefront has no quote; keeping cache")
                }
                Ok(RefreshOutcome::Skipped) => {}
                Err(e) if e.is_soft() => {
                    warn!(game_id, store = %store, error = %e, "price refresh failed; serving cached data")
                }
                Err(e) => return Err(e),
            }
        }

        Ok(PriceRefresh {
            records: load_prices(&self.db, game_id).await?,
            changes,
        })
    }

    /// Fetch one store's quote for `game`, classify it against `previous` and persist it.
    ///
    /// Fetch failures surface as soft [`EngineError::ExternalFetch`]; an invalid quote
    /// is [`EngineError::MalformedSourceData`]. Neither writes anything.
    pub async fn refresh_store(
        &self,
        game: &Game,
        store: StoreTag,
        previous: Option<&PriceRecord>,
    ) -> EngineResult<RefreshOutcome> {
        let Some(external_id) = game.external_id(store) else {
            return Ok(RefreshOutcome::Skipped);
        };
        let Some(source) = self.sources.get(store) else {
            debug!(game_id = game.id, store = %store, "no price source registered; skipping");
            return Ok(RefreshOutcome::Skipped);
        };

        let quote = source
            .fetch_price(external_id)
            .await
            .map_err(|source| EngineError::ExternalFetch {
                store,
                external_id: external_id.to_string(),
                source,
            })?;
        let Some(quote) = quote else {
            return Ok(RefreshOutcome::NotFound);
        };
        quote
            .validate()
            .map_err(|reason| EngineError::MalformedSourceData {
                store,
                external_id: external_id.to_string(),
                reason,
            })?;

        let now = Utc::now();
        let change = detect_at(game, store, previous, &quote, now);
        let record = upsert_price(&self.db, game.id, store, &quote, now).await?;
        debug!(
            game_id = game.id,
            store = %store,
            change = %change.change_type,
            price_minor = record.current_price_minor(),
            "price refreshed"
        );
        Ok(RefreshOutcome::Updated { record, change })
    }
}

/// Linked stores with no record or a record older than `max_age`.
pub fn stale_stores(
    game: &Game,
    records: &[PriceRecord],
    now: DateTime<Utc>,
    max_age: Duration,
) -> Vec<StoreTag> {
    game.linked_stores()
        .filter(|store| match records.iter().find(|r| r.store == *store) {
            Some(record) => record.is_stale(now, max_age),
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::database_ops::sources::{ScriptedPriceSource, ScriptedResponse};
    use crate::models::{ChangeType, GameAttributes};

    fn quote(price: i64, original: i64, on_sale: bool) -> PriceQuote {
        PriceQuote {
            price_minor: price,
            original_price_minor: original,
            discount_percent: if original > 0 { (original - price) * 100 / original } else { 0 },
            currency: "JPY".into(),
            is_on_sale: on_sale,
        }
    }

    struct Fixture {
        db: Db,
        catalog: CatalogReconciler,
        steam: Arc<ScriptedPriceSource>,
        epic: Arc<ScriptedPriceSource>,
        cache: PriceFreshnessCache,
    }

    async fn fixture() -> Fixture {
        let db = Db::connect_in_memory().await.unwrap();
        let steam = Arc::new(ScriptedPriceSource::new(StoreTag::Steam));
        let epic = Arc::new(ScriptedPriceSource::new(StoreTag::Epic));
        let sources = SourceRegistry::new().with(steam.clone()).with(epic.clone());
        Fixture {
            catalog: CatalogReconciler::new(db.clone()),
            cache: PriceFreshnessCache::new(db.clone(), sources, Duration::hours(1)),
            db,
            steam,
            epic,
        }
    }

    async fn age_record(db: &Db, game_id: i64, store: StoreTag, age: Duration) {
        sqlx::query("UPDATE price_records SET updated_at = ? WHERE game_id = ? AND store = ?")
            .bind(Utc::now() - age)
            .bind(game_id)
            .bind(store.as_str())
            .execute(&db.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_records_are_fetched_and_fresh_ones_are_not() {
        let f = fixture().await;
        let game = f
            .catalog
            .reconcile(StoreTag::Steam, "620", &GameAttributes::titled("Portal 2"))
            .await
            .unwrap();
        f.steam.set_quote("620", quote(980, 980, false));

        let first = f.cache.refresh_game(game.id, None).await.unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.changes[0].change_type, ChangeType::New);

        let second = f.cache.get_prices(game.id, None).await.unwrap();
        assert_eq!(second, first.records);
        assert_eq!(f.steam.calls(), 1);
    }

    #[tokio::test]
    async fn stale_record_is_refreshed_in_place() {
        let f = fixture().await;
        let game = f
            .catalog
            .reconcile(StoreTag::Steam, "620", &GameAttributes::titled("Portal 2"))
            .await
            .unwrap();
        f.steam.set_quote("620", quote(980, 980, false));
        f.cache.get_prices(game.id, None).await.unwrap();
        age_record(&f.db, game.id, StoreTag::Steam, Duration::hours(2)).await;

        f.steam.set_quote("620", quote(490, 980, true));
        let refreshed = f.cache.refresh_game(game.id, None).await.unwrap();
        assert_eq!(f.steam.calls(), 2);
        assert_eq!(refreshed.records.len(), 1);
        assert_eq!(refreshed.records[0].current_price_minor(), 490);
        assert_eq!(refreshed.records[0].discount_rate, 50);
        assert_eq!(refreshed.changes[0].change_type, ChangeType::SaleStart);
    }

    #[tokio::test]
    async fn failures_keep_the_cached_record() {
        let f = fixture().await;
        let game = f
            .catalog
            .reconcile(StoreTag::Epic, "ns-hades", &GameAttributes::titled("Hades"))
            .await
            .unwrap();
        f.epic.set_quote("ns-hades", quote(2570, 2570, false));
        let before = f.cache.get_prices(game.id, None).await.unwrap();
        age_record(&f.db, game.id, StoreTag::Epic, Duration::hours(3)).await;
        let aged = load_prices(&f.db, game.id).await.unwrap();

        f.epic.set_response("ns-hades", ScriptedResponse::Unavailable);
        let after = f.cache.get_prices(game.id, None).await.unwrap();
        assert_eq!(after, aged);
        assert_eq!(after[0].regular_price_minor, before[0].regular_price_minor);

        f.epic.set_response("ns-hades", ScriptedResponse::NotFound);
        assert_eq!(f.cache.get_prices(game.id, None).await.unwrap(), aged);
    }

    #[tokio::test]
    async fn malformed_quotes_are_not_written() {
        let f = fixture().await;
        let game = f
            .catalog
            .reconcile(StoreTag::Steam, "1", &GameAttributes::titled("Broken"))
            .await
            .unwrap();
        let mut bad = quote(100, 100, false);
        bad.discount_percent = 140;
        f.steam.set_quote("1", bad);
        assert!(f.cache.get_prices(game.id, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inactive_games_are_served_from_cache() {
        let f = fixture().await;
        let game = f
            .catalog
            .reconcile(StoreTag::Steam, "620", &GameAttributes::titled("Portal 2"))
            .await
            .unwrap();
        f.steam.set_quote("620", quote(980, 980, false));
        f.cache.get_prices(game.id, None).await.unwrap();
        age_record(&f.db, game.id, StoreTag::Steam, Duration::hours(5)).await;
        f.catalog.deactivate_game(game.id).await.unwrap();

        assert_eq!(f.cache.get_prices(game.id, None).await.unwrap().len(), 1);
        assert_eq!(f.steam.calls(), 1);
        assert!(matches!(
            f.cache.get_prices(404, None).await,
            Err(EngineError::GameNotFound(404))
        ));
    }

    #[tokio::test]
    async fn older_observation_never_overwrites_newer_one() {
        let f = fixture().await;
        let game = f
            .catalog
            .reconcile(StoreTag::Steam, "620", &GameAttributes::titled("Portal 2"))
            .await
            .unwrap();
        let now = Utc::now();
        upsert_price(&f.db, game.id, StoreTag::Steam, &quote(900, 900, false), now)
            .await
            .unwrap();
        let kept = upsert_price(
            &f.db,
            game.id,
            StoreTag::Steam,
            &quote(100, 100, false),
            now - Duration::minutes(5),
        )
        .await
        .unwrap();
        assert_eq!(kept.regular_price_minor, 900);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM price_records")
            .fetch_one(&f.db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn lowest_breaks_ties_by_store_name() {
        let f = fixture().await;
        let game = f
            .catalog
            .reconcile(StoreTag::Steam, "292030", &GameAttributes::titled("The Witcher 3"))
            .await
            .unwrap();
        let now = Utc::now();
        for (store, price) in [(StoreTag::Steam, 1200), (StoreTag::Gog, 1000), (StoreTag::Epic, 1000)] {
            upsert_price(&f.db, game.id, store, &quote(price, price, false), now)
                .await
                .unwrap();
        }
        let records = load_prices(&f.db, game.id).await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.store).collect::<Vec<_>>(),
            vec![StoreTag::Epic, StoreTag::Gog, StoreTag::Steam]
        );
        assert_eq!(lowest_price(&records).map(|r| r.store), Some(StoreTag::Epic));
        assert!(lowest_price(&[]).is_none());
    }

    #[tokio::test]
    async fn stale_records_skip_inactive_games() {
        let f = fixture().await;
        let a = f
            .catalog
            .reconcile(StoreTag::Steam, "1", &GameAttributes::titled("A"))
            .await
            .unwrap();
        let b = f
            .catalog
            .reconcile(StoreTag::Steam, "2", &GameAttributes::titled("B"))
            .await
            .unwrap();
        let old = Utc::now() - Duration::days(2);
        for id in [a.id, b.id] {
            upsert_price(&f.db, id, StoreTag::Steam, &quote(100, 100, false), old)
                .await
                .unwrap();
        }
        f.catalog.deactivate_game(b.id).await.unwrap();
        let stale = stale_records(&f.db, Utc::now() - Duration::hours(24), 50)
            .await
            .unwrap();
        assert_eq!(stale.iter().map(|r| r.game_id).collect::<Vec<_>>(), vec![a.id]);
    }
}
