//! In-process entry point wiring the catalog, the price cache, the change
//! detector and the notification trigger over one database handle.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::{EngineConfig, StoreSettings};
use crate::database_ops::alerts::{AlertTrigger, NotificationTrigger};
use crate::database_ops::catalog::CatalogReconciler;
use crate::database_ops::change_detector::{self, PriceChangeDetector};
use crate::database_ops::epic::provider::EpicPriceSource;
use crate::database_ops::prices::{load_price, PriceFreshnessCache, PriceRefresh, RefreshOutcome};
use crate::database_ops::sources::SourceRegistry;
use crate::database_ops::steam::provider::SteamPriceSource;
use crate::error::{EngineError, EngineResult};
use crate::models::{Game, GameAttributes, PriceChange, PriceQuote, PriceRecord, StoreTag};
use crate::util::db::Db;
use crate::util::env::init_env;

/// Result of [`PriceEngine::import_game`].
#[derive(Debug, Clone, Serialize)]
pub struct ImportedGame {
    pub game: Game,
    /// `None` when the storefront had no quote or the price fetch failed softly.
    pub change: Option<PriceChange>,
}

#[derive(Clone, Debug)]
pub struct PriceEngine {
    db: Db,
    config: EngineConfig,
    catalog: CatalogReconciler,
    cache: PriceFreshnessCache,
    detector: PriceChangeDetector,
    alerts: NotificationTrigger,
}

impl PriceEngine {
    pub fn new(db: Db, sources: SourceRegistry, config: EngineConfig) -> Self {
        let cache = PriceFreshnessCache::new(db.clone(), sources, config.max_age);
        let detector = PriceChangeDetector::new(
            db.clone(),
            cache.clone(),
            config.backfill_page_size,
            config.request_delay,
        );
        Self {
            catalog: CatalogReconciler::new(db.clone()),
            alerts: NotificationTrigger::new(db.clone()),
            cache,
            detector,
            config,
            db,
        }
    }

    /// Steam and Epic sources configured from `settings`.
    pub fn default_sources(settings: &StoreSettings) -> SourceRegistry {
        SourceRegistry::new()
            .with(Arc::new(SteamPriceSource::new(settings)))
            .with(Arc::new(EpicPriceSource::new(settings)))
    }

    pub async fn connect(config: EngineConfig) -> anyhow::Result<Self> {
        let db = Db::connect(&config.database_url, config.db_max_connections).await?;
        let sources = Self::default_sources(&config.stores);
        info!(stores = ?sources.stores(), "price engine ready");
        Ok(Self::new(db, sources, config))
    }

    pub async fn from_env() -> anyhow::Result<Self> {
        init_env();
        Self::connect(EngineConfig::from_env()).await
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn reconcile(
        &self,
        store: StoreTag,
        external_id: &str,
        attrs: &GameAttributes,
    ) -> EngineResult<Game> {
        self.catalog.reconcile(store, external_id, attrs).await
    }

    pub async fn get_game(&self, game_id: i64) -> EngineResult<Game> {
        self.catalog.get_game(game_id).await
    }

    pub async fn find_game(&self, store: StoreTag, external_id: &str) -> EngineResult<Option<Game>> {
        self.catalog.find_game(store, external_id).await
    }

    /// Prices per store for `game_id`; `None` uses the configured freshness window.
    pub async fn get_prices(
        &self,
        game_id: i64,
        max_age: Option<Duration>,
    ) -> EngineResult<Vec<PriceRecord>> {
        self.cache.get_prices(game_id, max_age).await
    }

    /// Same read as [`get_prices`](Self::get_prices), also returning the changes
    /// its refreshes detected so the caller can hand them to
    /// [`evaluate_alerts`](Self::evaluate_alerts).
    pub async fn get_prices_with_changes(
        &self,
        game_id: i64,
        max_age: Option<Duration>,
    ) -> EngineResult<PriceRefresh> {
        self.cache.refresh_game(game_id, max_age).await
    }

    pub async fn get_lowest(
        &self,
        game_id: i64,
        max_age: Option<Duration>,
    ) -> EngineResult<Option<PriceRecord>> {
        self.cache.get_lowest(game_id, max_age).await
    }

    pub fn detect(
        &self,
        game: &Game,
        store: StoreTag,
        previous: Option<&PriceRecord>,
        fetched: &PriceQuote,
    ) -> PriceChange {
        change_detector::detect(game, store, previous, fetched)
    }

    pub async fn run_freshness_sweep(&self) -> EngineResult<Vec<PriceChange>> {
        self.detector.run_freshness_sweep().await
    }

    /// Re-price stale records. Defaults to the configured window and sweep limit.
    pub async fn run_stale_sweep(
        &self,
        max_age: Option<Duration>,
        limit: Option<i64>,
    ) -> EngineResult<Vec<PriceChange>> {
        self.detector
            .run_stale_sweep(
                max_age.unwrap_or(self.config.max_age),
                limit.unwrap_or(self.config.stale_sweep_limit),
            )
            .await
    }

    /// Seed the catalog from a storefront id: fetch attributes, reconcile, then price
    /// that store once.
    #[instrument(skip(self), fields(store = %store))]
    pub async fn import_game(&self, store: StoreTag, external_id: &str) -> EngineResult<ImportedGame> {
        let source = self
            .cache
            .sources()
            .get(store)
            .ok_or(EngineError::UnknownStore(store))?;
        let attrs = source
            .fetch_attributes(external_id)
            .await
            .map_err(|source| EngineError::ExternalFetch {
                store,
                external_id: external_id.to_string(),
                source,
            })?;

        let game = match attrs {
            Some(attrs) => self.catalog.reconcile(store, external_id, &attrs).await?,
            None => self
                .catalog
                .find_game(store, external_id.trim())
                .await?
                .ok_or_else(|| EngineError::MalformedSourceData {
                    store,
                    external_id: external_id.to_string(),
                    reason: "storefront returned no attributes".into(),
                })?,
        };

        let previous = load_price(&self.db, game.id, store).await?;
        let change = match self.cache.refresh_store(&game, store, previous.as_ref()).await {
            Ok(RefreshOutcome::Updated { change, .. }) => Some(change),
            Ok(RefreshOutcome::NotFound | RefreshOutcome::Skipped) => None,
            Err(e) if e.is_soft() => {
                warn!(game_id = game.id, error = %e, "imported game without a price");
                None
            }
            Err(e) => return Err(e),
        };
        info!(game_id = game.id, priced = change.is_some(), "game imported");
        Ok(ImportedGame { game, change })
    }

    pub async fn search_games(&self, query: &str, limit: usize) -> EngineResult<Vec<Game>> {
        self.catalog.search_games(query, limit).await
    }

    pub async fn deactivate_game(&self, game_id: i64) -> EngineResult<()> {
        self.catalog.deactivate_game(game_id).await
    }

    pub async fn link_external_id(
        &self,
        game_id: i64,
        store: StoreTag,
        external_id: &str,
    ) -> EngineResult<Game> {
        self.catalog.link_external_id(game_id, store, external_id).await
    }

    pub async fn evaluate_alerts(&self, changes: &[PriceChange]) -> EngineResult<Vec<AlertTrigger>> {
        self.alerts.evaluate(changes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::sources::ScriptedPriceSource;
    use crate::models::ChangeType;

    #[tokio::test]
    async fn import_seeds_catalog_and_price() {
        crate::tracing::init_test_tracing();
        let db = Db::connect_in_memory().await.unwrap();
        let steam = Arc::new(ScriptedPriceSource::new(StoreTag::Steam));
        let mut attrs = GameAttributes::titled("Stardew Valley");
        attrs.developer = Some("ConcernedApe".into());
        steam.set_attributes("413150", attrs);
        steam.set_quote(
            "413150",
            PriceQuote {
                price_minor: 1480,
                original_price_minor: 1480,
                discount_percent: 0,
                currency: "JPY".into(),
                is_on_sale: false,
            },
        );
        let engine = PriceEngine::new(
            db,
            SourceRegistry::new().with(steam.clone()),
            EngineConfig::default().without_delay(),
        );

        let imported = engine.import_game(StoreTag::Steam, "413150").await.unwrap();
        assert_eq!(imported.game.developer.as_deref(), Some("ConcernedApe"));
        assert_eq!(imported.change.map(|c| c.change_type), Some(ChangeType::New));

        // the read right after import is served from cache
        let prices = engine.get_prices(imported.game.id, None).await.unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(steam.calls(), 1);

        assert!(matches!(
            engine.import_game(StoreTag::Epic, "anything").await,
            Err(EngineError::UnknownStore(StoreTag::Epic))
        ));
        assert!(matches!(
            engine.import_game(StoreTag::Steam, "missing").await,
            Err(EngineError::MalformedSourceData { .. })
        ));
    }
}
