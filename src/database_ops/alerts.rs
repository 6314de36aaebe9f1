use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, instrument};

use crate::error::EngineResult;
use crate::models::{ChangeType, FavoriteThreshold, PriceChange, StoreTag};
use crate::util::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertReason {
    /// The new price is at or below the user's saved target.
    ThresholdReached,
    /// A sale began on a favorite without a saved target.
    SaleStarted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertTrigger {
    pub user_id: i64,
    pub game_id: i64,
    pub game_title: String,
    pub store: StoreTag,
    pub reason: AlertReason,
    pub change_type: ChangeType,
    pub price_minor: i64,
    pub threshold_minor: Option<i64>,
    pub currency: String,
    pub triggered_at: DateTime<Utc>,
}

/// Decide whether `change` warrants an alert for `favorite`.
pub fn should_notify(change: &PriceChange, favorite: &FavoriteThreshold) -> Option<AlertReason> {
    if !favorite.notification_enabled || favorite.game_id != change.game_id {
        return None;
    }
    let moved_down = matches!(
        change.change_type,
        ChangeType::New | ChangeType::Decrease | ChangeType::SaleStart
    );
    match favorite.price_threshold_minor {
        Some(threshold) if moved_down && change.new_price_minor <= threshold => {
            Some(AlertReason::ThresholdReached)
        }
        Some(_) => None,
        None if change.change_type == ChangeType::SaleStart => Some(AlertReason::SaleStarted),
        None => None,
    }
}

/// Reads saved favorites and matches them against detected changes. Delivery is
/// someone else's job; this only says who should hear about what.
#[derive(Clone, Debug)]
pub struct NotificationTrigger {
    db: Db,
}

impl NotificationTrigger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    pub async fn evaluate(&self, changes: &[PriceChange]) -> EngineResult<Vec<AlertTrigger>> {
        let game_ids: BTreeSet<i64> = changes.iter().map(|c| c.game_id).collect();
        if game_ids.is_empty() {
            return Ok(vec![]);
        }
        let favorites = self.load_favorites(&game_ids).await?;

        let mut triggers = Vec::new();
        for change in changes {
            for fav in favorites.iter().filter(|f| f.game_id == change.game_id) {
                if let Some(reason) = should_notify(change, fav) {
                    triggers.push(AlertTrigger {
                        user_id: fav.user_id,
                        game_id: change.game_id,
                        game_title: change.game_title.clone(),
                        store: change.store,
                        reason,
                        change_type: change.change_type,
                        price_minor: change.new_price_minor,
                        threshold_minor: fav.price_threshold_minor,
                        currency: change.currency.clone(),
                        triggered_at: change.detected_at,
                    });
                }
            }
        }
        debug!(favorites = favorites.len(), triggers = triggers.len(), "alerts evaluated");
        Ok(triggers)
    }

    pub async fn load_favorites(
        &self,
        game_ids: &BTreeSet<i64>,
    ) -> EngineResult<Vec<FavoriteThreshold>> {
        if game_ids.is_empty() {
            return Ok(vec![]);
        }
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "SELECT user_id, game_id, notification_enabled, price_threshold_minor \
             FROM user_favorites WHERE game_id IN (",
        );
        let mut sep = qb.separated(", ");
        for id in game_ids {
            sep.push_bind(*id);
        }
        qb.push(") ORDER BY game_id, user_id");

        let rows = qb.build().fetch_all(&self.db.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(FavoriteThreshold {
                user_id: r.try_get("user_id")?,
                game_id: r.try_get("game_id")?,
                notification_enabled: r.try_get("notification_enabled")?,
                price_threshold_minor: r.try_get("price_threshold_minor")?,
            });
        }
        Ok(out)
    }
}
