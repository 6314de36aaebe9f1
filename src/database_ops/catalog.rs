//! Canonical game records: identity resolution across storefronts, attribute
//! merging, soft deactivation and title search.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::models::{non_blank, Game, GameAttributes, StoreTag};
use crate::normalization::title::{normalize_title, title_similarity};
use crate::util::db::Db;

/// How often a reconcile re-reads after losing an insert race before giving up.
const MAX_RECONCILE_ATTEMPTS: usize = 3;

const GAME_COLUMNS: &str = "id, title, normalized_title, description, developer, publisher, \
     genres, release_date, image_url, rating, metacritic_score, is_active, created_at, updated_at";

#[derive(Clone, Debug)]
pub struct CatalogReconciler {
    db: Db,
}

impl CatalogReconciler {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Resolve `(store, external_id)` to its canonical game, creating it on first
    /// sight and merging non-empty incoming attributes otherwise.
    ///
    /// The external-id link carries a unique constraint; a concurrent reconcile of
    /// the same id loses the insert, discards its half-built row and re-reads.
    #[instrument(skip(self, attrs), fields(store = %store))]
    pub async fn reconcile(
        &self,
        store: StoreTag,
        external_id: &str,
        attrs: &GameAttributes,
    ) -> EngineResult<Game> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(EngineError::MalformedSourceData {
                store,
                external_id: String::new(),
                reason: "empty external id".into(),
            });
        }
        let Some(title) = attrs.usable_title() else {
            return Err(EngineError::MalformedSourceData {
                store,
                external_id: external_id.to_string(),
                reason: "missing title".into(),
            });
        };

        for attempt in 0..MAX_RECONCILE_ATTEMPTS {
            let now = Utc::now();
            if let Some(game_id) = self.find_game_id(store, external_id).await? {
                self.merge_attributes(game_id, title, attrs, now).await?;
                debug!(game_id, external_id, "reconciled existing game");
                return self.get_game(game_id).await;
            }
            match self.insert_game(store, external_id, title, attrs, now).await {
                Ok(game_id) => {
                    info!(game_id, external_id, title, "created game");
                    return self.get_game(game_id).await;
                }
                Err(e) if e.is_conflict() => {
                    debug!(attempt, external_id, "lost insert race; re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::PersistenceConflict {
            key: link_key(store, external_id),
        })
    }

    pub async fn find_game_id(&self, store: StoreTag, external_id: &str) -> EngineResult<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT game_id FROM game_external_ids WHERE store = ? AND external_id = ?",
        )
        .bind(store.as_str())
        .bind(external_id)
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(id)
    }

    pub async fn find_game(&self, store: StoreTag, external_id: &str) -> EngineResult<Option<Game>> {
        match self.find_game_id(store, external_id).await? {
            Some(id) => Ok(Some(self.get_game(id).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_game(&self, game_id: i64) -> EngineResult<Game> {
        let row = sqlx::query(&format!("SELECT {GAME_COLUMNS} FROM games WHERE id = ?"))
            .bind(game_id)
            .fetch_optional(&self.db.pool)
            .await?
            .ok_or(EngineError::GameNotFound(game_id))?;
        self.hydrate(&row).await
    }

    // One UPDATE so a partially merged row is never visible.
    async fn merge_attributes(
        &self,
        game_id: i64,
        title: &str,
        attrs: &GameAttributes,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE games SET
                title = ?,
                normalized_title = ?,
                description = COALESCE(?, description),
                developer = COALESCE(?, developer),
                publisher = COALESCE(?, publisher),
                normalized_developer = COALESCE(?, normalized_developer),
                normalized_publisher = COALESCE(?, normalized_publisher),
                genres = COALESCE(?, genres),
                release_date = COALESCE(?, release_date),
                image_url = COALESCE(?, image_url),
                rating = COALESCE(?, rating),
                metacritic_score = COALESCE(?, metacritic_score),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(title)
        .bind(normalize_title(title))
        .bind(non_blank(attrs.description.as_deref()))
        .bind(non_blank(attrs.developer.as_deref()))
        .bind(non_blank(attrs.publisher.as_deref()))
        .bind(normalized_name(attrs.developer.as_deref()))
        .bind(normalized_name(attrs.publisher.as_deref()))
        .bind(join_genres(&attrs.genres))
        .bind(attrs.release_date)
        .bind(non_blank(attrs.image_url.as_deref()))
        .bind(attrs.rating)
        .bind(attrs.metacritic_score)
        .bind(now)
        .bind(game_id)
        .execute(&self.db.pool)
        .await
        .map_err(|e| EngineError::from_sqlx(e, format!("games/{game_id}")))?;
        Ok(())
    }

    async fn insert_game(
        &self,
        store: StoreTag,
        external_id: &str,
        title: &str,
        attrs: &GameAttributes,
        now: DateTime<Utc>,
    ) -> EngineResult<i64> {
        let key = link_key(store, external_id);
        let mut tx = self.db.pool.begin().await?;

        let game_id: i64 = sqlx::query_scalar(
            "INSERT INTO games (title, normalized_title, description, developer, publisher,
                                normalized_developer, normalized_publisher, genres,
                                release_date, image_url, rating, metacritic_score, is_active,
                                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
             RETURNING id",
        )
        .bind(title)
        .bind(normalize_title(title))
        .bind(non_blank(attrs.description.as_deref()))
        .bind(non_blank(attrs.developer.as_deref()))
        .bind(non_blank(attrs.publisher.as_deref()))
        .bind(normalized_name(attrs.developer.as_deref()))
        .bind(normalized_name(attrs.publisher.as_deref()))
        .bind(join_genres(&attrs.genres))
        .bind(attrs.release_date)
        .bind(non_blank(attrs.image_url.as_deref()))
        .bind(attrs.rating)
        .bind(attrs.metacritic_score)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| EngineError::from_sqlx(e, key.clone()))?;

        let linked = sqlx::query(
            "INSERT INTO game_external_ids (game_id, store, external_id, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(game_id)
        .bind(store.as_str())
        .bind(external_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| EngineError::from_sqlx(e, key.clone()))?;

        if linked.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(EngineError::PersistenceConflict { key });
        }
        tx.commit()
            .await
            .map_err(|e| EngineError::from_sqlx(e, key.clone()))?;
        Ok(game_id)
    }

    /// Attach another storefront's id to an existing game. Re-linking the same pair
    /// is a no-op; an id owned by a different game, or a second id for the same
    /// store, is a conflict.
    #[instrument(skip(self), fields(store = %store))]
    pub async fn link_external_id(
        &self,
        game_id: i64,
        store: StoreTag,
        external_id: &str,
    ) -> EngineResult<Game> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(EngineError::MalformedSourceData {
                store,
                external_id: String::new(),
                reason: "empty external id".into(),
            });
        }
        let game = self.get_game(game_id).await?;
        if game.external_id(store) == Some(external_id) {
            return Ok(game);
        }
        sqlx::query(
            "INSERT INTO game_external_ids (game_id, store, external_id, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(game_id)
        .bind(store.as_str())
        .bind(external_id)
        .bind(Utc::now())
        .execute(&self.db.pool)
        .await
        .map_err(|e| EngineError::from_sqlx(e, link_key(store, external_id)))?;
        info!(game_id, external_id, "linked external id");
        self.get_game(game_id).await
    }

    /// Soft delete: the row stays, refreshes and sweeps skip it.
    pub async fn deactivate_game(&self, game_id: i64) -> EngineResult<()> {
        let res = sqlx::query("UPDATE games SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(game_id)
            .execute(&self.db.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(EngineError::GameNotFound(game_id));
        }
        info!(game_id, "deactivated game");
        Ok(())
    }

    /// Active games whose normalized title, developer or publisher contains the
    /// normalized query, best title match first.
    ///
    /// Candidates are capped after a cheap SQL relevance order (exact title, then
    /// title prefix, then shortest title) and re-ranked by Jaro-Winkler.
    pub async fn search_games(&self, query: &str, limit: usize) -> EngineResult<Vec<Game>> {
        let needle = normalize_title(query);
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let contains = format!("%{needle}%");
        let prefix = format!("{needle}%");
        let candidate_cap = (limit.saturating_mul(5)).min(500) as i64;
        let rows = sqlx::query(&format!(
            "SELECT {GAME_COLUMNS} FROM games
             WHERE is_active = 1
               AND (normalized_title LIKE ?1
                    OR normalized_developer LIKE ?1
                    OR normalized_publisher LIKE ?1)
             ORDER BY normalized_title = ?2 DESC,
                      normalized_title LIKE ?3 DESC,
                      normalized_title LIKE ?1 DESC,
                      LENGTH(normalized_title),
                      id
             LIMIT ?4"
        ))
        .bind(&contains)
        .bind(&needle)
        .bind(&prefix)
        .bind(candidate_cap)
        .fetch_all(&self.db.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let game = self.hydrate(row).await?;
            let score = title_similarity(&game.normalized_title, &needle);
            scored.push((score, game));
        }
        scored.sort_by(|(sa, ga), (sb, gb)| {
            sb.total_cmp(sa).then_with(|| ga.title.cmp(&gb.title))
        });
        Ok(scored.into_iter().take(limit).map(|(_, g)| g).collect())
    }

    /// Active, unpriced games linked to at least one of `stores`, least recently
    /// attempted first (never-attempted games lead, then by id).
    ///
    /// Callers stamp each attempt with [`mark_backfill_attempt`](Self::mark_backfill_attempt)
    /// so games that keep failing rotate behind the rest of the backlog.
    pub async fn games_without_prices(
        &self,
        stores: &[StoreTag],
        limit: i64,
    ) -> EngineResult<Vec<Game>> {
        if stores.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT {GAME_COLUMNS} FROM games g
             WHERE g.is_active = 1
               AND NOT EXISTS (SELECT 1 FROM price_records p WHERE p.game_id = g.id)
               AND EXISTS (SELECT 1 FROM game_external_ids x
                           WHERE x.game_id = g.id AND x.store IN ("
        ));
        let mut sep = qb.separated(", ");
        for store in stores {
            sep.push_bind(store.as_str());
        }
        qb.push(
            "))
             ORDER BY g.last_backfill_attempt_at IS NOT NULL, g.last_backfill_attempt_at, g.id
             LIMIT ",
        );
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.db.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.hydrate(row).await?);
        }
        Ok(out)
    }

    pub async fn mark_backfill_attempt(&self, game_id: i64, at: DateTime<Utc>) -> EngineResult<()> {
        sqlx::query("UPDATE games SET last_backfill_attempt_at = ? WHERE id = ?")
            .bind(at)
            .bind(game_id)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    async fn hydrate(&self, row: &SqliteRow) -> EngineResult<Game> {
        let id: i64 = row.try_get("id")?;
        let links = sqlx::query("SELECT store, external_id FROM game_external_ids WHERE game_id = ?")
            .bind(id)
            .fetch_all(&self.db.pool)
            .await?;
        let mut external_ids = BTreeMap::new();
        for link in links {
            let raw: String = link.try_get("store")?;
            match StoreTag::from_str(&raw) {
                Ok(tag) => {
                    external_ids.insert(tag, link.try_get::<String, _>("external_id")?);
                }
                Err(e) => warn!(game_id = id, error = %e, "ignoring link with unknown store"),
            }
        }
        Ok(Game {
            id,
            title: row.try_get("title")?,
            normalized_title: row.try_get("normalized_title")?,
            description: row.try_get("description")?,
            developer: row.try_get("developer")?,
            publisher: row.try_get("publisher")?,
            genres: split_genres(row.try_get::<Option<String>, _>("genres")?.as_deref()),
            release_date: row.try_get("release_date")?,
            image_url: row.try_get("image_url")?,
            rating: row.try_get("rating")?,
            metacritic_score: row.try_get("metacritic_score")?,
            external_ids,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn link_key(store: StoreTag, external_id: &str) -> String {
    format!("game_external_ids({store}, {external_id})")
}

fn normalized_name(raw: Option<&str>) -> Option<String> {
    non_blank(raw)
        .map(normalize_title)
        .filter(|n| !n.is_empty())
}

fn join_genres(genres: &[String]) -> Option<String> {
    let cleaned: Vec<&str> = genres
        .iter()
        .map(|g| g.trim())
        .filter(|g| !g.is_empty())
        .collect();
    (!cleaned.is_empty()).then(|| cleaned.join(","))
}

fn split_genres(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog() -> CatalogReconciler {
        CatalogReconciler::new(Db::connect_in_memory().await.unwrap())
    }

    fn attrs(title: &str) -> GameAttributes {
        GameAttributes::titled(title)
    }

    #[tokio::test]
    async fn creates_game_with_normalized_title_and_link() {
        let catalog = catalog().await;
        let game = catalog
            .reconcile(StoreTag::Steam, "1091500", &attrs("Cyberpunk 2077: Ultimate Edition!"))
            .await
            .unwrap();
        assert_eq!(game.normalized_title, "cyberpunk 2077 ultimate edition");
        assert_eq!(game.external_id(StoreTag::Steam), Some("1091500"));
        assert!(game.is_active);
    }

    #[tokio::test]
    async fn repeated_reconcile_keeps_one_row_and_merges_non_empty_values() {
        let catalog = catalog().await;
        let mut first = attrs("Hades");
        first.developer = Some("Supergiant Games".into());
        first.genres = vec!["Action".into(), "Roguelike".into()];
        let a = catalog.reconcile(StoreTag::Steam, "1145360", &first).await.unwrap();

        let mut second = attrs("Hades II");
        second.developer = Some("   ".into());
        second.publisher = Some("Supergiant Games".into());
        let b = catalog.reconcile(StoreTag::Steam, "1145360", &second).await.unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(b.title, "Hades II");
        assert_eq!(b.normalized_title, "hades ii");
        assert_eq!(b.developer.as_deref(), Some("Supergiant Games"));
        assert_eq!(b.publisher.as_deref(), Some("Supergiant Games"));
        assert_eq!(b.genres, vec!["Action".to_string(), "Roguelike".to_string()]);
        assert!(b.updated_at >= a.updated_at);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM games")
            .fetch_one(&catalog.db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn missing_title_is_rejected_without_writing() {
        let catalog = catalog().await;
        let err = catalog
            .reconcile(StoreTag::Epic, "ns-1", &GameAttributes::titled("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedSourceData { .. }));
        assert!(err.is_soft());
        assert!(catalog.find_game(StoreTag::Epic, "ns-1").await.unwrap().is_none());
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM games")
            .fetch_one(&catalog.db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn same_external_id_on_different_stores_are_different_games() {
        let catalog = catalog().await;
        let steam = catalog.reconcile(StoreTag::Steam, "42", &attrs("A")).await.unwrap();
        let epic = catalog.reconcile(StoreTag::Epic, "42", &attrs("B")).await.unwrap();
        assert_ne!(steam.id, epic.id);
    }

    #[tokio::test]
    async fn linking_rejects_ids_owned_by_another_game() {
        let catalog = catalog().await;
        let a = catalog.reconcile(StoreTag::Steam, "1", &attrs("A")).await.unwrap();
        let b = catalog.reconcile(StoreTag::Epic, "ns-b", &attrs("B")).await.unwrap();

        let linked = catalog.link_external_id(a.id, StoreTag::Epic, "ns-a").await.unwrap();
        assert_eq!(linked.linked_stores().collect::<Vec<_>>(), vec![StoreTag::Steam, StoreTag::Epic]);
        // idempotent
        catalog.link_external_id(a.id, StoreTag::Epic, "ns-a").await.unwrap();

        let err = catalog.link_external_id(a.id, StoreTag::Epic, "ns-b").await.unwrap_err();
        assert!(err.is_conflict());
        let err = catalog.link_external_id(b.id, StoreTag::Epic, "ns-a").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn deactivated_games_drop_out_of_search_and_backfill() {
        let catalog = catalog().await;
        let portal = catalog.reconcile(StoreTag::Steam, "400", &attrs("Portal")).await.unwrap();
        catalog.reconcile(StoreTag::Steam, "620", &attrs("Portal 2")).await.unwrap();

        let hits = catalog.search_games("portal", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Portal");

        catalog.deactivate_game(portal.id).await.unwrap();
        let hits = catalog.search_games("PORTAL!", 10).await.unwrap();
        assert_eq!(hits.iter().map(|g| g.title.as_str()).collect::<Vec<_>>(), vec!["Portal 2"]);

        let pending = catalog.games_without_prices(&StoreTag::ALL, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(matches!(
            catalog.deactivate_game(9999).await,
            Err(EngineError::GameNotFound(9999))
        ));
    }

    #[tokio::test]
    async fn search_matches_developer() {
        let catalog = catalog().await;
        let mut a = attrs("The Witcher 3");
        a.developer = Some("CD PROJEKT RED".into());
        catalog.reconcile(StoreTag::Gog, "witcher_3", &a).await.unwrap();
        let hits = catalog.search_games("projekt", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(catalog.search_games("?!", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_matches_punctuated_publishers() {
        let catalog = catalog().await;
        let mut a = attrs("Elden Ring");
        a.publisher = Some("Bandai Namco, Inc.".into());
        catalog.reconcile(StoreTag::Steam, "1245620", &a).await.unwrap();

        let hits = catalog.search_games("namco inc", 5).await.unwrap();
        assert_eq!(hits.iter().map(|g| g.title.as_str()).collect::<Vec<_>>(), vec!["Elden Ring"]);

        // a blank publisher on a later reconcile keeps the searchable name
        let mut b = attrs("Elden Ring");
        b.publisher = Some(" ".into());
        catalog.reconcile(StoreTag::Steam, "1245620", &b).await.unwrap();
        assert_eq!(catalog.search_games("bandai namco", 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exact_title_survives_many_newer_partial_matches() {
        let catalog = catalog().await;
        catalog.reconcile(StoreTag::Steam, "400", &attrs("Portal")).await.unwrap();
        for n in 1..=6 {
            catalog
                .reconcile(
                    StoreTag::Steam,
                    &format!("knights-{n}"),
                    &attrs(&format!("Portal Knights Deluxe Collection {n}")),
                )
                .await
                .unwrap();
        }
        let hits = catalog.search_games("portal", 1).await.unwrap();
        assert_eq!(hits.iter().map(|g| g.title.as_str()).collect::<Vec<_>>(), vec!["Portal"]);
        assert_eq!(catalog.search_games("portal", 10).await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn backfill_page_only_holds_games_a_source_can_price() {
        let catalog = catalog().await;
        let gog = catalog.reconcile(StoreTag::Gog, "gog-only", &attrs("GOG Only")).await.unwrap();
        let steam = catalog.reconcile(StoreTag::Steam, "10", &attrs("Steam")).await.unwrap();

        let page = catalog.games_without_prices(&[StoreTag::Steam], 10).await.unwrap();
        assert_eq!(page.iter().map(|g| g.id).collect::<Vec<_>>(), vec![steam.id]);
        assert!(catalog.games_without_prices(&[], 10).await.unwrap().is_empty());

        // attempted games move behind never-attempted ones
        catalog.mark_backfill_attempt(gog.id, Utc::now()).await.unwrap();
        let page = catalog.games_without_prices(&StoreTag::ALL, 10).await.unwrap();
        assert_eq!(page.iter().map(|g| g.id).collect::<Vec<_>>(), vec![steam.id, gog.id]);
    }
}
