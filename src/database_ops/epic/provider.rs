//! Epic Games Store source.
//!
//! The catalog listing (id → namespace, title, metadata) comes from the public
//! promotions feed and is cached in memory for a few hours. Prices are never
//! cached here: each fetch asks the GraphQL `catalogOffer` endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::StoreSettings;
use crate::database_ops::sources::{http_client, read_json, ExternalPriceSource};
use crate::error::FetchError;
use crate::models::{
    currency_for_country, currency_minor_digits, GameAttributes, PriceQuote, StoreTag,
};

pub const EPIC_PROMOTIONS_URL: &str =
    "https://store-site-backend-static.ak.epicgames.com/freeGamesPromotions";
pub const EPIC_GRAPHQL_URL: &str = "https://graphql.epicgames.com/graphql";

const CATALOG_OFFER_QUERY: &str = r#"
query catalogQuery($namespace: String!, $id: String!, $country: String!, $locale: String) {
  Catalog {
    catalogOffer(namespace: $namespace, id: $id, locale: $locale) {
      title
      price(country: $country) {
        totalPrice {
          discountPrice
          originalPrice
          currencyCode
          currencyInfo { decimals }
        }
      }
    }
  }
}"#;

/// One offer from the promotions listing.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub offer_id: String,
    pub namespace: String,
    pub attributes: GameAttributes,
}

/// Cached listing plus the earliest instant another refresh may be attempted.
#[derive(Debug, Default)]
struct CatalogState {
    entries: Option<HashMap<String, CatalogEntry>>,
    next_refresh_at: Option<Instant>,
}

impl CatalogState {
    fn refresh_due(&self) -> bool {
        self.next_refresh_at.map_or(true, |at| Instant::now() >= at)
    }

    fn lookup(&self, key: &str) -> Result<Option<CatalogEntry>, FetchError> {
        match &self.entries {
            Some(entries) => Ok(entries.get(key).cloned()),
            None => Err(FetchError::CoolingDown {
                retry_after_secs: self
                    .next_refresh_at
                    .map(|at| at.saturating_duration_since(Instant::now()).as_secs())
                    .unwrap_or(0),
            }),
        }
    }
}

/// Pause after a failed listing refresh before the next attempt.
const CATALOG_RETRY_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct EpicPriceSource {
    client: Client,
    promotions_url: String,
    graphql_url: String,
    country: String,
    locale: String,
    currency: &'static str,
    catalog_ttl: Duration,
    retry_backoff: Duration,
    catalog: RwLock<CatalogState>,
    refresh: Mutex<()>,
    refresh_attempts: AtomicUsize,
}

impl EpicPriceSource {
    pub fn new(settings: &StoreSettings) -> Self {
        Self::with_endpoints(settings, EPIC_PROMOTIONS_URL, EPIC_GRAPHQL_URL)
    }

    pub fn with_endpoints(
        settings: &StoreSettings,
        promotions_url: impl Into<String>,
        graphql_url: impl Into<String>,
    ) -> Self {
        Self {
            client: http_client(settings.http_timeout),
            promotions_url: promotions_url.into(),
            graphql_url: graphql_url.into(),
            country: settings.epic_country.to_ascii_uppercase(),
            locale: settings.epic_locale.clone(),
            currency: currency_for_country(&settings.epic_country),
            catalog_ttl: settings.catalog_ttl,
            retry_backoff: settings.catalog_ttl.min(CATALOG_RETRY_BACKOFF),
            catalog: RwLock::new(CatalogState::default()),
            refresh: Mutex::new(()),
            refresh_attempts: AtomicUsize::new(0),
        }
    }

    /// Listing refreshes attempted since construction.
    pub fn catalog_refresh_attempts(&self) -> usize {
        self.refresh_attempts.load(Ordering::Relaxed)
    }

    /// Catalog entry for an offer id or namespace, refreshing the listing when expired.
    ///
    /// One task refreshes at a time and the `RwLock` is never held across the HTTP
    /// call, so readers keep the previous listing meanwhile. A failed refresh keeps
    /// serving that listing and is not retried before the backoff elapses.
    pub async fn catalog_entry(&self, key: &str) -> Result<Option<CatalogEntry>, FetchError> {
        {
            let state = self.catalog.read().await;
            if !state.refresh_due() {
                return state.lookup(key);
            }
        }

        let _refresh = match self.refresh.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                {
                    let state = self.catalog.read().await;
                    if state.entries.is_some() {
                        return state.lookup(key);
                    }
                }
                self.refresh.lock().await
            }
        };
        // the refresh we waited on may have settled it
        {
            let state = self.catalog.read().await;
            if !state.refresh_due() {
                return state.lookup(key);
            }
        }

        let attempt = self.refresh_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let loaded = self.load_catalog().await;

        let mut state = self.catalog.write().await;
        match loaded {
            Ok(entries) => {
                info!(entries = entries.len(), attempt, "epic catalog refreshed");
                state.entries = Some(entries);
                state.next_refresh_at = Some(Instant::now() + self.catalog_ttl);
                state.lookup(key)
            }
            Err(e) => {
                state.next_refresh_at = Some(Instant::now() + self.retry_backoff);
                if state.entries.is_none() {
                    return Err(e);
                }
                warn!(
                    error = %e,
                    attempt,
                    retry_in_secs = self.retry_backoff.as_secs(),
                    "epic catalog refresh failed; serving previous listing"
                );
                state.lookup(key)
            }
        }
    }

    async fn load_catalog(&self) -> Result<HashMap<String, CatalogEntry>, FetchError> {
        let resp = self
            .client
            .get(&self.promotions_url)
            .header("Accept", "application/json")
            .query(&[
                ("locale", self.locale.as_str()),
                ("country", self.country.as_str()),
                ("allowCountries", self.country.as_str()),
            ])
            .send()
            .await?;
        let body = read_json(resp).await?;
        parse_catalog(&body)
    }

    async fn offer_price(
        &self,
        namespace: &str,
        offer_id: &str,
    ) -> Result<Option<PriceQuote>, FetchError> {
        let resp = self
            .client
            .post(&self.graphql_url)
            .header("Accept", "application/json")
            .json(&json!({
                "query": CATALOG_OFFER_QUERY,
                "variables": {
                    "namespace": namespace,
                    "id": offer_id,
                    "country": self.country,
                    "locale": self.locale,
                }
            }))
            .send()
            .await?;
        let body = read_json(resp).await?;
        parse_offer_price(&body, self.currency)
    }

    #[cfg(test)]
    async fn seed_catalog(&self, entries: Vec<CatalogEntry>, age: Duration) {
        let entries = entries
            .into_iter()
            .flat_map(|e| [(e.offer_id.clone(), e.clone()), (e.namespace.clone(), e)])
            .collect();
        *self.catalog.write().await = CatalogState {
            entries: Some(entries),
            next_refresh_at: Some(Instant::now() + self.catalog_ttl.saturating_sub(age)),
        };
    }
}

#[async_trait]
impl ExternalPriceSource for EpicPriceSource {
    fn store(&self) -> StoreTag {
        StoreTag::Epic
    }

    /// External ids are either `namespace:offer_id` or a bare offer id / namespace
    /// resolved through the catalog listing.
    async fn fetch_price(&self, external_id: &str) -> Result<Option<PriceQuote>, FetchError> {
        let (namespace, offer_id) = match external_id.split_once(':') {
            Some((ns, id)) if !ns.is_empty() && !id.is_empty() => (ns.to_string(), id.to_string()),
            _ => match self.catalog_entry(external_id).await? {
                Some(entry) => (entry.namespace, entry.offer_id),
                None => {
                    debug!(external_id, "epic offer not in catalog");
                    return Ok(None);
                }
            },
        };
        self.offer_price(&namespace, &offer_id).await
    }

    async fn fetch_attributes(
        &self,
        external_id: &str,
    ) -> Result<Option<GameAttributes>, FetchError> {
        let key = match external_id.split_once(':') {
            Some((_, id)) if !id.is_empty() => id,
            _ => external_id,
        };
        Ok(self.catalog_entry(key).await?.map(|e| e.attributes))
    }
}

/// Index the promotions feed by offer id and namespace.
pub fn parse_catalog(body: &Value) -> Result<HashMap<String, CatalogEntry>, FetchError> {
    let elements = body
        .pointer("/data/Catalog/searchStore/elements")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::malformed("promotions feed has no elements"))?;

    let mut out = HashMap::new();
    for el in elements {
        let (Some(offer_id), Some(namespace)) = (str_field(el, "id"), str_field(el, "namespace"))
        else {
            continue;
        };
        let entry = CatalogEntry {
            offer_id: offer_id.to_string(),
            namespace: namespace.to_string(),
            attributes: GameAttributes {
                title: str_field(el, "title").map(str::to_string),
                description: str_field(el, "description").map(str::to_string),
                developer: custom_attribute(el, "developerName"),
                publisher: el
                    .pointer("/seller/name")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .or_else(|| custom_attribute(el, "publisherName")),
                genres: Vec::new(),
                release_date: str_field(el, "effectiveDate").and_then(parse_epic_date),
                image_url: key_image(el),
                rating: None,
                metacritic_score: None,
            },
        };
        out.insert(entry.namespace.clone(), entry.clone());
        out.insert(entry.offer_id.clone(), entry);
    }
    Ok(out)
}

/// Parse a `catalogOffer` GraphQL response. `Ok(None)` when Epic has no such offer.
pub fn parse_offer_price(
    body: &Value,
    fallback_currency: &str,
) -> Result<Option<PriceQuote>, FetchError> {
    let Some(data) = body.get("data").filter(|d| !d.is_null()) else {
        let reason = body
            .pointer("/errors/0/message")
            .and_then(Value::as_str)
            .unwrap_or("response has no data");
        return Err(FetchError::malformed(format!("catalogOffer: {reason}")));
    };
    let Some(offer) = data.pointer("/Catalog/catalogOffer").filter(|o| !o.is_null()) else {
        return Ok(None);
    };
    let Some(total) = offer.pointer("/price/totalPrice").filter(|t| t.is_object()) else {
        // listed without a price: free
        return Ok(Some(PriceQuote::free(fallback_currency)));
    };

    let original = total
        .get("originalPrice")
        .and_then(Value::as_i64)
        .ok_or_else(|| FetchError::malformed("totalPrice has no originalPrice"))?;
    let discounted = total
        .get("discountPrice")
        .and_then(Value::as_i64)
        .unwrap_or(original);
    let currency = total
        .get("currencyCode")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(fallback_currency)
        .to_ascii_uppercase();
    let decimals = total
        .pointer("/currencyInfo/decimals")
        .and_then(Value::as_u64)
        .and_then(|d| u32::try_from(d).ok())
        .unwrap_or(2);

    let to_digits = currency_minor_digits(&currency);
    let (Some(original_minor), Some(price_minor)) = (
        rescale(original, decimals, to_digits),
        rescale(discounted, decimals, to_digits),
    ) else {
        return Err(FetchError::malformed(format!(
            "totalPrice amounts {original}/{discounted} with {decimals} decimals do not fit {currency}"
        )));
    };
    let discount_percent = if original_minor > 0 && price_minor < original_minor {
        let (o, p) = (i128::from(original_minor), i128::from(price_minor));
        (((o - p) * 100 + o / 2) / o).clamp(0, 100) as i64
    } else {
        0
    };
    Ok(Some(PriceQuote {
        price_minor,
        original_price_minor: original_minor,
        discount_percent,
        is_on_sale: price_minor < original_minor,
        currency,
    }))
}

/// `None` when the rescaled amount does not fit an `i64`.
fn rescale(amount: i64, from_digits: u32, to_digits: u32) -> Option<i64> {
    match from_digits.cmp(&to_digits) {
        std::cmp::Ordering::Equal => Some(amount),
        std::cmp::Ordering::Greater => 10i64
            .checked_pow(from_digits - to_digits)
            .map(|scale| amount / scale),
        std::cmp::Ordering::Less => 10i64
            .checked_pow(to_digits - from_digits)
            .and_then(|scale| amount.checked_mul(scale)),
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn custom_attribute(el: &Value, key: &str) -> Option<String> {
    el.get("customAttributes")?
        .as_array()?
        .iter()
        .find(|a| a.get("key").and_then(Value::as_str) == Some(key))
        .and_then(|a| str_field(a, "value"))
        .map(str::to_string)
}

// Prefer the wide store art, then anything with a URL.
fn key_image(el: &Value) -> Option<String> {
    let images = el.get("keyImages")?.as_array()?;
    ["OfferImageWide", "DieselStoreFrontWide", "Thumbnail"]
        .iter()
        .find_map(|wanted| {
            images
                .iter()
                .find(|img| img.get("type").and_then(Value::as_str) == Some(*wanted))
                .and_then(|img| str_field(img, "url"))
        })
        .or_else(|| images.iter().find_map(|img| str_field(img, "url")))
        .map(str::to_string)
}

fn parse_epic_date(raw: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.date_naive())
        .ok()
        // placeholder dates far in the future mean "unannounced"
        .filter(|d| d.year() < 2099)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> Value {
        json!({"data": {"Catalog": {"searchStore": {"elements": [
            {
                "title": "Death Stranding",
                "id": "offer-ds",
                "namespace": "ns-ds",
                "description": "From Hideo Kojima",
                "effectiveDate": "2021-03-30T15:00:00.000Z",
                "seller": {"name": "505 Games"},
                "customAttributes": [{"key": "developerName", "value": "KOJIMA PRODUCTIONS"}],
                "keyImages": [
                    {"type": "Thumbnail", "url": "https://cdn.example/thumb.jpg"},
                    {"type": "OfferImageWide", "url": "https://cdn.example/wide.jpg"}
                ],
                "price": {"totalPrice": {"originalPrice": 5280, "discountPrice": 0, "currencyCode": "JPY"}}
            },
            {"title": "No namespace", "id": "offer-x"},
            {
                "title": "Mystery Game",
                "id": "offer-m",
                "namespace": "ns-m",
                "effectiveDate": "2099-01-01T00:00:00.000Z"
            }
        ]}}}})
    }

    #[test]
    fn catalog_is_indexed_by_offer_and_namespace() {
        let catalog = parse_catalog(&feed()).unwrap();
        assert_eq!(catalog.len(), 4);
        let ds = &catalog["ns-ds"];
        assert_eq!(ds, &catalog["offer-ds"]);
        assert_eq!(ds.attributes.title.as_deref(), Some("Death Stranding"));
        assert_eq!(ds.attributes.developer.as_deref(), Some("KOJIMA PRODUCTIONS"));
        assert_eq!(ds.attributes.publisher.as_deref(), Some("505 Games"));
        assert_eq!(ds.attributes.image_url.as_deref(), Some("https://cdn.example/wide.jpg"));
        assert_eq!(ds.attributes.release_date, NaiveDate::from_ymd_opt(2021, 3, 30));
        assert_eq!(catalog["ns-m"].attributes.release_date, None);
        assert!(parse_catalog(&json!({"data": null})).is_err());
    }

    #[test]
    fn offer_price_in_yen() {
        let body = json!({"data": {"Catalog": {"catalogOffer": {
            "title": "Hades",
            "price": {"totalPrice": {
                "originalPrice": 2570,
                "discountPrice": 1285,
                "currencyCode": "JPY",
                "currencyInfo": {"decimals": 0}
            }}
        }}}});
        let q = parse_offer_price(&body, "JPY").unwrap().unwrap();
        assert_eq!(q.price_minor, 1285);
        assert_eq!(q.original_price_minor, 2570);
        assert_eq!(q.discount_percent, 50);
        assert!(q.is_on_sale);
    }

    #[test]
    fn offer_price_rescales_decimals() {
        let body = json!({"data": {"Catalog": {"catalogOffer": {
            "price": {"totalPrice": {"originalPrice": 398000, "discountPrice": 398000, "currencyCode": "JPY"}}
        }}}});
        let q = parse_offer_price(&body, "JPY").unwrap().unwrap();
        assert_eq!(q.price_minor, 3980);
        assert_eq!(q.discount_percent, 0);
        assert!(!q.is_on_sale);
    }

    #[test]
    fn missing_offer_and_errors() {
        let missing = json!({"data": {"Catalog": {"catalogOffer": null}}});
        assert_eq!(parse_offer_price(&missing, "JPY").unwrap(), None);
        let err = json!({"errors": [{"message": "boom"}], "data": null});
        assert!(matches!(parse_offer_price(&err, "JPY"), Err(FetchError::Malformed(m)) if m.contains("boom")));
        let free = json!({"data": {"Catalog": {"catalogOffer": {"title": "Free"}}}});
        assert_eq!(parse_offer_price(&free, "JPY").unwrap(), Some(PriceQuote::free("JPY")));
    }

    fn unreachable_source(ttl: Duration) -> EpicPriceSource {
        let settings = StoreSettings {
            http_timeout: Duration::from_secs(2),
            catalog_ttl: ttl,
            ..StoreSettings::default()
        };
        EpicPriceSource::with_endpoints(&settings, "http://127.0.0.1:9/promotions", "http://127.0.0.1:9/graphql")
    }

    #[tokio::test]
    async fn fresh_catalog_is_served_without_network() {
        let src = unreachable_source(Duration::from_secs(3600));
        let entries: Vec<CatalogEntry> = parse_catalog(&feed())
            .unwrap()
            .into_iter()
            .filter(|(k, _)| k.starts_with("offer-"))
            .map(|(_, v)| v)
            .collect();
        src.seed_catalog(entries, Duration::ZERO).await;
        let attrs = src.fetch_attributes("ns-ds").await.unwrap().unwrap();
        assert_eq!(attrs.title.as_deref(), Some("Death Stranding"));
        assert_eq!(src.fetch_attributes("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_catalog_survives_failed_refresh() {
        let src = unreachable_source(Duration::from_secs(60));
        let entry = parse_catalog(&feed()).unwrap()["offer-ds"].clone();
        src.seed_catalog(vec![entry], Duration::from_secs(120)).await;
        let attrs = src.fetch_attributes("offer-ds").await.unwrap();
        assert!(attrs.is_some());

        let empty = unreachable_source(Duration::from_secs(60));
        assert!(matches!(
            empty.fetch_attributes("offer-ds").await,
            Err(FetchError::Network(_))
        ));
    }

    #[tokio::test]
    async fn failed_refresh_is_attempted_once_per_backoff_window() {
        let src = unreachable_source(Duration::from_secs(60));
        let entry = parse_catalog(&feed()).unwrap()["offer-ds"].clone();
        src.seed_catalog(vec![entry], Duration::from_secs(120)).await;

        let lookups = futures::future::join_all((0..8).map(|_| src.fetch_attributes("offer-ds"))).await;
        for found in lookups {
            assert!(found.unwrap().is_some());
        }
        assert_eq!(src.catalog_refresh_attempts(), 1);

        // still inside the backoff: served from the old listing without a new attempt
        assert!(src.fetch_attributes("ns-ds").await.unwrap().is_some());
        assert_eq!(src.catalog_refresh_attempts(), 1);
    }

    #[tokio::test]
    async fn failed_first_load_cools_down_before_retrying() {
        let src = unreachable_source(Duration::from_secs(60));
        assert!(matches!(src.fetch_attributes("offer-ds").await, Err(FetchError::Network(_))));
        assert!(matches!(
            src.fetch_attributes("offer-ds").await,
            Err(FetchError::CoolingDown { retry_after_secs }) if retry_after_secs <= 60
        ));
        assert_eq!(src.catalog_refresh_attempts(), 1);
    }

    #[test]
    fn oversized_amounts_are_malformed_not_wrapped() {
        let body = json!({"data": {"Catalog": {"catalogOffer": {
            "price": {"totalPrice": {
                "originalPrice": 5280,
                "discountPrice": 5280,
                "currencyCode": "KWD",
                "currencyInfo": {"decimals": 40}
            }}
        }}}});
        assert!(matches!(parse_offer_price(&body, "JPY"), Err(FetchError::Malformed(_))));

        let body = json!({"data": {"Catalog": {"catalogOffer": {
            "price": {"totalPrice": {
                "originalPrice": i64::MAX,
                "discountPrice": 1,
                "currencyCode": "KWD",
                "currencyInfo": {"decimals": 0}
            }}
        }}}});
        assert!(matches!(parse_offer_price(&body, "JPY"), Err(FetchError::Malformed(_))));
        assert_eq!(rescale(i64::MAX, 2, 0), Some(i64::MAX / 100));
    }
}
