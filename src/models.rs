//! Catalog, price and change types shared by every engine component.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Storefront tag stored next to every external id and price record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreTag {
    Steam,
    Epic,
    Gog,
}

impl StoreTag {
    pub const ALL: [StoreTag; 3] = [StoreTag::Steam, StoreTag::Epic, StoreTag::Gog];

    pub fn as_str(self) -> &'static str {
        match self {
            StoreTag::Steam => "steam",
            StoreTag::Epic => "epic",
            StoreTag::Gog => "gog",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            StoreTag::Steam => "Steam",
            StoreTag::Epic => "Epic Games Store",
            StoreTag::Gog => "GOG",
        }
    }

    /// Public product page for an external id on this storefront.
    pub fn store_url(self, external_id: &str) -> String {
        match self {
            StoreTag::Steam => format!("https://store.steampowered.com/app/{external_id}/"),
            StoreTag::Epic => format!("https://store.epicgames.com/p/{external_id}"),
            StoreTag::Gog => format!("https://www.gog.com/game/{external_id}"),
        }
    }
}

impl fmt::Display for StoreTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStoreTag(pub String);

impl fmt::Display for UnknownStoreTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown store tag '{}'", self.0)
    }
}

impl std::error::Error for UnknownStoreTag {}

impl FromStr for StoreTag {
    type Err = UnknownStoreTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "steam" => Ok(StoreTag::Steam),
            "epic" | "epic_games" | "epicgames" => Ok(StoreTag::Epic),
            "gog" => Ok(StoreTag::Gog),
            other => Err(UnknownStoreTag(other.to_string())),
        }
    }
}

/// Descriptive attributes as delivered by a storefront, before reconciliation.
///
/// `None` and empty values never overwrite what the catalog already holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameAttributes {
    pub title: Option<String>,
    pub description: Option<String>,
    pub developer: Option<String>,
    pub publisher: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub release_date: Option<NaiveDate>,
    pub image_url: Option<String>,
    pub rating: Option<i64>,
    pub metacritic_score: Option<i64>,
}

impl GameAttributes {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Trimmed title, `None` when absent or blank.
    pub fn usable_title(&self) -> Option<&str> {
        non_blank(self.title.as_deref())
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Canonical catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Game {
    pub id: i64,
    pub title: String,
    pub normalized_title: String,
    pub description: Option<String>,
    pub developer: Option<String>,
    pub publisher: Option<String>,
    pub genres: Vec<String>,
    pub release_date: Option<NaiveDate>,
    pub image_url: Option<String>,
    pub rating: Option<i64>,
    pub metacritic_score: Option<i64>,
    pub external_ids: BTreeMap<StoreTag, String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Game {
    pub fn external_id(&self, store: StoreTag) -> Option<&str> {
        self.external_ids.get(&store).map(String::as_str)
    }

    /// Stores this game is linked to, in tag order.
    pub fn linked_stores(&self) -> impl Iterator<Item = StoreTag> + '_ {
        self.external_ids.keys().copied()
    }
}

/// Authoritative cached price for one (game, store) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceRecord {
    pub id: i64,
    pub game_id: i64,
    pub store: StoreTag,
    pub regular_price_minor: i64,
    pub sale_price_minor: Option<i64>,
    pub discount_rate: i64,
    pub is_on_sale: bool,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PriceRecord {
    /// Sale price while on sale (when known), regular price otherwise.
    pub fn current_price_minor(&self) -> i64 {
        match (self.is_on_sale, self.sale_price_minor) {
            (true, Some(sale)) => sale,
            _ => self.regular_price_minor,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.updated_at > max_age
    }
}

/// A price observation returned by a storefront fetch, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price_minor: i64,
    pub original_price_minor: i64,
    pub discount_percent: i64,
    pub currency: String,
    pub is_on_sale: bool,
}

impl PriceQuote {
    /// Quote for an item that is free or has no price listed.
    pub fn free(currency: impl Into<String>) -> Self {
        Self {
            price_minor: 0,
            original_price_minor: 0,
            discount_percent: 0,
            currency: currency.into(),
            is_on_sale: false,
        }
    }

    /// Storefronts are untrusted; reject values the price table cannot hold.
    pub fn validate(&self) -> Result<(), String> {
        if self.price_minor < 0 || self.original_price_minor < 0 {
            return Err(format!(
                "negative amount (price={}, original={})",
                self.price_minor, self.original_price_minor
            ));
        }
        if !(0..=100).contains(&self.discount_percent) {
            return Err(format!("discount {} outside 0..=100", self.discount_percent));
        }
        if self.currency.trim().is_empty() {
            return Err("missing currency".into());
        }
        Ok(())
    }

    pub fn regular_price_minor(&self) -> i64 {
        if self.original_price_minor > 0 {
            self.original_price_minor
        } else {
            self.price_minor
        }
    }

    pub fn sale_price_minor(&self) -> Option<i64> {
        self.is_on_sale.then_some(self.price_minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    New,
    Increase,
    Decrease,
    SaleStart,
    SaleEnd,
    NoChange,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::New => "new",
            ChangeType::Increase => "increase",
            ChangeType::Decrease => "decrease",
            ChangeType::SaleStart => "sale_start",
            ChangeType::SaleEnd => "sale_end",
            ChangeType::NoChange => "no_change",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detected price delta. Lives for one refresh cycle; never persisted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChange {
    pub game_id: i64,
    pub game_title: String,
    pub store: StoreTag,
    pub old_price_minor: Option<i64>,
    pub new_price_minor: i64,
    pub currency: String,
    pub change_type: ChangeType,
    pub change_percent: f64,
    pub detected_at: DateTime<Utc>,
}

/// A user's saved price target for a game. Read-only input to the notification trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FavoriteThreshold {
    pub user_id: i64,
    pub game_id: i64,
    pub notification_enabled: bool,
    pub price_threshold_minor: Option<i64>,
}

/// Number of minor-unit digits for an ISO 4217 currency code.
pub fn currency_minor_digits(code: &str) -> u32 {
    match code.to_ascii_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" | "HUF" => 0,
        "BHD" | "IQD" | "KWD" | "JOD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Storefront billing currency for a two-letter country code.
pub fn currency_for_country(code2: &str) -> &'static str {
    match code2.trim().to_ascii_uppercase().as_str() {
        "US" => "USD",
        "CA" => "CAD",
        "AU" => "AUD",
        "NZ" => "NZD",
        "GB" => "GBP",
        "DE" | "FR" | "ES" | "IT" | "NL" | "BE" | "PT" | "IE" | "FI" | "GR" | "AT" | "LU"
        | "SI" | "SK" | "LV" | "LT" | "EE" | "MT" | "CY" => "EUR",
        "PL" => "PLN",
        "TR" => "TRY",
        "JP" => "JPY",
        "KR" => "KRW",
        "BR" => "BRL",
        "HK" => "HKD",
        "TW" => "TWD",
        "SE" => "SEK",
        "NO" => "NOK",
        "DK" => "DKK",
        "KW" => "KWD",
        "MX" => "MXN",
        _ => "USD",
    }
}

/// Human readable amount, e.g. `3,980 JPY` or `19.99 USD`.
pub fn format_minor(amount_minor: i64, currency: &str) -> String {
    let digits = currency_minor_digits(currency);
    let scale = 10i64.pow(digits);
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    let major = abs / scale.unsigned_abs();
    let minor = abs % scale.unsigned_abs();

    let raw = major.to_string();
    let mut grouped = String::with_capacity(raw.len() + raw.len() / 3);
    for (i, ch) in raw.chars().enumerate() {
        if i > 0 && (raw.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let code = currency.to_ascii_uppercase();
    if digits == 0 {
        format!("{sign}{grouped} {code}")
    } else {
        format!(
            "{sign}{grouped}.{minor:0width$} {code}",
            width = digits as usize
        )
    }
}
