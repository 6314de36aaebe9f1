use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::StoreSettings;
use crate::database_ops::sources::{http_client, read_json, ExternalPriceSource};
use crate::error::FetchError;
use crate::models::{
    currency_for_country, currency_minor_digits, GameAttributes, PriceQuote, StoreTag,
};

pub const STEAM_STORE_API: &str = "https://store.steampowered.com/api";

#[derive(Debug, Deserialize)]
struct PriceOverview {
    currency: Option<String>,
    #[serde(rename = "initial")]
    initial_price: Option<i64>,
    #[serde(rename = "final")]
    final_price: Option<i64>,
    discount_percent: Option<i64>,
}

// Full details fields used to seed the catalog
#[derive(Debug, Default, Deserialize)]
struct FullAppData {
    name: Option<String>,
    #[serde(default)]
    short_description: Option<String>,
    #[serde(default)]
    about_the_game: Option<String>,
    #[serde(default)]
    developers: Vec<String>,
    #[serde(default)]
    publishers: Vec<String>,
    #[serde(default)]
    genres: Vec<GenreEntry>,
    release_date: Option<ReleaseDate>,
    header_image: Option<String>,
    metacritic: Option<Metacritic>,
    recommendations: Option<Recommendations>,
}

#[derive(Debug, Deserialize)]
struct GenreEntry {
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReleaseDate {
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Metacritic {
    score: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Recommendations {
    total: Option<i64>,
}

/// Steam storefront via the public `appdetails` endpoint. External ids are app ids.
#[derive(Debug, Clone)]
pub struct SteamPriceSource {
    client: Client,
    base_url: String,
    country: String,
    language: String,
    currency: &'static str,
}

impl SteamPriceSource {
    pub fn new(settings: &StoreSettings) -> Self {
        Self::with_base_url(settings, STEAM_STORE_API)
    }

    pub fn with_base_url(settings: &StoreSettings, base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(settings.http_timeout),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            country: settings.steam_country.to_ascii_lowercase(),
            language: normalize_language(&settings.steam_language),
            currency: currency_for_country(&settings.steam_country),
        }
    }

    async fn app_details(&self, appid: &str, query: &[(&str, &str)]) -> Result<Value, FetchError> {
        let resp = self
            .client
            .get(format!("{}/appdetails", self.base_url))
            .header("Accept", "application/json")
            .query(&[("appids", appid), ("cc", self.country.as_str())])
            .query(query)
            .send()
            .await?;
        read_json(resp).await
    }
}

#[async_trait]
impl ExternalPriceSource for SteamPriceSource {
    fn store(&self) -> StoreTag {
        StoreTag::Steam
    }

    async fn fetch_price(&self, external_id: &str) -> Result<Option<PriceQuote>, FetchError> {
        let body = self
            .app_details(external_id, &[("filters", "price_overview")])
            .await?;
        let quote = parse_price_response(external_id, &body, self.currency)?;
        debug!(appid = external_id, found = quote.is_some(), "steam price fetched");
        Ok(quote)
    }

    async fn fetch_attributes(
        &self,
        external_id: &str,
    ) -> Result<Option<GameAttributes>, FetchError> {
        let body = self
            .app_details(external_id, &[("l", self.language.as_str())])
            .await?;
        parse_details(external_id, &body)
    }
}

fn normalize_language(lang: &str) -> String {
    let mut s = lang.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    if s.is_empty() {
        s = "english".into();
    }
    s
}

/// Locate the `{appid: {success, data}}` entry. `Ok(None)` when Steam does not know the app.
fn app_entry<'a>(appid: &str, body: &'a Value) -> Result<Option<&'a Value>, FetchError> {
    let obj = body
        .as_object()
        .ok_or_else(|| FetchError::malformed("appdetails body is not an object"))?;
    let Some(entry) = obj.get(appid) else {
        return Ok(None);
    };
    if !entry.is_object() {
        return Err(FetchError::malformed(format!("appdetails entry for {appid} is not an object")));
    }
    if !entry.get("success").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(None);
    }
    Ok(Some(entry))
}

/// Steam amounts are hundredths of the currency; rescale to its minor unit.
/// `None` when the result does not fit an `i64`.
fn steam_to_minor(hundredths: i64, currency: &str) -> Option<i64> {
    match currency_minor_digits(currency) {
        0 => Some(hundredths / 100),
        1 => Some(hundredths / 10),
        2 => Some(hundredths),
        d => 10i64
            .checked_pow(d - 2)
            .and_then(|scale| hundredths.checked_mul(scale)),
    }
}

/// Turn a `filters=price_overview` response into a quote.
///
/// Known apps without a `price_overview` are free to play and quote at zero.
pub fn parse_price_response(
    appid: &str,
    body: &Value,
    fallback_currency: &str,
) -> Result<Option<PriceQuote>, FetchError> {
    let Some(entry) = app_entry(appid, body)? else {
        return Ok(None);
    };
    // Steam sends `"data": []` when the filter matched nothing.
    let Some(overview) = entry
        .get("data")
        .and_then(Value::as_object)
        .and_then(|d| d.get("price_overview"))
        .filter(|v| v.is_object())
    else {
        return Ok(Some(PriceQuote::free(fallback_currency)));
    };

    let overview: PriceOverview = serde_json::from_value(overview.clone())
        .map_err(|e| FetchError::malformed(format!("price_overview for {appid}: {e}")))?;
    let currency = overview
        .currency
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(fallback_currency)
        .to_ascii_uppercase();
    let final_price = overview
        .final_price
        .ok_or_else(|| FetchError::malformed(format!("price_overview for {appid} has no final price")))?;
    let initial_price = overview.initial_price.unwrap_or(final_price).max(final_price);
    let discount_percent = match overview.discount_percent {
        Some(d) => d,
        None if initial_price > 0 => {
            let (i, f) = (i128::from(initial_price), i128::from(final_price));
            ((i - f) * 100 / i).clamp(0, 100) as i64
        }
        None => 0,
    };
    let (Some(price_minor), Some(original_price_minor)) = (
        steam_to_minor(final_price, &currency),
        steam_to_minor(initial_price, &currency),
    ) else {
        return Err(FetchError::malformed(format!(
            "price_overview for {appid}: {initial_price}/{final_price} overflows {currency}"
        )));
    };

    Ok(Some(PriceQuote {
        price_minor,
        original_price_minor,
        discount_percent,
        is_on_sale: discount_percent > 0,
        currency,
    }))
}

/// Map a full `appdetails` response onto catalog attributes.
pub fn parse_details(appid: &str, body: &Value) -> Result<Option<GameAttributes>, FetchError> {
    let Some(entry) = app_entry(appid, body)? else {
        return Ok(None);
    };
    let Some(data) = entry.get("data").filter(|d| d.is_object()) else {
        return Ok(None);
    };
    let full: FullAppData = serde_json::from_value(data.clone())
        .map_err(|e| FetchError::malformed(format!("appdetails data for {appid}: {e}")))?;

    let description = [full.short_description.as_deref(), full.about_the_game.as_deref()]
        .into_iter()
        .flatten()
        .map(strip_html_tags)
        .find(|s| !s.is_empty());

    Ok(Some(GameAttributes {
        title: full.name.map(|n| n.trim().to_string()),
        description,
        developer: join_names(&full.developers),
        publisher: join_names(&full.publishers),
        genres: full
            .genres
            .into_iter()
            .filter_map(|g| g.description)
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect(),
        release_date: full
            .release_date
            .and_then(|r| r.date)
            .and_then(|d| parse_release_date(&d)),
        image_url: full.header_image.filter(|u| !u.trim().is_empty()),
        rating: full
            .recommendations
            .and_then(|r| r.total)
            .and_then(estimate_rating),
        metacritic_score: full.metacritic.and_then(|m| m.score),
    }))
}

fn join_names(names: &[String]) -> Option<String> {
    let names: Vec<&str> = names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect();
    (!names.is_empty()).then(|| names.join(", "))
}

// Rough score from review volume; Steam does not expose its review summary here.
fn estimate_rating(total_recommendations: i64) -> Option<i64> {
    match total_recommendations {
        t if t > 1000 => Some(80),
        t if t > 100 => Some(70),
        t if t > 10 => Some(60),
        _ => None,
    }
}

/// Release dates come localized: `10 Dec, 2020`, `Dec 10, 2020`, `2020年12月10日`,
/// `Dec 2020`, or a bare year.
fn parse_release_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in ["%d %b, %Y", "%b %d, %Y", "%Y年%m月%d日", "%Y/%m/%d", "%Y-%m-%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(&format!("1 {s}"), "%d %b %Y") {
        return Some(d);
    }
    let year: i32 = s.parse().ok()?;
    NaiveDate::from_ymd_opt(year, 1, 1).filter(|d| d.year() > 1970)
}

fn strip_html_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    let mut prev_space = false;
    for ch in input.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => {
                if c.is_whitespace() {
                    if !prev_space {
                        out.push(' ');
                        prev_space = true;
                    }
                } else {
                    out.push(c);
                    prev_space = false;
                }
            }
            _ => {}
        }
    }
    out.trim().to_string()
}
