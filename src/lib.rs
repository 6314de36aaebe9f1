//! Multi-store game price reconciliation and freshness engine.
//!
//! Storefront data is resolved into one canonical catalog record per game, each
//! store's price is cached with a staleness window and refreshed on read, and
//! refreshes yield typed [`PriceChange`](models::PriceChange) events that the
//! notification trigger matches against saved favorites.

pub mod config;
pub mod database_ops;
pub mod engine;
pub mod error;
pub mod models;
pub mod normalization;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::EngineConfig;
pub use engine::PriceEngine;
pub use error::{EngineError, EngineResult, FetchError};
pub use models::{ChangeType, Game, GameAttributes, PriceChange, PriceQuote, PriceRecord, StoreTag};
