//! Oracle module - Multi-source price reconciliation
//!
//! Collects raw quotes from the configured providers and produces one
//! canonical, optionally risk-steered, price point per instrument per tick.

mod aggregator;
mod candles;
pub mod sources;

pub use aggregator::{
    collect, filter_outliers, market_price, Collected, EngineConfig, PriceBook,
    ReconciliationEngine, Reconciler, SourceFeed,
};
pub use candles::{merge_candle, merge_tick, CandleBuilder, VOLUME_PRECISION};
