//! Mock provider for local development
//!
//! Random walk starting at 100 with moves of up to one unit per poll and an
//! integer volume in [1000, 3000).

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::bcmath;
use crate::error::SourceError;
use crate::oracle::sources::{now_secs, TickerFetcher};
use crate::types::{Instrument, Kline, Origin};

const START_PRICE: &str = "100.0000";

#[derive(Default)]
pub struct MockFetcher {
    prices: Mutex<HashMap<Instrument, String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_point(&self, instrument: &Instrument) -> Result<(String, String), SourceError> {
        let mut rng = rand::thread_rng();
        let delta_units: i64 = rng.gen_range(-10_000..=10_000);
        let delta = bcmath::div(&delta_units.to_string(), "10000", 4)
            .map_err(|e| SourceError::unavailable("mock", e))?;
        let volume = rng.gen_range(1000..3000u32).to_string();

        let mut prices = self
            .prices
            .lock()
            .map_err(|_| SourceError::unavailable("mock", "price state poisoned"))?;
        let current = prices
            .entry(instrument.clone())
            .or_insert_with(|| START_PRICE.to_string());
        let mut next =
            bcmath::add(current, &delta, 4).map_err(|e| SourceError::unavailable("mock", e))?;
        if bcmath::cmp_sign(&next, "0").unwrap_or(1) <= 0 {
            next = START_PRICE.to_string();
        }
        *current = next.clone();

        Ok((next, volume))
    }
}

#[async_trait]
impl TickerFetcher for MockFetcher {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn origin(&self) -> Origin {
        Origin::Mock
    }

    async fn fetch(&self, instrument: &Instrument) -> Result<Option<Kline>, SourceError> {
        let (close, volume) = self.next_point(instrument)?;
        Ok(Some(Kline::tick(
            instrument.clone(),
            close,
            volume,
            Origin::Mock,
            now_secs(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_random_walk_stays_bounded() {
        let fetcher = MockFetcher::new();
        let btc = Instrument::new("BTC/USDT");
        let mut previous = START_PRICE.to_string();
        for _ in 0..50 {
            let point = fetcher.fetch(&btc).await.unwrap().unwrap();
            let step = bcmath::abs_sub(&point.close, &previous, 4).unwrap();
            assert!(bcmath::cmp_sign(&step, "1").unwrap() <= 0);
            let volume: u32 = point.volume.parse().unwrap();
            assert!((1000..3000).contains(&volume));
            assert_eq!(point.origin, Origin::Mock);
            previous = point.close;
        }
    }

    #[test]
    fn test_instruments_walk_independently() {
        let fetcher = MockFetcher::new();
        for symbol in ["BTC/USDT", "ETH/USDT", "BTC/USDT"] {
            let point = tokio_test::block_on(fetcher.fetch(&Instrument::new(symbol)))
                .unwrap()
                .unwrap();
            assert_eq!(point.instrument.as_str(), symbol);
        }
        assert_eq!(fetcher.prices.lock().unwrap().len(), 2);
    }
}
