//! Binance REST client for 24h ticker statistics
//!
//! Polls `/api/v3/ticker/24hr` once per interval per symbol. Prices and
//! volumes arrive as decimal strings and are normalised to 4 digits.

use async_trait::async_trait;
use serde::Deserialize;

use crate::bcmath;
use crate::error::SourceError;
use crate::oracle::sources::{http_client, now_secs, TickerFetcher};
use crate::types::{Instrument, Kline, Origin};

const BINANCE_REST_URL: &str = "https://api.binance.com/api/v3/ticker/24hr";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    last_price: String,
    volume: String,
}

pub struct BinanceFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceFetcher {
    pub fn new() -> Result<Self, SourceError> {
        Ok(Self {
            client: http_client("binance")?,
            base_url: BINANCE_REST_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn symbol(instrument: &Instrument) -> String {
        instrument.cex_symbol().to_uppercase()
    }

    fn parse_body(body: &str) -> Result<(String, String), SourceError> {
        let ticker: Ticker24h =
            serde_json::from_str(body).map_err(|e| SourceError::unavailable("binance", e))?;
        let close = bcmath::add(&ticker.last_price, "0", 4)
            .map_err(|e| SourceError::unavailable("binance", e))?;
        let volume = bcmath::add(&ticker.volume, "0", 4)
            .map_err(|e| SourceError::unavailable("binance", e))?;
        Ok((close, volume))
    }
}

#[async_trait]
impl TickerFetcher for BinanceFetcher {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn origin(&self) -> Origin {
        Origin::Binance
    }

    fn supports(&self, instrument: &Instrument) -> bool {
        instrument.quote().is_some()
    }

    async fn fetch(&self, instrument: &Instrument) -> Result<Option<Kline>, SourceError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("symbol", Self::symbol(instrument))])
            .send()
            .await
            .map_err(|e| SourceError::unavailable("binance", e))?;

        if !response.status().is_success() {
            return Err(SourceError::unavailable(
                "binance",
                format!("API returned {}", response.status()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SourceError::unavailable("binance", e))?;
        let (close, volume) = Self::parse_body(&body)?;

        Ok(Some(Kline::tick(
            instrument.clone(),
            close,
            volume,
            Origin::Binance,
            now_secs(),
        )))
    }
}
