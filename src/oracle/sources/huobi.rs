//! Huobi REST ticker
//!
//! Polls `/market/detail/merged`, which returns the latest trade price and
//! the rolling 24h quote volume as JSON numbers.

use async_trait::async_trait;
use serde::Deserialize;

use crate::bcmath;
use crate::error::SourceError;
use crate::oracle::sources::{http_client, now_secs, TickerFetcher};
use crate::types::{Instrument, Kline, Origin};

const HUOBI_REST_URL: &str = "https://api-aws.huobi.pro/market/detail/merged";

#[derive(Debug, Deserialize)]
struct MergedResponse {
    status: String,
    #[serde(rename = "err-msg", default)]
    err_msg: Option<String>,
    tick: Option<MergedTick>,
}

#[derive(Debug, Deserialize)]
struct MergedTick {
    close: serde_json::Number,
    vol: serde_json::Number,
}

pub struct HuobiFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HuobiFetcher {
    pub fn new() -> Result<Self, SourceError> {
        Ok(Self {
            client: http_client("huobi")?,
            base_url: HUOBI_REST_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Decode a merged-ticker body into (close, volume) at 4 digits
    fn parse_body(body: &str) -> Result<(String, String), SourceError> {
        let resp: MergedResponse =
            serde_json::from_str(body).map_err(|e| SourceError::unavailable("huobi", e))?;
        if resp.status != "ok" {
            let reason = resp.err_msg.unwrap_or_else(|| resp.status.clone());
            return Err(SourceError::unavailable("huobi", reason));
        }
        let tick = resp
            .tick
            .ok_or_else(|| SourceError::unavailable("huobi", "response has no tick"))?;

        let close = bcmath::add(&tick.close.to_string(), "0", 4)
            .map_err(|e| SourceError::unavailable("huobi", e))?;
        let volume = bcmath::add(&tick.vol.to_string(), "0", 4)
            .map_err(|e| SourceError::unavailable("huobi", e))?;
        Ok((close, volume))
    }
}

#[async_trait]
impl TickerFetcher for HuobiFetcher {
    fn name(&self) -> &'static str {
        "huobi"
    }

    fn origin(&self) -> Origin {
        Origin::Huobi
    }

    fn supports(&self, instrument: &Instrument) -> bool {
        instrument.quote().is_some()
    }

    async fn fetch(&self, instrument: &Instrument) -> Result<Option<Kline>, SourceError> {
        let body = self
            .client
            .get(&self.base_url)
            .query(&[("symbol", instrument.cex_symbol())])
            .send()
            .await
            .map_err(|e| SourceError::unavailable("huobi", e))?
            .text()
            .await
            .map_err(|e| SourceError::unavailable("huobi", e))?;

        let (close, volume) = Self::parse_body(&body)?;
        Ok(Some(Kline::tick(
            instrument.clone(),
            close,
            volume,
            Origin::Huobi,
            now_secs(),
        )))
    }
}
