//! Core types used throughout KlineHub
//!
//! Defines instruments, provider origins, time scales and the `Kline`
//! price point that flows through every stage of the hub.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Time scale label of a single reconciled tick
pub const TICK_SCALE: &str = "1s";

/// Time scale label used for the same-day aggregate lookup
pub const DAILY_SCALE: &str = "1D";

/// Tradable pair identifier, e.g. "BTC/USDT"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base asset, e.g. "BTC" for "BTC/USDT"
    pub fn base(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Quote currency, e.g. "USDT" for "BTC/USDT"
    pub fn quote(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, q)| q)
    }

    /// Concatenated lowercase symbol used by most CEX REST APIs ("btcusdt")
    pub fn cex_symbol(&self) -> String {
        self.0.replace('/', "").to_lowercase()
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Instrument {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Which provider produced a price point.
///
/// The integer codes are stable: they are stored in the database and sent
/// to subscribers. `Market` marks points produced by reconciliation. Only
/// the origins listed in `ProviderKind` have a quote source; the rest are
/// kept so older rows still decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum Origin {
    Market,
    Local,
    Zb,
    Huobi,
    Blockcc,
    Okex,
    Bitz,
    Otcbtc,
    Gateio,
    Binance,
    Bitmax,
    Sina,
    Mock,
}

impl Origin {
    pub const ALL: [Origin; 13] = [
        Origin::Market,
        Origin::Local,
        Origin::Zb,
        Origin::Huobi,
        Origin::Blockcc,
        Origin::Okex,
        Origin::Bitz,
        Origin::Otcbtc,
        Origin::Gateio,
        Origin::Binance,
        Origin::Bitmax,
        Origin::Sina,
        Origin::Mock,
    ];

    pub fn code(&self) -> u16 {
        match self {
            Origin::Market => 1,
            Origin::Local => 3,
            Origin::Zb => 4,
            Origin::Huobi => 5,
            Origin::Blockcc => 6,
            Origin::Okex => 7,
            Origin::Bitz => 8,
            Origin::Otcbtc => 9,
            Origin::Gateio => 10,
            Origin::Binance => 11,
            Origin::Bitmax => 12,
            Origin::Sina => 13,
            Origin::Mock => 100,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|o| o.code() == code)
    }

    /// Provider name as used in configuration
    pub fn name(&self) -> &'static str {
        match self {
            Origin::Market => "market",
            Origin::Local => "local",
            Origin::Zb => "zb",
            Origin::Huobi => "huobi",
            Origin::Blockcc => "blockcc",
            Origin::Okex => "okex",
            Origin::Bitz => "bitz",
            Origin::Otcbtc => "otcbtc",
            Origin::Gateio => "gateio",
            Origin::Binance => "binance",
            Origin::Bitmax => "bitmax",
            Origin::Sina => "sina",
            Origin::Mock => "mock",
        }
    }
}

impl From<Origin> for u16 {
    fn from(origin: Origin) -> Self {
        origin.code()
    }
}

impl TryFrom<u16> for Origin {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Origin::from_code(code).ok_or_else(|| format!("unknown origin code {}", code))
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operator risk-control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMode {
    /// Publish the market price unchanged
    #[default]
    None,
    /// Walk the published price toward the operator target
    Steer,
    /// Walk the published price back to the market price
    Revert,
}

impl RiskMode {
    pub fn code(&self) -> u8 {
        match self {
            RiskMode::None => 0,
            RiskMode::Steer => 1,
            RiskMode::Revert => 2,
        }
    }
}

impl fmt::Display for RiskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskMode::None => write!(f, "none"),
            RiskMode::Steer => write!(f, "steer"),
            RiskMode::Revert => write!(f, "revert"),
        }
    }
}

/// Named candle bucket width
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimeScale {
    pub label: String,
    pub width_secs: i64,
}

impl TimeScale {
    pub fn new(label: impl Into<String>, width_secs: i64) -> Self {
        Self {
            label: label.into(),
            width_secs,
        }
    }
}

/// Parses the `label=seconds` configuration form
impl FromStr for TimeScale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (label, width) = s
            .split_once('=')
            .ok_or_else(|| format!("time scale '{s}' is not label=seconds"))?;
        let label = label.trim();
        let width: i64 = width
            .trim()
            .parse()
            .map_err(|_| format!("time scale '{s}' has a non-integer width"))?;
        if label.is_empty() || width <= 0 {
            return Err(format!("time scale '{s}' needs a label and a positive width"));
        }
        Ok(Self::new(label, width))
    }
}

/// Configured set of time scales, ordered by bucket width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeScaleTable {
    scales: Vec<TimeScale>,
}

impl TimeScaleTable {
    pub fn new(mut scales: Vec<TimeScale>) -> Self {
        scales.sort_by(|a, b| a.width_secs.cmp(&b.width_secs).then(a.label.cmp(&b.label)));
        Self { scales }
    }

    pub fn get(&self, label: &str) -> Option<&TimeScale> {
        self.scales.iter().find(|s| s.label == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeScale> {
        self.scales.iter()
    }

    pub fn len(&self) -> usize {
        self.scales.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }
}

impl Default for TimeScaleTable {
    fn default() -> Self {
        Self::new(vec![
            TimeScale::new("1s", 1),
            TimeScale::new("5s", 5),
            TimeScale::new("15s", 15),
            TimeScale::new("60s", 60),
            TimeScale::new("1D", 86_400),
            TimeScale::new("7D", 86_400 * 7),
            TimeScale::new("1M", 86_400 * 30),
        ])
    }
}

/// Price point flowing through the hub (raw sample, canonical tick or candle row).
///
/// Only the subscriber-facing fields are serialized; timestamps other than
/// `create_time`, the audit price and the risk metadata stay internal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kline {
    #[serde(rename = "coinType")]
    pub instrument: Instrument,
    pub high: String,
    pub low: String,
    pub open: String,
    pub close: String,
    #[serde(rename = "time")]
    pub create_time: i64,
    #[serde(skip)]
    pub update_time: i64,
    #[serde(skip)]
    pub time_scale: String,
    pub origin: Origin,
    #[serde(skip)]
    pub origin_price: String,
    pub volume: String,
    #[serde(skip)]
    pub risk_mode: RiskMode,
    #[serde(skip)]
    pub total_steps: u32,
    #[serde(skip)]
    pub step: u32,
}

impl Kline {
    /// Single-tick point: open, high, low and close all equal `price`
    pub fn tick(
        instrument: Instrument,
        price: impl Into<String>,
        volume: impl Into<String>,
        origin: Origin,
        now: i64,
    ) -> Self {
        let price = price.into();
        Self {
            instrument,
            high: price.clone(),
            low: price.clone(),
            open: price.clone(),
            close: price.clone(),
            create_time: now,
            update_time: now,
            time_scale: TICK_SCALE.to_string(),
            origin,
            origin_price: price,
            volume: volume.into(),
            risk_mode: RiskMode::None,
            total_steps: 0,
            step: 0,
        }
    }

    /// Steps left before a risk transition completes
    pub fn remaining_steps(&self) -> u32 {
        self.total_steps.saturating_sub(self.step)
    }
}
