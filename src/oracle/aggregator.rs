//! Reconciliation engine - Combines raw samples into one canonical point
//!
//! Once per tick per instrument: drain whatever the sources have ready,
//! reject outliers with an IQR fence, average the survivors and apply the
//! operator's risk steering before emitting a `1s` Market point.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bcmath::{self, DecimalResult};
use crate::risk::{self, RiskTarget, PRICE_PRECISION};
use crate::types::{Instrument, Kline, Origin};

/// Digits kept for intermediate sums and quartile math
const WORK_PRECISION: u32 = 18;

/// Below this many market samples the outlier filter is skipped
const MIN_SAMPLES_FOR_FILTER: usize = 4;

/// Last published point per instrument
pub type PriceBook = Arc<RwLock<HashMap<Instrument, Kline>>>;

/// Receiving end of one source's handoff channel
pub struct SourceFeed {
    pub name: &'static str,
    pub origin: Origin,
    /// Samples from this feed are risk directives, not market quotes
    pub is_local: bool,
    pub rx: mpsc::Receiver<Kline>,
}

/// Samples gathered for one tick
#[derive(Debug, Default)]
pub struct Collected {
    pub market: Vec<Kline>,
    pub directive: Option<RiskTarget>,
}

/// Non-blocking read of one sample per feed.
///
/// Samples older than `max_age_secs`, or with a malformed close or volume,
/// are dropped.
pub fn collect(feeds: &mut [SourceFeed], now: i64, max_age_secs: i64) -> Collected {
    let mut collected = Collected::default();

    for feed in feeds.iter_mut() {
        let sample = match feed.rx.try_recv() {
            Ok(sample) => sample,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => continue,
        };

        if now - sample.create_time > max_age_secs {
            tracing::debug!(
                source = feed.name,
                instrument = %sample.instrument,
                age_secs = now - sample.create_time,
                "Expired sample discarded"
            );
            continue;
        }

        if let Err(e) = bcmath::parse(&sample.close).and_then(|_| bcmath::parse(&sample.volume)) {
            tracing::warn!(source = feed.name, instrument = %sample.instrument, error = %e, "Malformed sample ignored");
            continue;
        }

        if feed.is_local {
            collected.directive = Some(RiskTarget::from_sample(&sample));
        } else {
            collected.market.push(sample);
        }
    }

    collected
}

/// Drop samples outside the 1.5·IQR fence. Fewer than four samples pass
/// through untouched; otherwise the result is sorted by close.
pub fn filter_outliers(mut samples: Vec<Kline>) -> DecimalResult<Vec<Kline>> {
    let n = samples.len();
    if n < MIN_SAMPLES_FOR_FILTER {
        return Ok(samples);
    }

    let mut keyed = Vec::with_capacity(n);
    for sample in samples.drain(..) {
        keyed.push((bcmath::parse(&sample.close)?, sample));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));

    let closes: Vec<&str> = keyed.iter().map(|(_, k)| k.close.as_str()).collect();
    let q1 = quartile(&closes, n, 1)?;
    let q3 = quartile(&closes, n, 3)?;
    let iqr = bcmath::sub(&q3, &q1, WORK_PRECISION)?;
    let reach = bcmath::mul("1.5", &iqr, WORK_PRECISION)?;
    let lower = bcmath::sub(&q1, &reach, WORK_PRECISION)?;
    let upper = bcmath::add(&q3, &reach, WORK_PRECISION)?;

    let mut kept = Vec::with_capacity(n);
    for (_, sample) in keyed {
        let below = bcmath::cmp(&sample.close, &lower)? == Ordering::Less;
        let above = bcmath::cmp(&sample.close, &upper)? == Ordering::Greater;
        if below || above {
            tracing::debug!(instrument = %sample.instrument, close = %sample.close, origin = %sample.origin, "Outlier rejected");
            continue;
        }
        kept.push(sample);
    }
    Ok(kept)
}

/// Sorted close at the integer position q·n/4, clamped to n-1. The
/// position is truncated before floor/ceil, so the 0.25/0.75 blend of the
/// two neighbours reads the same element twice.
fn quartile(sorted: &[&str], n: usize, q: usize) -> DecimalResult<String> {
    let position = (q * n / 4).min(n - 1);
    bcmath::add(sorted[position], "0", WORK_PRECISION)
}

/// Mean close and mean volume, summed at 18 digits and divided at 4.
/// `None` when there are no samples.
pub fn market_price(samples: &[Kline]) -> DecimalResult<Option<(String, String)>> {
    if samples.is_empty() {
        return Ok(None);
    }

    let mut close_sum = "0".to_string();
    let mut volume_sum = "0".to_string();
    for sample in samples {
        close_sum = bcmath::add(&close_sum, &sample.close, WORK_PRECISION)?;
        volume_sum = bcmath::add(&volume_sum, &sample.volume, WORK_PRECISION)?;
    }

    let count = samples.len().to_string();
    Ok(Some((
        bcmath::div(&close_sum, &count, PRICE_PRECISION)?,
        bcmath::div(&volume_sum, &count, PRICE_PRECISION)?,
    )))
}

/// Per-instrument reconciliation state
pub struct Reconciler {
    instrument: Instrument,
    prices: PriceBook,
    rng: StdRng,
}

impl Reconciler {
    pub fn new(instrument: Instrument, prices: PriceBook, rng: StdRng) -> Self {
        Self {
            instrument,
            prices,
            rng,
        }
    }

    /// Previously published close for this instrument
    fn current_close(&self) -> Option<String> {
        self.prices
            .read()
            .ok()?
            .get(&self.instrument)
            .map(|k| k.close.clone())
    }

    /// Turn this tick's samples into a canonical point. Returns `None` when
    /// no market sample survives or the math fails.
    pub fn reconcile(&mut self, collected: Collected, now: i64) -> Option<Kline> {
        match self.try_reconcile(collected, now) {
            Ok(point) => point,
            Err(e) => {
                tracing::warn!(instrument = %self.instrument, error = %e, "Tick skipped");
                None
            }
        }
    }

    fn try_reconcile(&mut self, collected: Collected, now: i64) -> DecimalResult<Option<Kline>> {
        let sample_count = collected.market.len();
        let survivors = filter_outliers(collected.market)?;
        let Some((market, volume)) = market_price(&survivors)? else {
            if sample_count > 0 {
                tracing::debug!(instrument = %self.instrument, "No samples survived the fence");
            }
            return Ok(None);
        };

        let current = self.current_close();
        let steered = risk::steer(
            &mut self.rng,
            collected.directive.as_ref(),
            current.as_deref(),
            &market,
        )?;

        let mut point = Kline::tick(
            self.instrument.clone(),
            steered.price,
            volume,
            Origin::Market,
            now,
        );
        point.origin_price = market;
        point.risk_mode = steered.mode;
        point.total_steps = steered.total_steps;
        point.step = steered.step;

        if let Ok(mut prices) = self.prices.write() {
            prices.insert(self.instrument.clone(), point.clone());
        }

        tracing::trace!(
            instrument = %point.instrument,
            close = %point.close,
            market = %point.origin_price,
            samples = survivors.len(),
            risk = %point.risk_mode,
            "Tick reconciled"
        );
        Ok(Some(point))
    }
}

/// Engine cadence
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    pub max_sample_age_secs: i64,
    /// Fixed RNG seed for reproducible steering
    pub seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_sample_age_secs: 3,
            seed: None,
        }
    }
}

/// Runs one reconciliation loop per instrument
pub struct ReconciliationEngine {
    config: EngineConfig,
    prices: PriceBook,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            prices: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn prices(&self) -> PriceBook {
        self.prices.clone()
    }

    pub fn current_price(&self, instrument: &Instrument) -> Option<Kline> {
        self.prices.read().ok()?.get(instrument).cloned()
    }

    /// Spawn the loop for `instrument`, emitting into `output`
    pub fn start(&mut self, instrument: Instrument, feeds: Vec<SourceFeed>, output: mpsc::Sender<Kline>) {
        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(self.handles.len() as u64)),
            None => StdRng::from_entropy(),
        };
        tracing::info!(
            instrument = %instrument,
            sources = feeds.len(),
            "Reconciliation loop starting"
        );
        let reconciler = Reconciler::new(instrument, self.prices.clone(), rng);
        let task = Self::run(reconciler, feeds, output, self.config, self.cancel.clone());
        self.handles.push(tokio::spawn(task));
    }

    async fn run(
        mut reconciler: Reconciler,
        mut feeds: Vec<SourceFeed>,
        output: mpsc::Sender<Kline>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = chrono::Utc::now().timestamp();
            let collected = collect(&mut feeds, now, config.max_sample_age_secs);
            let Some(point) = reconciler.reconcile(collected, now) else {
                continue;
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = output.send(point) => {
                    if sent.is_err() {
                        tracing::warn!(instrument = %reconciler.instrument, "Staging closed, reconciliation stopped");
                        break;
                    }
                }
            }
        }
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Reconciliation task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskMode;

    fn sample(close: &str, volume: &str) -> Kline {
        Kline::tick(Instrument::new("BTC/USDT"), close, volume, Origin::Huobi, 1_000)
    }

    fn closes(samples: &[Kline]) -> Vec<String> {
        samples.iter().map(|s| s.close.clone()).collect()
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(
            Instrument::new("BTC/USDT"),
            Arc::new(RwLock::new(HashMap::new())),
            StdRng::seed_from_u64(42),
        )
    }

    #[test]
    fn test_filter_fixture_drops_twenty() {
        // Q1 = 4.6, Q3 = 10, fence [-3.5, 18.1]
        let input: Vec<Kline> = ["10", "3", "4.6", "5", "6.5", "1", "7.0", "8", "15", "20"]
            .iter()
            .map(|c| sample(c, "1"))
            .collect();
        let kept = filter_outliers(input).unwrap();
        assert_eq!(
            closes(&kept),
            vec!["1", "3", "4.6", "5", "6.5", "7.0", "8", "10", "15"]
        );
    }

    #[test]
    fn test_quartile_uses_integer_position() {
        let sorted = ["1", "3", "4.6", "5", "6.5", "7.0", "8", "10", "15", "20"];
        assert_eq!(bcmath::cmp(&quartile(&sorted, 10, 1).unwrap(), "4.6").unwrap(), Ordering::Equal);
        assert_eq!(bcmath::cmp(&quartile(&sorted, 10, 3).unwrap(), "10").unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_filter_drops_far_outlier() {
        let input: Vec<Kline> = ["1", "2", "3", "4", "5", "6", "7", "100"]
            .iter()
            .map(|c| sample(c, "1"))
            .collect();
        let kept = filter_outliers(input).unwrap();
        assert_eq!(kept.len(), 7);
        assert!(kept.iter().all(|k| k.close != "100"));
    }

    #[test]
    fn test_filter_noop_below_four() {
        let input = vec![sample("1", "1"), sample("1000", "1"), sample("5", "1")];
        let kept = filter_outliers(input).unwrap();
        assert_eq!(closes(&kept), vec!["1", "1000", "5"]);
    }

    #[test]
    fn test_market_price_mean() {
        let samples = vec![
            sample("100.00", "10"),
            sample("101.00", "12"),
            sample("99.50", "8"),
        ];
        let (close, volume) = market_price(&samples).unwrap().unwrap();
        assert_eq!(close, "100.1667");
        assert_eq!(volume, "10.0000");
        assert!(market_price(&[]).unwrap().is_none());
    }

    #[test]
    fn test_reconcile_emits_market_point() {
        let mut r = reconciler();
        let collected = Collected {
            market: vec![sample("100.00", "10"), sample("101.00", "12"), sample("99.50", "8")],
            directive: None,
        };
        let point = r.reconcile(collected, 1_234).unwrap();
        assert_eq!(point.close, "100.1667");
        assert_eq!(point.open, point.close);
        assert_eq!(point.origin, Origin::Market);
        assert_eq!(point.origin_price, "100.1667");
        assert_eq!(point.risk_mode, RiskMode::None);
        assert_eq!((point.create_time, point.update_time), (1_234, 1_234));
        assert_eq!(point.time_scale, "1s");
        assert_eq!(r.current_close().as_deref(), Some("100.1667"));
    }

    #[test]
    fn test_reconcile_nothing_without_market_samples() {
        let mut r = reconciler();
        let collected = Collected {
            market: vec![],
            directive: Some(RiskTarget::new("200", RiskMode::Steer, 5)),
        };
        assert!(r.reconcile(collected, 1).is_none());
        assert!(r.current_close().is_none());
    }

    #[test]
    fn test_reconcile_steers_from_previous_point() {
        let mut r = reconciler();
        let first = Collected { market: vec![sample("100", "1")], directive: None };
        r.reconcile(first, 1).unwrap();

        let mut directive = RiskTarget::new("120", RiskMode::Steer, 3);
        directive.step = 3;
        let second = Collected { market: vec![sample("101", "1")], directive: Some(directive) };
        let point = r.reconcile(second, 2).unwrap();
        assert_eq!(point.close, "120.0000");
        assert_eq!(point.origin_price, "101.0000");
        assert_eq!(point.risk_mode, RiskMode::Steer);
        assert_eq!((point.total_steps, point.step), (3, 3));
    }

    #[tokio::test]
    async fn test_collect_splits_local_and_drops_expired() {
        let (market_tx, market_rx) = mpsc::channel(1);
        let (stale_tx, stale_rx) = mpsc::channel(1);
        let (local_tx, local_rx) = mpsc::channel(1);
        let (_idle_tx, idle_rx) = mpsc::channel::<Kline>(1);

        market_tx.send(sample("100", "1")).await.unwrap();
        let mut stale = sample("90", "1");
        stale.create_time = 990;
        stale_tx.send(stale).await.unwrap();
        let mut directive = sample("150", "0");
        directive.origin = Origin::Local;
        directive.risk_mode = RiskMode::Steer;
        directive.total_steps = 10;
        local_tx.send(directive).await.unwrap();

        let feed = |name, origin, is_local, rx| SourceFeed { name, origin, is_local, rx };
        let mut feeds = vec![
            feed("huobi", Origin::Huobi, false, market_rx),
            feed("binance", Origin::Binance, false, stale_rx),
            feed("local", Origin::Local, true, local_rx),
            feed("mock", Origin::Mock, false, idle_rx),
        ];

        let collected = collect(&mut feeds, 1_001, 3);
        assert_eq!(closes(&collected.market), vec!["100"]);
        let target = collected.directive.unwrap();
        assert_eq!(target.target, "150");
        assert_eq!(target.mode, RiskMode::Steer);
    }

    #[tokio::test]
    async fn test_collect_ignores_malformed_sample() {
        let (tx, rx) = mpsc::channel(1);
        tx.send(sample("n/a", "1")).await.unwrap();
        let mut feeds = vec![SourceFeed { name: "huobi", origin: Origin::Huobi, is_local: false, rx }];
        assert!(collect(&mut feeds, 1_000, 3).market.is_empty());
    }
}
