//! Quote source implementations (Mock, Local risk desk, Binance, Huobi)
//!
//! Every provider is a `PollingSource` around a `TickerFetcher`: one polling
//! task per instrument hands samples to the engine through a single-slot
//! channel, giving up when the engine does not take the sample in time.

mod binance;
mod huobi;
mod local;
mod mock;

pub use binance::BinanceFetcher;
pub use huobi::HuobiFetcher;
pub use local::LocalFetcher;
pub use mock::MockFetcher;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::risk::RiskDesk;
use crate::types::{Instrument, Kline, Origin};

/// A provider of raw price samples
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Get the source name
    fn name(&self) -> &'static str;

    fn origin(&self) -> Origin;

    /// Take the receiving half of the handoff channel for `instrument`.
    /// `None` when the instrument is unsupported or the receiver was taken.
    fn read_channel(&mut self, instrument: &Instrument) -> Option<mpsc::Receiver<Kline>>;

    /// Spawn the polling tasks
    fn start_collecting(&mut self);

    /// Signal every polling task and wait for all of them
    async fn stop(&mut self);
}

/// One request/response round trip against a provider
#[async_trait]
pub trait TickerFetcher: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn origin(&self) -> Origin;

    fn supports(&self, _instrument: &Instrument) -> bool {
        true
    }

    /// Fetch the latest sample. `Ok(None)` means nothing to report this round.
    async fn fetch(&self, instrument: &Instrument) -> Result<Option<Kline>, SourceError>;
}

/// Polling cadence shared by all sources
#[derive(Debug, Clone, Copy)]
pub struct SourceTiming {
    pub poll_interval: Duration,
    /// How long a sample waits for the engine before it is dropped
    pub handoff_timeout: Duration,
}

impl Default for SourceTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            handoff_timeout: Duration::from_secs(3),
        }
    }
}

/// Generic polling quote source
pub struct PollingSource<F: TickerFetcher> {
    fetcher: Arc<F>,
    timing: SourceTiming,
    senders: HashMap<Instrument, mpsc::Sender<Kline>>,
    receivers: HashMap<Instrument, mpsc::Receiver<Kline>>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<F: TickerFetcher> PollingSource<F> {
    pub fn new(fetcher: F, instruments: &[Instrument], timing: SourceTiming) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for instrument in instruments.iter().filter(|i| fetcher.supports(i)) {
            let (tx, rx) = mpsc::channel(1);
            senders.insert(instrument.clone(), tx);
            receivers.insert(instrument.clone(), rx);
        }

        Self {
            fetcher: Arc::new(fetcher),
            timing,
            senders,
            receivers,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    async fn poll_loop(
        fetcher: Arc<F>,
        instrument: Instrument,
        tx: mpsc::Sender<Kline>,
        timing: SourceTiming,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(timing.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = fetcher.fetch(&instrument) => fetched,
            };

            let sample = match fetched {
                Ok(Some(sample)) => sample,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        source = fetcher.name(),
                        instrument = %instrument,
                        error = %e,
                        "Sample skipped"
                    );
                    continue;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tokio::time::timeout(timing.handoff_timeout, tx.send(sample)) => match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        tracing::debug!(source = fetcher.name(), instrument = %instrument, "Reader gone, polling stopped");
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(source = fetcher.name(), instrument = %instrument, "Sample expired before handoff");
                    }
                },
            }
        }
    }
}

#[async_trait]
impl<F: TickerFetcher> QuoteSource for PollingSource<F> {
    fn name(&self) -> &'static str {
        self.fetcher.name()
    }

    fn origin(&self) -> Origin {
        self.fetcher.origin()
    }

    fn read_channel(&mut self, instrument: &Instrument) -> Option<mpsc::Receiver<Kline>> {
        self.receivers.remove(instrument)
    }

    fn start_collecting(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        for (instrument, tx) in self.senders.drain() {
            let task = Self::poll_loop(
                self.fetcher.clone(),
                instrument,
                tx,
                self.timing,
                self.cancel.clone(),
            );
            self.handles.push(tokio::spawn(task));
        }
        tracing::info!(source = self.fetcher.name(), tasks = self.handles.len(), "Collecting");
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(source = self.fetcher.name(), error = %e, "Polling task panicked");
            }
        }
    }
}

/// Registry of provider adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Mock,
    Local,
    Binance,
    Huobi,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Mock,
        ProviderKind::Local,
        ProviderKind::Binance,
        ProviderKind::Huobi,
    ];

    pub fn name(&self) -> &'static str {
        self.origin().name()
    }

    pub fn origin(&self) -> Origin {
        match self {
            ProviderKind::Mock => Origin::Mock,
            ProviderKind::Local => Origin::Local,
            ProviderKind::Binance => Origin::Binance,
            ProviderKind::Huobi => Origin::Huobi,
        }
    }

    /// Construct the adapter for this provider
    pub fn build(
        &self,
        instruments: &[Instrument],
        timing: SourceTiming,
        desk: &RiskDesk,
    ) -> Result<Box<dyn QuoteSource>> {
        let source: Box<dyn QuoteSource> = match self {
            ProviderKind::Mock => Box::new(PollingSource::new(MockFetcher::new(), instruments, timing)),
            ProviderKind::Local => Box::new(PollingSource::new(
                LocalFetcher::new(desk.clone()),
                instruments,
                timing,
            )),
            ProviderKind::Binance => {
                Box::new(PollingSource::new(BinanceFetcher::new()?, instruments, timing))
            }
            ProviderKind::Huobi => {
                Box::new(PollingSource::new(HuobiFetcher::new()?, instruments, timing))
            }
        };
        Ok(source)
    }
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.trim().to_lowercase();
        match ProviderKind::ALL.into_iter().find(|k| k.name() == lowered) {
            Some(kind) => Ok(kind),
            None => bail!("unknown provider: {}", s),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current epoch seconds
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Shared HTTP client settings for REST providers
pub(crate) fn http_client(provider: &'static str) -> Result<reqwest::Client, SourceError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| SourceError::unavailable(provider, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl TickerFetcher for CountingFetcher {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn origin(&self) -> Origin {
            Origin::Mock
        }

        fn supports(&self, instrument: &Instrument) -> bool {
            instrument.as_str() != "DOGE/USDT"
        }

        async fn fetch(&self, instrument: &Instrument) -> Result<Option<Kline>, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SourceError::unavailable("counting", "offline"));
            }
            Ok(Some(Kline::tick(instrument.clone(), format!("{}", 100 + n), "1", Origin::Mock, 0)))
        }
    }

    fn timing() -> SourceTiming {
        SourceTiming {
            poll_interval: Duration::from_millis(10),
            handoff_timeout: Duration::from_millis(30),
        }
    }

    #[tokio::test]
    async fn test_read_channel_once_and_unsupported() {
        let fetcher = CountingFetcher { calls: Arc::new(AtomicUsize::new(0)), fail: false };
        let instruments = vec![Instrument::new("BTC/USDT"), Instrument::new("DOGE/USDT")];
        let mut source = PollingSource::new(fetcher, &instruments, timing());

        assert!(source.read_channel(&instruments[0]).is_some());
        assert!(source.read_channel(&instruments[0]).is_none());
        assert!(source.read_channel(&instruments[1]).is_none());
    }

    #[tokio::test]
    async fn test_samples_delivered_and_stop_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = CountingFetcher { calls: calls.clone(), fail: false };
        let btc = Instrument::new("BTC/USDT");
        let mut source = PollingSource::new(fetcher, &[btc.clone()], timing());
        let mut rx = source.read_channel(&btc).unwrap();

        source.start_collecting();
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.instrument, btc);
        assert_eq!(first.origin, Origin::Mock);

        source.stop().await;
        source.stop().await;
        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_fetch_errors_are_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = CountingFetcher { calls: calls.clone(), fail: true };
        let btc = Instrument::new("BTC/USDT");
        let mut source = PollingSource::new(fetcher, &[btc.clone()], timing());
        let mut rx = source.read_channel(&btc).unwrap();

        source.start_collecting();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        assert!(calls.load(Ordering::SeqCst) >= 2);
        source.stop().await;
    }

    #[test]
    fn test_provider_registry() {
        assert_eq!("Binance".parse::<ProviderKind>().unwrap(), ProviderKind::Binance);
        assert_eq!("local".parse::<ProviderKind>().unwrap().origin(), Origin::Local);
        assert!("bitstamp".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_origins_without_adapter_are_not_configurable() {
        let configurable: Vec<Origin> = ProviderKind::ALL.iter().map(|k| k.origin()).collect();
        assert_eq!(configurable, vec![Origin::Mock, Origin::Local, Origin::Binance, Origin::Huobi]);

        for origin in [Origin::Okex, Origin::Zb, Origin::Gateio, Origin::Bitmax, Origin::Sina] {
            assert!(origin.name().parse::<ProviderKind>().is_err());
            assert_eq!(Origin::from_code(origin.code()), Some(origin));
        }
        assert!(Origin::Market.name().parse::<ProviderKind>().is_err());
    }
}
