//! Local provider backed by the operator risk desk
//!
//! Emits the active directive for an instrument once per poll, advancing
//! its step. Instruments without a directive produce nothing.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::oracle::sources::{now_secs, TickerFetcher};
use crate::risk::RiskDesk;
use crate::types::{Instrument, Kline, Origin};

pub struct LocalFetcher {
    desk: RiskDesk,
}

impl LocalFetcher {
    pub fn new(desk: RiskDesk) -> Self {
        Self { desk }
    }
}

#[async_trait]
impl TickerFetcher for LocalFetcher {
    fn name(&self) -> &'static str {
        "local"
    }

    fn origin(&self) -> Origin {
        Origin::Local
    }

    async fn fetch(&self, instrument: &Instrument) -> Result<Option<Kline>, SourceError> {
        let Some(directive) = self.desk.next_directive(instrument) else {
            return Ok(None);
        };

        let mut sample = Kline::tick(
            instrument.clone(),
            directive.target,
            "0",
            Origin::Local,
            now_secs(),
        );
        sample.risk_mode = directive.mode;
        sample.total_steps = directive.total_steps;
        sample.step = directive.step;
        Ok(Some(sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskMode;

    #[tokio::test]
    async fn test_emits_directive_with_risk_fields() {
        let desk = RiskDesk::new();
        let eth = Instrument::new("ETH/USDT");
        let fetcher = LocalFetcher::new(desk.clone());
        assert!(fetcher.fetch(&eth).await.unwrap().is_none());

        desk.set_target(eth.clone(), "3100.5", RiskMode::Steer, 30).unwrap();
        let sample = fetcher.fetch(&eth).await.unwrap().unwrap();
        assert_eq!(sample.close, "3100.5000");
        assert_eq!(sample.origin, Origin::Local);
        assert_eq!(sample.risk_mode, RiskMode::Steer);
        assert_eq!((sample.total_steps, sample.step), (30, 1));
    }
}
