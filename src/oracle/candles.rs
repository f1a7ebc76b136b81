//! Candle Builder - Derives multi-resolution candle rows from ticks
//!
//! Every reconciled point becomes one row per configured time scale, with
//! `create_time` truncated to the bucket start. Rows for the same bucket are
//! merged by the store with the rules in `merge_candle` and `merge_tick`.

use crate::bcmath::{self, DecimalResult};
use crate::types::{Kline, TimeScale, TimeScaleTable};

/// Fractional digits kept for accumulated volume
pub const VOLUME_PRECISION: u32 = 4;

/// Builds candle rows for every configured time scale
#[derive(Debug, Clone, Default)]
pub struct CandleBuilder {
    scales: TimeScaleTable,
}

impl CandleBuilder {
    pub fn new(scales: TimeScaleTable) -> Self {
        Self { scales }
    }

    pub fn scales(&self) -> &TimeScaleTable {
        &self.scales
    }

    /// Start of the bucket containing `ts`
    pub fn candle_start(ts: i64, width_secs: i64) -> i64 {
        if width_secs <= 0 {
            return ts;
        }
        ts - ts.rem_euclid(width_secs)
    }

    /// Copy of `point` relabelled and truncated into `scale`'s bucket
    pub fn row_for(point: &Kline, scale: &TimeScale) -> Kline {
        let mut row = point.clone();
        row.time_scale = scale.label.clone();
        row.create_time = Self::candle_start(point.create_time, scale.width_secs);
        row
    }

    /// One row per configured scale, narrowest first
    pub fn rows_for(&self, point: &Kline) -> Vec<Kline> {
        self.scales
            .iter()
            .map(|scale| Self::row_for(point, scale))
            .collect()
    }
}

/// Fold an incoming row into an existing candle for the same bucket.
///
/// Open stays with the first writer, close and update time follow the
/// incoming row, high/low widen and volume accumulates.
pub fn merge_candle(existing: &mut Kline, incoming: &Kline) -> DecimalResult<()> {
    existing.high = bcmath::max(&existing.high, &incoming.high)?.to_string();
    existing.low = bcmath::min(&existing.low, &incoming.low)?.to_string();
    existing.volume = bcmath::add(&existing.volume, &incoming.volume, VOLUME_PRECISION)?;
    existing.close = incoming.close.clone();
    existing.update_time = incoming.update_time;
    Ok(())
}

/// Fold an incoming tick into the cached row for the same second.
///
/// Everything but high/low is last-write-wins.
pub fn merge_tick(existing: &mut Kline, incoming: &Kline) -> DecimalResult<()> {
    let high = bcmath::max(&existing.high, &incoming.high)?.to_string();
    let low = bcmath::min(&existing.low, &incoming.low)?.to_string();
    *existing = incoming.clone();
    existing.high = high;
    existing.low = low;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Instrument, Origin};

    fn point(price: &str, volume: &str, ts: i64) -> Kline {
        Kline::tick(Instrument::new("BTC/USDT"), price, volume, Origin::Market, ts)
    }

    #[test]
    fn test_candle_start_alignment() {
        assert_eq!(CandleBuilder::candle_start(1_700_000_123, 60), 1_700_000_100);
        assert_eq!(CandleBuilder::candle_start(1_700_000_123, 1), 1_700_000_123);
        assert_eq!(CandleBuilder::candle_start(1_700_000_123, 86_400), 1_699_920_000);
        assert_eq!(CandleBuilder::candle_start(-5, 60), -60);
    }

    #[test]
    fn test_rows_for_every_scale() {
        let builder = CandleBuilder::default();
        let rows = builder.rows_for(&point("100.0000", "1.0000", 1_700_000_123));
        assert_eq!(rows.len(), 7);
        assert_eq!(rows[0].time_scale, "1s");
        assert_eq!(rows[0].create_time, 1_700_000_123);
        assert_eq!(rows[3].time_scale, "60s");
        assert_eq!(rows[3].create_time, 1_700_000_100);
        assert!(rows.iter().all(|r| r.update_time == 1_700_000_123));
    }

    #[test]
    fn test_merge_candle_rules() {
        let mut candle = point("100.0000", "10.0000", 60);
        merge_candle(&mut candle, &point("105.0000", "2.5000", 61)).unwrap();
        merge_candle(&mut candle, &point("98.0000", "1.0000", 62)).unwrap();

        assert_eq!(candle.open, "100.0000");
        assert_eq!(candle.high, "105.0000");
        assert_eq!(candle.low, "98.0000");
        assert_eq!(candle.close, "98.0000");
        assert_eq!(candle.volume, "13.5000");
        assert_eq!(candle.update_time, 62);
    }

    #[test]
    fn test_merge_tick_last_write_wins() {
        let mut tick = point("100.0000", "10.0000", 60);
        merge_tick(&mut tick, &point("99.0000", "3.0000", 60)).unwrap();

        assert_eq!(tick.open, "99.0000");
        assert_eq!(tick.close, "99.0000");
        assert_eq!(tick.volume, "3.0000");
        assert_eq!(tick.high, "100.0000");
        assert_eq!(tick.low, "99.0000");
    }
}
