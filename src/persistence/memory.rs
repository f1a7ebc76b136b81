//! In-process `KlineStore` for development and tests
//!
//! Applies the same merge rules as the MySQL upserts.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::error::{StorageError, StorageResult};
use crate::oracle::{merge_candle, merge_tick, CandleBuilder};
use crate::persistence::KlineStore;
use crate::types::{Instrument, Kline, TimeScale};

type RowKey = (Instrument, String, i64);

fn key_of(row: &Kline) -> RowKey {
    (row.instrument.clone(), row.time_scale.clone(), row.create_time)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    ticks: RwLock<BTreeMap<RowKey, Kline>>,
    candles: RwLock<BTreeMap<RowKey, Kline>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All tick rows, ordered by key
    pub fn tick_rows(&self) -> Vec<Kline> {
        self.ticks
            .read()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All candle rows, ordered by key
    pub fn candle_rows(&self) -> Vec<Kline> {
        self.candles
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Exact-key candle lookup
    pub fn candle(&self, instrument: &Instrument, label: &str, create_time: i64) -> Option<Kline> {
        let key = (instrument.clone(), label.to_string(), create_time);
        self.candles.read().ok()?.get(&key).cloned()
    }

    fn poisoned() -> StorageError {
        StorageError::Database("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl KlineStore for MemoryStore {
    async fn upsert_ticks(&self, ticks: &[Kline]) -> StorageResult<()> {
        let mut table = self.ticks.write().map_err(|_| Self::poisoned())?;
        for tick in ticks {
            match table.get_mut(&key_of(tick)) {
                Some(existing) => merge_tick(existing, tick)?,
                None => {
                    table.insert(key_of(tick), tick.clone());
                }
            }
        }
        Ok(())
    }

    async fn upsert_candles(&self, rows: &[Kline]) -> StorageResult<()> {
        let mut table = self.candles.write().map_err(|_| Self::poisoned())?;
        for row in rows {
            match table.get_mut(&key_of(row)) {
                Some(existing) => merge_candle(existing, row)?,
                None => {
                    table.insert(key_of(row), row.clone());
                }
            }
        }
        Ok(())
    }

    async fn find_candle(
        &self,
        instrument: &Instrument,
        scale: &TimeScale,
        create_time: i64,
    ) -> StorageResult<Option<Kline>> {
        let bucket = CandleBuilder::candle_start(create_time, scale.width_secs);
        let key = (instrument.clone(), scale.label.clone(), bucket);
        Ok(self
            .candles
            .read()
            .map_err(|_| Self::poisoned())?
            .get(&key)
            .cloned())
    }

    async fn delete_ticks_before(&self, cutoff: i64) -> StorageResult<u64> {
        let mut table = self.ticks.write().map_err(|_| Self::poisoned())?;
        let before = table.len();
        table.retain(|(_, _, created), _| *created >= cutoff);
        Ok((before - table.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Origin, TimeScaleTable};

    fn point(price: &str, volume: &str, ts: i64) -> Kline {
        Kline::tick(Instrument::new("ETH/USDT"), price, volume, Origin::Market, ts)
    }

    #[tokio::test]
    async fn test_candle_batch_replay_only_accumulates_volume() {
        let store = MemoryStore::new();
        let builder = CandleBuilder::new(TimeScaleTable::default());
        let mut batch = builder.rows_for(&point("100.0000", "2.0000", 120));
        batch.extend(builder.rows_for(&point("103.0000", "1.5000", 121)));

        store.upsert_candles(&batch).await.unwrap();
        let once = store.candle_rows();
        store.upsert_candles(&batch).await.unwrap();
        let twice = store.candle_rows();

        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!((&a.open, &a.high, &a.low, &a.close), (&b.open, &b.high, &b.low, &b.close));
            assert_eq!(a.update_time, b.update_time);
        }

        let minute = once.iter().find(|r| r.time_scale == "60s").unwrap();
        assert_eq!(minute.open, "100.0000");
        assert_eq!(minute.high, "103.0000");
        assert_eq!(minute.close, "103.0000");
        assert_eq!(minute.volume, "3.5000");
        let minute = store.candle(&Instrument::new("ETH/USDT"), "60s", 120).unwrap();
        assert_eq!(minute.volume, "7.0000");
    }

    #[tokio::test]
    async fn test_tick_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let batch = vec![point("100.0000", "2.0000", 10), point("101.0000", "1.0000", 11)];
        store.upsert_ticks(&batch).await.unwrap();
        store.upsert_ticks(&batch).await.unwrap();
        assert_eq!(store.tick_rows(), batch);
    }

    #[tokio::test]
    async fn test_find_candle_truncates_to_bucket() {
        let store = MemoryStore::new();
        let builder = CandleBuilder::default();
        store
            .upsert_candles(&builder.rows_for(&point("99.0000", "5.0000", 86_400 + 3_600)))
            .await
            .unwrap();

        let daily = TimeScale::new("1D", 86_400);
        let found = store
            .find_candle(&Instrument::new("ETH/USDT"), &daily, 86_400 + 50_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.create_time, 86_400);
        assert!(store
            .find_candle(&Instrument::new("BTC/USDT"), &daily, 86_400)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_ticks_before_cutoff() {
        let store = MemoryStore::new();
        let batch: Vec<Kline> = (0..5).map(|ts| point("1.0000", "1.0000", ts)).collect();
        store.upsert_ticks(&batch).await.unwrap();
        assert_eq!(store.delete_ticks_before(3).await.unwrap(), 3);
        assert_eq!(store.tick_rows().len(), 2);
    }
}
