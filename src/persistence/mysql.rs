//! MySQL `KlineStore` backed by sqlx
//!
//! Prices and volumes are stored as decimal strings; merges cast them to
//! DECIMAL(20,4) inside `ON DUPLICATE KEY UPDATE`.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, QueryBuilder, Row};
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::oracle::CandleBuilder;
use crate::persistence::KlineStore;
use crate::types::{Instrument, Kline, Origin, TimeScale};

const COLUMNS: &str =
    "coinType, high, low, open, close, createTime, updateTime, timeScale, origin, originPrice, volume";

const CANDLE_MERGE: &str = " ON DUPLICATE KEY UPDATE \
    low = IF(CAST(low AS DECIMAL(20,4)) < CAST(VALUES(low) AS DECIMAL(20,4)), low, VALUES(low)), \
    high = IF(CAST(high AS DECIMAL(20,4)) > CAST(VALUES(high) AS DECIMAL(20,4)), high, VALUES(high)), \
    volume = CAST(CAST(volume AS DECIMAL(20,4)) + CAST(VALUES(volume) AS DECIMAL(20,4)) AS CHAR), \
    close = VALUES(close), \
    updateTime = VALUES(updateTime)";

const TICK_MERGE: &str = " ON DUPLICATE KEY UPDATE \
    low = IF(CAST(low AS DECIMAL(20,4)) < CAST(VALUES(low) AS DECIMAL(20,4)), low, VALUES(low)), \
    high = IF(CAST(high AS DECIMAL(20,4)) > CAST(VALUES(high) AS DECIMAL(20,4)), high, VALUES(high)), \
    open = VALUES(open), \
    close = VALUES(close), \
    volume = VALUES(volume), \
    updateTime = VALUES(updateTime)";

fn table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT,
            coinType VARCHAR(32) NOT NULL,
            high VARCHAR(40) NOT NULL,
            low VARCHAR(40) NOT NULL,
            open VARCHAR(40) NOT NULL,
            close VARCHAR(40) NOT NULL,
            createTime BIGINT NOT NULL,
            updateTime BIGINT NOT NULL,
            timeScale VARCHAR(8) NOT NULL,
            origin INT NOT NULL,
            originPrice VARCHAR(40) NOT NULL DEFAULT '',
            volume VARCHAR(40) NOT NULL DEFAULT '0',
            PRIMARY KEY (id),
            UNIQUE KEY uniq_{table}_bucket (coinType, timeScale, createTime)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
    )
}

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!(max_connections, "MySQL connection pool initialized");
        Ok(Self { pool })
    }

    pub fn with_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Create the `kline` and `tick_cache` tables if missing
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        for table in ["kline", "tick_cache"] {
            sqlx::query(&table_ddl(table)).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn bulk_upsert(&self, table: &str, rows: &[Kline], merge: &str) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<MySql> =
            QueryBuilder::new(format!("INSERT INTO {table} ({COLUMNS}) "));
        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.instrument.as_str().to_string())
                .push_bind(row.high.clone())
                .push_bind(row.low.clone())
                .push_bind(row.open.clone())
                .push_bind(row.close.clone())
                .push_bind(row.create_time)
                .push_bind(row.update_time)
                .push_bind(row.time_scale.clone())
                .push_bind(i32::from(row.origin.code()))
                .push_bind(row.origin_price.clone())
                .push_bind(row.volume.clone());
        });
        builder.push(merge);

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_kline(row: &MySqlRow) -> StorageResult<Kline> {
        let field = |name: &str, e: sqlx::Error| StorageError::Serialization(format!("{name}: {e}"));
        let code: i32 = row.try_get("origin").map_err(|e| field("origin", e))?;
        let origin = u16::try_from(code)
            .ok()
            .and_then(Origin::from_code)
            .ok_or_else(|| StorageError::Serialization(format!("unknown origin code {code}")))?;

        Ok(Kline {
            instrument: Instrument::new(
                row.try_get::<String, _>("coinType")
                    .map_err(|e| field("coinType", e))?,
            ),
            high: row.try_get("high").map_err(|e| field("high", e))?,
            low: row.try_get("low").map_err(|e| field("low", e))?,
            open: row.try_get("open").map_err(|e| field("open", e))?,
            close: row.try_get("close").map_err(|e| field("close", e))?,
            create_time: row.try_get("createTime").map_err(|e| field("createTime", e))?,
            update_time: row.try_get("updateTime").map_err(|e| field("updateTime", e))?,
            time_scale: row.try_get("timeScale").map_err(|e| field("timeScale", e))?,
            origin,
            origin_price: row.try_get("originPrice").unwrap_or_default(),
            volume: row.try_get("volume").map_err(|e| field("volume", e))?,
            risk_mode: Default::default(),
            total_steps: 0,
            step: 0,
        })
    }
}

#[async_trait]
impl KlineStore for MySqlStore {
    async fn upsert_ticks(&self, ticks: &[Kline]) -> StorageResult<()> {
        self.bulk_upsert("tick_cache", ticks, TICK_MERGE).await
    }

    async fn upsert_candles(&self, rows: &[Kline]) -> StorageResult<()> {
        self.bulk_upsert("kline", rows, CANDLE_MERGE).await
    }

    async fn find_candle(
        &self,
        instrument: &Instrument,
        scale: &TimeScale,
        create_time: i64,
    ) -> StorageResult<Option<Kline>> {
        let bucket = CandleBuilder::candle_start(create_time, scale.width_secs);
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM kline WHERE coinType = ? AND timeScale = ? AND createTime = ? LIMIT 1"
        ))
        .bind(instrument.as_str())
        .bind(scale.label.as_str())
        .bind(bucket)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_kline).transpose()
    }

    async fn delete_ticks_before(&self, cutoff: i64) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM tick_cache WHERE createTime < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
