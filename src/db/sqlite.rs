use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

use crate::models::{Granularity, History, MinuteBar, Tick, TradeAction, TradeRecord};
use crate::persistence::{RowCounts, StoreBackend, StoreItem};
use crate::Result;

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| format!("timestamp out of range: {}", ms).into())
}

/// SQLite persistence for ticks, minute bars, the trade log and cached fundamentals
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if missing) the database file and run migrations
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Opened SQLite store at {}", path.display());

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Upsert one minute bar; a second write for the same minute overwrites the first
    pub async fn upsert_minute_bar(&self, bar: &MinuteBar) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        upsert_bar(&mut conn, bar).await
    }

    pub async fn append_trade(&self, trade: &TradeRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_trade(&mut conn, trade).await
    }

    pub async fn load_ticks(&self, symbol: &str, since: DateTime<Utc>) -> Result<Vec<Tick>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, price, volume, timestamp_ms
            FROM tick_data
            WHERE symbol = ?1 AND timestamp_ms >= ?2
            ORDER BY timestamp_ms ASC, id ASC
            "#,
        )
        .bind(symbol)
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Tick> {
                Ok(Tick {
                    symbol: row.try_get("symbol")?,
                    price: row.try_get("price")?,
                    volume: row.try_get::<i64, _>("volume")?.max(0) as u64,
                    timestamp: from_millis(row.try_get("timestamp_ms")?)?,
                })
            })
            .collect()
    }

    pub async fn load_minute_bars(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MinuteBar>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, minute_timestamp, open, high, low, close, volume, rsi, ma5, ma20
            FROM minute_data
            WHERE symbol = ?1 AND minute_timestamp >= ?2
            ORDER BY minute_timestamp ASC
            "#,
        )
        .bind(symbol)
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<MinuteBar> {
                Ok(MinuteBar {
                    symbol: row.try_get("symbol")?,
                    open: row.try_get("open")?,
                    high: row.try_get("high")?,
                    low: row.try_get("low")?,
                    close: row.try_get("close")?,
                    volume: row.try_get::<i64, _>("volume")?.max(0) as u64,
                    timestamp: from_millis(row.try_get("minute_timestamp")?)?,
                    rsi: row.try_get("rsi")?,
                    ma5: row.try_get("ma5")?,
                    ma20: row.try_get("ma20")?,
                })
            })
            .collect()
    }

    pub async fn load_trades(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp_ms, symbol, action, price, quantity, reason,
                   realized_pnl, realized_pnl_pct
            FROM trade_log
            WHERE timestamp_ms >= ?1
            ORDER BY timestamp_ms ASC
            "#,
        )
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;

        let trades: Vec<TradeRecord> = rows.iter().map(trade_from_row).collect::<Result<_>>()?;

        tracing::debug!("Loaded {} trades since {}", trades.len(), since);

        Ok(trades)
    }

    pub async fn get_metric(&self, symbol: &str, metric: &str) -> Result<Option<(f64, DateTime<Utc>)>> {
        let row = sqlx::query(
            "SELECT value, cached_at_ms FROM financial_cache WHERE symbol = ?1 AND metric_name = ?2",
        )
        .bind(symbol)
        .bind(metric)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some((
                row.try_get("value")?,
                from_millis(row.try_get("cached_at_ms")?)?,
            ))),
            None => Ok(None),
        }
    }

    pub async fn put_metric(
        &self,
        symbol: &str,
        metric: &str,
        value: f64,
        cached_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO financial_cache (symbol, metric_name, value, cached_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(symbol, metric_name) DO UPDATE SET
                value = excluded.value,
                cached_at_ms = excluded.cached_at_ms
            "#,
        )
        .bind(symbol)
        .bind(metric)
        .bind(value)
        .bind(to_millis(cached_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_metrics_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM financial_cache WHERE cached_at_ms < ?1")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?.max(0) as u64)
    }
}

async fn upsert_bar(conn: &mut sqlx::SqliteConnection, bar: &MinuteBar) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO minute_data (
            symbol, minute_timestamp, open, high, low, close, volume, rsi, ma5, ma20
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(symbol, minute_timestamp) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            volume = excluded.volume,
            rsi = excluded.rsi,
            ma5 = excluded.ma5,
            ma20 = excluded.ma20
        "#,
    )
    .bind(&bar.symbol)
    .bind(to_millis(bar.timestamp))
    .bind(bar.open)
    .bind(bar.high)
    .bind(bar.low)
    .bind(bar.close)
    .bind(bar.volume as i64)
    .bind(bar.rsi)
    .bind(bar.ma5)
    .bind(bar.ma20)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_trade(conn: &mut sqlx::SqliteConnection, trade: &TradeRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO trade_log (
            id, timestamp_ms, symbol, action, price, quantity, reason,
            realized_pnl, realized_pnl_pct
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(trade.id.to_string())
    .bind(to_millis(trade.timestamp))
    .bind(&trade.symbol)
    .bind(trade.action.as_str())
    .bind(trade.price)
    .bind(trade.quantity as i64)
    .bind(&trade.reason)
    .bind(trade.realized_pnl)
    .bind(trade.realized_pnl_pct)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn trade_from_row(row: &SqliteRow) -> Result<TradeRecord> {
    let id: String = row.try_get("id")?;
    let action: String = row.try_get("action")?;
    Ok(TradeRecord {
        id: Uuid::parse_str(&id)?,
        symbol: row.try_get("symbol")?,
        action: action.parse::<TradeAction>()?,
        price: row.try_get("price")?,
        quantity: row.try_get::<i64, _>("quantity")?.max(0) as u64,
        timestamp: from_millis(row.try_get("timestamp_ms")?)?,
        reason: row.try_get("reason")?,
        realized_pnl: row.try_get("realized_pnl")?,
        realized_pnl_pct: row.try_get("realized_pnl_pct")?,
    })
}

#[async_trait]
impl StoreBackend for SqliteStorage {
    /// Write a mixed batch in one transaction
    async fn write_batch(&self, batch: &[StoreItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for item in batch {
            match item {
                StoreItem::Tick(tick) => {
                    sqlx::query(
                        r#"
                        INSERT OR IGNORE INTO tick_data (symbol, price, volume, timestamp_ms)
                        VALUES (?1, ?2, ?3, ?4)
                        "#,
                    )
                    .bind(&tick.symbol)
                    .bind(tick.price)
                    .bind(tick.volume as i64)
                    .bind(to_millis(tick.timestamp))
                    .execute(&mut *tx)
                    .await?;
                }
                StoreItem::Bar(bar) => upsert_bar(&mut tx, bar).await?,
                StoreItem::Trade(trade) => insert_trade(&mut tx, trade).await?,
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_history(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<History> {
        Ok(match granularity {
            Granularity::Tick => History::Ticks(self.load_ticks(symbol, since).await?),
            Granularity::Minute => History::Bars(self.load_minute_bars(symbol, since).await?),
        })
    }

    async fn load_trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>> {
        self.load_trades(since).await
    }

    async fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = to_millis(cutoff);
        let ticks = sqlx::query("DELETE FROM tick_data WHERE timestamp_ms < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let bars = sqlx::query("DELETE FROM minute_data WHERE minute_timestamp < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::info!("Cleaned up {} ticks and {} minute bars", ticks, bars);

        Ok(ticks + bars)
    }

    async fn row_counts(&self) -> Result<RowCounts> {
        Ok(RowCounts {
            ticks: self.count("tick_data").await?,
            minute_bars: self.count("minute_data").await?,
            trades: self.count("trade_log").await?,
            financial_metrics: self.count("financial_cache").await?,
        })
    }
}
