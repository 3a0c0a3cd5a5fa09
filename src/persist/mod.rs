//! Relational store for monitoring rows and the profit log.
//!
//! Writes go through a dedicated writer task so a slow or failing store
//! never blocks trading. The `monitor_account` row is upserted on status
//! changes; `profit_log` is append-only, one row per realized-PnL event.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::trading::errors::TradingError;
use crate::utils::{retry_with_backoff, RetryConfig};

/// Health status stored on the monitor row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Paused,
    Stopped,
}

impl AccountStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            AccountStatus::Active => 0,
            AccountStatus::Paused => 1,
            AccountStatus::Stopped => 2,
        }
    }
}

/// One monitored account row
#[derive(Debug, Clone, FromRow)]
pub struct MonitorAccount {
    pub id: i64,
    /// Opaque account key, unique per monitored account
    pub userid: String,
    pub username: String,
    pub status: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One realized-PnL event
#[derive(Debug, Clone, FromRow)]
pub struct ProfitLogEntry {
    pub id: i64,
    pub price: f64,
    pub position: f64,
    pub period_profit: f64,
    pub created_at: DateTime<Utc>,
}

fn persistence_error(e: sqlx::Error) -> TradingError {
    TradingError::PersistenceFailure {
        message: e.to_string(),
    }
}

/// Pool-backed store for the two monitoring tables.
#[derive(Clone)]
pub struct ProfitStore {
    pool: SqlitePool,
}

impl ProfitStore {
    /// Connect, creating the database file and schema if missing.
    pub async fn connect(url: &str) -> Result<Self, TradingError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(persistence_error)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(persistence_error)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), TradingError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitor_account (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                userid TEXT UNIQUE NOT NULL,
                username TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(persistence_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS profit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                price FLOAT NOT NULL,
                position FLOAT NOT NULL,
                period_profit FLOAT NOT NULL,
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(persistence_error)?;
        Ok(())
    }

    /// Insert or update the account row keyed by userid.
    pub async fn upsert_account(
        &self,
        userid: &str,
        username: &str,
        status: AccountStatus,
    ) -> Result<(), TradingError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO monitor_account (userid, username, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(userid) DO UPDATE SET
                username = excluded.username,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(userid)
        .bind(username)
        .bind(status.as_i64())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(persistence_error)?;
        Ok(())
    }

    /// Append one realized-PnL row.
    pub async fn append_profit(
        &self,
        price: Decimal,
        position: Decimal,
        period_profit: Decimal,
    ) -> Result<(), TradingError> {
        sqlx::query(
            "INSERT INTO profit_log (price, position, period_profit, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(price.to_f64().unwrap_or_default())
        .bind(position.to_f64().unwrap_or_default())
        .bind(period_profit.to_f64().unwrap_or_default())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(persistence_error)?;
        Ok(())
    }

    pub async fn fetch_account(
        &self,
        userid: &str,
    ) -> Result<Option<MonitorAccount>, TradingError> {
        sqlx::query_as::<_, MonitorAccount>("SELECT * FROM monitor_account WHERE userid = ?")
            .bind(userid)
            .fetch_optional(&self.pool)
            .await
            .map_err(persistence_error)
    }

    pub async fn account_count(&self) -> Result<i64, TradingError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM monitor_account")
            .fetch_one(&self.pool)
            .await
            .map_err(persistence_error)
    }

    pub async fn recent_profits(&self, limit: i64) -> Result<Vec<ProfitLogEntry>, TradingError> {
        sqlx::query_as::<_, ProfitLogEntry>(
            "SELECT * FROM profit_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence_error)
    }
}

/// Command accepted by the writer task
#[derive(Debug, Clone)]
pub enum RecordCommand {
    Profit {
        price: Decimal,
        position: Decimal,
        period_profit: Decimal,
    },
    Status(AccountStatus),
}

/// Non-blocking handle to the writer task.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<RecordCommand>,
}

impl RecorderHandle {
    /// Enqueue a write without ever blocking the caller. A full queue is
    /// logged and dropped; the store is a monitor, not a ledger.
    pub fn record(&self, command: RecordCommand) {
        if let Err(e) = self.tx.try_send(command) {
            warn!("profit recorder queue full, dropping write: {}", e);
        }
    }
}

async fn write_command(store: &ProfitStore, userid: &str, username: &str, command: &RecordCommand) {
    let result = retry_with_backoff(
        "persist write",
        RetryConfig::new(3, 250),
        |_: &TradingError| true,
        || async {
            match command {
                RecordCommand::Profit {
                    price,
                    position,
                    period_profit,
                } => store.append_profit(*price, *position, *period_profit).await,
                RecordCommand::Status(status) => {
                    store.upsert_account(userid, username, *status).await
                }
            }
        },
    )
    .await;
    if let Err(e) = result {
        // Surface as a health signal; trading is unaffected.
        error!("persist write failed after retries: {}", e);
    }
}

/// Spawn the single writer task for one account.
///
/// With `flush` set, realized-profit rows accumulate and a single
/// aggregated row is written per interval; status writes always go through
/// immediately. Anything still pending is written on shutdown.
pub fn spawn_writer(
    store: ProfitStore,
    userid: String,
    username: String,
    flush: Option<Duration>,
) -> (RecorderHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<RecordCommand>(256);
    let handle = tokio::spawn(async move {
        let mut pending: Option<(Decimal, Decimal, Decimal)> = None;
        let mut flush_tick =
            tokio::time::interval(flush.unwrap_or(Duration::from_secs(3600)));
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        flush_tick.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(RecordCommand::Profit { price, position, period_profit })
                            if flush.is_some() =>
                        {
                            let entry =
                                pending.get_or_insert((price, position, Decimal::ZERO));
                            entry.0 = price;
                            entry.1 = position;
                            entry.2 += period_profit;
                        }
                        Some(command) => {
                            write_command(&store, &userid, &username, &command).await;
                        }
                        None => break,
                    }
                }
                _ = flush_tick.tick(), if flush.is_some() => {
                    if let Some((price, position, period_profit)) = pending.take() {
                        let command = RecordCommand::Profit { price, position, period_profit };
                        write_command(&store, &userid, &username, &command).await;
                    }
                }
            }
        }

        if let Some((price, position, period_profit)) = pending.take() {
            let command = RecordCommand::Profit { price, position, period_profit };
            write_command(&store, &userid, &username, &command).await;
        }
        info!("profit recorder stopped");
    });
    (RecorderHandle { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn temp_store() -> (ProfitStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        (ProfitStore::connect(&url).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn test_upsert_same_userid_keeps_one_row() {
        let (store, _dir) = temp_store().await;

        store
            .upsert_account("acct-7", "alice", AccountStatus::Active)
            .await
            .unwrap();
        store
            .upsert_account("acct-7", "alice-renamed", AccountStatus::Paused)
            .await
            .unwrap();

        assert_eq!(store.account_count().await.unwrap(), 1);
        let row = store.fetch_account("acct-7").await.unwrap().unwrap();
        assert_eq!(row.username, "alice-renamed");
        assert_eq!(row.status, AccountStatus::Paused.as_i64());
    }

    #[tokio::test]
    async fn test_profit_log_is_append_only() {
        let (store, _dir) = temp_store().await;

        store
            .append_profit(dec!(101), dec!(1), dec!(2))
            .await
            .unwrap();
        store
            .append_profit(dec!(99), dec!(0), dec!(1.5))
            .await
            .unwrap();

        let rows = store.recent_profits(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].period_profit, 1.5);
        assert_eq!(rows[1].period_profit, 2.0);
    }

    #[tokio::test]
    async fn test_writer_task_applies_commands() {
        let (store, _dir) = temp_store().await;
        let (handle, task) =
            spawn_writer(store.clone(), "acct-9".to_string(), "bob".to_string(), None);

        handle.record(RecordCommand::Status(AccountStatus::Active));
        handle.record(RecordCommand::Profit {
            price: dec!(100),
            position: dec!(1),
            period_profit: dec!(0.5),
        });
        drop(handle);
        task.await.unwrap();

        assert!(store.fetch_account("acct-9").await.unwrap().is_some());
        assert_eq!(store.recent_profits(10).await.unwrap().len(), 1);
    }
}
