//! Persistence behavior of the monitor and profit tables.

use grid_pilot::persist::{spawn_writer, AccountStatus, ProfitStore, RecordCommand};
use rust_decimal_macros::dec;
use std::time::Duration;

async fn temp_store() -> (ProfitStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("recorder.db").display());
    (ProfitStore::connect(&url).await.unwrap(), dir)
}

#[tokio::test]
async fn test_monitor_account_upsert_is_keyed_by_userid() {
    let (store, _dir) = temp_store().await;

    store
        .upsert_account("acct-100", "first-name", AccountStatus::Active)
        .await
        .unwrap();
    let created = store.fetch_account("acct-100").await.unwrap().unwrap();

    store
        .upsert_account("acct-100", "second-name", AccountStatus::Stopped)
        .await
        .unwrap();

    assert_eq!(store.account_count().await.unwrap(), 1);
    let updated = store.fetch_account("acct-100").await.unwrap().unwrap();
    assert_eq!(updated.id, created.id);
    assert_eq!(updated.username, "second-name");
    assert_eq!(updated.status, AccountStatus::Stopped.as_i64());
    assert_eq!(updated.created_at, created.created_at);
    assert!(updated.updated_at >= created.updated_at);
}

#[tokio::test]
async fn test_distinct_userids_get_distinct_rows() {
    let (store, _dir) = temp_store().await;

    store
        .upsert_account("acct-1", "one", AccountStatus::Active)
        .await
        .unwrap();
    store
        .upsert_account("acct-2", "two", AccountStatus::Active)
        .await
        .unwrap();

    assert_eq!(store.account_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_profit_log_appends_and_never_overwrites() {
    let (store, _dir) = temp_store().await;

    for i in 1..=5 {
        store
            .append_profit(dec!(100), dec!(1), rust_decimal::Decimal::from(i))
            .await
            .unwrap();
    }

    let rows = store.recent_profits(100).await.unwrap();
    assert_eq!(rows.len(), 5);
    // Newest first; every historical row is still present.
    assert_eq!(rows[0].period_profit, 5.0);
    assert_eq!(rows[4].period_profit, 1.0);
}

#[tokio::test]
async fn test_writer_survives_status_and_profit_interleaving() {
    let (store, _dir) = temp_store().await;
    let (handle, task) = spawn_writer(
        store.clone(),
        "acct-7".to_string(),
        "interleave".to_string(),
        None,
    );

    handle.record(RecordCommand::Status(AccountStatus::Active));
    handle.record(RecordCommand::Profit {
        price: dec!(101),
        position: dec!(1),
        period_profit: dec!(2),
    });
    handle.record(RecordCommand::Status(AccountStatus::Paused));
    handle.record(RecordCommand::Profit {
        price: dec!(99),
        position: dec!(0),
        period_profit: dec!(1),
    });
    handle.record(RecordCommand::Status(AccountStatus::Stopped));
    drop(handle);
    task.await.unwrap();

    let account = store.fetch_account("acct-7").await.unwrap().unwrap();
    assert_eq!(account.status, AccountStatus::Stopped.as_i64());
    assert_eq!(store.recent_profits(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_flush_interval_aggregates_profit_rows() {
    let (store, _dir) = temp_store().await;
    // An interval far longer than the test: the aggregate is written when
    // the writer drains on shutdown.
    let (handle, task) = spawn_writer(
        store.clone(),
        "acct-8".to_string(),
        "batch".to_string(),
        Some(Duration::from_secs(3600)),
    );

    for profit in [dec!(1), dec!(2), dec!(0.5)] {
        handle.record(RecordCommand::Profit {
            price: dec!(100) + profit,
            position: profit,
            period_profit: profit,
        });
    }
    drop(handle);
    task.await.unwrap();

    let rows = store.recent_profits(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].period_profit, 3.5);
    assert_eq!(rows[0].price, 100.5);
}
