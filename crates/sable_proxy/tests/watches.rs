//! Watch lifecycle: triggering, budget, and cancellation.

mod common;

use std::time::Duration;

use sable_core::StoreError;
use sable_proxy::{SimClusterConfig, TransactionLimits};

#[tokio::test]
async fn watch_fires_when_the_value_changes() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.set(b"watched", b"before").unwrap();
    tr.commit().await.unwrap();

    let mut watcher = db.transaction();
    let watch = watcher.watch(b"watched").unwrap();

    let mut writer = db.transaction();
    writer.set(b"watched", b"after").unwrap();
    writer.commit().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), watch.wait())
        .await
        .expect("watch should fire")
        .expect("watch result");
    assert_eq!(db.live_watches(), 0);
}

#[tokio::test]
async fn watch_budget_is_enforced() {
    let cluster = common::start_cluster_with(SimClusterConfig {
        limits: TransactionLimits {
            max_watches: 2,
            ..TransactionLimits::default()
        },
        ..SimClusterConfig::default()
    })
    .await;
    let db = cluster.database();

    let mut tr = db.transaction();
    let _w1 = tr.watch(b"a").unwrap();
    let _w2 = tr.watch(b"b").unwrap();
    let over = tr.watch(b"c");
    assert!(matches!(over, Err(StoreError::TooManyWatches)));
    assert_eq!(StoreError::TooManyWatches.code(), 1032);

    // Dropping a live watch frees budget.
    drop(_w1);
    tr.watch(b"c").expect("budget freed");
}

#[tokio::test]
async fn cancelling_a_transaction_fails_its_watches() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    let watch = tr.watch(b"doomed").unwrap();
    tr.cancel();
    assert_eq!(watch.wait().await, Err(StoreError::TransactionCancelled));
    assert_eq!(StoreError::TransactionCancelled.code(), 1025);

    // A cancelled transaction refuses further work.
    let mut tr = db.transaction();
    tr.cancel();
    assert_eq!(tr.set(b"x", b"y"), Err(StoreError::TransactionCancelled));
}

#[tokio::test]
async fn disabled_watches_surface_1034() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.options.watches_disabled = true;
    assert!(matches!(tr.watch(b"k"), Err(StoreError::WatchesDisabled)));
    assert_eq!(StoreError::WatchesDisabled.code(), 1034);
}

#[tokio::test]
async fn reset_fails_pending_watches_and_reuses_the_transaction() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    let watch = tr.watch(b"reset-me").unwrap();
    tr.reset();
    assert_eq!(watch.wait().await, Err(StoreError::TransactionCancelled));

    tr.set(b"reset-me", b"ok").unwrap();
    tr.commit().await.expect("post-reset commit");
}
