//! Read-version admission control, throttles, locks, and client limits.

mod common;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sable_core::messages::TagThrottleInfo;
use sable_core::types::Priority;
use sable_core::StoreError;
use sable_proxy::{SimClusterConfig, TransactionLimits};

#[tokio::test]
async fn batch_priority_is_rejected_when_the_batch_rate_collapses() {
    let cluster = common::start_cluster_with(SimClusterConfig {
        batch_transaction_rate: 0.5,
        ..SimClusterConfig::default()
    })
    .await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.options.priority = Priority::Batch;
    let result = tr.get_read_version().await;
    assert_eq!(result, Err(StoreError::BatchTransactionThrottled));
    assert_eq!(StoreError::BatchTransactionThrottled.code(), 1051);
}

#[tokio::test]
async fn batch_priority_proceeds_under_a_healthy_rate() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    // Give the rate lease loop a moment to pick up the healthy rates.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut tr = db.transaction();
    tr.options.priority = Priority::Batch;
    tr.set(b"batchy", b"1").unwrap();
    tr.commit().await.expect("batch-priority commit");
}

#[tokio::test]
async fn tag_throttle_advice_reaches_tagged_requests() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut throttles = HashMap::new();
    let mut per_tag = HashMap::new();
    per_tag.insert(
        Bytes::from_static(b"hot"),
        TagThrottleInfo {
            tps_rate: 5.0,
            expiration: Instant::now() + Duration::from_secs(60),
        },
    );
    throttles.insert(Priority::Default, per_tag);
    cluster.rate_keeper.set_throttled_tags(throttles);

    // The throttle map rides the next rate lease renewal.
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let mut tr = db.transaction();
    tr.options.tags.push(Bytes::from_static(b"hot"));
    tr.get_read_version().await.expect("read version");
    let throttles = tr.tag_throttles().expect("grv reply cached");
    let info = throttles.get(&Bytes::from_static(b"hot")).expect("tag advice");
    assert_eq!(info.tps_rate, 5.0);

    // The per-tag counters were forwarded to the rate keeper.
    let counts = cluster.rate_keeper.seen_tag_counts();
    assert!(counts.get(&Bytes::from_static(b"hot")).copied().unwrap_or(0) >= 1);
}

#[tokio::test]
async fn lock_discipline_spans_both_proxies() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    // A transaction that took its snapshot before the lock.
    let mut stale = db.transaction();
    stale.get_read_version().await.unwrap();

    // Lock the database.
    let mut locker = db.transaction();
    locker.options.access_system_keys = true;
    locker.options.lock_aware = true;
    locker.set(b"\xff/dbLocked", b"lock-uid").unwrap();
    locker.commit().await.expect("lock commit");

    // New non-lock-aware transactions are refused a read version.
    let mut refused = db.transaction();
    assert_eq!(refused.get(b"k").await, Err(StoreError::DatabaseLocked));
    assert_eq!(StoreError::DatabaseLocked.code(), 1038);

    // Lock-aware transactions still run.
    let mut aware = db.transaction();
    aware.options.lock_aware = true;
    aware.get(b"k").await.expect("lock-aware read");

    // The stale transaction commits into the locked database and loses.
    stale.set(b"k", b"stale").unwrap();
    assert_eq!(stale.commit().await, Err(StoreError::NotCommitted));

    // Unlock and confirm normal service resumes.
    let mut unlocker = db.transaction();
    unlocker.options.access_system_keys = true;
    unlocker.options.lock_aware = true;
    unlocker.clear(b"\xff/dbLocked").unwrap();
    unlocker.commit().await.expect("unlock commit");

    let mut tr = db.transaction();
    tr.set(b"k", b"fresh").unwrap();
    tr.commit().await.expect("post-unlock commit");
}

#[tokio::test]
async fn min_known_committed_version_substitution() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.set(b"advance", b"1").unwrap();
    let committed = tr.commit().await.unwrap();

    let mut tr = db.transaction();
    tr.options.use_min_known_committed_version = true;
    let version = tr.get_read_version().await.expect("min-known version");
    assert!(version > 0 && version <= committed, "version {version} vs {committed}");
}

#[tokio::test]
async fn transaction_timeout_surfaces_1031() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.set_timeout(Duration::from_millis(5));
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(tr.get(b"anything").await, Err(StoreError::TransactionTimedOut));
    assert_eq!(StoreError::TransactionTimedOut.code(), 1031);
}

#[tokio::test]
async fn size_limit_option_validates_and_binds() {
    let cluster = common::start_cluster_with(SimClusterConfig {
        limits: TransactionLimits::default(),
        ..SimClusterConfig::default()
    })
    .await;
    let db = cluster.database();

    let mut tr = db.transaction();
    assert_eq!(tr.set_size_limit(8), Err(StoreError::InvalidOptionValue));
    assert_eq!(tr.set_size_limit(20_000_000), Err(StoreError::InvalidOptionValue));
    tr.set_size_limit(64).unwrap();
    tr.set(b"big", &[0u8; 100]).unwrap();
    assert_eq!(tr.commit().await, Err(StoreError::TransactionTooLarge));
    assert_eq!(StoreError::TransactionTooLarge.code(), 2101);
}

#[tokio::test]
async fn system_keys_require_explicit_access() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    assert_eq!(
        tr.get(b"\xff\x02/blog/x").await,
        Err(StoreError::KeyOutsideLegalRange)
    );
    assert_eq!(
        tr.set(b"\xff/conf/x", b"v"),
        Err(StoreError::KeyOutsideLegalRange)
    );

    // Read-only system access allows reads but still no writes.
    let mut tr = db.transaction();
    tr.options.read_system_keys = true;
    tr.get(b"\xff\x02/blog/x").await.expect("system read");
    assert_eq!(
        tr.set(b"\xff/conf/x", b"v"),
        Err(StoreError::KeyOutsideLegalRange)
    );
}
