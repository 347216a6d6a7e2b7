//! End-to-end commit and read flows through both proxies.

mod common;

use bytes::Bytes;
use sable_core::types::INVALID_VERSION;
use tokio::sync::oneshot;

#[tokio::test]
async fn set_then_get_round_trips() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.set(b"foo", b"bar").unwrap();
    let version = tr.commit().await.expect("commit");
    assert!(version >= 0, "commit version {version}");

    let mut tr = db.transaction();
    let value = tr.get(b"foo").await.expect("get");
    assert_eq!(value, Some(Bytes::from_static(b"bar")));
}

#[tokio::test]
async fn read_only_transactions_report_invalid_version() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    let _ = tr.get(b"missing").await.expect("get");
    let version = tr.commit().await.expect("read-only commit");
    assert_eq!(version, INVALID_VERSION);
}

#[tokio::test]
async fn commit_versions_are_strictly_monotonic() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut last = 0;
    for i in 0..5 {
        let mut tr = db.transaction();
        tr.set(format!("mono{i}").as_bytes(), b"x").unwrap();
        let version = tr.commit().await.expect("commit");
        assert!(version > last, "version {version} after {last}");
        last = version;
    }
    // The master's view is never behind any proxy's.
    assert!(cluster.master.live_committed_version() >= last);
    assert_eq!(cluster.commit_data.committed_version.get(), last);
}

#[tokio::test]
async fn read_your_writes_within_a_transaction() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.set(b"ryw", b"one").unwrap();
    assert_eq!(tr.get(b"ryw").await.unwrap(), Some(Bytes::from_static(b"one")));
    tr.clear(b"ryw").unwrap();
    assert_eq!(tr.get(b"ryw").await.unwrap(), None);
}

#[tokio::test]
async fn clear_range_and_reverse_limited_range_reads() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    for (key, value) in [("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")] {
        tr.set(key.as_bytes(), value.as_bytes()).unwrap();
    }
    tr.commit().await.expect("populate");

    // Reverse scan comes back key-descending with the right values.
    let mut tr = db.transaction();
    let (rows, more) = tr.get_range(b"a", b"e", 10, true).await.expect("range");
    assert!(!more);
    let keys: Vec<&[u8]> = rows.iter().map(|(k, _)| k.as_ref()).collect();
    assert_eq!(keys, vec![&b"d"[..], b"c", b"b", b"a"]);
    assert_eq!(rows[0].1, Bytes::from_static(b"4"));

    // A limit of 2 returns the first two and signals more.
    let (rows, more) = tr.get_range(b"a", b"e", 2, false).await.expect("range");
    assert!(more);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, Bytes::from_static(b"a"));
    assert_eq!(rows[1].0, Bytes::from_static(b"b"));

    // Clear the middle and confirm the hole.
    let mut tr = db.transaction();
    tr.clear_range(b"b", b"d").unwrap();
    tr.commit().await.expect("clear");

    let mut tr = db.transaction();
    assert_eq!(tr.get(b"b").await.unwrap(), None);
    assert_eq!(tr.get(b"c").await.unwrap(), None);
    assert_eq!(tr.get(b"a").await.unwrap(), Some(Bytes::from_static(b"1")));
    assert_eq!(tr.get(b"d").await.unwrap(), Some(Bytes::from_static(b"4")));
}

#[tokio::test]
async fn key_locations_resolve_to_the_seeded_storage_server() {
    let cluster = common::start_cluster().await;

    let (reply_tx, reply_rx) = oneshot::channel();
    cluster
        .key_location_sender()
        .send(sable_core::messages::GetKeyServerLocationsRequest {
            begin: Bytes::from_static(b"anything"),
            end: None,
            limit: 1,
            reverse: false,
            reply: reply_tx,
        })
        .unwrap();
    let reply = reply_rx.await.unwrap().expect("locations");
    assert_eq!(reply.results.len(), 1);
    assert_eq!(reply.results[0].1, vec![1]);
}
