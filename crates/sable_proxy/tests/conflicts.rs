//! Conflict detection through the resolver fan-out.

mod common;

use sable_core::StoreError;

#[tokio::test]
async fn overlapping_writers_with_stale_snapshots_conflict() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    // Both transactions take their snapshots before either commits.
    let mut a = db.transaction();
    a.get_read_version().await.unwrap();
    let mut b = db.transaction();
    b.get_read_version().await.unwrap();

    a.get(b"contended").await.unwrap();
    a.set(b"contended", b"from-a").unwrap();
    b.get(b"contended").await.unwrap();
    b.set(b"contended", b"from-b").unwrap();

    let first = a.commit().await;
    let second = b.commit().await;
    assert!(first.is_ok(), "first writer should win: {first:?}");
    assert_eq!(second, Err(StoreError::NotCommitted));
    assert_eq!(StoreError::NotCommitted.code(), 1020);
}

#[tokio::test]
async fn blind_writes_do_not_conflict() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    // No read-conflict ranges: both blind writes commit.
    let mut a = db.transaction();
    a.get_read_version().await.unwrap();
    let mut b = db.transaction();
    b.get_read_version().await.unwrap();
    a.set(b"blind", b"a").unwrap();
    b.set(b"blind", b"b").unwrap();
    a.commit().await.expect("a commits");
    b.commit().await.expect("b commits");
}

#[tokio::test]
async fn conflicting_key_reporting_maps_to_client_indices() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut winner = db.transaction();
    winner.get_read_version().await.unwrap();
    let mut loser = db.transaction();
    loser.options.report_conflicting_keys = true;
    loser.get_read_version().await.unwrap();

    winner.set(b"reported", b"w").unwrap();

    // The loser reads an unrelated key first, then the contended one, so the
    // conflicting client-side index is 1.
    loser.get(b"unrelated").await.unwrap();
    loser.get(b"reported").await.unwrap();
    loser.set(b"reported", b"l").unwrap();

    winner.commit().await.expect("winner commits");
    let result = loser.commit().await;
    assert_eq!(result, Err(StoreError::NotCommitted));
    let indices = loser
        .conflicting_range_indices()
        .expect("conflicting indices reported");
    assert_eq!(indices, &[1]);
}

#[tokio::test]
async fn retry_loop_recovers_from_conflicts() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    // Seed the counter.
    let mut tr = db.transaction();
    tr.set(b"counter", b"0").unwrap();
    tr.commit().await.unwrap();

    // Two contending increments, each with the standard retry loop.
    let mut handles = Vec::new();
    for _ in 0..2 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let mut tr = db.transaction();
            loop {
                let result = async {
                    let current = tr.get(b"counter").await?.unwrap_or_default();
                    let next = (String::from_utf8_lossy(&current).parse::<u64>().unwrap_or(0)
                        + 1)
                    .to_string();
                    tr.set(b"counter", next.as_bytes())?;
                    tr.commit().await
                }
                .await;
                match result {
                    Ok(_) => return,
                    Err(err) => tr.on_error(err).await.expect("retryable"),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut tr = db.transaction();
    let value = tr.get(b"counter").await.unwrap().unwrap();
    assert_eq!(value.as_ref(), b"2");
}
