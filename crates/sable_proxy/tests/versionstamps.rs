//! Versionstamp fill-in through the commit pipeline.

mod common;

use bytes::Bytes;
use sable_core::mutation::MutationKind;
use sable_core::StoreError;

fn stamped_key(prefix: &[u8]) -> Vec<u8> {
    // prefix ‖ 10-byte placeholder ‖ little-endian offset of the placeholder.
    let mut key = prefix.to_vec();
    key.extend_from_slice(&[0u8; 10]);
    key.extend_from_slice(&(prefix.len() as u32).to_le_bytes());
    key
}

#[tokio::test]
async fn versionstamped_key_lands_at_the_stamped_location() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    let key = stamped_key(b"user/foo/");
    tr.atomic_op(MutationKind::SetVersionstampedKey, &key, b"bar")
        .unwrap();
    let version = tr.commit().await.expect("commit");
    let stamp = tr.get_versionstamp().expect("stamp");
    assert_eq!(&stamp[..8], &version.to_be_bytes());

    // Reading at prefix ‖ stamp yields the written value.
    let mut final_key = b"user/foo/".to_vec();
    final_key.extend_from_slice(&stamp);
    let mut tr = db.transaction();
    let value = tr.get(&final_key).await.unwrap();
    assert_eq!(value, Some(Bytes::from_static(b"bar")));
}

#[tokio::test]
async fn versionstamped_value_is_rewritten_in_place() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    // Value: 4 bytes of payload, then the placeholder at offset 4.
    let mut value = b"pay:".to_vec();
    value.extend_from_slice(&[0u8; 10]);
    value.extend_from_slice(&4u32.to_le_bytes());
    tr.atomic_op(MutationKind::SetVersionstampedValue, b"stamped-value", &value)
        .unwrap();
    let version = tr.commit().await.expect("commit");
    let stamp = tr.get_versionstamp().unwrap();

    let mut tr = db.transaction();
    let stored = tr.get(b"stamped-value").await.unwrap().expect("value");
    assert_eq!(&stored[..4], b"pay:");
    assert_eq!(&stored[4..14], &stamp);
    assert_eq!(&stored[4..12], &version.to_be_bytes());
}

#[tokio::test]
async fn invalid_versionstamp_offset_fails_only_that_transaction() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut bad = db.transaction();
    // Offset points past the end of the stripped parameter.
    let mut key = b"bad".to_vec();
    key.extend_from_slice(&[0u8; 10]);
    key.extend_from_slice(&200u32.to_le_bytes());
    bad.atomic_op(MutationKind::SetVersionstampedKey, &key, b"x")
        .unwrap();
    assert_eq!(
        bad.commit().await,
        Err(StoreError::ClientInvalidOperation)
    );

    // The pipeline is intact for the next transaction.
    let mut ok = db.transaction();
    ok.set(b"after-bad", b"fine").unwrap();
    ok.commit().await.expect("subsequent commit");
}

#[tokio::test]
async fn versionstamps_within_a_batch_are_unique() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    // Several concurrent stamped writes; every final key must be distinct.
    let mut handles = Vec::new();
    for i in 0..4 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let mut tr = db.transaction();
            let key = stamped_key(format!("queue/{i}/").as_bytes());
            tr.atomic_op(MutationKind::SetVersionstampedKey, &key, b"v")
                .unwrap();
            tr.commit().await.expect("commit");
            tr.get_versionstamp().expect("stamp")
        }));
    }
    let mut stamps = Vec::new();
    for handle in handles {
        stamps.push(handle.await.unwrap());
    }
    stamps.sort();
    stamps.dedup();
    assert_eq!(stamps.len(), 4, "stamps must be unique");
}
