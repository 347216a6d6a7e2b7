//! Atomic mutations applied through the full pipeline.

mod common;

use bytes::Bytes;
use sable_core::mutation::MutationKind;

#[tokio::test]
async fn atomic_add_increments_a_byte() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.set(b"foo", b"a").unwrap();
    tr.commit().await.unwrap();

    let mut tr = db.transaction();
    tr.atomic_op(MutationKind::Add, b"foo", b"\x01").unwrap();
    tr.commit().await.unwrap();

    let mut tr = db.transaction();
    let value = tr.get(b"foo").await.unwrap().unwrap();
    assert_eq!(value, Bytes::from_static(b"b"));
    assert_eq!(value.as_ref(), [0x62]);
}

#[tokio::test]
async fn atomic_add_carries_and_extends() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.set(b"wide", &[0xff, 0x00]).unwrap();
    tr.atomic_op(MutationKind::Add, b"wide", &[0x01, 0x00]).unwrap();
    tr.commit().await.unwrap();

    let mut tr = db.transaction();
    let value = tr.get(b"wide").await.unwrap().unwrap();
    assert_eq!(value.as_ref(), [0x00, 0x01]);
}

#[tokio::test]
async fn compare_and_clear_removes_only_matching_values() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.set(b"cac", b"expected").unwrap();
    tr.commit().await.unwrap();

    // Mismatched operand leaves the value alone.
    let mut tr = db.transaction();
    tr.atomic_op(MutationKind::CompareAndClear, b"cac", b"other")
        .unwrap();
    tr.commit().await.unwrap();
    let mut tr = db.transaction();
    assert_eq!(
        tr.get(b"cac").await.unwrap(),
        Some(Bytes::from_static(b"expected"))
    );

    // Matching operand clears the key.
    let mut tr = db.transaction();
    tr.atomic_op(MutationKind::CompareAndClear, b"cac", b"expected")
        .unwrap();
    tr.commit().await.unwrap();
    let mut tr = db.transaction();
    assert_eq!(tr.get(b"cac").await.unwrap(), None);
}

#[tokio::test]
async fn append_if_fits_and_byte_extremes() {
    let cluster = common::start_cluster().await;
    let db = cluster.database();

    let mut tr = db.transaction();
    tr.set(b"log", b"ab").unwrap();
    tr.atomic_op(MutationKind::AppendIfFits, b"log", b"cd").unwrap();
    tr.atomic_op(MutationKind::ByteMax, b"peak", b"mmm").unwrap();
    tr.atomic_op(MutationKind::ByteMax, b"peak", b"azz").unwrap();
    tr.commit().await.unwrap();

    let mut tr = db.transaction();
    assert_eq!(tr.get(b"log").await.unwrap(), Some(Bytes::from_static(b"abcd")));
    assert_eq!(tr.get(b"peak").await.unwrap(), Some(Bytes::from_static(b"mmm")));
}
