//! Interpretation of metadata mutations.
//!
//! Metadata mutations target the interpreted part of the system key space.
//! Applying one updates the txn-state store and the proxy's derived maps
//! (key→storage info, backup ranges, cache ranges, server-tag cache) and,
//! for server-tag changes, forwards a privatized copy to the affected tag so
//! the storage side learns about it in version order. `initial_commit` is the
//! seeding mode: the store already holds the data, so only the derived maps
//! are rebuilt and nothing is logged.

use bytes::Bytes;
use sable_core::keys::{
    self, decode_key_servers_value, decode_log_ranges_value, decode_server_tag_key,
    decode_server_tag_value, CACHE_RANGES_PREFIX, KEY_SERVERS_PREFIX, LOG_RANGES_PREFIX,
    SERVER_TAG_PREFIX,
};
use sable_core::messages::LogPushBuffer;
use sable_core::mutation::{Mutation, MutationKind};
use sable_core::types::{KeyRange, INVALID_TAG};

use crate::commit_data::{CommitState, ServerCacheInfo};

/// Prefix a system key into its privatized (storage-visible) form.
fn privatized(key: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(2 + key.len());
    out.extend_from_slice(b"\xff\xff");
    out.extend_from_slice(key);
    Bytes::from(out)
}

/// Apply the metadata mutations of one committed transaction.
pub fn apply_metadata_mutations(
    state: &mut CommitState,
    mutations: &[Mutation],
    mut to_commit: Option<&mut LogPushBuffer>,
    initial_commit: bool,
) {
    for mutation in mutations {
        if !mutation.is_metadata_mutation() {
            continue;
        }
        match mutation.kind {
            MutationKind::SetValue => {
                apply_set(state, mutation, to_commit.as_deref_mut(), initial_commit)
            }
            MutationKind::ClearRange => {
                apply_clear(state, mutation, to_commit.as_deref_mut(), initial_commit)
            }
            _ => {}
        }
    }
}

fn apply_set(
    state: &mut CommitState,
    mutation: &Mutation,
    to_commit: Option<&mut LogPushBuffer>,
    initial_commit: bool,
) {
    let key = &mutation.param1;
    let value = &mutation.param2;

    if key.starts_with(KEY_SERVERS_PREFIX) {
        let shard_begin = key.slice(KEY_SERVERS_PREFIX.len()..);
        if shard_begin.as_ref() < keys::ALL_KEYS_END {
            match decode_key_servers_value(value) {
                Ok((src, dest)) => {
                    let mut info = ServerCacheInfo {
                        tags: Vec::new(),
                        src,
                        dest,
                    };
                    for server in info.src.iter().chain(info.dest.iter()) {
                        match state.storage_tag(*server) {
                            Ok(tag) => {
                                debug_assert!(tag != INVALID_TAG);
                                info.tags.push(tag);
                            }
                            Err(err) => {
                                tracing::warn!(server, error = ?err, "keyServers references unknown storage server");
                            }
                        }
                    }
                    info.tags.sort();
                    info.tags.dedup();
                    // Writing keyServers/<k> starts a shard at k reaching to
                    // the end of the range that currently contains k.
                    let (containing, _) = state.key_info.range_containing(&shard_begin);
                    let insert_range = KeyRange::new(shard_begin, containing.end);
                    state.key_info.insert(&insert_range, info);
                }
                Err(err) => {
                    tracing::warn!(error = ?err, "undecodable keyServers value");
                }
            }
        }
    } else if key.starts_with(SERVER_TAG_PREFIX) {
        match (decode_server_tag_key(key), decode_server_tag_value(value)) {
            (Ok(server), Ok(tag)) => {
                let changed = state.storage_cache.get(&server) != Some(&tag);
                state.storage_cache.insert(server, tag);
                if changed {
                    // Cached tag vectors may now be stale everywhere; they are
                    // repopulated lazily.
                    state.invalidate_cached_tags();
                    if let Some(buffer) = to_commit {
                        buffer.add_tag(tag);
                        buffer.add_typed_message(&Mutation::set(
                            privatized(key),
                            value.clone(),
                        ));
                    }
                }
            }
            (server, tag) => {
                tracing::warn!(key = %keys::printable(key), ok_key = server.is_ok(), ok_value = tag.is_ok(), "undecodable serverTag entry");
            }
        }
    } else if key.starts_with(LOG_RANGES_PREFIX) {
        if !initial_commit {
            state.txn_state_store.set(key.clone(), value.clone());
        }
        rebuild_backup_ranges(state);
        // The store write happens below for every other branch; this one has
        // already done it, so return early.
        return;
    } else if key.starts_with(CACHE_RANGES_PREFIX) {
        if !initial_commit {
            state.txn_state_store.set(key.clone(), value.clone());
        }
        rebuild_cache_ranges(state);
        return;
    }

    if !initial_commit {
        state.txn_state_store.set(key.clone(), value.clone());
    }
}

fn apply_clear(
    state: &mut CommitState,
    mutation: &Mutation,
    mut to_commit: Option<&mut LogPushBuffer>,
    initial_commit: bool,
) {
    let range = KeyRange::new(mutation.param1.clone(), mutation.param2.clone());
    if range.is_empty() {
        return;
    }

    if range.intersects(&keys::prefix_range(KEY_SERVERS_PREFIX)) {
        // Shard boundaries are only ever rewritten, never cleared.
        tracing::warn!(range = %range, "ignoring clear of keyServers boundaries");
    }

    if range.intersects(&keys::prefix_range(SERVER_TAG_PREFIX)) {
        let affected = state
            .txn_state_store
            .read_range(&range.intersection(&keys::prefix_range(SERVER_TAG_PREFIX)), usize::MAX);
        let mut cleared_any = false;
        for (key, value) in affected {
            if let (Ok(server), Ok(tag)) =
                (decode_server_tag_key(&key), decode_server_tag_value(&value))
            {
                state.storage_cache.remove(&server);
                cleared_any = true;
                if let Some(buffer) = to_commit.as_deref_mut() {
                    // The departing tag is told its registration is gone.
                    buffer.add_tag(tag);
                    buffer.add_typed_message(&Mutation::clear_range(
                        privatized(&key),
                        privatized(&keys::key_after(&key)),
                    ));
                }
            }
        }
        if cleared_any {
            state.invalidate_cached_tags();
        }
    }

    if !initial_commit {
        state.txn_state_store.clear_range(&range);
    }

    if range.intersects(&keys::prefix_range(LOG_RANGES_PREFIX)) {
        rebuild_backup_ranges(state);
    }
    if range.intersects(&keys::prefix_range(CACHE_RANGES_PREFIX)) {
        rebuild_cache_ranges(state);
    }
}

/// Rebuild the backup-range map from the txn-state store.
fn rebuild_backup_ranges(state: &mut CommitState) {
    let mut map = sable_core::rangemap::RangeMap::new(keys::all_keys(), std::collections::BTreeSet::new());
    let entries = state
        .txn_state_store
        .read_range(&keys::prefix_range(LOG_RANGES_PREFIX), usize::MAX);
    for (key, value) in entries {
        let begin = key.slice(LOG_RANGES_PREFIX.len()..);
        match decode_log_ranges_value(&value) {
            Ok((end, dest)) => {
                let range = KeyRange::new(begin, end);
                if range.is_empty() {
                    continue;
                }
                for dests in map.modify(&range) {
                    dests.insert(dest.clone());
                }
            }
            Err(err) => {
                tracing::warn!(error = ?err, "undecodable logRanges value");
            }
        }
    }
    state.backup_ranges = map;
}

/// Rebuild the cached-range map from the txn-state store.
fn rebuild_cache_ranges(state: &mut CommitState) {
    let mut map = sable_core::rangemap::RangeMap::new(keys::all_keys(), false);
    let entries = state
        .txn_state_store
        .read_range(&keys::prefix_range(CACHE_RANGES_PREFIX), usize::MAX);
    for (key, value) in entries {
        let begin = key.slice(CACHE_RANGES_PREFIX.len()..);
        let range = KeyRange::new(begin, Bytes::copy_from_slice(&value));
        if range.is_empty() {
            continue;
        }
        map.insert(&range, true);
    }
    state.cache_info = map;
}

/// Rebuild every derived map from a freshly seeded txn-state store, and load
/// the lock/metadata-version snapshot.
pub fn load_initial_state(state: &mut CommitState) {
    let entries = state.txn_state_store.read_range(&keys::system_keys(), usize::MAX);
    for (key, value) in entries {
        let mutation = Mutation::set(key, value);
        apply_metadata_mutations(state, &[mutation], None, true);
    }
    state.locked = state
        .txn_state_store
        .read_value(keys::DATABASE_LOCKED_KEY)
        .map(|v| !v.is_empty())
        .unwrap_or(false);
    state.metadata_version = state.txn_state_store.read_value(keys::METADATA_VERSION_KEY);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitProxyConfig;
    use sable_core::keys::{
        encode_key_servers_value, encode_log_ranges_value, encode_server_tag_value,
        key_servers_key_for, log_ranges_key_for, server_tag_key_for,
    };
    use sable_core::types::Tag;

    fn seeded_state() -> CommitState {
        let mut state = CommitState::new(&CommitProxyConfig::default());
        // Two storage servers with tags, one shard boundary at "m".
        state.txn_state_store.seed(
            server_tag_key_for(1),
            encode_server_tag_value(Tag::new(0, 1)),
        );
        state.txn_state_store.seed(
            server_tag_key_for(2),
            encode_server_tag_value(Tag::new(0, 2)),
        );
        state
    }

    #[test]
    fn key_servers_set_splits_the_containing_shard() {
        let mut state = seeded_state();
        apply_metadata_mutations(
            &mut state,
            &[Mutation::set(
                key_servers_key_for(b""),
                encode_key_servers_value(&[1], &[]),
            )],
            None,
            false,
        );
        apply_metadata_mutations(
            &mut state,
            &[Mutation::set(
                key_servers_key_for(b"m"),
                encode_key_servers_value(&[2], &[1]),
            )],
            None,
            false,
        );
        assert_eq!(state.tags_for_key(b"a"), vec![Tag::new(0, 1)]);
        let mut upper = state.tags_for_key(b"z");
        upper.sort();
        assert_eq!(upper, vec![Tag::new(0, 1), Tag::new(0, 2)]);
        let (range, info) = state.key_info.range_containing(b"z");
        assert_eq!(range.begin.as_ref(), b"m");
        assert_eq!(info.src, vec![2]);
        assert_eq!(info.dest, vec![1]);
    }

    #[test]
    fn server_tag_change_invalidates_cached_tags_and_privatizes() {
        let mut state = seeded_state();
        apply_metadata_mutations(
            &mut state,
            &[Mutation::set(
                key_servers_key_for(b""),
                encode_key_servers_value(&[1], &[]),
            )],
            None,
            false,
        );
        assert_eq!(state.tags_for_key(b"a"), vec![Tag::new(0, 1)]);

        let mut buffer = LogPushBuffer::new();
        apply_metadata_mutations(
            &mut state,
            &[Mutation::set(
                server_tag_key_for(1),
                encode_server_tag_value(Tag::new(0, 9)),
            )],
            Some(&mut buffer),
            false,
        );
        // The privatized copy rides to the new tag.
        let messages = buffer.into_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].tags, vec![Tag::new(0, 9)]);
        // Cached vectors were emptied and repopulate with the new tag.
        assert_eq!(state.tags_for_key(b"a"), vec![Tag::new(0, 9)]);
    }

    #[test]
    fn backup_ranges_rebuild_from_the_store() {
        let mut state = seeded_state();
        apply_metadata_mutations(
            &mut state,
            &[Mutation::set(
                log_ranges_key_for(b"a"),
                encode_log_ranges_value(b"m", b"\xff\x02/blog/dest1/"),
            )],
            None,
            false,
        );
        assert!(!state.backup_ranges.get(b"b").is_empty());
        assert!(state.backup_ranges.get(b"z").is_empty());

        apply_metadata_mutations(
            &mut state,
            &[Mutation::clear_range(
                keys::prefix_range(LOG_RANGES_PREFIX).begin,
                keys::prefix_range(LOG_RANGES_PREFIX).end,
            )],
            None,
            false,
        );
        assert!(state.backup_ranges.get(b"b").is_empty());
    }

    #[test]
    fn load_initial_state_reads_lock_and_metadata_version() {
        let mut state = seeded_state();
        state
            .txn_state_store
            .seed(Bytes::from_static(keys::DATABASE_LOCKED_KEY), Bytes::from_static(b"uid"));
        state.txn_state_store.seed(
            key_servers_key_for(b""),
            encode_key_servers_value(&[2], &[]),
        );
        load_initial_state(&mut state);
        assert!(state.locked);
        assert_eq!(state.tags_for_key(b"q"), vec![Tag::new(0, 2)]);
    }
}
