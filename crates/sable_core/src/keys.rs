//! Key utilities and the `\xff` system-key schema.
//!
//! The transaction subsystem keeps its shared metadata in the system key
//! space. Keys below `\xff\x02` are interpreted by the metadata machinery;
//! `[\xff\x02, \xff\x03)` holds data (backup logs and the like) that is
//! system-owned but not metadata. Encode/decode helpers for the structured
//! values live here next to their key constants.

use anyhow::ensure;
use bytes::Bytes;

use crate::types::{KeyRange, Tag};

/// Exclusive upper bound of the normal (client) key space.
pub const NORMAL_KEYS_END: &[u8] = b"\xff";
/// Exclusive upper bound of the entire key space.
pub const ALL_KEYS_END: &[u8] = b"\xff\xff";

/// The client-writable key space.
pub fn normal_keys() -> KeyRange {
    KeyRange::new(&b""[..], NORMAL_KEYS_END)
}

/// The system key space `[\xff, \xff\xff)`.
pub fn system_keys() -> KeyRange {
    KeyRange::new(NORMAL_KEYS_END, ALL_KEYS_END)
}

/// Everything, normal and system.
pub fn all_keys() -> KeyRange {
    KeyRange::new(&b""[..], ALL_KEYS_END)
}

/// System keys that are *not* interpreted as metadata mutations.
pub fn non_metadata_system_keys() -> KeyRange {
    KeyRange::new(&b"\xff\x02"[..], &b"\xff\x03"[..])
}

pub const DATABASE_LOCKED_KEY: &[u8] = b"\xff/dbLocked";
pub const METADATA_VERSION_KEY: &[u8] = b"\xff/metadataVersion";
pub const MUST_CONTAIN_SYSTEM_MUTATIONS_KEY: &[u8] = b"\xff/mustContainSystemMutations";
pub const COORDINATORS_KEY: &[u8] = b"\xff/coordinators";
pub const KEY_SERVERS_PREFIX: &[u8] = b"\xff/keyServers/";
pub const SERVER_TAG_PREFIX: &[u8] = b"\xff/serverTag/";
pub const SERVER_TAG_HISTORY_PREFIX: &[u8] = b"\xff/serverTagHistory/";
pub const TAG_LOCALITY_LIST_PREFIX: &[u8] = b"\xff/tagLocalityList/";
pub const SERVER_LIST_PREFIX: &[u8] = b"\xff/serverList/";
pub const LOG_RANGES_PREFIX: &[u8] = b"\xff/logRanges/";
pub const CACHE_RANGES_PREFIX: &[u8] = b"\xff/cacheRanges/";
pub const CONFIG_KEYS_PREFIX: &[u8] = b"\xff/conf/";
pub const LOG_ANTI_QUORUM_KEY: &[u8] = b"\xff/conf/log_anti_quorum";

/// Range covered by the database-lock key (used as a read-conflict range).
pub fn database_locked_range() -> KeyRange {
    KeyRange::single_key(DATABASE_LOCKED_KEY)
}

/// Range spanned by a system-key prefix.
pub fn prefix_range(prefix: &[u8]) -> KeyRange {
    let mut end = prefix.to_vec();
    while end.last() == Some(&0xff) {
        end.pop();
    }
    if let Some(last) = end.last_mut() {
        *last += 1;
    }
    KeyRange::new(Bytes::copy_from_slice(prefix), Bytes::from(end))
}

/// The smallest key strictly greater than `key`: `key ‖ \x00`.
pub fn key_after(key: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.extend_from_slice(key);
    out.push(0x00);
    Bytes::from(out)
}

/// The smallest key that is greater than every key with prefix `key`.
///
/// Strips trailing `\xff` bytes and increments the last remaining byte, so
/// `strinc("a") == "b"` and `strinc("ab\xff") == "ac"`.
pub fn strinc(key: &[u8]) -> anyhow::Result<Bytes> {
    let mut end = key.len();
    while end > 0 && key[end - 1] == 0xff {
        end -= 1;
    }
    ensure!(end > 0, "strinc on an empty or all-0xff key");
    let mut out = key[..end].to_vec();
    *out.last_mut().expect("non-empty after trim") += 1;
    Ok(Bytes::from(out))
}

/// Printable rendering of a key for diagnostics (hex-escapes non-ASCII).
pub fn printable(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key {
        if (0x20..0x7f).contains(&b) && b != b'\\' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out
}

pub fn server_tag_key_for(server: u64) -> Bytes {
    let mut out = Vec::with_capacity(SERVER_TAG_PREFIX.len() + 8);
    out.extend_from_slice(SERVER_TAG_PREFIX);
    out.extend_from_slice(&server.to_be_bytes());
    Bytes::from(out)
}

pub fn decode_server_tag_key(key: &[u8]) -> anyhow::Result<u64> {
    ensure!(
        key.starts_with(SERVER_TAG_PREFIX) && key.len() == SERVER_TAG_PREFIX.len() + 8,
        "malformed serverTag key"
    );
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[SERVER_TAG_PREFIX.len()..]);
    Ok(u64::from_be_bytes(buf))
}

pub fn encode_server_tag_value(tag: Tag) -> Bytes {
    let mut out = Vec::with_capacity(3);
    out.push(tag.locality as u8);
    out.extend_from_slice(&tag.id.to_be_bytes());
    Bytes::from(out)
}

pub fn decode_server_tag_value(value: &[u8]) -> anyhow::Result<Tag> {
    ensure!(value.len() == 3, "malformed serverTag value");
    let mut id = [0u8; 2];
    id.copy_from_slice(&value[1..3]);
    Ok(Tag::new(value[0] as i8, u16::from_be_bytes(id)))
}

pub fn key_servers_key_for(begin: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(KEY_SERVERS_PREFIX.len() + begin.len());
    out.extend_from_slice(KEY_SERVERS_PREFIX);
    out.extend_from_slice(begin);
    Bytes::from(out)
}

/// Encode the src/dest storage-server lists of a shard.
pub fn encode_key_servers_value(src: &[u64], dest: &[u64]) -> Bytes {
    let mut out = Vec::with_capacity(8 + (src.len() + dest.len()) * 8);
    out.extend_from_slice(&(src.len() as u32).to_be_bytes());
    for id in src {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out.extend_from_slice(&(dest.len() as u32).to_be_bytes());
    for id in dest {
        out.extend_from_slice(&id.to_be_bytes());
    }
    Bytes::from(out)
}

pub fn decode_key_servers_value(value: &[u8]) -> anyhow::Result<(Vec<u64>, Vec<u64>)> {
    let mut offset = 0usize;
    let src_len = read_u32(value, &mut offset)? as usize;
    let mut src = Vec::with_capacity(src_len);
    for _ in 0..src_len {
        src.push(read_u64(value, &mut offset)?);
    }
    let dest_len = read_u32(value, &mut offset)? as usize;
    let mut dest = Vec::with_capacity(dest_len);
    for _ in 0..dest_len {
        dest.push(read_u64(value, &mut offset)?);
    }
    Ok((src, dest))
}

pub fn log_ranges_key_for(begin: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(LOG_RANGES_PREFIX.len() + begin.len());
    out.extend_from_slice(LOG_RANGES_PREFIX);
    out.extend_from_slice(begin);
    Bytes::from(out)
}

/// Encode the (end key, backup destination prefix) of a configured backup range.
pub fn encode_log_ranges_value(end: &[u8], dest: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(8 + end.len() + dest.len());
    out.extend_from_slice(&(end.len() as u32).to_be_bytes());
    out.extend_from_slice(end);
    out.extend_from_slice(&(dest.len() as u32).to_be_bytes());
    out.extend_from_slice(dest);
    Bytes::from(out)
}

pub fn decode_log_ranges_value(value: &[u8]) -> anyhow::Result<(Bytes, Bytes)> {
    let mut offset = 0usize;
    let end_len = read_u32(value, &mut offset)? as usize;
    ensure!(offset + end_len <= value.len(), "short logRanges end key");
    let end = Bytes::copy_from_slice(&value[offset..offset + end_len]);
    offset += end_len;
    let dest_len = read_u32(value, &mut offset)? as usize;
    ensure!(offset + dest_len <= value.len(), "short logRanges destination");
    let dest = Bytes::copy_from_slice(&value[offset..offset + dest_len]);
    Ok((end, dest))
}

pub fn cache_ranges_key_for(begin: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(CACHE_RANGES_PREFIX.len() + begin.len());
    out.extend_from_slice(CACHE_RANGES_PREFIX);
    out.extend_from_slice(begin);
    Bytes::from(out)
}

/// Read a big-endian u32 from `data` at `offset`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

/// Read a big-endian u64 from `data` at `offset`.
pub fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strinc_increments_last_usable_byte() {
        assert_eq!(strinc(b"a").unwrap(), Bytes::from_static(b"b"));
        assert_eq!(strinc(b"y").unwrap(), Bytes::from_static(b"z"));
        assert_eq!(strinc(b"fdb").unwrap(), Bytes::from_static(b"fdc"));
        assert_eq!(strinc(b"ab\xff").unwrap(), Bytes::from_static(b"ac"));
        assert_eq!(strinc(b"!").unwrap(), Bytes::from_static(b"\""));
    }

    #[test]
    fn strinc_rejects_unincrementable_keys() {
        assert!(strinc(b"").is_err());
        assert!(strinc(b"\xff").is_err());
        assert!(strinc(b"\xff\xff").is_err());
    }

    #[test]
    fn key_after_is_the_immediate_successor() {
        assert_eq!(key_after(b"a"), Bytes::from_static(b"a\x00"));
        assert!(key_after(b"a") > Bytes::from_static(b"a"));
        assert!(key_after(b"a") < Bytes::from_static(b"a\x01"));
    }

    #[test]
    fn server_tag_value_round_trips() {
        let tag = Tag::new(0, 42);
        assert_eq!(decode_server_tag_value(&encode_server_tag_value(tag)).unwrap(), tag);
        let remote = Tag::new(crate::types::TAG_LOCALITY_REMOTE_LOG, 7);
        assert_eq!(
            decode_server_tag_value(&encode_server_tag_value(remote)).unwrap(),
            remote
        );
    }

    #[test]
    fn key_servers_value_round_trips() {
        let value = encode_key_servers_value(&[1, 2, 3], &[9]);
        let (src, dest) = decode_key_servers_value(&value).unwrap();
        assert_eq!(src, vec![1, 2, 3]);
        assert_eq!(dest, vec![9]);
    }

    #[test]
    fn metadata_space_excludes_backup_data() {
        assert!(non_metadata_system_keys().contains(b"\xff\x02/blog/x"));
        assert!(!non_metadata_system_keys().contains(DATABASE_LOCKED_KEY));
    }
}
