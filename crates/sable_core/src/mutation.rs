//! Mutations: the unit of write work flowing through the commit pipeline.
//!
//! A mutation is constructed from a client request, rewritten at most once by
//! versionstamp fill-in, serialized into the log push buffer, and discarded
//! with its batch. The byte semantics of the atomic sub-kinds live in
//! [`crate::atomic`].

use anyhow::ensure;
use bytes::Bytes;

use crate::error::StoreError;
use crate::keys::{self, read_u32};
use crate::types::{KeyRange, Version};

/// Kind of a mutation, including the atomic-op sub-kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MutationKind {
    SetValue = 0,
    ClearRange = 1,
    Add = 2,
    BitAnd = 3,
    BitOr = 4,
    BitXor = 5,
    Max = 6,
    Min = 7,
    ByteMax = 8,
    ByteMin = 9,
    AppendIfFits = 10,
    CompareAndClear = 11,
    SetVersionstampedKey = 12,
    SetVersionstampedValue = 13,
}

impl MutationKind {
    pub fn from_u8(value: u8) -> anyhow::Result<Self> {
        use MutationKind::*;
        Ok(match value {
            0 => SetValue,
            1 => ClearRange,
            2 => Add,
            3 => BitAnd,
            4 => BitOr,
            5 => BitXor,
            6 => Max,
            7 => Min,
            8 => ByteMax,
            9 => ByteMin,
            10 => AppendIfFits,
            11 => CompareAndClear,
            12 => SetVersionstampedKey,
            13 => SetVersionstampedValue,
            other => anyhow::bail!("unknown mutation kind {other}"),
        })
    }
}

/// A single write operation. `param1` is the key (or range begin); `param2` is
/// the value (or range end for clear-range).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub param1: Bytes,
    pub param2: Bytes,
}

impl Mutation {
    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            kind: MutationKind::SetValue,
            param1: key.into(),
            param2: value.into(),
        }
    }

    pub fn clear_range(begin: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            kind: MutationKind::ClearRange,
            param1: begin.into(),
            param2: end.into(),
        }
    }

    pub fn atomic(kind: MutationKind, key: impl Into<Bytes>, operand: impl Into<Bytes>) -> Self {
        Self {
            kind,
            param1: key.into(),
            param2: operand.into(),
        }
    }

    /// Serialized-size accounting used for batching and memory admission.
    pub fn expected_size(&self) -> usize {
        self.param1.len() + self.param2.len()
    }

    /// Everything except clear-range addresses exactly one key.
    pub fn is_single_key(&self) -> bool {
        self.kind != MutationKind::ClearRange
    }

    pub fn is_atomic_op(&self) -> bool {
        !matches!(self.kind, MutationKind::SetValue | MutationKind::ClearRange)
    }

    /// Key range this mutation writes (single key or the cleared range).
    pub fn write_range(&self) -> KeyRange {
        match self.kind {
            MutationKind::ClearRange => KeyRange::new(self.param1.clone(), self.param2.clone()),
            _ => KeyRange::single_key(self.param1.clone()),
        }
    }

    /// True if this mutation must be interpreted by the metadata machinery.
    ///
    /// Conservative first-byte test: a set whose key opens the system space
    /// (and is not in the non-metadata carve-out), or a clear whose range ends
    /// in the system space without being contained in the carve-out.
    pub fn is_metadata_mutation(&self) -> bool {
        let non_meta = keys::non_metadata_system_keys();
        match self.kind {
            MutationKind::SetValue => {
                !self.param1.is_empty()
                    && self.param1[0] == 0xff
                    && !self.param1.starts_with(&non_meta.begin)
            }
            MutationKind::ClearRange => {
                !self.param2.is_empty()
                    && self.param2[0] == 0xff
                    && !non_meta
                        .contains_range(&KeyRange::new(self.param1.clone(), self.param2.clone()))
            }
            _ => false,
        }
    }

    /// Compact binary encoding used for log messages.
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(1 + 4 + self.param1.len() + 4 + self.param2.len());
        out.push(self.kind as u8);
        out.extend_from_slice(&(self.param1.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.param1);
        out.extend_from_slice(&(self.param2.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.param2);
        Bytes::from(out)
    }

    /// Decode the encoding produced by [`Mutation::encode`].
    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        ensure!(!data.is_empty(), "empty mutation");
        let kind = MutationKind::from_u8(data[0])?;
        let mut offset = 1usize;
        let p1_len = read_u32(data, &mut offset)? as usize;
        ensure!(offset + p1_len <= data.len(), "short mutation param1");
        let param1 = Bytes::copy_from_slice(&data[offset..offset + p1_len]);
        offset += p1_len;
        let p2_len = read_u32(data, &mut offset)? as usize;
        ensure!(offset + p2_len <= data.len(), "short mutation param2");
        let param2 = Bytes::copy_from_slice(&data[offset..offset + p2_len]);
        Ok(Self { kind, param1, param2 })
    }
}

/// Cost units attributed to a write of `bytes` serialized bytes; the unit
/// the rate keeper's commit-cost accounting runs in.
pub fn write_operation_cost(bytes: usize) -> u64 {
    (bytes as u64 / 16_384) + 1
}

/// Width of a versionstamp: 8-byte commit version + 2-byte in-batch index.
pub const VERSIONSTAMP_SIZE: usize = 10;

/// Build the 10-byte stamp for a transaction of a committed batch.
pub fn versionstamp(version: Version, batch_index: u16) -> [u8; VERSIONSTAMP_SIZE] {
    let mut out = [0u8; VERSIONSTAMP_SIZE];
    out[..8].copy_from_slice(&version.to_be_bytes());
    out[8..].copy_from_slice(&batch_index.to_be_bytes());
    out
}

/// Fill in a versionstamp placeholder.
///
/// The final 4 bytes of `param` carry the little-endian offset of the 10-byte
/// placeholder; they are stripped from the result. Rejects parameters whose
/// placeholder would not fit.
pub fn transform_versionstamp(
    param: &Bytes,
    version: Version,
    batch_index: u16,
) -> Result<Bytes, StoreError> {
    if param.len() < 4 {
        return Err(StoreError::ClientInvalidOperation);
    }
    let new_len = param.len() - 4;
    let mut offset_buf = [0u8; 4];
    offset_buf.copy_from_slice(&param[new_len..]);
    let offset = u32::from_le_bytes(offset_buf) as usize;
    if offset + VERSIONSTAMP_SIZE > new_len {
        return Err(StoreError::ClientInvalidOperation);
    }
    let mut out = param[..new_len].to_vec();
    out[offset..offset + VERSIONSTAMP_SIZE].copy_from_slice(&versionstamp(version, batch_index));
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped_param(body: &[u8], offset: u32) -> Bytes {
        let mut out = body.to_vec();
        out.extend_from_slice(&offset.to_le_bytes());
        Bytes::from(out)
    }

    #[test]
    fn versionstamp_transform_overwrites_placeholder() {
        // "prefix" + 10 placeholder bytes + trailing offset pointing at them.
        let mut body = b"prefix".to_vec();
        body.extend_from_slice(&[0xaa; VERSIONSTAMP_SIZE]);
        let param = stamped_param(&body, 6);
        let out = transform_versionstamp(&param, 0x0102030405060708, 3).unwrap();
        assert_eq!(&out[..6], b"prefix");
        assert_eq!(&out[6..14], &0x0102030405060708i64.to_be_bytes());
        assert_eq!(&out[14..16], &3u16.to_be_bytes());
        assert_eq!(out.len(), body.len());
    }

    #[test]
    fn versionstamp_transform_rejects_bad_offsets() {
        // Offset runs past the end of the stripped parameter.
        let param = stamped_param(&[0u8; 12], 5);
        assert_eq!(
            transform_versionstamp(&param, 1, 0),
            Err(StoreError::ClientInvalidOperation)
        );
        // Too short to even carry the offset.
        assert_eq!(
            transform_versionstamp(&Bytes::from_static(b"ab"), 1, 0),
            Err(StoreError::ClientInvalidOperation)
        );
    }

    #[test]
    fn metadata_detection_is_prefix_based() {
        assert!(Mutation::set(&b"\xff/dbLocked"[..], &b"x"[..]).is_metadata_mutation());
        assert!(!Mutation::set(&b"\xff\x02/blog/a"[..], &b"x"[..]).is_metadata_mutation());
        assert!(!Mutation::set(&b"normal"[..], &b"x"[..]).is_metadata_mutation());
        // A clear ending in the system space is metadata unless fully inside
        // the non-metadata carve-out.
        assert!(Mutation::clear_range(&b"\xff/a"[..], &b"\xff/b"[..]).is_metadata_mutation());
        assert!(
            !Mutation::clear_range(&b"\xff\x02/a"[..], &b"\xff\x02/b"[..]).is_metadata_mutation()
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        let m = Mutation::atomic(MutationKind::Add, &b"k"[..], &b"\x01"[..]);
        assert_eq!(Mutation::decode(&m.encode()).unwrap(), m);
    }
}
