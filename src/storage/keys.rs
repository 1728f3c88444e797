// ============================================================================
// Ordered Key Encodings
// ============================================================================
//
// Keys are encoded so that byte order equals logical order:
//
//   i64      sign bit flipped, big endian   (negative < zero < positive)
//   u32/u64  big endian
//   String   u32 big endian length, then UTF-8 bytes
//   DbNil    zero bytes (for set-like families)
//   (A, B)   concatenation, so a prefix of the tuple is a scan prefix
//
// Composite index keys such as (deadline, job_key) therefore iterate in
// deadline order and ties are broken by job key.
//
// ============================================================================

use super::column_family::ColumnFamily;
use crate::core::{EngineError, Result};
use std::marker::PhantomData;

/// A reference from one stored key into another column family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub column_family: ColumnFamily,
    pub key: Vec<u8>,
}

pub trait DbKey: Sized {
    fn write_to(&self, buf: &mut Vec<u8>);

    /// Decodes one key from the front of `bytes`, returning it and the bytes consumed.
    fn read_from(bytes: &[u8]) -> Result<(Self, usize)>;

    /// Foreign keys embedded in this key.
    fn collect_foreign_keys(&self, _out: &mut Vec<ForeignKeyRef>) {}

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (key, used) = Self::read_from(bytes)?;
        if used != bytes.len() {
            return Err(EngineError::Corruption(format!(
                "Key has {} trailing bytes",
                bytes.len() - used
            )));
        }
        Ok(key)
    }

    fn foreign_keys(&self) -> Vec<ForeignKeyRef> {
        let mut out = Vec::new();
        self.collect_foreign_keys(&mut out);
        out
    }
}

fn take<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    if bytes.len() < N {
        return Err(EngineError::Corruption(format!(
            "Key needs {} bytes but only {} remain",
            N,
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    Ok(out)
}

impl DbKey for i64 {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&((*self as u64) ^ (1 << 63)).to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Result<(Self, usize)> {
        let raw = u64::from_be_bytes(take::<8>(bytes)?);
        Ok(((raw ^ (1 << 63)) as i64, 8))
    }
}

impl DbKey for u64 {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Result<(Self, usize)> {
        Ok((u64::from_be_bytes(take::<8>(bytes)?), 8))
    }
}

impl DbKey for u32 {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Result<(Self, usize)> {
        Ok((u32::from_be_bytes(take::<4>(bytes)?), 4))
    }
}

impl DbKey for String {
    fn write_to(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).write_to(buf);
        buf.extend_from_slice(self.as_bytes());
    }

    fn read_from(bytes: &[u8]) -> Result<(Self, usize)> {
        let (len, used) = u32::read_from(bytes)?;
        let end = used + len as usize;
        if bytes.len() < end {
            return Err(EngineError::Corruption(format!(
                "String key of {} bytes is truncated",
                len
            )));
        }
        let value = String::from_utf8(bytes[used..end].to_vec())
            .map_err(|e| EngineError::Corruption(format!("String key is not UTF-8: {}", e)))?;
        Ok((value, end))
    }
}

/// Empty key or value, for families that only record presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct DbNil;

impl DbKey for DbNil {
    fn write_to(&self, _buf: &mut Vec<u8>) {}

    fn read_from(_bytes: &[u8]) -> Result<(Self, usize)> {
        Ok((DbNil, 0))
    }
}

impl<A: DbKey, B: DbKey> DbKey for (A, B) {
    fn write_to(&self, buf: &mut Vec<u8>) {
        self.0.write_to(buf);
        self.1.write_to(buf);
    }

    fn read_from(bytes: &[u8]) -> Result<(Self, usize)> {
        let (a, used_a) = A::read_from(bytes)?;
        let (b, used_b) = B::read_from(&bytes[used_a..])?;
        Ok(((a, b), used_a + used_b))
    }

    fn collect_foreign_keys(&self, out: &mut Vec<ForeignKeyRef>) {
        self.0.collect_foreign_keys(out);
        self.1.collect_foreign_keys(out);
    }
}

impl<A: DbKey, B: DbKey, C: DbKey> DbKey for (A, B, C) {
    fn write_to(&self, buf: &mut Vec<u8>) {
        self.0.write_to(buf);
        self.1.write_to(buf);
        self.2.write_to(buf);
    }

    fn read_from(bytes: &[u8]) -> Result<(Self, usize)> {
        let (a, used_a) = A::read_from(bytes)?;
        let (b, used_b) = B::read_from(&bytes[used_a..])?;
        let (c, used_c) = C::read_from(&bytes[used_a + used_b..])?;
        Ok(((a, b, c), used_a + used_b + used_c))
    }

    fn collect_foreign_keys(&self, out: &mut Vec<ForeignKeyRef>) {
        self.0.collect_foreign_keys(out);
        self.1.collect_foreign_keys(out);
        self.2.collect_foreign_keys(out);
    }
}

/// Names the column family a key must exist in.
pub trait ForeignTarget {
    const COLUMN_FAMILY: ColumnFamily;
}

/// Target marker for keys of the jobs family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobsFamily;

impl ForeignTarget for JobsFamily {
    const COLUMN_FAMILY: ColumnFamily = ColumnFamily::Jobs;
}

/// Target marker for keys of the messages family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagesFamily;

impl ForeignTarget for MessagesFamily {
    const COLUMN_FAMILY: ColumnFamily = ColumnFamily::Messages;
}

/// A key component that must exist as a key in `T::COLUMN_FAMILY`.
/// Encodes exactly like the wrapped key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbForeignKey<K, T> {
    inner: K,
    _target: PhantomData<T>,
}

impl<K, T> DbForeignKey<K, T> {
    pub fn new(inner: K) -> Self {
        Self {
            inner,
            _target: PhantomData,
        }
    }

    pub fn inner(&self) -> &K {
        &self.inner
    }

    pub fn into_inner(self) -> K {
        self.inner
    }
}

impl<K: DbKey, T: ForeignTarget> DbKey for DbForeignKey<K, T> {
    fn write_to(&self, buf: &mut Vec<u8>) {
        self.inner.write_to(buf);
    }

    fn read_from(bytes: &[u8]) -> Result<(Self, usize)> {
        let (inner, used) = K::read_from(bytes)?;
        Ok((Self::new(inner), used))
    }

    fn collect_foreign_keys(&self, out: &mut Vec<ForeignKeyRef>) {
        out.push(ForeignKeyRef {
            column_family: T::COLUMN_FAMILY,
            key: self.inner.to_bytes(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_byte_order_matches_numeric_order() {
        let values = [i64::MIN, -5, -1, 0, 1, 100, 256, i64::MAX];
        let encoded: Vec<Vec<u8>> = values.iter().map(|v| v.to_bytes()).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        for (value, bytes) in values.iter().zip(&encoded) {
            assert_eq!(i64::from_bytes(bytes).unwrap(), *value);
        }
    }

    #[test]
    fn test_composite_key_orders_by_first_component() {
        let a = (100i64, 9i64).to_bytes();
        let b = (100i64, 10i64).to_bytes();
        let c = (256i64, 1i64).to_bytes();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_string_tuple_decodes() {
        let key = ("payment".to_string(), 42i64);
        let decoded = <(String, i64)>::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_truncated_key_is_corruption() {
        assert!(matches!(i64::from_bytes(&[1, 2, 3]), Err(EngineError::Corruption(_))));
        assert!(matches!(
            String::from_bytes(&[0, 0, 0, 9, b'a']),
            Err(EngineError::Corruption(_))
        ));
        assert!(matches!(u32::from_bytes(&[0, 0, 0, 1, 0]), Err(EngineError::Corruption(_))));
    }

    #[test]
    fn test_foreign_keys_are_collected() {
        let key: (i64, DbForeignKey<i64, JobsFamily>) = (5, DbForeignKey::new(7));
        let refs = key.foreign_keys();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].column_family, ColumnFamily::Jobs);
        assert_eq!(refs[0].key, 7i64.to_bytes());
    }
}
