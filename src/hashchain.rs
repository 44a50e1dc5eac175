//! Chained hash tables over data and field objects.
//!
//! Each table is an array of 16-byte buckets `{head, tail}` holding object
//! start offsets; each object carries the offset of its successor.  A table
//! is consistent when every chain runs from `head` to `tail`, every member
//! reduces to its own bucket, and the chains together hold every object of
//! the table's kind exactly once.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::header::JournalHeader;
use crate::object::{DataObject, FieldObject};
use crate::view::{ByteView, Region, ViewError};

pub const BUCKET_SIZE: u64 = 16;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("bucket {bucket} chain references offset {offset}, which is not a known object")]
    DanglingReference { bucket: u64, offset: u64 },
    #[error("object at offset {offset} sits in bucket {bucket} but its hash reduces to {reduced}")]
    BucketMismatch { offset: u64, bucket: u64, reduced: u64 },
    #[error("bucket {bucket} chain ends at {last}, tail says {tail}")]
    BrokenTail { bucket: u64, tail: u64, last: u64 },
    #[error("hash chains hold {visited} objects, the file has {expected}")]
    CountMismatch { expected: u64, visited: u64 },
    #[error("bucket {bucket} chain does not terminate")]
    CyclicChain { bucket: u64 },
    #[error("hash table out of bounds: {0}")]
    Table(#[from] ViewError),
}

/// Reduce a stored 64-bit hash to a bucket index.
///
/// The hash is treated as signed: a negative value has its sign bit cleared
/// before the modulo and `2·(2⁶² mod m)` is added back, which is exactly
/// `hash mod m` over the unsigned value.
pub fn reduce_hash(hash: u64, buckets: u64) -> u64 {
    let signed = hash as i64;
    if signed >= 0 {
        return hash % buckets;
    }
    let low = ((signed & i64::MAX) as u64 % buckets) as u128;
    let correction = ((1u64 << 62) % buckets) as u128;
    ((low + 2 * correction) % buckets as u128) as u64
}

pub trait HashedObject {
    fn offset(&self) -> u64;
    fn hash(&self) -> u64;
    fn next_hash_offset(&self) -> u64;

    fn reduced_hash(&self, buckets: u64) -> u64 {
        reduce_hash(self.hash(), buckets)
    }
}

impl HashedObject for DataObject {
    fn offset(&self) -> u64 {
        self.offset
    }
    fn hash(&self) -> u64 {
        self.hash
    }
    fn next_hash_offset(&self) -> u64 {
        self.next_hash_offset
    }
}

impl HashedObject for FieldObject {
    fn offset(&self) -> u64 {
        self.offset
    }
    fn hash(&self) -> u64 {
        self.hash
    }
    fn next_hash_offset(&self) -> u64 {
        self.next_hash_offset
    }
}

// ── Table access ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct HashTable {
    view:    ByteView,
    buckets: u64,
}

impl HashTable {
    pub fn new(view: ByteView) -> Self {
        Self { buckets: view.len() / BUCKET_SIZE, view }
    }

    /// The data-object table named by the header.
    pub fn data(header: &JournalHeader, region: &Region) -> Result<Self, IndexError> {
        let view = region.view().slice(header.data_hash_table_offset, header.data_hash_table_size)?;
        Ok(Self::new(view))
    }

    /// The field-object table named by the header.
    pub fn field(header: &JournalHeader, region: &Region) -> Result<Self, IndexError> {
        let view = region.view().slice(header.field_hash_table_offset, header.field_hash_table_size)?;
        Ok(Self::new(view))
    }

    pub fn buckets(&self) -> u64 {
        self.buckets
    }

    /// `(head, tail)` of bucket `index`.
    pub fn bucket(&self, region: &Region, index: u64) -> Result<(u64, u64), ViewError> {
        let at = index * BUCKET_SIZE;
        Ok((self.view.get_u64(region, at)?, self.view.get_u64(region, at + 8)?))
    }

    pub fn set_bucket(&self, region: &mut Region, index: u64, head: u64, tail: u64) -> Result<(), ViewError> {
        let at = index * BUCKET_SIZE;
        self.view.put_u64(region, at, head)?;
        self.view.put_u64(region, at + 8, tail)
    }

    /// Walk every chain against `records`; returns the number of objects visited.
    pub fn verify<T: HashedObject>(&self, region: &Region, records: &BTreeMap<u64, T>) -> Result<u64, IndexError> {
        let limit = records.len() as u64;
        let mut visited = 0u64;
        for bucket in 0..self.buckets {
            let (head, tail) = self.bucket(region, bucket)?;
            let mut p = head;
            let mut last = 0;
            let mut steps = 0u64;
            while p != 0 {
                steps += 1;
                if steps > limit {
                    return Err(IndexError::CyclicChain { bucket });
                }
                let record = records.get(&p).ok_or(IndexError::DanglingReference { bucket, offset: p })?;
                let reduced = record.reduced_hash(self.buckets);
                if reduced != bucket {
                    return Err(IndexError::BucketMismatch { offset: p, bucket, reduced });
                }
                visited += 1;
                last = p;
                p = record.next_hash_offset();
            }
            if last != tail {
                return Err(IndexError::BrokenTail { bucket, tail, last });
            }
        }
        if visited != limit {
            return Err(IndexError::CountMismatch { expected: limit, visited });
        }
        Ok(visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsprng::FsKey;
    use crate::object::{JournalScan, ObjectIndex, OBJECT_PREFIX_SIZE};
    use crate::writer::{JournalWriter, WriterOptions};
    use proptest::prelude::*;

    fn crowded_journal() -> Region {
        let key = FsKey::from_seed_bytes([9; 12], 0, 1_000_000);
        let options = WriterOptions { data_buckets: 3, field_buckets: 2, ..Default::default() };
        let mut w = JournalWriter::new(key, options).unwrap();
        for i in 0..12u64 {
            let msg = format!("MESSAGE=message number {i}");
            let unit = format!("UNIT=unit-{}", i % 4);
            w.append(100 + i, &[msg.as_bytes(), unit.as_bytes()]).unwrap();
        }
        w.into_region().unwrap()
    }

    fn index_of(region: &Region) -> (JournalHeader, ObjectIndex) {
        let mut scan = JournalScan::open(region).unwrap();
        while scan.next(region, None).unwrap().is_some() {}
        (scan.header().clone(), scan.into_index())
    }

    #[test]
    fn reduce_matches_known_values() {
        assert_eq!(reduce_hash(17, 5), 2);
        assert_eq!(reduce_hash(u64::MAX, 10), u64::MAX % 10);
        assert_eq!(reduce_hash(1 << 63, 3), (1u64 << 63) % 3);
    }

    #[test]
    fn well_formed_tables_verify() {
        let region = crowded_journal();
        let (header, index) = index_of(&region);
        let data = HashTable::data(&header, &region).unwrap();
        assert_eq!(data.buckets(), 3);
        assert_eq!(data.verify(&region, index.data_objects()).unwrap(), header.n_data);
        assert_eq!(header.n_data, 16);
        let fields = HashTable::field(&header, &region).unwrap();
        assert_eq!(fields.verify(&region, index.field_objects()).unwrap(), 2);
    }

    #[test]
    fn corrupted_link_is_detected() {
        let mut region = crowded_journal();
        let (header, index) = index_of(&region);
        let victim = index.data_objects().values().next().unwrap().offset;
        // next_hash_offset is the second word of the body; point it into the header.
        region.view().put_u64(&mut region, victim + OBJECT_PREFIX_SIZE + 8, 8).unwrap();

        let (_, index) = index_of(&region);
        let data = HashTable::data(&header, &region).unwrap();
        let err = data.verify(&region, index.data_objects()).unwrap_err();
        assert!(
            matches!(err, IndexError::DanglingReference { offset: 8, .. } | IndexError::BucketMismatch { .. }),
            "{err}"
        );
    }

    #[test]
    fn unlinked_object_is_a_count_mismatch_or_broken_tail() {
        let mut region = crowded_journal();
        let (header, index) = index_of(&region);
        let data = HashTable::data(&header, &region).unwrap();
        let (bucket, (head, _)) = (0..data.buckets())
            .map(|b| (b, data.bucket(&region, b).unwrap()))
            .find(|(_, (h, _))| *h != 0)
            .unwrap();
        let next = index.data(head).unwrap().next_hash_offset;
        let tail = if next == 0 { 0 } else { data.bucket(&region, bucket).unwrap().1 };
        data.set_bucket(&mut region, bucket, next, tail).unwrap();

        let err = data.verify(&region, index.data_objects()).unwrap_err();
        assert!(matches!(err, IndexError::CountMismatch { .. }), "{err}");
    }

    #[test]
    fn self_loop_terminates() {
        let mut region = crowded_journal();
        let (header, index) = index_of(&region);
        let data = HashTable::data(&header, &region).unwrap();
        let head = (0..data.buckets()).map(|b| data.bucket(&region, b).unwrap().0).find(|&h| h != 0).unwrap();
        region.view().put_u64(&mut region, head + OBJECT_PREFIX_SIZE + 8, head).unwrap();

        let (_, index_after) = index_of(&region);
        assert_eq!(index_after.data_objects().len(), index.data_objects().len());
        let err = data.verify(&region, index_after.data_objects()).unwrap_err();
        assert!(matches!(err, IndexError::CyclicChain { .. }), "{err}");
    }

    proptest! {
        #[test]
        fn reduction_is_unsigned_modulo(hash: u64, buckets in 1u64..u64::MAX) {
            prop_assert_eq!(reduce_hash(hash, buckets), hash % buckets);
        }

        #[test]
        fn reduction_small_tables(hash: u64, buckets in 1u64..4096) {
            prop_assert!(reduce_hash(hash, buckets) < buckets);
        }
    }
}
