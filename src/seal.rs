//! Incremental recomputation of the journal MAC chain.
//!
//! A [`MacChecker`] owns one monotonic cursor, `sealed_until`.  Each call to
//! [`MacChecker::compute_mac`] folds every object between the cursor and the
//! target offset into a fresh HMAC keyed for the requested epoch, then moves
//! the cursor to the target.  Calls must therefore be issued in file order;
//! [`MacChecker::rewind`] is the only way back.
//!
//! # Fold masking
//! The 16-byte object prefix is always hashed.  After it:
//!
//! | type            | hashed body bytes                         |
//! |-----------------|-------------------------------------------|
//! | DATA (1)        | `[0, 8)` then `[48, end)`                 |
//! | FIELD (2)       | `[0, 8)` then `[24, end)`                 |
//! | ENTRY (3)       | everything                                |
//! | hash tables, ENTRY_ARRAY (4, 5, 6) | nothing                |
//! | TAG (7)         | `[0, 16)` (seqnum, epoch; never the MAC)  |
//!
//! The first fold of a file (`sealed_until == 0`) additionally covers the
//! immutable header ranges `[0,16) [24,56) [72,96) [104,136)` and starts at
//! `header_size`.

use hmac::Mac;
use num_bigint::BigUint;
use num_traits::One;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, trace};

use crate::fsprng::{FsKey, HmacSha256, KeyError, MAC_LEN};
use crate::header::{FormatError, JournalHeader};
use crate::object::{
    TagObject, OBJECT_DATA, OBJECT_DATA_HASH_TABLE, OBJECT_ENTRY, OBJECT_ENTRY_ARRAY, OBJECT_FIELD,
    OBJECT_FIELD_HASH_TABLE, OBJECT_TAG,
};
use crate::view::{align_up, ByteView, Region};

const HEADER_SEALED_RANGES: [(u64, u64); 4] = [(0, 16), (24, 32), (72, 24), (104, 32)];

#[derive(Error, Debug)]
pub enum SealError {
    #[error("seal mismatch for range ending at {offset} (epoch {epoch}): stored {stored}, computed {computed}")]
    SealMismatch { offset: u64, epoch: u64, stored: String, computed: String },
    #[error("tag at offset {offset} has seqnum {found}, expected {expected}")]
    SequenceGap { offset: u64, expected: u64, found: u64 },
    #[error("epoch {epoch} covers [{window_start}, {window_end}) but sealed entries span [{min_realtime}, {max_realtime}]")]
    EpochWindowViolation {
        epoch:        u64,
        window_start: u64,
        window_end:   u64,
        min_realtime: u64,
        max_realtime: u64,
    },
    #[error("tag at offset {offset} seals epoch {epoch} after epoch {previous}")]
    EpochOutOfOrder { offset: u64, previous: u64, epoch: u64 },
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// How a checker treats epochs its key cannot evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SealPolicy {
    /// Every tag is recomputed and compared.
    Strict,
    /// Tags of epochs below the key's minimum epoch are folded with a
    /// placeholder state and not compared.  Only the attack's scan uses it.
    Reconnaissance,
}

pub struct MacChecker {
    key:          FsKey,
    file:         ByteView,
    header_size:  u64,
    sealed_until: u64,
    next_seqnum:  u64,
    policy:       SealPolicy,
}

impl MacChecker {
    /// Strict checker over the whole file described by `file`.
    pub fn new(key: FsKey, header: &JournalHeader, file: ByteView) -> Self {
        Self::with_policy(key, header, file, SealPolicy::Strict)
    }

    pub(crate) fn reconnaissance(key: FsKey, header: &JournalHeader, file: ByteView) -> Self {
        Self::with_policy(key, header, file, SealPolicy::Reconnaissance)
    }

    fn with_policy(key: FsKey, header: &JournalHeader, file: ByteView, policy: SealPolicy) -> Self {
        Self {
            key,
            file,
            header_size: header.header_size,
            sealed_until: 0,
            next_seqnum: 1,
            policy,
        }
    }

    /// Follow a region that has grown since the checker was created.
    pub(crate) fn refresh(&mut self, region: &Region) {
        self.file = region.view();
    }

    pub fn key(&self) -> &FsKey {
        &self.key
    }

    /// Exclusive end of the bytes covered by the last computed MAC.
    pub fn sealed_until(&self) -> u64 {
        self.sealed_until
    }

    /// Move the cursor back to `offset` (0 restarts with the header ranges).
    pub fn rewind(&mut self, offset: u64) {
        debug!(from = self.sealed_until, to = offset, "rewinding seal cursor");
        self.sealed_until = offset;
    }

    /// Seqnum the next verified tag must carry.
    pub fn next_seqnum(&self) -> u64 {
        self.next_seqnum
    }

    // ── MAC computation ──────────────────────────────────────────────────────

    /// Fold `[sealed_until, target)` under `epoch`'s key derived from `state`.
    pub fn compute_mac(
        &mut self,
        region: &Region,
        target: u64,
        epoch: u64,
        state: &BigUint,
    ) -> Result<[u8; MAC_LEN], SealError> {
        debug!(from = self.sealed_until, to = target, epoch, "folding seal range");
        let mut mac = self.key.seal_hasher(state, epoch)?;

        let mut p = if self.sealed_until == 0 {
            for (start, len) in HEADER_SEALED_RANGES {
                mac.update(self.bytes(region, start, len)?);
            }
            self.header_size
        } else {
            self.sealed_until
        };
        while p < target {
            p = self.fold_object(region, &mut mac, p)?;
        }
        self.sealed_until = target;

        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(out)
    }

    /// [`compute_mac`](Self::compute_mac) with the state this checker's key
    /// (and policy) yields for `epoch`.
    pub fn mac_for(&mut self, region: &Region, target: u64, epoch: u64) -> Result<[u8; MAC_LEN], SealError> {
        let state = self.state_for(epoch)?;
        self.compute_mac(region, target, epoch, &state)
    }

    /// Recompute the MAC up to `target` and compare it with `expected` in
    /// constant time.
    pub fn check(&mut self, region: &Region, target: u64, epoch: u64, expected: &[u8; MAC_LEN]) -> Result<(), SealError> {
        let computed = self.mac_for(region, target, epoch)?;
        if self.is_placeholder(epoch) {
            trace!(epoch, "epoch below key minimum, seal not compared");
            return Ok(());
        }
        if bool::from(computed[..].ct_eq(&expected[..])) {
            Ok(())
        } else {
            Err(SealError::SealMismatch {
                offset:   target,
                epoch,
                stored:   hex::encode(expected),
                computed: hex::encode(computed),
            })
        }
    }

    /// Advance the tag sequence, then check the tag's MAC.
    pub fn verify_tag(&mut self, region: &Region, tag: &TagObject) -> Result<(), SealError> {
        if tag.seqnum != self.next_seqnum {
            return Err(SealError::SequenceGap {
                offset:   tag.offset,
                expected: self.next_seqnum,
                found:    tag.seqnum,
            });
        }
        self.next_seqnum += 1;
        debug!(offset = tag.offset, seqnum = tag.seqnum, epoch = tag.epoch, "verifying tag");
        self.check(region, tag.mac_range_end(), tag.epoch, &tag.mac)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn is_placeholder(&self, epoch: u64) -> bool {
        self.policy == SealPolicy::Reconnaissance && epoch < self.key.min_epoch()
    }

    fn state_for(&self, epoch: u64) -> Result<BigUint, SealError> {
        if self.is_placeholder(epoch) {
            return Ok(BigUint::one());
        }
        Ok(self.key.state(epoch)?)
    }

    fn bytes<'r>(&self, region: &'r Region, index: u64, len: u64) -> Result<&'r [u8], FormatError> {
        self.file.get_bytes(region, index, len).map_err(FormatError::truncated(index))
    }

    /// Fold the object at `p` and return the offset of the next one.
    fn fold_object(&self, region: &Region, mac: &mut HmacSha256, p: u64) -> Result<u64, SealError> {
        let prefix = self.bytes(region, p, 16)?;
        let kind = prefix[0];
        let mut size_le = [0u8; 8];
        size_le.copy_from_slice(&prefix[8..16]);
        let size = u64::from_le_bytes(size_le);
        if size < 16 {
            return Err(FormatError::ObjectTooSmall { offset: p, kind, size }.into());
        }
        mac.update(prefix);

        let body = p + 16;
        let body_len = size - 16;
        let too_small = FormatError::ObjectTooSmall { offset: p, kind, size };
        match kind {
            OBJECT_DATA => {
                if body_len < 48 {
                    return Err(too_small.into());
                }
                mac.update(self.bytes(region, body, 8)?);
                mac.update(self.bytes(region, body + 48, body_len - 48)?);
            }
            OBJECT_FIELD => {
                if body_len < 24 {
                    return Err(too_small.into());
                }
                mac.update(self.bytes(region, body, 8)?);
                mac.update(self.bytes(region, body + 24, body_len - 24)?);
            }
            OBJECT_ENTRY => mac.update(self.bytes(region, body, body_len)?),
            OBJECT_DATA_HASH_TABLE | OBJECT_FIELD_HASH_TABLE | OBJECT_ENTRY_ARRAY => {}
            OBJECT_TAG => {
                if body_len < 16 {
                    return Err(too_small.into());
                }
                mac.update(self.bytes(region, body, 16)?);
            }
            other => return Err(FormatError::UnknownObjectType { offset: p, kind: other }.into()),
        }
        Ok(align_up(p + size, 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{JournalWriter, WriterOptions};
    use crate::object::{JournalScan, ObjectRecord};

    fn sealed_file() -> (FsKey, Region, Vec<TagObject>) {
        let key = FsKey::from_seed_bytes([3; 12], 1_000_000, 1_000_000);
        let mut w = JournalWriter::new(key.clone(), WriterOptions::default()).unwrap();
        w.append(1_100_000, &[b"MESSAGE=first line of epoch zero".as_slice()]).unwrap();
        w.append(1_200_000, &[b"MESSAGE=second line of epoch zero".as_slice()]).unwrap();
        w.append(2_100_000, &[b"MESSAGE=line in epoch one".as_slice()]).unwrap();
        w.seal().unwrap();
        let region = w.into_region().unwrap();

        let mut scan = JournalScan::open(&region).unwrap();
        let mut tags = Vec::new();
        while let Some(rec) = scan.next(&region, None).unwrap() {
            if let ObjectRecord::Tag(t) = rec {
                tags.push(t);
            }
        }
        (key, region, tags)
    }

    #[test]
    fn all_tags_of_a_written_file_verify() {
        let (key, region, tags) = sealed_file();
        assert!(tags.len() >= 3);
        let header = JournalHeader::read(&region.view(), &region).unwrap();
        let mut checker = MacChecker::new(key, &header, region.view());
        for t in &tags {
            checker.verify_tag(&region, t).unwrap();
            assert_eq!(checker.sealed_until(), t.mac_range_end());
        }
    }

    #[test]
    fn check_is_deterministic_after_rewind() {
        let (key, region, tags) = sealed_file();
        let header = JournalHeader::read(&region.view(), &region).unwrap();
        let mut checker = MacChecker::new(key, &header, region.view());
        checker.verify_tag(&region, &tags[0]).unwrap();
        let checkpoint = checker.sealed_until();
        let t = &tags[1];

        let first = checker.check(&region, t.mac_range_end(), t.epoch, &t.mac).is_ok();
        checker.rewind(checkpoint);
        let second = checker.check(&region, t.mac_range_end(), t.epoch, &t.mac).is_ok();
        assert!(first && second);

        let wrong = [0u8; MAC_LEN];
        checker.rewind(checkpoint);
        let a = checker.check(&region, t.mac_range_end(), t.epoch, &wrong).is_ok();
        checker.rewind(checkpoint);
        let b = checker.check(&region, t.mac_range_end(), t.epoch, &wrong).is_ok();
        assert!(!a && !b);
    }

    #[test]
    fn sequence_gap_is_reported() {
        let (key, region, tags) = sealed_file();
        let header = JournalHeader::read(&region.view(), &region).unwrap();
        let mut checker = MacChecker::new(key, &header, region.view());
        assert!(matches!(
            checker.verify_tag(&region, &tags[1]),
            Err(SealError::SequenceGap { expected: 1, found: 2, .. })
        ));
    }

    #[test]
    fn flipped_payload_byte_breaks_the_seal() {
        let (key, mut region, tags) = sealed_file();
        let needle = b"second line";
        let at = region
            .as_bytes()
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap() as u64;
        region.view().put_bytes(&mut region, at, b"S").unwrap();

        let header = JournalHeader::read(&region.view(), &region).unwrap();
        let mut checker = MacChecker::new(key, &header, region.view());
        let mut failed = false;
        for t in &tags {
            if let Err(e) = checker.verify_tag(&region, t) {
                assert!(matches!(e, SealError::SealMismatch { .. }));
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn reconnaissance_skips_epochs_below_the_key() {
        let (key, region, tags) = sealed_file();
        let header = JournalHeader::read(&region.view(), &region).unwrap();
        let late = key.checkpoint_at(1).unwrap();

        let mut strict = MacChecker::new(late.clone(), &header, region.view());
        assert!(matches!(
            strict.verify_tag(&region, &tags[0]),
            Err(SealError::Key(KeyError::EpochRegression { .. }))
        ));

        let mut recon = MacChecker::reconnaissance(late, &header, region.view());
        for t in &tags {
            recon.verify_tag(&region, t).unwrap();
        }
    }
}
