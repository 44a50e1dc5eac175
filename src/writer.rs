//! Sealing journal writer.
//!
//! Builds files the way the logging daemon does: data and field objects are
//! deduplicated through the hash tables, entries reference their data
//! objects by offset (items sorted by offset), and every entry is linked
//! into the global entry-array chain and into the chain of each data object
//! it references.  A tag is appended at creation, whenever an entry crosses
//! into a later epoch, and on [`JournalWriter::seal`].

use std::path::Path;

use tracing::{debug, info};
use uuid::Uuid;

use crate::codec::Compression;
use crate::error::Result;
use crate::fsprng::FsKey;
use crate::hashchain::{reduce_hash, HashTable, IndexError};
use crate::header::{
    FormatError, JournalHeader, COMPATIBLE_SEALED, HEADER_SIZE_MAX, INCOMPATIBLE_KEYED_HASH,
    OFF_ENTRY_ARRAY, OFF_STATE, SIGNATURE,
};
use crate::object::{
    content_hash, read_object, ObjectRecord, DATA_FIXED_SIZE, ENTRY_ITEM_SIZE, OBJECT_DATA,
    OBJECT_DATA_HASH_TABLE, OBJECT_ENTRY, OBJECT_ENTRY_ARRAY, OBJECT_FIELD, OBJECT_FIELD_HASH_TABLE,
    OBJECT_PREFIX_SIZE, OBJECT_TAG, TAG_BODY_SIZE,
};
use crate::seal::MacChecker;
use crate::view::{Region, ViewError};

/// Bucket counts the daemon uses for a fresh file.
pub const DEFAULT_DATA_BUCKETS:  u64 = 2047;
pub const DEFAULT_FIELD_BUCKETS: u64 = 333;
/// Payloads at least this long are offered to the compressor.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 512;

const FILE_STATE_OFFLINE: u8 = 0;
const FILE_STATE_ONLINE:  u8 = 1;

// Body-relative word offsets.
const DATA_NEXT_HASH:   u64 = OBJECT_PREFIX_SIZE + 8;
const DATA_NEXT_FIELD:  u64 = OBJECT_PREFIX_SIZE + 16;
const DATA_ENTRY:       u64 = OBJECT_PREFIX_SIZE + 24;
const DATA_ENTRY_ARRAY: u64 = OBJECT_PREFIX_SIZE + 32;
const DATA_N_ENTRIES:   u64 = OBJECT_PREFIX_SIZE + 40;
const FIELD_NEXT_HASH:  u64 = OBJECT_PREFIX_SIZE + 8;
const FIELD_HEAD_DATA:  u64 = OBJECT_PREFIX_SIZE + 16;
const ARRAY_NEXT:       u64 = OBJECT_PREFIX_SIZE;
const ARRAY_ITEMS:      u64 = OBJECT_PREFIX_SIZE + 8;

// ── WriterOptions ────────────────────────────────────────────────────────────

/// Configuration for [`JournalWriter::new`].
#[derive(Debug, Clone)]
pub struct WriterOptions {
    pub data_buckets:       u64,
    pub field_buckets:      u64,
    pub file_id:            Uuid,
    pub machine_id:         Uuid,
    pub boot_id:            Uuid,
    pub seqnum_id:          Uuid,
    /// Compression offered to payloads of `compress_threshold` bytes or more.
    /// A payload is stored compressed only if that makes it smaller.
    pub compression:        Compression,
    pub compress_threshold: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            data_buckets:       DEFAULT_DATA_BUCKETS,
            field_buckets:      DEFAULT_FIELD_BUCKETS,
            file_id:            Uuid::new_v4(),
            machine_id:         Uuid::new_v4(),
            boot_id:            Uuid::new_v4(),
            seqnum_id:          Uuid::new_v4(),
            compression:        Compression::None,
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        }
    }
}

// ── JournalWriter ────────────────────────────────────────────────────────────

pub struct JournalWriter {
    region:          Region,
    header:          JournalHeader,
    checker:         MacChecker,
    options:         WriterOptions,
    hash_key:        (u64, u64),
    data_table:      HashTable,
    field_table:     HashTable,
    /// Epoch of the entries appended since the last tag.
    current_epoch:   u64,
    /// Objects were appended since the last tag.
    dirty:           bool,
    first_monotonic: Option<u64>,
}

impl JournalWriter {
    /// Lay out the header and both hash tables and append the first tag.
    pub fn new(key: FsKey, options: WriterOptions) -> Result<Self> {
        let data_buckets = options.data_buckets.max(1);
        let field_buckets = options.field_buckets.max(1);
        let header_size = HEADER_SIZE_MAX;

        let data_table_offset = header_size + OBJECT_PREFIX_SIZE;
        let data_table_size = data_buckets * 16;
        let field_table_offset = data_table_offset + data_table_size + OBJECT_PREFIX_SIZE;
        let field_table_size = field_buckets * 16;

        let mut header = JournalHeader {
            signature:               SIGNATURE,
            compatible_flags:        COMPATIBLE_SEALED,
            incompatible_flags:      INCOMPATIBLE_KEYED_HASH | options.compression.incompatible_flag(),
            state:                   FILE_STATE_ONLINE,
            file_id:                 options.file_id,
            machine_id:              options.machine_id,
            tail_entry_boot_id:      Uuid::nil(),
            seqnum_id:               options.seqnum_id,
            header_size,
            arena_size:              0,
            data_hash_table_offset:  data_table_offset,
            data_hash_table_size:    data_table_size,
            field_hash_table_offset: field_table_offset,
            field_hash_table_size:   field_table_size,
            tail_object_offset:      0,
            n_objects:               0,
            n_entries:               0,
            tail_entry_seqnum:       0,
            head_entry_seqnum:       0,
            entry_array_offset:      0,
            head_entry_realtime:     0,
            tail_entry_realtime:     0,
            tail_entry_monotonic:    0,
            n_data:                  0,
            n_fields:                0,
            n_tags:                  0,
            n_entry_arrays:          0,
            data_hash_chain_depth:   0,
            field_hash_chain_depth:  0,
            tail_entry_array_offset: 0,
            tail_entry_array_n_entries: 0,
            tail_entry_offset:       0,
        };

        let mut region = Region::from_bytes(vec![0u8; header_size as usize]);
        for (kind, size) in [(OBJECT_DATA_HASH_TABLE, data_table_size), (OBJECT_FIELD_HASH_TABLE, field_table_size)] {
            header.tail_object_offset = region.append(&object_prefix(kind, 0, size));
            region.append(&vec![0u8; size as usize]);
            header.n_objects += 1;
        }
        header.arena_size = region.len() - header_size;
        header.write(&mut region)?;

        let data_table = HashTable::data(&header, &region)?;
        let field_table = HashTable::field(&header, &region)?;
        let checker = MacChecker::new(key.clone(), &header, region.view());
        let current_epoch = key.min_epoch();
        let hash_key = header.hash_key();

        let mut w = Self {
            region,
            header,
            checker,
            options,
            hash_key,
            data_table,
            field_table,
            current_epoch,
            dirty: true,
            first_monotonic: None,
        };
        w.append_tag(current_epoch)?;
        info!(file_id = %w.header.file_id, epoch = current_epoch, "created sealed journal");
        Ok(w)
    }

    pub fn header(&self) -> &JournalHeader {
        &self.header
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn key(&self) -> &FsKey {
        self.checker.key()
    }

    /// Epoch the next tag will seal.
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    /// Mark the file offline and hand over its bytes.
    pub fn into_region(mut self) -> Result<Region> {
        self.header.state = FILE_STATE_OFFLINE;
        let v = self.region.view();
        v.put_bytes(&mut self.region, OFF_STATE, &[FILE_STATE_OFFLINE])?;
        Ok(self.region)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        self.region.save(path)
    }

    // ── Appending ────────────────────────────────────────────────────────────

    /// Append one entry made of `fields` (`NAME=value` byte strings) at
    /// wall-clock `realtime` microseconds.  Returns the entry's offset.
    pub fn append(&mut self, realtime: u64, fields: &[&[u8]]) -> Result<u64> {
        if self.header.n_entries > 0 && realtime < self.header.tail_entry_realtime {
            return Err(FormatError::NonMonotonicRealtime {
                offset:   self.region.len(),
                previous: self.header.tail_entry_realtime,
                realtime,
            }
            .into());
        }
        let epoch = self.checker.key().epoch_at(realtime);
        if epoch > self.current_epoch {
            if self.dirty {
                self.append_tag(self.current_epoch)?;
            }
            self.current_epoch = epoch;
        }

        let mut items: Vec<(u64, u64)> = Vec::with_capacity(fields.len());
        for field in fields {
            items.push(self.append_data(field)?);
        }
        items.sort_unstable();
        items.dedup_by_key(|(offset, _)| *offset);

        let seqnum = self.header.tail_entry_seqnum + 1;
        let monotonic = realtime - *self.first_monotonic.get_or_insert(realtime);
        let xor_hash = items.iter().fold(0u64, |acc, (_, h)| acc ^ h);

        let mut body = Vec::with_capacity(48 + items.len() * ENTRY_ITEM_SIZE as usize);
        body.extend_from_slice(&seqnum.to_le_bytes());
        body.extend_from_slice(&realtime.to_le_bytes());
        body.extend_from_slice(&monotonic.to_le_bytes());
        body.extend_from_slice(self.options.boot_id.as_bytes());
        body.extend_from_slice(&xor_hash.to_le_bytes());
        for (offset, hash) in &items {
            body.extend_from_slice(&offset.to_le_bytes());
            body.extend_from_slice(&hash.to_le_bytes());
        }
        let entry = self.append_object(OBJECT_ENTRY, 0, &body)?;

        let (array, slot) = self.link_into_array(OFF_ENTRY_ARRAY, self.header.n_entries, entry)?;
        self.header.entry_array_offset = self.get(OFF_ENTRY_ARRAY)?;
        self.header.tail_entry_array_offset = u32::try_from(array).unwrap_or(0);
        self.header.tail_entry_array_n_entries = u32::try_from(slot + 1).unwrap_or(u32::MAX);
        for (data, _) in &items {
            self.link_data_to_entry(*data, entry)?;
        }

        if self.header.n_entries == 0 {
            self.header.head_entry_seqnum = seqnum;
            self.header.head_entry_realtime = realtime;
        }
        self.header.n_entries += 1;
        self.header.tail_entry_seqnum = seqnum;
        self.header.tail_entry_realtime = realtime;
        self.header.tail_entry_monotonic = monotonic;
        self.header.tail_entry_boot_id = self.options.boot_id;
        self.header.tail_entry_offset = entry;
        self.header.write_counters(&mut self.region)?;
        debug!(offset = entry, seqnum, realtime, epoch, "appended entry");
        Ok(entry)
    }

    /// Seal everything appended so far under the current epoch.  Returns
    /// the tag offset.
    pub fn seal(&mut self) -> Result<u64> {
        self.append_tag(self.current_epoch)
    }

    /// Move the sealing clock to `epoch`, sealing pending objects under the
    /// previous one first.
    pub fn advance_to_epoch(&mut self, epoch: u64) -> Result<()> {
        if epoch > self.current_epoch {
            if self.dirty {
                self.append_tag(self.current_epoch)?;
            }
            self.current_epoch = epoch;
        }
        Ok(())
    }

    // ── Object plumbing ──────────────────────────────────────────────────────

    fn get(&self, at: u64) -> std::result::Result<u64, ViewError> {
        self.region.view().get_u64(&self.region, at)
    }

    fn put(&mut self, at: u64, value: u64) -> std::result::Result<(), ViewError> {
        let v = self.region.view();
        v.put_u64(&mut self.region, at, value)
    }

    fn append_object(&mut self, kind: u8, flags: u8, body: &[u8]) -> Result<u64> {
        self.region.pad_to(8);
        let offset = self.region.append(&object_prefix(kind, flags, body.len() as u64));
        self.region.append(body);
        self.region.pad_to(8);

        self.header.n_objects += 1;
        self.header.tail_object_offset = offset;
        self.header.arena_size = self.region.len() - self.header.header_size;
        self.header.write_counters(&mut self.region)?;
        self.dirty = true;
        Ok(offset)
    }

    fn append_tag(&mut self, epoch: u64) -> Result<u64> {
        let seqnum = self.header.n_tags + 1;
        let mut body = [0u8; TAG_BODY_SIZE as usize];
        body[..8].copy_from_slice(&seqnum.to_le_bytes());
        body[8..16].copy_from_slice(&epoch.to_le_bytes());
        let offset = self.append_object(OBJECT_TAG, 0, &body)?;
        self.header.n_tags += 1;
        self.header.write_counters(&mut self.region)?;

        self.checker.refresh(&self.region);
        let end = offset + OBJECT_PREFIX_SIZE + TAG_BODY_SIZE;
        let mac = self.checker.mac_for(&self.region, end, epoch)?;
        let v = self.region.view();
        v.put_bytes(&mut self.region, offset + OBJECT_PREFIX_SIZE + 16, &mac)?;
        self.dirty = false;
        debug!(offset, seqnum, epoch, mac = %hex::encode(mac), "appended tag");
        Ok(offset)
    }

    /// Offset and hash of the data object holding `payload`, appending it
    /// (and its field) if it does not exist yet.
    fn append_data(&mut self, payload: &[u8]) -> Result<(u64, u64)> {
        let hash = content_hash(self.hash_key, payload);
        let bucket = reduce_hash(hash, self.data_table.buckets());
        let (head, tail) = self.data_table.bucket(&self.region, bucket)?;

        let mut p = head;
        let mut depth = 0;
        while p != 0 {
            depth += 1;
            let d = match self.decode_at(p, bucket)? {
                ObjectRecord::Data(d) => d,
                _ => return Err(IndexError::DanglingReference { bucket, offset: p }.into()),
            };
            if d.hash == hash && d.payload_text()?.as_ref() == payload {
                return Ok((p, hash));
            }
            p = d.next_hash_offset;
        }

        let (flags, stored) = self.maybe_compress(payload)?;
        let mut body = vec![0u8; DATA_FIXED_SIZE as usize];
        body[..8].copy_from_slice(&hash.to_le_bytes());
        body.extend_from_slice(&stored);
        let offset = self.append_object(OBJECT_DATA, flags, &body)?;

        if tail == 0 {
            self.data_table.set_bucket(&mut self.region, bucket, offset, offset)?;
        } else {
            self.put(tail + DATA_NEXT_HASH, offset)?;
            self.data_table.set_bucket(&mut self.region, bucket, head, offset)?;
        }
        self.header.n_data += 1;
        self.header.data_hash_chain_depth = self.header.data_hash_chain_depth.max(depth + 1);

        let name_len = payload.iter().position(|&b| b == b'=').unwrap_or(payload.len());
        let field = self.append_field(&payload[..name_len])?;
        let previous_head = self.get(field + FIELD_HEAD_DATA)?;
        self.put(offset + DATA_NEXT_FIELD, previous_head)?;
        self.put(field + FIELD_HEAD_DATA, offset)?;

        self.header.write_counters(&mut self.region)?;
        Ok((offset, hash))
    }

    fn append_field(&mut self, name: &[u8]) -> Result<u64> {
        let hash = content_hash(self.hash_key, name);
        let bucket = reduce_hash(hash, self.field_table.buckets());
        let (head, tail) = self.field_table.bucket(&self.region, bucket)?;

        let mut p = head;
        let mut depth = 0;
        while p != 0 {
            depth += 1;
            let f = match self.decode_at(p, bucket)? {
                ObjectRecord::Field(f) => f,
                _ => return Err(IndexError::DanglingReference { bucket, offset: p }.into()),
            };
            if f.hash == hash && f.payload == name {
                return Ok(p);
            }
            p = f.next_hash_offset;
        }

        let mut body = vec![0u8; 24];
        body[..8].copy_from_slice(&hash.to_le_bytes());
        body.extend_from_slice(name);
        let offset = self.append_object(OBJECT_FIELD, 0, &body)?;
        if tail == 0 {
            self.field_table.set_bucket(&mut self.region, bucket, offset, offset)?;
        } else {
            self.put(tail + FIELD_NEXT_HASH, offset)?;
            self.field_table.set_bucket(&mut self.region, bucket, head, offset)?;
        }
        self.header.n_fields += 1;
        self.header.field_hash_chain_depth = self.header.field_hash_chain_depth.max(depth + 1);
        Ok(offset)
    }

    fn maybe_compress(&self, payload: &[u8]) -> Result<(u8, Vec<u8>)> {
        let c = self.options.compression;
        if c == Compression::None || payload.len() < self.options.compress_threshold {
            return Ok((0, payload.to_vec()));
        }
        let packed = c.compress(payload)?;
        if packed.len() >= payload.len() {
            return Ok((0, payload.to_vec()));
        }
        Ok((c.object_flag(), packed))
    }

    /// The first entry of a data object is stored inline; later ones go to
    /// its entry-array chain.
    fn link_data_to_entry(&mut self, data: u64, entry: u64) -> Result<()> {
        let n = self.get(data + DATA_N_ENTRIES)?;
        if n == 0 {
            self.put(data + DATA_ENTRY, entry)?;
        } else {
            self.link_into_array(data + DATA_ENTRY_ARRAY, n - 1, entry)?;
        }
        self.put(data + DATA_N_ENTRIES, n + 1)?;
        Ok(())
    }

    /// Store `entry` as item number `n_linked` of the array chain whose first
    /// offset lives at `first_at`, growing the chain (doubling capacity) when
    /// full.  Returns the array used and the slot within it.
    fn link_into_array(&mut self, first_at: u64, n_linked: u64, entry: u64) -> Result<(u64, u64)> {
        let mut a = self.get(first_at)?;
        let mut i = n_linked;
        let mut last = 0;
        let mut last_capacity = 0;
        while a != 0 {
            let size = self.get(a + 8)?;
            let capacity = (size - OBJECT_PREFIX_SIZE - 8) / 8;
            if i < capacity {
                self.put(a + ARRAY_ITEMS + 8 * i, entry)?;
                return Ok((a, i));
            }
            i -= capacity;
            last = a;
            last_capacity = capacity;
            a = self.get(a + ARRAY_NEXT)?;
        }

        let capacity = (last_capacity * 2).max(4);
        let mut body = vec![0u8; 8 + 8 * capacity as usize];
        body[8..16].copy_from_slice(&entry.to_le_bytes());
        let array = self.append_object(OBJECT_ENTRY_ARRAY, 0, &body)?;
        if last == 0 {
            self.put(first_at, array)?;
        } else {
            self.put(last + ARRAY_NEXT, array)?;
        }
        self.header.n_entry_arrays += 1;
        self.header.write_counters(&mut self.region)?;
        Ok((array, 0))
    }

    fn decode_at(&self, offset: u64, bucket: u64) -> Result<ObjectRecord> {
        let mut cursor = self.region.view();
        cursor
            .set_position(offset)
            .map_err(FormatError::truncated(offset))?;
        read_object(&mut cursor, &self.region, None)?
            .ok_or_else(|| IndexError::DanglingReference { bucket, offset }.into())
    }
}

/// 16-byte object prefix for a body of `body_len` bytes.
fn object_prefix(kind: u8, flags: u8, body_len: u64) -> [u8; 16] {
    let mut prefix = [0u8; 16];
    prefix[0] = kind;
    prefix[1] = flags;
    prefix[8..].copy_from_slice(&(OBJECT_PREFIX_SIZE + body_len).to_le_bytes());
    prefix
}
