//! Typed decoding of the journal object stream.
//!
//! Every object starts with a 16-byte prefix `{type:u8, flags:u8,
//! reserved[6], size:u64}`; `size` includes the prefix and the next object
//! starts at `size` rounded up to 8.  Offsets stored inside objects (entry
//! items, hash buckets, chain links) always name an object's *start*.

use std::borrow::Cow;
use std::collections::BTreeMap;

use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use uuid::Uuid;

use crate::codec::{CodecError, Compression};
use crate::error::Result;
use crate::fsprng::MAC_LEN;
use crate::header::{FormatError, JournalHeader};
use crate::seal::MacChecker;
use crate::view::{align_up, ByteView, Region, ViewError};

pub const OBJECT_UNUSED:           u8 = 0;
pub const OBJECT_DATA:             u8 = 1;
pub const OBJECT_FIELD:            u8 = 2;
pub const OBJECT_ENTRY:            u8 = 3;
pub const OBJECT_DATA_HASH_TABLE:  u8 = 4;
pub const OBJECT_FIELD_HASH_TABLE: u8 = 5;
pub const OBJECT_ENTRY_ARRAY:      u8 = 6;
pub const OBJECT_TAG:              u8 = 7;

pub const OBJECT_PREFIX_SIZE: u64 = 16;
pub const DATA_FIXED_SIZE:    u64 = 48;
pub const FIELD_FIXED_SIZE:   u64 = 24;
pub const ENTRY_FIXED_SIZE:   u64 = 48;
pub const ENTRY_ITEM_SIZE:    u64 = 16;
pub const TAG_BODY_SIZE:      u64 = 8 + 8 + MAC_LEN as u64;

// ── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DataObject {
    pub offset:             u64,
    pub flags:              u8,
    pub hash:               u64,
    pub next_hash_offset:   u64,
    pub next_field_offset:  u64,
    pub entry_offset:       u64,
    pub entry_array_offset: u64,
    pub n_entries:          u64,
    /// Stored payload; compressed when `flags` says so.
    pub payload:            Vec<u8>,
    body:                   ByteView,
}

impl DataObject {
    pub fn compression(&self) -> std::result::Result<Compression, CodecError> {
        Compression::from_object_flags(self.flags)
    }

    /// The `FIELD=value` bytes, decompressed if needed.
    pub fn payload_text(&self) -> std::result::Result<Cow<'_, [u8]>, CodecError> {
        match self.compression()? {
            Compression::None => Ok(Cow::Borrowed(&self.payload)),
            c => Ok(Cow::Owned(c.decompress(&self.payload)?)),
        }
    }

    /// Absolute offset of the first payload byte.
    pub fn payload_offset(&self) -> u64 {
        self.offset + OBJECT_PREFIX_SIZE + DATA_FIXED_SIZE
    }

    /// Absolute offset of the object body (just past the prefix).
    pub fn body_offset(&self) -> u64 {
        self.body.absolute()
    }

    /// Keyed content hash of the decoded payload.
    pub fn compute_hash(&self, key: (u64, u64)) -> std::result::Result<u64, CodecError> {
        Ok(content_hash(key, &self.payload_text()?))
    }

    /// Point this record at `region`, a copy of the file it was read from.
    pub fn rebind(&mut self, region: &Region) {
        self.body = self.body.rebind(region);
    }

    /// Store `hash` and `payload` back into the file.  The payload length
    /// is fixed by the object size.
    pub fn write_back(&self, region: &mut Region) -> std::result::Result<(), ViewError> {
        self.body.put_u64(region, 0, self.hash)?;
        self.body.put_bytes(region, DATA_FIXED_SIZE, &self.payload)
    }
}

#[derive(Debug, Clone)]
pub struct FieldObject {
    pub offset:           u64,
    pub hash:             u64,
    pub next_hash_offset: u64,
    pub head_data_offset: u64,
    pub payload:          Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryItem {
    pub object_offset: u64,
    pub hash:          u64,
}

#[derive(Debug, Clone)]
pub struct EntryObject {
    pub offset:    u64,
    pub seqnum:    u64,
    pub realtime:  u64,
    pub monotonic: u64,
    pub boot_id:   Uuid,
    pub xor_hash:  u64,
    pub items:     Vec<EntryItem>,
    body:          ByteView,
}

impl EntryObject {
    pub fn rebind(&mut self, region: &Region) {
        self.body = self.body.rebind(region);
    }

    /// Overwrite the cached hash of every item that references `data_offset`.
    /// Returns how many items were patched.
    pub fn write_item_hash(
        &mut self,
        region: &mut Region,
        data_offset: u64,
        hash: u64,
    ) -> std::result::Result<usize, ViewError> {
        let mut patched = 0;
        for (i, item) in self.items.iter_mut().enumerate() {
            if item.object_offset == data_offset {
                let at = ENTRY_FIXED_SIZE + ENTRY_ITEM_SIZE * i as u64 + 8;
                self.body.put_u64(region, at, hash)?;
                item.hash = hash;
                patched += 1;
            }
        }
        Ok(patched)
    }
}

#[derive(Debug, Clone)]
pub struct EntryArrayObject {
    pub offset:            u64,
    pub next_array_offset: u64,
    /// Slots as stored; unused trailing slots are zero.
    pub items:             Vec<u64>,
}

impl EntryArrayObject {
    pub fn entries(&self) -> impl Iterator<Item = u64> + '_ {
        self.items.iter().copied().filter(|&o| o != 0)
    }
}

#[derive(Debug, Clone)]
pub struct TagObject {
    pub offset: u64,
    pub seqnum: u64,
    pub epoch:  u64,
    pub mac:    [u8; MAC_LEN],
    body:       ByteView,
}

impl TagObject {
    /// Exclusive end of the bytes this tag attests to (just past the MAC).
    pub fn mac_range_end(&self) -> u64 {
        self.offset + OBJECT_PREFIX_SIZE + TAG_BODY_SIZE
    }

    pub fn rebind(&mut self, region: &Region) {
        self.body = self.body.rebind(region);
    }

    /// Store `epoch` and `mac` back into the file.
    pub fn write_back(&self, region: &mut Region) -> std::result::Result<(), ViewError> {
        self.body.put_u64(region, 8, self.epoch)?;
        self.body.put_bytes(region, 16, &self.mac)
    }
}

/// One decoded object.
#[derive(Debug, Clone)]
pub enum ObjectRecord {
    Data(DataObject),
    Field(FieldObject),
    Entry(EntryObject),
    EntryArray(EntryArrayObject),
    Tag(TagObject),
    /// Hash tables and types this decoder does not interpret.
    Other { offset: u64, kind: u8, flags: u8, size: u64 },
}

impl ObjectRecord {
    pub fn offset(&self) -> u64 {
        match self {
            ObjectRecord::Data(o) => o.offset,
            ObjectRecord::Field(o) => o.offset,
            ObjectRecord::Entry(o) => o.offset,
            ObjectRecord::EntryArray(o) => o.offset,
            ObjectRecord::Tag(o) => o.offset,
            ObjectRecord::Other { offset, .. } => *offset,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjectRecord::Data(_) => "data",
            ObjectRecord::Field(_) => "field",
            ObjectRecord::Entry(_) => "entry",
            ObjectRecord::EntryArray(_) => "entry array",
            ObjectRecord::Tag(_) => "tag",
            ObjectRecord::Other { kind: OBJECT_DATA_HASH_TABLE, .. } => "data hash table",
            ObjectRecord::Other { kind: OBJECT_FIELD_HASH_TABLE, .. } => "field hash table",
            ObjectRecord::Other { .. } => "unknown",
        }
    }
}

/// SipHash-2-4 of `payload` keyed by the file id halves.
pub fn content_hash(key: (u64, u64), payload: &[u8]) -> u64 {
    let mut h = SipHasher24::new_with_keys(key.0, key.1);
    h.write(payload);
    h.finish()
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Decode the object at `view`'s cursor and advance past its padding.
///
/// Returns `None` at a zero-size or zero-type sentinel.  A decoded tag is
/// verified against `checker` before it is returned.
pub fn read_object(
    view: &mut ByteView,
    region: &Region,
    checker: Option<&mut MacChecker>,
) -> Result<Option<ObjectRecord>> {
    let start = view.position();
    let offset = view.absolute() + start;
    let t = FormatError::truncated;

    let kind = view.read_u8(region).map_err(t(offset))?;
    let flags = view.read_u8(region).map_err(t(offset))?;
    view.skip(6).map_err(t(offset))?;
    let size = view.read_u64(region).map_err(t(offset))?;
    if size == 0 || kind == OBJECT_UNUSED {
        return Ok(None);
    }
    if size < OBJECT_PREFIX_SIZE {
        return Err(FormatError::ObjectTooSmall { offset, kind, size }.into());
    }
    let mut body = view.slice(start + OBJECT_PREFIX_SIZE, size - OBJECT_PREFIX_SIZE).map_err(t(offset))?;
    let next = align_up(start + size, 8).min(view.len());
    view.set_position(next).map_err(t(offset))?;

    let too_small = |min: u64| -> Result<()> {
        if size - OBJECT_PREFIX_SIZE < min {
            return Err(FormatError::ObjectTooSmall { offset, kind, size }.into());
        }
        Ok(())
    };

    let record = match kind {
        OBJECT_DATA => {
            too_small(DATA_FIXED_SIZE)?;
            let hash = body.read_u64(region).map_err(t(offset))?;
            let next_hash_offset = body.read_u64(region).map_err(t(offset))?;
            let next_field_offset = body.read_u64(region).map_err(t(offset))?;
            let entry_offset = body.read_u64(region).map_err(t(offset))?;
            let entry_array_offset = body.read_u64(region).map_err(t(offset))?;
            let n_entries = body.read_u64(region).map_err(t(offset))?;
            let payload = body.read_bytes(region, body.remaining()).map_err(t(offset))?.to_vec();
            body.set_position(0).map_err(t(offset))?;
            ObjectRecord::Data(DataObject {
                offset,
                flags,
                hash,
                next_hash_offset,
                next_field_offset,
                entry_offset,
                entry_array_offset,
                n_entries,
                payload,
                body,
            })
        }
        OBJECT_FIELD => {
            too_small(FIELD_FIXED_SIZE)?;
            let hash = body.read_u64(region).map_err(t(offset))?;
            let next_hash_offset = body.read_u64(region).map_err(t(offset))?;
            let head_data_offset = body.read_u64(region).map_err(t(offset))?;
            let payload = body.read_bytes(region, body.remaining()).map_err(t(offset))?.to_vec();
            ObjectRecord::Field(FieldObject { offset, hash, next_hash_offset, head_data_offset, payload })
        }
        OBJECT_ENTRY => {
            too_small(ENTRY_FIXED_SIZE)?;
            let seqnum = body.read_u64(region).map_err(t(offset))?;
            let realtime = body.read_u64(region).map_err(t(offset))?;
            let monotonic = body.read_u64(region).map_err(t(offset))?;
            let boot_id = body.read_uuid(region).map_err(t(offset))?;
            let xor_hash = body.read_u64(region).map_err(t(offset))?;
            let mut items = Vec::with_capacity((body.remaining() / ENTRY_ITEM_SIZE) as usize);
            while body.remaining() >= ENTRY_ITEM_SIZE {
                let object_offset = body.read_u64(region).map_err(t(offset))?;
                let hash = body.read_u64(region).map_err(t(offset))?;
                items.push(EntryItem { object_offset, hash });
            }
            body.set_position(0).map_err(t(offset))?;
            ObjectRecord::Entry(EntryObject { offset, seqnum, realtime, monotonic, boot_id, xor_hash, items, body })
        }
        OBJECT_ENTRY_ARRAY => {
            too_small(8)?;
            let next_array_offset = body.read_u64(region).map_err(t(offset))?;
            let mut items = Vec::with_capacity((body.remaining() / 8) as usize);
            while body.remaining() >= 8 {
                items.push(body.read_u64(region).map_err(t(offset))?);
            }
            ObjectRecord::EntryArray(EntryArrayObject { offset, next_array_offset, items })
        }
        OBJECT_TAG => {
            if body.len() != TAG_BODY_SIZE {
                return Err(FormatError::BadTagSize { offset, size: body.len() }.into());
            }
            let seqnum = body.read_u64(region).map_err(t(offset))?;
            let epoch = body.read_u64(region).map_err(t(offset))?;
            let mut mac = [0u8; MAC_LEN];
            mac.copy_from_slice(body.read_bytes(region, MAC_LEN as u64).map_err(t(offset))?);
            body.set_position(0).map_err(t(offset))?;
            let tag = TagObject { offset, seqnum, epoch, mac, body };
            if let Some(checker) = checker {
                checker.verify_tag(region, &tag)?;
            }
            ObjectRecord::Tag(tag)
        }
        _ => ObjectRecord::Other { offset, kind, flags, size },
    };
    Ok(Some(record))
}

// ── Session index ────────────────────────────────────────────────────────────

/// Offset-keyed tables of the objects that others refer to.  Owned by one
/// scan; dropped with it.
#[derive(Debug, Default, Clone)]
pub struct ObjectIndex {
    data:   BTreeMap<u64, DataObject>,
    fields: BTreeMap<u64, FieldObject>,
}

impl ObjectIndex {
    pub fn record(&mut self, record: &ObjectRecord) {
        match record {
            ObjectRecord::Data(d) => {
                self.data.insert(d.offset, d.clone());
            }
            ObjectRecord::Field(f) => {
                self.fields.insert(f.offset, f.clone());
            }
            _ => {}
        }
    }

    pub fn data(&self, offset: u64) -> Option<&DataObject> {
        self.data.get(&offset)
    }

    pub fn field(&self, offset: u64) -> Option<&FieldObject> {
        self.fields.get(&offset)
    }

    /// Replace a data record after it was patched in the file.
    pub fn update_data(&mut self, data: DataObject) {
        self.data.insert(data.offset, data);
    }

    pub fn data_objects(&self) -> &BTreeMap<u64, DataObject> {
        &self.data
    }

    pub fn field_objects(&self) -> &BTreeMap<u64, FieldObject> {
        &self.fields
    }

    /// Data objects referenced by `entry`, in item order.  `None` marks a
    /// reference to an offset this scan has not seen as a data object.
    pub fn entry_data<'a>(&'a self, entry: &'a EntryObject) -> impl Iterator<Item = (u64, Option<&'a DataObject>)> + 'a {
        entry.items.iter().map(move |it| (it.object_offset, self.data.get(&it.object_offset)))
    }
}

// ── Scan session ─────────────────────────────────────────────────────────────

/// Sequential decoder over one file: header, cursor and index.
pub struct JournalScan {
    header:        JournalHeader,
    cursor:        ByteView,
    index:         ObjectIndex,
    records:       u64,
    last_realtime: Option<u64>,
}

impl JournalScan {
    pub fn open(region: &Region) -> std::result::Result<Self, FormatError> {
        let file = region.view();
        let header = JournalHeader::read(&file, region)?;
        let mut cursor = file;
        cursor
            .set_position(header.header_size)
            .map_err(FormatError::truncated(header.header_size))?;
        Ok(Self { header, cursor, index: ObjectIndex::default(), records: 0, last_realtime: None })
    }

    /// Next object, or `None` after `n_objects` records or at a sentinel.
    /// Entries must carry non-decreasing realtime stamps.
    pub fn next(&mut self, region: &Region, checker: Option<&mut MacChecker>) -> Result<Option<ObjectRecord>> {
        if self.records >= self.header.n_objects || !self.cursor.has_remaining() {
            return Ok(None);
        }
        let Some(record) = read_object(&mut self.cursor, region, checker)? else {
            return Ok(None);
        };
        if let ObjectRecord::Entry(e) = &record {
            if let Some(previous) = self.last_realtime {
                if e.realtime < previous {
                    return Err(FormatError::NonMonotonicRealtime {
                        offset: e.offset,
                        previous,
                        realtime: e.realtime,
                    }
                    .into());
                }
            }
            self.last_realtime = Some(e.realtime);
        }
        self.index.record(&record);
        self.records += 1;
        Ok(Some(record))
    }

    pub fn header(&self) -> &JournalHeader {
        &self.header
    }

    pub fn index(&self) -> &ObjectIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut ObjectIndex {
        &mut self.index
    }

    pub fn into_index(self) -> ObjectIndex {
        self.index
    }

    /// Records decoded so far.
    pub fn records(&self) -> u64 {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fsprng::FsKey;
    use crate::writer::{JournalWriter, WriterOptions};

    fn small_journal(options: WriterOptions) -> Region {
        let key = FsKey::from_seed_bytes([5; 12], 0, 1_000_000);
        let mut w = JournalWriter::new(key, options).unwrap();
        w.append(10, &[b"MESSAGE=alpha alpha alpha".as_slice(), b"PRIORITY=6".as_slice()]).unwrap();
        w.append(20, &[b"MESSAGE=beta beta beta".as_slice(), b"PRIORITY=6".as_slice()]).unwrap();
        w.seal().unwrap();
        w.into_region().unwrap()
    }

    fn all(region: &Region) -> (JournalScan, Vec<ObjectRecord>) {
        let mut scan = JournalScan::open(region).unwrap();
        let mut out = Vec::new();
        while let Some(r) = scan.next(region, None).unwrap() {
            out.push(r);
        }
        (scan, out)
    }

    #[test]
    fn decodes_every_object_the_header_counts() {
        let region = small_journal(WriterOptions::default());
        let (scan, records) = all(&region);
        assert_eq!(records.len() as u64, scan.header().n_objects);

        let entries: Vec<&EntryObject> = records
            .iter()
            .filter_map(|r| if let ObjectRecord::Entry(e) = r { Some(e) } else { None })
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].realtime, 10);
        assert_eq!(entries[1].seqnum, entries[0].seqnum + 1);

        let texts: Vec<Vec<u8>> = scan
            .index()
            .entry_data(entries[1])
            .map(|(_, d)| d.unwrap().payload_text().unwrap().into_owned())
            .collect();
        assert!(texts.contains(&b"MESSAGE=beta beta beta".to_vec()));
        assert!(texts.contains(&b"PRIORITY=6".to_vec()));

        // PRIORITY=6 is shared by both entries.
        let shared = scan.index().data_objects().values().find(|d| d.payload == b"PRIORITY=6").unwrap();
        assert_eq!(shared.n_entries, 2);
    }

    #[test]
    fn stored_hashes_are_keyed_siphash() {
        let region = small_journal(WriterOptions::default());
        let (scan, _) = all(&region);
        let key = scan.header().hash_key();
        for d in scan.index().data_objects().values() {
            assert_eq!(d.compute_hash(key).unwrap(), d.hash);
        }
        for f in scan.index().field_objects().values() {
            assert_eq!(content_hash(key, &f.payload), f.hash);
        }
    }

    #[test]
    fn compressed_payloads_decode() {
        let message = format!("MESSAGE={}", "alpha ".repeat(64));
        let options = WriterOptions { compression: Compression::Zstd, compress_threshold: 64, ..Default::default() };
        let key = FsKey::from_seed_bytes([5; 12], 0, 1_000_000);
        let mut w = JournalWriter::new(key, options).unwrap();
        w.append(10, &[message.as_bytes()]).unwrap();
        let region = w.into_region().unwrap();

        let (scan, _) = all(&region);
        let stored = scan
            .index()
            .data_objects()
            .values()
            .find(|d| d.payload_text().unwrap().starts_with(b"MESSAGE=alpha"))
            .unwrap();
        assert_eq!(stored.compression().unwrap(), Compression::Zstd);
        assert!(stored.payload.len() < message.len());
        assert_eq!(&*stored.payload_text().unwrap(), message.as_bytes());
    }

    #[test]
    fn tag_with_wrong_body_size_is_rejected() {
        let mut region = Region::from_bytes(vec![0u8; 64]);
        let v = region.view();
        v.put_bytes(&mut region, 0, &[OBJECT_TAG, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        v.put_u64(&mut region, 8, 16 + 40).unwrap();
        let mut cursor = region.view();
        assert!(matches!(
            read_object(&mut cursor, &region, None),
            Err(Error::Format(FormatError::BadTagSize { offset: 0, size: 40 }))
        ));
    }

    #[test]
    fn zero_size_is_a_sentinel_and_unknown_types_are_kept() {
        let mut region = Region::from_bytes(vec![0u8; 64]);
        let v = region.view();
        v.put_bytes(&mut region, 0, &[42, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        v.put_u64(&mut region, 8, 20).unwrap();
        let mut cursor = region.view();
        let first = read_object(&mut cursor, &region, None).unwrap().unwrap();
        assert!(matches!(first, ObjectRecord::Other { kind: 42, size: 20, .. }));
        assert_eq!(cursor.position(), 24);
        assert!(read_object(&mut cursor, &region, None).unwrap().is_none());
    }

    #[test]
    fn realtime_going_backwards_is_a_format_error() {
        let mut region = small_journal(WriterOptions::default());
        let (_, records) = all(&region);
        let second = records
            .iter()
            .filter_map(|r| if let ObjectRecord::Entry(e) = r { Some(e.offset) } else { None })
            .nth(1)
            .unwrap();
        region.view().put_u64(&mut region, second + OBJECT_PREFIX_SIZE + 8, 5).unwrap();

        let mut scan = JournalScan::open(&region).unwrap();
        let err = loop {
            match scan.next(&region, None) {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("scan finished without error"),
                Err(e) => break e,
            }
        };
        assert!(matches!(
            err,
            Error::Format(FormatError::NonMonotonicRealtime { previous: 10, realtime: 5, .. })
        ));
    }

    #[test]
    fn item_hash_patch_updates_file_and_record() {
        let mut region = small_journal(WriterOptions::default());
        let (_, records) = all(&region);
        let mut entry = records
            .iter()
            .find_map(|r| if let ObjectRecord::Entry(e) = r { Some(e.clone()) } else { None })
            .unwrap();
        let target = entry.items[0].object_offset;
        assert_eq!(entry.write_item_hash(&mut region, target, 0xfeed).unwrap(), 1);
        assert_eq!(entry.items[0].hash, 0xfeed);

        let (_, again) = all(&region);
        let reread = again
            .iter()
            .find_map(|r| if let ObjectRecord::Entry(e) = r { Some(e.clone()) } else { None })
            .unwrap();
        assert_eq!(reread.items[0].hash, 0xfeed);
    }
}
