use thiserror::Error;
use uuid::Uuid;

use crate::view::{ByteView, Region, ViewError};

/// `"LPKSHHRH"` read as a little-endian u64.
pub const SIGNATURE: u64 = 0x4852_4848_534b_504c;
pub const SIGNATURE_BYTES: &[u8; 8] = b"LPKSHHRH";

/// Smallest header this decoder accepts (systemd 189+ layout with tag counters).
pub const HEADER_SIZE_MIN: u64 = 0xf0;
/// Largest header layout this decoder knows every field of.
pub const HEADER_SIZE_MAX: u64 = 0x110;

pub const COMPATIBLE_SEALED: u32 = 1 << 0;
pub const COMPATIBLE_TAIL_ENTRY_BOOT_ID: u32 = 1 << 1;
pub const COMPATIBLE_SEALED_CONTINUOUS: u32 = 1 << 2;

pub const INCOMPATIBLE_COMPRESSED_XZ: u32 = 1 << 0;
pub const INCOMPATIBLE_COMPRESSED_LZ4: u32 = 1 << 1;
pub const INCOMPATIBLE_KEYED_HASH: u32 = 1 << 2;
pub const INCOMPATIBLE_COMPRESSED_ZSTD: u32 = 1 << 3;
pub const INCOMPATIBLE_COMPACT: u32 = 1 << 4;

/// Compact items use 32-bit offsets and a different data layout; not supported.
const SUPPORTED_INCOMPATIBLE: u32 = INCOMPATIBLE_COMPRESSED_XZ
    | INCOMPATIBLE_COMPRESSED_LZ4
    | INCOMPATIBLE_KEYED_HASH
    | INCOMPATIBLE_COMPRESSED_ZSTD;

// Field offsets written outside the sequential decoder.
pub(crate) const OFF_STATE: u64 = 16;
pub(crate) const OFF_TAIL_ENTRY_BOOT_ID: u64 = 56;
pub(crate) const OFF_HEADER_SIZE: u64 = 88;
pub(crate) const OFF_ARENA_SIZE: u64 = 96;
pub(crate) const OFF_TAIL_OBJECT: u64 = 136;
pub(crate) const OFF_ENTRY_ARRAY: u64 = 176;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("bad signature {found:#018x}, not a journal file")]
    BadMagic { found: u64 },
    #[error("unsupported header size {size:#x} (supported {HEADER_SIZE_MIN:#x}..={HEADER_SIZE_MAX:#x})")]
    UnsupportedHeaderSize { size: u64 },
    #[error("unsupported incompatible flags {flags:#010x}")]
    UnsupportedFeatures { flags: u32 },
    #[error("object at offset {offset} is truncated: {source}")]
    Truncated { offset: u64, source: ViewError },
    #[error("object at offset {offset} of type {kind} is too small ({size} bytes)")]
    ObjectTooSmall { offset: u64, kind: u8, size: u64 },
    #[error("tag at offset {offset} has a {size}-byte body, expected 48")]
    BadTagSize { offset: u64, size: u64 },
    #[error("entry at offset {offset} has realtime {realtime} before its predecessor {previous}")]
    NonMonotonicRealtime { offset: u64, previous: u64, realtime: u64 },
    #[error("header declares {declared} {kind} objects, scan found {found}")]
    HeaderCountMismatch { kind: &'static str, declared: u64, found: u64 },
    #[error("object at offset {offset} has unknown type {kind}")]
    UnknownObjectType { offset: u64, kind: u8 },
}

impl FormatError {
    pub(crate) fn truncated(offset: u64) -> impl FnOnce(ViewError) -> FormatError {
        move |source| FormatError::Truncated { offset, source }
    }
}

/// Decoded fixed file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalHeader {
    pub signature:               u64,
    pub compatible_flags:        u32,
    pub incompatible_flags:      u32,
    pub state:                   u8,
    pub file_id:                 Uuid,
    pub machine_id:              Uuid,
    pub tail_entry_boot_id:      Uuid,
    pub seqnum_id:               Uuid,
    pub header_size:             u64,
    pub arena_size:              u64,
    pub data_hash_table_offset:  u64,
    pub data_hash_table_size:    u64,
    pub field_hash_table_offset: u64,
    pub field_hash_table_size:   u64,
    pub tail_object_offset:      u64,
    pub n_objects:               u64,
    pub n_entries:               u64,
    pub tail_entry_seqnum:       u64,
    pub head_entry_seqnum:       u64,
    pub entry_array_offset:      u64,
    pub head_entry_realtime:     u64,
    pub tail_entry_realtime:     u64,
    pub tail_entry_monotonic:    u64,
    pub n_data:                  u64,
    pub n_fields:                u64,
    pub n_tags:                  u64,
    pub n_entry_arrays:          u64,
    pub data_hash_chain_depth:   u64,
    pub field_hash_chain_depth:  u64,
    pub tail_entry_array_offset: u32,
    pub tail_entry_array_n_entries: u32,
    pub tail_entry_offset:       u64,
}

impl JournalHeader {
    /// Decode the header at the start of `view`.
    pub fn read(view: &ByteView, region: &Region) -> Result<Self, FormatError> {
        let mut bb = *view;
        bb.set_position(0).map_err(FormatError::truncated(0))?;

        let signature = bb.read_u64(region).map_err(FormatError::truncated(0))?;
        if signature != SIGNATURE {
            return Err(FormatError::BadMagic { found: signature });
        }
        let compatible_flags   = bb.read_u32(region).map_err(FormatError::truncated(0))?;
        let incompatible_flags = bb.read_u32(region).map_err(FormatError::truncated(0))?;
        if incompatible_flags & !SUPPORTED_INCOMPATIBLE != 0 {
            return Err(FormatError::UnsupportedFeatures { flags: incompatible_flags });
        }
        let state = bb.read_u8(region).map_err(FormatError::truncated(0))?;
        bb.skip(7).map_err(FormatError::truncated(0))?; // reserved

        let file_id            = bb.read_uuid(region).map_err(FormatError::truncated(0))?;
        let machine_id         = bb.read_uuid(region).map_err(FormatError::truncated(0))?;
        let tail_entry_boot_id = bb.read_uuid(region).map_err(FormatError::truncated(0))?;
        let seqnum_id          = bb.read_uuid(region).map_err(FormatError::truncated(0))?;

        let header_size = bb.read_u64(region).map_err(FormatError::truncated(0))?;
        if !(HEADER_SIZE_MIN..=HEADER_SIZE_MAX).contains(&header_size) {
            return Err(FormatError::UnsupportedHeaderSize { size: header_size });
        }
        let mut words = [0u64; 18];
        for w in words.iter_mut() {
            *w = bb.read_u64(region).map_err(FormatError::truncated(0))?;
        }
        let [arena_size, data_hash_table_offset, data_hash_table_size, field_hash_table_offset,
             field_hash_table_size, tail_object_offset, n_objects, n_entries, tail_entry_seqnum,
             head_entry_seqnum, entry_array_offset, head_entry_realtime, tail_entry_realtime,
             tail_entry_monotonic, n_data, n_fields, n_tags, n_entry_arrays] = words;

        let mut data_hash_chain_depth = 0;
        let mut field_hash_chain_depth = 0;
        if header_size > 0xf0 {
            data_hash_chain_depth  = bb.read_u64(region).map_err(FormatError::truncated(0))?;
            field_hash_chain_depth = bb.read_u64(region).map_err(FormatError::truncated(0))?;
        }
        let mut tail_entry_array_offset = 0;
        let mut tail_entry_array_n_entries = 0;
        let mut tail_entry_offset = 0;
        if header_size > 0x100 {
            tail_entry_array_offset    = bb.read_u32(region).map_err(FormatError::truncated(0))?;
            tail_entry_array_n_entries = bb.read_u32(region).map_err(FormatError::truncated(0))?;
            tail_entry_offset          = bb.read_u64(region).map_err(FormatError::truncated(0))?;
        }

        Ok(Self {
            signature,
            compatible_flags,
            incompatible_flags,
            state,
            file_id,
            machine_id,
            tail_entry_boot_id,
            seqnum_id,
            header_size,
            arena_size,
            data_hash_table_offset,
            data_hash_table_size,
            field_hash_table_offset,
            field_hash_table_size,
            tail_object_offset,
            n_objects,
            n_entries,
            tail_entry_seqnum,
            head_entry_seqnum,
            entry_array_offset,
            head_entry_realtime,
            tail_entry_realtime,
            tail_entry_monotonic,
            n_data,
            n_fields,
            n_tags,
            n_entry_arrays,
            data_hash_chain_depth,
            field_hash_chain_depth,
            tail_entry_array_offset,
            tail_entry_array_n_entries,
            tail_entry_offset,
        })
    }

    /// Serialise into the first `header_size` bytes of `region`.
    pub fn write(&self, region: &mut Region) -> Result<(), ViewError> {
        let v = region.view();
        v.put_u64(region, 0, self.signature)?;
        v.put_u32(region, 8, self.compatible_flags)?;
        v.put_u32(region, 12, self.incompatible_flags)?;
        v.put_bytes(region, OFF_STATE, &[self.state, 0, 0, 0, 0, 0, 0, 0])?;
        v.put_bytes(region, 24, self.file_id.as_bytes())?;
        v.put_bytes(region, 40, self.machine_id.as_bytes())?;
        v.put_bytes(region, 72, self.seqnum_id.as_bytes())?;
        v.put_u64(region, OFF_HEADER_SIZE, self.header_size)?;
        self.write_counters(region)?;
        v.put_u64(region, 104, self.data_hash_table_offset)?;
        v.put_u64(region, 112, self.data_hash_table_size)?;
        v.put_u64(region, 120, self.field_hash_table_offset)?;
        v.put_u64(region, 128, self.field_hash_table_size)?;
        Ok(())
    }

    /// Rewrite only the fields that change as the file grows.
    pub fn write_counters(&self, region: &mut Region) -> Result<(), ViewError> {
        let v = region.view();
        v.put_bytes(region, OFF_TAIL_ENTRY_BOOT_ID, self.tail_entry_boot_id.as_bytes())?;
        v.put_u64(region, OFF_ARENA_SIZE, self.arena_size)?;
        v.put_u64(region, OFF_TAIL_OBJECT, self.tail_object_offset)?;
        let counters = [
            self.n_objects,
            self.n_entries,
            self.tail_entry_seqnum,
            self.head_entry_seqnum,
            self.entry_array_offset,
            self.head_entry_realtime,
            self.tail_entry_realtime,
            self.tail_entry_monotonic,
            self.n_data,
            self.n_fields,
            self.n_tags,
            self.n_entry_arrays,
        ];
        for (i, value) in counters.iter().enumerate() {
            v.put_u64(region, 144 + 8 * i as u64, *value)?;
        }
        if self.header_size > 0xf0 {
            v.put_u64(region, 0xf0, self.data_hash_chain_depth)?;
            v.put_u64(region, 0xf8, self.field_hash_chain_depth)?;
        }
        if self.header_size > 0x100 {
            v.put_u32(region, 0x100, self.tail_entry_array_offset)?;
            v.put_u32(region, 0x104, self.tail_entry_array_n_entries)?;
            v.put_u64(region, 0x108, self.tail_entry_offset)?;
        }
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.compatible_flags & COMPATIBLE_SEALED != 0
    }

    pub fn is_keyed_hash(&self) -> bool {
        self.incompatible_flags & INCOMPATIBLE_KEYED_HASH != 0
    }

    /// SipHash key halves: the file id read as two little-endian words.
    pub fn hash_key(&self) -> (u64, u64) {
        let b = self.file_id.as_bytes();
        let mut k0 = [0u8; 8];
        let mut k1 = [0u8; 8];
        k0.copy_from_slice(&b[..8]);
        k1.copy_from_slice(&b[8..]);
        (u64::from_le_bytes(k0), u64::from_le_bytes(k1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(header_size: u64) -> JournalHeader {
        JournalHeader {
            signature:               SIGNATURE,
            compatible_flags:        COMPATIBLE_SEALED,
            incompatible_flags:      INCOMPATIBLE_KEYED_HASH,
            state:                   1,
            file_id:                 Uuid::from_bytes([1; 16]),
            machine_id:              Uuid::from_bytes([2; 16]),
            tail_entry_boot_id:      Uuid::from_bytes([3; 16]),
            seqnum_id:               Uuid::from_bytes([4; 16]),
            header_size,
            arena_size:              4096,
            data_hash_table_offset:  header_size + 16,
            data_hash_table_size:    64 * 16,
            field_hash_table_offset: header_size + 16 + 64 * 16 + 16,
            field_hash_table_size:   16 * 16,
            tail_object_offset:      2000,
            n_objects:               9,
            n_entries:               3,
            tail_entry_seqnum:       3,
            head_entry_seqnum:       1,
            entry_array_offset:      1500,
            head_entry_realtime:     10,
            tail_entry_realtime:     30,
            tail_entry_monotonic:    7,
            n_data:                  2,
            n_fields:                1,
            n_tags:                  1,
            n_entry_arrays:          1,
            data_hash_chain_depth:   if header_size > 0xf0 { 1 } else { 0 },
            field_hash_chain_depth:  if header_size > 0xf0 { 1 } else { 0 },
            tail_entry_array_offset: 0,
            tail_entry_array_n_entries: 0,
            tail_entry_offset:       if header_size > 0x100 { 1900 } else { 0 },
        }
    }

    #[test]
    fn header_write_read_all_layouts() {
        for size in [0xf0, 0x100, 0x110] {
            let h = sample(size);
            let mut region = Region::from_bytes(vec![0u8; size as usize]);
            h.write(&mut region).unwrap();
            assert_eq!(&region.as_bytes()[..8], SIGNATURE_BYTES);
            let back = JournalHeader::read(&region.view(), &region).unwrap();
            assert_eq!(back, h);
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let region = Region::from_bytes(vec![0u8; 0x110]);
        assert!(matches!(
            JournalHeader::read(&region.view(), &region),
            Err(FormatError::BadMagic { found: 0 })
        ));
    }

    #[test]
    fn rejects_header_size_out_of_range() {
        for size in [0xe8u64, 0x118] {
            let mut h = sample(0x110);
            h.header_size = size;
            let mut region = Region::from_bytes(vec![0u8; 0x118]);
            h.write(&mut region).unwrap();
            assert!(matches!(
                JournalHeader::read(&region.view(), &region),
                Err(FormatError::UnsupportedHeaderSize { size: s }) if s == size
            ));
        }
    }

    #[test]
    fn rejects_compact_layout() {
        let mut h = sample(0x110);
        h.incompatible_flags |= INCOMPATIBLE_COMPACT;
        let mut region = Region::from_bytes(vec![0u8; 0x110]);
        h.write(&mut region).unwrap();
        assert!(matches!(
            JournalHeader::read(&region.view(), &region),
            Err(FormatError::UnsupportedFeatures { .. })
        ));
    }

    #[test]
    fn hash_key_is_file_id_little_endian() {
        let mut h = sample(0x110);
        h.file_id = Uuid::from_bytes([1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(h.hash_key(), (1, 2));
    }
}
