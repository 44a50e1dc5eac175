//! Offset-aware little-endian views over one owned byte region.
//!
//! A [`Region`] owns the bytes of one journal file (or key file).  Any number
//! of [`ByteView`]s may describe windows into it; a view is only an
//! `(region id, absolute base, length, cursor)` quadruple and never borrows
//! the region, so the attack can patch bytes through `&mut Region` while
//! other views of the same file are still alive.  Every access names the
//! region explicitly and is bounds-checked against both the view and the
//! current region length.
//!
//! # Endianness
//! Journal files are little-endian throughout.  The key-checkpoint state
//! block is big-endian and is read with the `_be` accessors.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    #[error("views belong to different byte regions")]
    IncompatibleRegion,
    #[error("access of {len} bytes at absolute offset {offset} exceeds capacity {capacity}")]
    OutOfBounds { offset: u64, len: u64, capacity: u64 },
}

// ── Region ───────────────────────────────────────────────────────────────────

/// Process-unique identity of a [`Region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(u64);

static NEXT_REGION: AtomicU64 = AtomicU64::new(1);

/// The single owner of a file's bytes.
#[derive(Debug)]
pub struct Region {
    id:    RegionId,
    bytes: Vec<u8>,
}

impl Region {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            id: RegionId(NEXT_REGION.fetch_add(1, Ordering::Relaxed)),
            bytes,
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        Ok(Self::from_bytes(fs::read(path)?))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        fs::write(path, &self.bytes)
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// A view over the whole region, cursor at 0.  The view's length is
    /// fixed at creation; take a new one after [`Region::append`].
    pub fn view(&self) -> ByteView {
        ByteView { region: self.id, base: 0, len: self.len(), pos: 0 }
    }

    /// Append `bytes` and return the absolute offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        let at = self.len();
        self.bytes.extend_from_slice(bytes);
        at
    }

    /// Grow with zeroes until the length is a multiple of `align`.
    pub fn pad_to(&mut self, align: u64) {
        let target = align_up(self.len(), align);
        self.bytes.resize(target as usize, 0);
    }

    fn range(&self, view: &ByteView, index: u64, len: u64) -> Result<std::ops::Range<usize>, ViewError> {
        if view.region != self.id {
            return Err(ViewError::IncompatibleRegion);
        }
        let oob = ViewError::OutOfBounds {
            offset:   view.base.saturating_add(index),
            len,
            capacity: view.len.min(self.len().saturating_sub(view.base)),
        };
        let end = index.checked_add(len).ok_or_else(|| oob.clone())?;
        if end > view.len {
            return Err(oob);
        }
        let start = view.base + index;
        let stop  = view.base + end;
        if stop > self.len() {
            return Err(oob);
        }
        Ok(start as usize..stop as usize)
    }

    fn slice_of(&self, view: &ByteView, index: u64, len: u64) -> Result<&[u8], ViewError> {
        let r = self.range(view, index, len)?;
        Ok(&self.bytes[r])
    }

    fn slice_of_mut(&mut self, view: &ByteView, index: u64, len: u64) -> Result<&mut [u8], ViewError> {
        let r = self.range(view, index, len)?;
        Ok(&mut self.bytes[r])
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

// ── ByteView ─────────────────────────────────────────────────────────────────

/// A bounds-checked window `[base, base + len)` into a [`Region`] with a
/// relative read cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteView {
    region: RegionId,
    base:   u64,
    len:    u64,
    pos:    u64,
}

impl ByteView {
    /// Sub-view of `len` bytes starting at relative `index`; cursor at 0.
    pub fn slice(&self, index: u64, len: u64) -> Result<ByteView, ViewError> {
        let end = index.checked_add(len);
        match end {
            Some(end) if end <= self.len => Ok(ByteView {
                region: self.region,
                base:   self.base + index,
                len,
                pos:    0,
            }),
            _ => Err(ViewError::OutOfBounds {
                offset:   self.base.saturating_add(index),
                len,
                capacity: self.len,
            }),
        }
    }

    /// Sub-view from the cursor to the end of this view.
    pub fn rest(&self) -> ByteView {
        ByteView {
            region: self.region,
            base:   self.base + self.pos,
            len:    self.len - self.pos,
            pos:    0,
        }
    }

    /// The same window over `region`, typically a copy of the same file.
    pub fn rebind(&self, region: &Region) -> ByteView {
        ByteView { region: region.id(), ..*self }
    }

    /// Distance of this view's base from `other`'s base.
    pub fn offset_from(&self, other: &ByteView) -> Result<i64, ViewError> {
        if self.region != other.region {
            return Err(ViewError::IncompatibleRegion);
        }
        Ok(self.base as i64 - other.base as i64)
    }

    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Absolute offset of this view's first byte in its region.
    pub fn absolute(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn set_position(&mut self, pos: u64) -> Result<(), ViewError> {
        if pos > self.len {
            return Err(ViewError::OutOfBounds { offset: self.base + pos, len: 0, capacity: self.len });
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: u64) -> Result<(), ViewError> {
        self.set_position(self.pos.saturating_add(n))
    }

    pub fn remaining(&self) -> u64 {
        self.len - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.len
    }

    // ── Indexed reads ──────────────────────────────────────────────────────

    pub fn get_bytes<'r>(&self, region: &'r Region, index: u64, len: u64) -> Result<&'r [u8], ViewError> {
        region.slice_of(self, index, len)
    }

    pub fn get_u8(&self, region: &Region, index: u64) -> Result<u8, ViewError> {
        Ok(self.get_bytes(region, index, 1)?[0])
    }

    pub fn get_u16_be(&self, region: &Region, index: u64) -> Result<u16, ViewError> {
        Ok(BigEndian::read_u16(self.get_bytes(region, index, 2)?))
    }

    pub fn get_u32(&self, region: &Region, index: u64) -> Result<u32, ViewError> {
        Ok(LittleEndian::read_u32(self.get_bytes(region, index, 4)?))
    }

    pub fn get_u64(&self, region: &Region, index: u64) -> Result<u64, ViewError> {
        Ok(LittleEndian::read_u64(self.get_bytes(region, index, 8)?))
    }

    pub fn get_u64_be(&self, region: &Region, index: u64) -> Result<u64, ViewError> {
        Ok(BigEndian::read_u64(self.get_bytes(region, index, 8)?))
    }

    // ── Cursor reads ───────────────────────────────────────────────────────

    pub fn read_bytes<'r>(&mut self, region: &'r Region, len: u64) -> Result<&'r [u8], ViewError> {
        let out = region.slice_of(self, self.pos, len)?;
        self.pos += len;
        Ok(out)
    }

    pub fn read_u8(&mut self, region: &Region) -> Result<u8, ViewError> {
        Ok(self.read_bytes(region, 1)?[0])
    }

    pub fn read_u32(&mut self, region: &Region) -> Result<u32, ViewError> {
        Ok(LittleEndian::read_u32(self.read_bytes(region, 4)?))
    }

    pub fn read_u64(&mut self, region: &Region) -> Result<u64, ViewError> {
        Ok(LittleEndian::read_u64(self.read_bytes(region, 8)?))
    }

    pub fn read_u16_be(&mut self, region: &Region) -> Result<u16, ViewError> {
        Ok(BigEndian::read_u16(self.read_bytes(region, 2)?))
    }

    pub fn read_u64_be(&mut self, region: &Region) -> Result<u64, ViewError> {
        Ok(BigEndian::read_u64(self.read_bytes(region, 8)?))
    }

    /// 128-bit id stored as raw bytes (journald's `sd_id128_t`).
    pub fn read_uuid(&mut self, region: &Region) -> Result<Uuid, ViewError> {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(self.read_bytes(region, 16)?);
        Ok(Uuid::from_bytes(raw))
    }

    // ── Indexed writes ─────────────────────────────────────────────────────

    pub fn put_bytes(&self, region: &mut Region, index: u64, src: &[u8]) -> Result<(), ViewError> {
        region.slice_of_mut(self, index, src.len() as u64)?.copy_from_slice(src);
        Ok(())
    }

    pub fn put_u32(&self, region: &mut Region, index: u64, value: u32) -> Result<(), ViewError> {
        LittleEndian::write_u32(region.slice_of_mut(self, index, 4)?, value);
        Ok(())
    }

    pub fn put_u64(&self, region: &mut Region, index: u64, value: u64) -> Result<(), ViewError> {
        LittleEndian::write_u64(region.slice_of_mut(self, index, 8)?, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn writes_are_visible_through_aliasing_views() {
        let mut region = Region::from_bytes(vec![0u8; 64]);
        let whole = region.view();
        let tail = whole.slice(32, 32).unwrap();
        tail.put_u64(&mut region, 8, 0xdead_beef).unwrap();
        assert_eq!(whole.get_u64(&region, 40).unwrap(), 0xdead_beef);
        assert_eq!(tail.offset_from(&whole).unwrap(), 32);
        assert_eq!(whole.offset_from(&tail).unwrap(), -32);
    }

    #[test]
    fn views_of_different_regions_are_incompatible() {
        let a = Region::from_bytes(vec![0u8; 16]);
        let b = Region::from_bytes(vec![0u8; 16]);
        assert_eq!(a.view().offset_from(&b.view()), Err(ViewError::IncompatibleRegion));
        assert_eq!(a.view().get_u64(&b, 0), Err(ViewError::IncompatibleRegion));
    }

    #[test]
    fn rebound_view_writes_to_the_copy_only() {
        let original = Region::from_bytes(vec![0u8; 32]);
        let mut copy = Region::from_bytes(original.as_bytes().to_vec());
        let field = original.view().slice(8, 8).unwrap();
        assert_eq!(field.put_u64(&mut copy, 0, 7), Err(ViewError::IncompatibleRegion));

        let field = field.rebind(&copy);
        field.put_u64(&mut copy, 0, 7).unwrap();
        assert_eq!(copy.view().get_u64(&copy, 8).unwrap(), 7);
        assert_eq!(original.view().get_u64(&original, 8).unwrap(), 0);
    }

    #[test]
    fn rest_keeps_absolute_offset() {
        let region = Region::from_bytes((0u8..32).collect());
        let mut v = region.view().slice(8, 24).unwrap();
        v.read_u64(&region).unwrap();
        let rest = v.rest();
        assert_eq!(rest.absolute(), 16);
        assert_eq!(rest.get_u8(&region, 0).unwrap(), 16);
        assert_eq!(rest.len(), 16);
    }

    #[test]
    fn reads_past_the_view_fail() {
        let region = Region::from_bytes(vec![1u8; 32]);
        let v = region.view().slice(0, 12).unwrap();
        assert!(v.get_u64(&region, 4).is_ok());
        assert!(matches!(v.get_u64(&region, 5), Err(ViewError::OutOfBounds { .. })));
        assert!(region.view().slice(30, 4).is_err());
    }

    proptest! {
        #[test]
        fn put_then_get_at_any_aligned_index(idx in 0u64..56, value: u64) {
            let mut region = Region::from_bytes(vec![0u8; 64]);
            let v = region.view();
            v.put_u64(&mut region, idx, value).unwrap();
            prop_assert_eq!(v.get_u64(&region, idx).unwrap(), value);
        }

        #[test]
        fn nested_slices_compose_offsets(a in 0u64..32, b in 0u64..16) {
            let region = Region::from_bytes(vec![0u8; 64]);
            let outer = region.view().slice(a, 32).unwrap();
            let inner = outer.slice(b, 16).unwrap();
            prop_assert_eq!(inner.offset_from(&region.view()).unwrap(), (a + b) as i64);
        }
    }
}
