//! Fixed-size record decoding over the mapped file
//!
//! Map files are arrays of packed little-endian structs. Rather than casting the mapping to
//! Rust structs (which would depend on alignment and host byte order), each record type
//! decodes itself from its byte slice on access.

use memmap2::Mmap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, Range};
use std::sync::Arc;

/// Backing bytes of one map file
pub(crate) enum MapBytes {
    /// Read-only memory mapping of the file
    Mapped(Mmap),
    /// Bytes already held in memory
    Owned(Vec<u8>),
}

impl Deref for MapBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            MapBytes::Mapped(mmap) => mmap,
            MapBytes::Owned(bytes) => bytes,
        }
    }
}

/// A shared window onto the data of one section
///
/// Holds a reference to the whole mapping, so the file stays mapped as long as any context
/// built from it is alive.
#[derive(Clone)]
pub struct SectionData {
    map: Arc<MapBytes>,
    range: Range<usize>,
}

impl SectionData {
    /// The range must lie inside the mapping; the section parser guarantees it.
    pub(crate) fn new(map: Arc<MapBytes>, range: Range<usize>) -> Self {
        debug_assert!(range.end <= map.len());
        Self { map, range }
    }

    /// Raw bytes of the section
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.map[self.range.clone()]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl fmt::Debug for SectionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionData")
            .field("range", &self.range)
            .finish()
    }
}

/// A fixed-size record stored in a map file
pub trait Record: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Decode one record. `bytes` is exactly [`Record::SIZE`] long.
    fn decode(bytes: &[u8]) -> Self;
}

impl Record for u32 {
    const SIZE: usize = 4;

    #[inline]
    fn decode(bytes: &[u8]) -> Self {
        read_u32(bytes, 0)
    }
}

impl Record for i32 {
    const SIZE: usize = 4;

    #[inline]
    fn decode(bytes: &[u8]) -> Self {
        read_i32(bytes, 0)
    }
}

/// A typed, read-only array of records inside a section
pub struct Table<T> {
    data: SectionData,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Record> Table<T> {
    /// The caller has already checked that `data` holds exactly `len` records.
    pub(crate) fn new(data: SectionData, len: usize) -> Self {
        debug_assert_eq!(data.len(), len * T::SIZE);
        Self {
            data,
            len,
            _marker: PhantomData,
        }
    }

    /// Decode the record at `index`, if it exists
    #[inline]
    pub fn get(&self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        let start = index * T::SIZE;
        Some(T::decode(&self.data.as_slice()[start..start + T::SIZE]))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over all records in file order
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.data.as_slice().chunks_exact(T::SIZE).map(T::decode)
    }
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("len", &self.len)
            .field("data", &self.data)
            .finish()
    }
}

#[inline(always)]
pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

#[inline(always)]
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[inline(always)]
pub(crate) fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    read_u32(bytes, offset) as i32
}
