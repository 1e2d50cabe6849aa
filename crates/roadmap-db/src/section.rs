//! Section tree of a map file
//!
//! A map file is a 16-byte file header followed by a tree of sections. Every section starts
//! with a fixed header (name, child links, data size, record count) and its data follows
//! immediately; a parent's data region holds its children.
//!
//! ```text
//! File header (16 bytes):
//!   magic: "ROADMAP\0" (8B)
//!   byte_order: u32 = 0x01020304
//!   version: u32 = 1
//!
//! Section header (36 bytes):
//!   name: [u8; 16]   -- NUL padded
//!   first: u32       -- file offset of the first child header, 0 = leaf
//!   last: u32        -- file offset of the last child header, 0 = leaf
//!   next: u32        -- file offset of the next sibling header, 0 = last sibling
//!   size: u32        -- bytes of data following this header
//!   count: u32       -- declared number of records
//! ```
//!
//! All integers are little-endian. The whole tree is parsed and validated when the file is
//! opened; afterwards every accessor is O(1).

use crate::record::{MapBytes, Record, SectionData, Table, read_u32};
use crate::{DbError, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// File magic
pub const MAGIC: &[u8; 8] = b"ROADMAP\0";

/// Byte order marker, as written by a little-endian builder
pub const BYTE_ORDER: u32 = 0x0102_0304;

/// Supported format version
pub const VERSION: u32 = 1;

/// Size of the file header in bytes
pub const FILE_HEADER_SIZE: usize = 16;

/// Size of a section header in bytes
pub const SECTION_HEADER_SIZE: usize = 36;

/// Maximum length of a section name in bytes
pub const NAME_SIZE: usize = 16;

/// Deepest nesting accepted while parsing
const MAX_LEVEL: u32 = 32;

/// Identifier of a section inside one [`SectionStore`]
///
/// Identifiers are only meaningful for the store that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(u32);

impl SectionId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One node of the section tree
#[derive(Debug, Clone)]
pub struct Section {
    name: String,
    /// File offset of the section data
    offset: usize,
    /// Size of the section data in bytes
    size: usize,
    /// Declared record count
    count: usize,
    /// Depth in the tree (0 = root)
    level: u32,
    parent: Option<SectionId>,
    first_child: Option<SectionId>,
    last_child: Option<SectionId>,
    next_sibling: Option<SectionId>,
}

impl Section {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File offset of the section data
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of the section data in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Declared number of records
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Depth in the tree (0 = root)
    #[inline]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[inline]
    pub fn parent(&self) -> Option<SectionId> {
        self.parent
    }

    #[inline]
    pub fn first_child(&self) -> Option<SectionId> {
        self.first_child
    }

    #[inline]
    pub fn last_child(&self) -> Option<SectionId> {
        self.last_child
    }

    #[inline]
    pub fn next_sibling(&self) -> Option<SectionId> {
        self.next_sibling
    }
}

/// Raw section header as stored in the file
struct RawHeader {
    name: String,
    first: usize,
    last: usize,
    next: usize,
    size: usize,
    count: usize,
}

/// A mapped map file and its parsed section tree
pub struct SectionStore {
    map: Arc<MapBytes>,
    /// Arena of sections in depth-first order; index 0 is the root
    sections: Vec<Section>,
}

impl SectionStore {
    /// Memory-map a file and parse its section tree
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if file.metadata()?.len() < (FILE_HEADER_SIZE + SECTION_HEADER_SIZE) as u64 {
            return Err(DbError::BadHeader(format!(
                "{} is too small to be a map file",
                path.display()
            )));
        }

        // SAFETY: The file is mapped read-only and map files are never modified once built.
        let mmap = unsafe { Mmap::map(&file)? };
        Self::parse(Arc::new(MapBytes::Mapped(mmap)))
    }

    /// Parse a map file already held in memory
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(Arc::new(MapBytes::Owned(bytes)))
    }

    fn parse(map: Arc<MapBytes>) -> Result<Self> {
        Self::check_file_header(&map)?;

        let mut store = Self {
            map,
            sections: Vec::new(),
        };
        let file_len = store.map.len();
        let root = store.parse_section(FILE_HEADER_SIZE, None, 0, FILE_HEADER_SIZE..file_len)?;
        if root.next != 0 {
            return Err(DbError::corrupt(
                root.name,
                "root section must not have siblings",
            ));
        }

        tracing::debug!(sections = store.sections.len(), "Parsed section tree");
        Ok(store)
    }

    fn check_file_header(bytes: &[u8]) -> Result<()> {
        if bytes.len() < FILE_HEADER_SIZE + SECTION_HEADER_SIZE {
            return Err(DbError::BadHeader("file is too small".to_string()));
        }
        if &bytes[..8] != MAGIC {
            return Err(DbError::BadHeader("missing ROADMAP magic".to_string()));
        }
        match read_u32(bytes, 8) {
            BYTE_ORDER => {}
            marker if marker == BYTE_ORDER.swap_bytes() => return Err(DbError::ByteOrder),
            marker => {
                return Err(DbError::BadHeader(format!(
                    "unknown byte order marker {marker:#010x}"
                )));
            }
        }
        let version = read_u32(bytes, 12);
        if version != VERSION {
            return Err(DbError::BadHeader(format!(
                "unsupported format version {version}"
            )));
        }
        Ok(())
    }

    fn read_header(&self, offset: usize, bounds: &std::ops::Range<usize>) -> Result<RawHeader> {
        let end = offset
            .checked_add(SECTION_HEADER_SIZE)
            .filter(|end| offset >= bounds.start && *end <= bounds.end)
            .ok_or_else(|| {
                DbError::corrupt(
                    format!("@{offset}"),
                    format!("section header outside of {bounds:?}"),
                )
            })?;
        let bytes = &self.map[offset..end];

        let name_bytes = &bytes[..NAME_SIZE];
        let name_len = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_SIZE);
        let name = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| DbError::corrupt(format!("@{offset}"), "section name is not UTF-8"))?
            .to_string();

        Ok(RawHeader {
            name,
            first: read_u32(bytes, NAME_SIZE) as usize,
            last: read_u32(bytes, NAME_SIZE + 4) as usize,
            next: read_u32(bytes, NAME_SIZE + 8) as usize,
            size: read_u32(bytes, NAME_SIZE + 12) as usize,
            count: read_u32(bytes, NAME_SIZE + 16) as usize,
        })
    }

    /// Parse the section at `offset` and, recursively, its children.
    ///
    /// Returns the raw header so the caller can follow the sibling link.
    fn parse_section(
        &mut self,
        offset: usize,
        parent: Option<SectionId>,
        level: u32,
        bounds: std::ops::Range<usize>,
    ) -> Result<RawHeader> {
        let header = self.read_header(offset, &bounds)?;
        if level > MAX_LEVEL {
            return Err(DbError::corrupt(header.name, "section tree is too deep"));
        }

        let data_start = offset + SECTION_HEADER_SIZE;
        let data_end = data_start
            .checked_add(header.size)
            .filter(|end| *end <= bounds.end)
            .ok_or_else(|| {
                DbError::corrupt(
                    header.name.clone(),
                    format!("{} data bytes overflow the enclosing section", header.size),
                )
            })?;

        let id = SectionId(self.sections.len() as u32);
        self.sections.push(Section {
            name: header.name.clone(),
            offset: data_start,
            size: header.size,
            count: header.count,
            level,
            parent,
            first_child: None,
            last_child: None,
            next_sibling: None,
        });

        if header.first == 0 {
            if header.last != 0 {
                return Err(DbError::corrupt(
                    header.name,
                    "leaf section declares a last child",
                ));
            }
            return Ok(header);
        }

        let mut child_offset = header.first;
        let mut previous: Option<SectionId> = None;
        let mut last_offset = 0;
        while child_offset != 0 {
            let child_id = SectionId(self.sections.len() as u32);
            let child = self.parse_section(child_offset, Some(id), level + 1, data_start..data_end)?;

            match previous {
                Some(prev) => self.sections[prev.index()].next_sibling = Some(child_id),
                None => self.sections[id.index()].first_child = Some(child_id),
            }
            previous = Some(child_id);
            last_offset = child_offset;

            let child_end = child_offset + SECTION_HEADER_SIZE + child.size;
            if child.next != 0 && child.next < child_end {
                return Err(DbError::corrupt(
                    child.name,
                    "sibling link points backwards or into the section",
                ));
            }
            child_offset = child.next;
        }

        if last_offset != header.last {
            return Err(DbError::corrupt(
                header.name,
                "last child link does not match the sibling chain",
            ));
        }
        self.sections[id.index()].last_child = previous;

        Ok(header)
    }

    /// The root section
    #[inline]
    pub fn root(&self) -> SectionId {
        SectionId(0)
    }

    /// Number of sections in the tree
    #[inline]
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Section attributes
    ///
    /// # Panics
    /// If `id` was produced by a different store.
    #[inline]
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.index()]
    }

    #[inline]
    pub fn name(&self, id: SectionId) -> &str {
        self.section(id).name()
    }

    #[inline]
    pub fn first_child(&self, id: SectionId) -> Option<SectionId> {
        self.section(id).first_child
    }

    #[inline]
    pub fn next_sibling(&self, id: SectionId) -> Option<SectionId> {
        self.section(id).next_sibling
    }

    /// Raw data of a section
    #[inline]
    pub fn data(&self, id: SectionId) -> SectionData {
        let section = self.section(id);
        SectionData::new(
            self.map.clone(),
            section.offset..section.offset + section.size,
        )
    }

    /// Direct children of a section, in file order
    pub fn children(&self, id: SectionId) -> impl Iterator<Item = SectionId> + '_ {
        std::iter::successors(self.first_child(id), move |child| {
            self.next_sibling(*child)
        })
    }

    /// First direct child with the given name
    pub fn child(&self, id: SectionId, name: &str) -> Option<SectionId> {
        self.children(id).find(|child| self.name(*child) == name)
    }

    /// Resolve a '/' separated path of names starting below the root
    pub fn find(&self, path: &str) -> Option<SectionId> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(self.root(), |id, name| self.child(id, name))
    }

    /// All sections in depth-first order, root included
    pub fn walk(&self) -> impl Iterator<Item = SectionId> + '_ {
        (0..self.sections.len() as u32).map(SectionId)
    }

    /// Check that a section holds exactly its declared number of `record_size` records
    pub fn check_records(&self, id: SectionId, record_size: usize) -> Result<()> {
        let section = self.section(id);
        if section.count.checked_mul(record_size) != Some(section.size) {
            return Err(DbError::RecordSize {
                section: section.name.clone(),
                size: section.size,
                count: section.count,
                record_size,
            });
        }
        Ok(())
    }

    /// Typed view of a leaf section, after checking its declared size
    pub fn table<T: Record>(&self, id: SectionId) -> Result<Table<T>> {
        self.check_records(id, T::SIZE)?;
        Ok(Table::new(self.data(id), self.section(id).count))
    }

    /// Typed view of an optional child section; a missing child is not an error
    pub fn child_table<T: Record>(&self, id: SectionId, name: &str) -> Result<Option<Table<T>>> {
        self.child(id, name)
            .map(|child| self.table::<T>(child))
            .transpose()
    }
}

impl std::fmt::Debug for SectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectionStore")
            .field("bytes", &self.map.len())
            .field("sections", &self.sections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{MapBuilder, SectionBuilder};

    fn sample_tree() -> Vec<u8> {
        let mut builder = MapBuilder::new();
        builder.root_mut().push(
            SectionBuilder::parent("string").with_child(
                SectionBuilder::parent("street")
                    .with_child(SectionBuilder::leaf("data", b"\0main\0".to_vec(), 6))
                    .with_child(SectionBuilder::records("index", &[0u32, 1])),
            ),
        );
        builder
            .root_mut()
            .push(SectionBuilder::records("square", &[1u32, 2, 3]));
        builder.build()
    }

    #[test]
    fn test_parse_tree_links() {
        let store = SectionStore::from_bytes(sample_tree()).unwrap();
        let root = store.root();
        assert_eq!(store.section(root).level(), 0);

        let names: Vec<&str> = store.children(root).map(|id| store.name(id)).collect();
        assert_eq!(names, vec!["string", "square"]);

        let string = store.child(root, "string").unwrap();
        let street = store.first_child(string).unwrap();
        assert_eq!(store.name(street), "street");
        assert_eq!(store.section(street).level(), 2);
        assert_eq!(store.section(street).parent(), Some(string));
        assert_eq!(
            store.section(string).first_child(),
            store.section(string).last_child()
        );

        let data = store.find("string/street/data").unwrap();
        assert_eq!(store.section(data).size(), 6);
        assert_eq!(store.data(data).as_slice(), b"\0main\0");
        assert_eq!(store.section(data).level(), 3);
        assert!(store.find("string/city").is_none());
    }

    #[test]
    fn test_walk_is_depth_first() {
        let store = SectionStore::from_bytes(sample_tree()).unwrap();
        let names: Vec<&str> = store.walk().map(|id| store.name(id)).collect();
        assert_eq!(
            names,
            vec!["", "string", "street", "data", "index", "square"]
        );
        assert_eq!(store.len(), 6);
    }

    #[test]
    fn test_typed_table() {
        let store = SectionStore::from_bytes(sample_tree()).unwrap();
        let square = store.find("square").unwrap();
        let table = store.table::<u32>(square).unwrap();
        assert_eq!(table.iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        let missing = store.child_table::<u32>(store.root(), "line").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_record_size_mismatch_is_fatal() {
        let store = SectionStore::from_bytes(sample_tree()).unwrap();
        let square = store.find("square").unwrap();
        // Three u32 records cannot be read as 8-byte records
        let err = store.check_records(square, 8).unwrap_err();
        assert!(matches!(err, DbError::RecordSize { count: 3, .. }));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_tree();
        bytes[0] = b'X';
        assert!(matches!(
            SectionStore::from_bytes(bytes),
            Err(DbError::BadHeader(_))
        ));
    }

    #[test]
    fn test_swapped_byte_order() {
        let mut bytes = sample_tree();
        bytes[8..12].copy_from_slice(&BYTE_ORDER.to_be_bytes());
        assert!(matches!(
            SectionStore::from_bytes(bytes),
            Err(DbError::ByteOrder)
        ));
    }

    #[test]
    fn test_truncated_file() {
        let bytes = sample_tree();
        let truncated = bytes[..bytes.len() - 4].to_vec();
        assert!(matches!(
            SectionStore::from_bytes(truncated),
            Err(DbError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_backward_sibling_link() {
        let mut bytes = sample_tree();
        // The "string" section is the first child of the root; point its sibling link at itself
        let string_offset = FILE_HEADER_SIZE + SECTION_HEADER_SIZE;
        let link = NAME_SIZE + 8;
        bytes[string_offset + link..string_offset + link + 4]
            .copy_from_slice(&(string_offset as u32).to_le_bytes());
        assert!(SectionStore::from_bytes(bytes).is_err());
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usc06075.rdm");
        std::fs::write(&path, sample_tree()).unwrap();

        let store = SectionStore::open(&path).unwrap();
        assert!(store.find("string/street/index").is_some());

        let empty = dir.path().join("empty.rdm");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(
            SectionStore::open(&empty),
            Err(DbError::BadHeader(_))
        ));
    }
}
