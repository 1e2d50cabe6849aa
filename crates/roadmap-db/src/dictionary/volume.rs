//! One named string volume

use super::{Cursor, EDGE_STRING, EDGE_TREE, EDGE_TYPE_MASK, StringId};
use crate::record::{Record, SectionData, Table, read_u16, read_u32};
use crate::section::{SectionId, SectionStore};
use crate::{DbError, Result};

/// A trie row: the run `first..first + count` of the edge array, at depth `position`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeNode {
    pub first: u32,
    pub count: u16,
    pub position: u16,
}

impl Record for TreeNode {
    const SIZE: usize = 8;

    fn decode(bytes: &[u8]) -> Self {
        Self {
            first: read_u32(bytes, 0),
            count: read_u16(bytes, 4),
            position: read_u16(bytes, 6),
        }
    }
}

impl TreeNode {
    #[inline]
    fn edges(&self) -> std::ops::Range<usize> {
        self.first as usize..self.first as usize + self.count as usize
    }
}

/// An edge of the trie, keyed by one lowercase character
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Edge {
    pub character: u8,
    flags: u8,
    /// Tree row for TREE edges, string id for STRING edges
    pub index: u32,
}

impl Record for Edge {
    const SIZE: usize = 8;

    fn decode(bytes: &[u8]) -> Self {
        Self {
            character: bytes[0],
            flags: bytes[1],
            index: read_u32(bytes, 4),
        }
    }
}

impl Edge {
    /// Edge types are validated when the volume is mapped; anything not TREE is STRING.
    #[inline]
    pub fn is_tree(&self) -> bool {
        self.flags & EDGE_TYPE_MASK == EDGE_TREE
    }
}

/// The trie sections of a volume
#[derive(Debug, Clone)]
pub(crate) struct Trie {
    pub tree: Table<TreeNode>,
    pub nodes: Table<Edge>,
}

/// A named string table with its character trie
#[derive(Debug)]
pub struct Volume {
    name: String,
    data: SectionData,
    index: Table<u32>,
    trie: Option<Trie>,
}

impl Volume {
    /// Map one volume section and validate every string and trie link
    pub(crate) fn map(store: &SectionStore, section: SectionId) -> Result<Self> {
        let name = store.name(section).to_string();

        let data_id = store
            .child(section, "data")
            .ok_or_else(|| DbError::corrupt(&name, "volume has no data section"))?;
        store.check_records(data_id, 1)?;
        let data = store.data(data_id);
        let index = store
            .child_table::<u32>(section, "index")?
            .ok_or_else(|| DbError::corrupt(&name, "volume has no index section"))?;

        let tree = store.child_table::<TreeNode>(section, "tree")?;
        let nodes = store.child_table::<Edge>(section, "node")?;
        let trie = match (tree, nodes) {
            (Some(tree), Some(nodes)) => Some(Trie { tree, nodes }),
            (None, None) => {
                tracing::warn!(volume = %name, "Dictionary volume has no trie, searches will scan");
                None
            }
            _ => {
                return Err(DbError::corrupt(
                    &name,
                    "volume must have both tree and node sections or neither",
                ));
            }
        };

        let volume = Self {
            name,
            data,
            index,
            trie,
        };
        volume.validate_strings()?;
        if let Some(trie) = &volume.trie {
            volume.validate_trie(trie)?;
        }

        tracing::debug!(volume = %volume.name, strings = volume.len(), "Mapped dictionary volume");
        Ok(volume)
    }

    fn validate_strings(&self) -> Result<()> {
        let data = self.data.as_slice();
        for (id, offset) in self.index.iter().enumerate() {
            let tail = data.get(offset as usize..).ok_or_else(|| {
                DbError::corrupt(&self.name, format!("string {id} starts outside the data"))
            })?;
            let end = tail.iter().position(|&b| b == 0).ok_or_else(|| {
                DbError::corrupt(&self.name, format!("string {id} is not NUL terminated"))
            })?;
            std::str::from_utf8(&tail[..end]).map_err(|_| {
                DbError::corrupt(&self.name, format!("string {id} is not valid UTF-8"))
            })?;
        }
        Ok(())
    }

    fn validate_trie(&self, trie: &Trie) -> Result<()> {
        match trie.tree.get(0) {
            None => return Err(DbError::corrupt(&self.name, "trie has no root row")),
            Some(root) if root.position != 0 => {
                return Err(DbError::corrupt(
                    &self.name,
                    format!("trie root row is at depth {}", root.position),
                ));
            }
            Some(_) => {}
        }
        for (row, node) in trie.tree.iter().enumerate() {
            if node.edges().end > trie.nodes.len() {
                return Err(DbError::corrupt(
                    &self.name,
                    format!("tree row {row} runs past the node array"),
                ));
            }
            for edge in node.edges().filter_map(|i| trie.nodes.get(i)) {
                match edge.flags & EDGE_TYPE_MASK {
                    EDGE_TREE => {
                        let child = trie.tree.get(edge.index as usize).ok_or_else(|| {
                            DbError::corrupt(&self.name, format!("tree row {row} links a missing row"))
                        })?;
                        // Depth strictly grows along TREE edges, so every walk terminates
                        if edge.character == 0 || node.position.checked_add(1) != Some(child.position) {
                            return Err(DbError::corrupt(
                                &self.name,
                                format!("tree row {row} links a row at the wrong depth"),
                            ));
                        }
                    }
                    EDGE_STRING => {
                        if edge.index as usize >= self.index.len() {
                            return Err(DbError::corrupt(
                                &self.name,
                                format!("tree row {row} links a missing string"),
                            ));
                        }
                    }
                    other => {
                        return Err(DbError::corrupt(
                            &self.name,
                            format!("tree row {row} has an edge of unknown type {other}"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of strings, including the reserved empty string at id 0
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Text of a string id
    pub fn get(&self, id: StringId) -> Option<&str> {
        let offset = self.index.get(id as usize)? as usize;
        let tail = &self.data.as_slice()[offset..];
        let end = tail.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }

    /// Find the id of a string, ignoring ASCII case
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn locate(&self, text: &str) -> Option<StringId> {
        let Some(trie) = &self.trie else {
            return (1..self.len() as StringId)
                .find(|&id| self.get(id).is_some_and(|s| s.eq_ignore_ascii_case(text)));
        };

        let bytes = text.as_bytes();
        let mut node = trie.tree.get(0)?;
        loop {
            let depth = node.position as usize;
            let character = bytes.get(depth).map_or(0, u8::to_ascii_lowercase);
            let edge = self.edge(node, character)?;
            if edge.is_tree() {
                node = trie.tree.get(edge.index as usize)?;
                continue;
            }
            let candidate = self.get(edge.index)?;
            return (candidate.len() == bytes.len() && candidate.eq_ignore_ascii_case(text))
                .then_some(edge.index);
        }
    }

    /// Cursor at the root of the trie, for character-by-character entry
    ///
    /// Returns `None` when the volume was built without a trie.
    pub fn cursor(&self) -> Option<Cursor<'_>> {
        let trie = self.trie.as_ref()?;
        Some(Cursor::new(self, trie.tree.get(0)?))
    }

    /// Ids of up to `limit` strings starting with `prefix` (ASCII case ignored)
    pub fn search(&self, prefix: &str, limit: usize) -> Vec<StringId> {
        let Some(mut cursor) = self.cursor() else {
            return (1..self.len() as StringId)
                .filter(|&id| {
                    self.get(id).is_some_and(|s| {
                        s.len() >= prefix.len()
                            && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
                    })
                })
                .take(limit)
                .collect();
        };

        for character in prefix.bytes() {
            if !cursor.advance(character) {
                return Vec::new();
            }
        }
        cursor.matches(limit)
    }

    #[inline]
    pub(crate) fn trie(&self) -> Option<&Trie> {
        self.trie.as_ref()
    }

    /// Edge of `node` labelled `character`, by linear scan of the node's run
    pub(crate) fn edge(&self, node: TreeNode, character: u8) -> Option<Edge> {
        let trie = self.trie.as_ref()?;
        node.edges()
            .filter_map(|i| trie.nodes.get(i))
            .find(|edge| edge.character == character)
    }

    /// Edges of `node`, in stored order
    pub(crate) fn edges(&self, node: TreeNode) -> impl Iterator<Item = Edge> + '_ {
        let nodes = self.trie.as_ref().map(|trie| &trie.nodes);
        node.edges()
            .filter_map(move |i| nodes.and_then(|nodes| nodes.get(i)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{MapBuilder, SectionBuilder, VolumeBuilder};

    fn map_volume(volume: SectionBuilder) -> Result<Volume> {
        let bytes = MapBuilder::new()
            .with_section(SectionBuilder::parent("string").with_child(volume))
            .build();
        let store = SectionStore::from_bytes(bytes)?;
        let section = store.find("string").and_then(|s| store.first_child(s)).unwrap();
        Volume::map(&store, section)
    }

    fn streets() -> Volume {
        let builder = VolumeBuilder::new("street")
            .with("Main")
            .with("Maple")
            .with("Elm")
            .with("Elmwood")
            .with("Oak");
        map_volume(builder.build()).unwrap()
    }

    #[test]
    fn test_get() {
        let volume = streets();
        assert_eq!(volume.name(), "street");
        assert_eq!(volume.len(), 6);
        assert_eq!(volume.get(0), Some(""));
        assert_eq!(volume.get(1), Some("Main"));
        assert_eq!(volume.get(5), Some("Oak"));
        assert_eq!(volume.get(6), None);
    }

    #[test]
    fn test_locate_ignores_case() {
        let volume = streets();
        assert_eq!(volume.locate("main"), Some(1));
        assert_eq!(volume.locate("MAPLE"), Some(2));
        assert_eq!(volume.locate("elm"), Some(3));
        assert_eq!(volume.locate("ElmWood"), Some(4));
        assert_eq!(volume.locate("oak"), Some(5));
    }

    #[test]
    fn test_locate_not_found() {
        let volume = streets();
        assert_eq!(volume.locate("ma"), None);
        assert_eq!(volume.locate("mainz"), None);
        assert_eq!(volume.locate("oa"), None);
        assert_eq!(volume.locate("pine"), None);
        assert_eq!(volume.locate("elmw"), None);
    }

    #[test]
    fn test_search() {
        let volume = streets();
        assert_eq!(volume.search("ma", 10), vec![1, 2]);
        assert_eq!(volume.search("elm", 10), vec![3, 4]);
        assert_eq!(volume.search("elm", 1), vec![3]);
        assert_eq!(volume.search("O", 10), vec![5]);
        assert!(volume.search("x", 10).is_empty());
    }

    #[test]
    fn test_unterminated_string_is_corrupt() {
        let volume = SectionBuilder::parent("street")
            .with_child(SectionBuilder::leaf("data", b"\0main".to_vec(), 5))
            .with_child(SectionBuilder::records("index", &[0u32, 1]));
        assert!(matches!(map_volume(volume), Err(DbError::Corrupt { .. })));
    }

    #[test]
    fn test_index_outside_data_is_corrupt() {
        let volume = SectionBuilder::parent("street")
            .with_child(SectionBuilder::leaf("data", b"\0".to_vec(), 1))
            .with_child(SectionBuilder::records("index", &[0u32, 9]));
        assert!(matches!(map_volume(volume), Err(DbError::Corrupt { .. })));
    }

    #[test]
    fn test_unknown_edge_type_is_corrupt() {
        let mut node = vec![b'a', 3, 0, 0];
        node.extend_from_slice(&1u32.to_le_bytes());
        let mut tree = 0u32.to_le_bytes().to_vec();
        tree.extend_from_slice(&1u16.to_le_bytes());
        tree.extend_from_slice(&0u16.to_le_bytes());

        let volume = SectionBuilder::parent("street")
            .with_child(SectionBuilder::leaf("data", b"\0a\0".to_vec(), 3))
            .with_child(SectionBuilder::records("index", &[0u32, 1]))
            .with_child(SectionBuilder::leaf("tree", tree, 1))
            .with_child(SectionBuilder::leaf("node", node, 1));
        let err = map_volume(volume).unwrap_err();
        assert!(err.to_string().contains("unknown type 3"));
    }

    #[test]
    fn test_root_row_must_start_at_depth_zero() {
        // Root at depth 1 with a STRING edge for 'a'
        let mut node = vec![b'a', EDGE_STRING, 0, 0];
        node.extend_from_slice(&1u32.to_le_bytes());
        let mut tree = 0u32.to_le_bytes().to_vec();
        tree.extend_from_slice(&1u16.to_le_bytes());
        tree.extend_from_slice(&1u16.to_le_bytes());

        let volume = SectionBuilder::parent("street")
            .with_child(SectionBuilder::leaf("data", b"\0a\0".to_vec(), 3))
            .with_child(SectionBuilder::records("index", &[0u32, 1]))
            .with_child(SectionBuilder::leaf("tree", tree, 1))
            .with_child(SectionBuilder::leaf("node", node, 1));
        let err = map_volume(volume).unwrap_err();
        assert!(err.to_string().contains("root row is at depth 1"), "{err}");
    }

    #[test]
    fn test_tree_without_node_is_corrupt() {
        let volume = SectionBuilder::parent("street")
            .with_child(SectionBuilder::leaf("data", b"\0".to_vec(), 1))
            .with_child(SectionBuilder::records("index", &[0u32]))
            .with_child(SectionBuilder::leaf("tree", vec![0; 8], 1));
        assert!(matches!(map_volume(volume), Err(DbError::Corrupt { .. })));
    }

    #[test]
    fn test_index_record_size_checked() {
        let volume = SectionBuilder::parent("street")
            .with_child(SectionBuilder::leaf("data", b"\0".to_vec(), 1))
            .with_child(SectionBuilder::leaf("index", vec![0; 6], 2));
        assert!(matches!(
            map_volume(volume),
            Err(DbError::RecordSize { .. })
        ));
    }
}
