//! String dictionary
//!
//! The "string" section holds one child per volume ("street", "city", ...). Each volume stores
//! its strings back to back and indexes them through a character trie laid out as two flat
//! arrays: tree rows (`first`, `count`, `position`) delimit runs of edges in the node array,
//! so the whole trie is used in place from the mapping.

mod cursor;
mod volume;

pub use cursor::Cursor;
pub use volume::Volume;

use crate::model::Handler;
use crate::section::{SectionId, SectionStore};
use crate::Result;

/// Section name of the dictionary
pub const SECTION: &str = "string";

/// Edge leading to another tree row
pub(crate) const EDGE_TREE: u8 = 1;
/// Edge leading to a single string
pub(crate) const EDGE_STRING: u8 = 2;
/// Bits of the edge flags holding the edge type
pub(crate) const EDGE_TYPE_MASK: u8 = 0x03;

/// Identifier of a string inside a volume
pub type StringId = u32;

/// All volumes of one map file
#[derive(Debug)]
pub struct Dictionary {
    volumes: Vec<Volume>,
}

impl Dictionary {
    /// Look up a volume by name; a file without it is not an error
    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|volume| volume.name() == name)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.iter()
    }
}

/// Handler mapping the "string" section into a [`Dictionary`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DictionaryHandler;

impl DictionaryHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Handler for DictionaryHandler {
    type Context = Dictionary;

    fn map(&self, store: &SectionStore, section: SectionId) -> Result<Dictionary> {
        let volumes = store
            .children(section)
            .map(|child| Volume::map(store, child))
            .collect::<Result<Vec<_>>>()?;

        if volumes.is_empty() {
            tracing::warn!("Dictionary section has no volumes");
        }
        Ok(Dictionary { volumes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{MapBuilder, SAMPLE_STREETS, SectionBuilder, VolumeBuilder, sample_map};

    fn sample_dictionary() -> Dictionary {
        let store = SectionStore::from_bytes(sample_map().build()).unwrap();
        let section = store.find(SECTION).unwrap();
        DictionaryHandler.map(&store, section).unwrap()
    }

    #[test]
    fn test_volume_lookup() {
        let dictionary = sample_dictionary();
        assert!(dictionary.volume("street").is_some());
        assert!(dictionary.volume("attributes").is_some());
        assert!(dictionary.volume("city").is_none());
        assert_eq!(dictionary.volumes().count(), 2);
    }

    #[test]
    fn test_roundtrip_every_id() {
        let dictionary = sample_dictionary();
        for volume in dictionary.volumes() {
            for id in 1..volume.len() as StringId {
                let text = volume.get(id).unwrap();
                assert_eq!(volume.locate(text), Some(id), "{text}");
            }
        }
    }

    #[test]
    fn test_prefix_property() {
        let dictionary = sample_dictionary();
        let streets = dictionary.volume("street").unwrap();
        for name in SAMPLE_STREETS {
            let mut cursor = streets.cursor().unwrap();
            for character in name.bytes() {
                assert!(cursor.advance(character), "{name}");
            }
            // A word that is also a prefix of another needs its end marker
            if !cursor.is_complete() {
                assert!(cursor.completable());
                assert!(cursor.advance(0));
            }
            assert!(cursor.is_complete());
            assert_eq!(cursor.result(), streets.locate(name));
        }
    }

    #[test]
    fn test_empty_dictionary_section() {
        let bytes = MapBuilder::new()
            .with_section(SectionBuilder::parent(SECTION))
            .build();
        let store = SectionStore::from_bytes(bytes).unwrap();
        let dictionary = DictionaryHandler
            .map(&store, store.find(SECTION).unwrap())
            .unwrap();
        assert!(dictionary.volume("street").is_none());
    }

    #[test]
    fn test_volume_without_trie() {
        let volume = VolumeBuilder::new("city")
            .with("Springfield")
            .with("Shelbyville")
            .without_trie();
        let bytes = MapBuilder::new()
            .with_section(SectionBuilder::parent(SECTION).with_child(volume.build()))
            .build();
        let store = SectionStore::from_bytes(bytes).unwrap();
        let dictionary = DictionaryHandler
            .map(&store, store.find(SECTION).unwrap())
            .unwrap();
        let cities = dictionary.volume("city").unwrap();

        assert!(cities.cursor().is_none());
        assert_eq!(cities.locate("shelbyville"), Some(2));
        assert_eq!(cities.search("s", 10), vec![1, 2]);
    }
}
