//! Tile attributes (territory id, name, build date...)
//!
//! Stored as `(category, name, value)` triples of string ids in the "attributes" dictionary
//! volume, so reading a value needs the tile's [`Dictionary`].

use crate::dictionary::{Dictionary, StringId};
use crate::model::Handler;
use crate::record::{Record, Table, read_u32};
use crate::section::{SectionId, SectionStore};
use crate::Result;

/// Section name of the tile attributes
pub const SECTION: &str = "metadata";

/// Dictionary volume holding attribute strings
pub const VOLUME: &str = "attributes";

/// One attribute, as string ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub category: StringId,
    pub name: StringId,
    pub value: StringId,
}

impl Record for Attribute {
    const SIZE: usize = 12;

    fn decode(bytes: &[u8]) -> Self {
        Self {
            category: read_u32(bytes, 0),
            name: read_u32(bytes, 4),
            value: read_u32(bytes, 8),
        }
    }
}

#[derive(Debug)]
pub struct Metadata {
    attributes: Option<Table<Attribute>>,
}

impl Metadata {
    pub fn len(&self) -> usize {
        self.attributes.as_ref().map_or(0, Table::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Attribute> + '_ {
        self.attributes.iter().flat_map(|table| table.iter())
    }

    /// Value of attribute `category`/`name` (names compared case-insensitively)
    pub fn get<'d>(&self, dictionary: &'d Dictionary, category: &str, name: &str) -> Option<&'d str> {
        let volume = dictionary.volume(VOLUME)?;
        let category = volume.locate(category)?;
        let name = volume.locate(name)?;
        self.iter()
            .find(|attribute| attribute.category == category && attribute.name == name)
            .and_then(|attribute| volume.get(attribute.value))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetadataHandler;

impl MetadataHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Handler for MetadataHandler {
    type Context = Metadata;

    fn map(&self, store: &SectionStore, section: SectionId) -> Result<Metadata> {
        let attributes = store.child_table::<Attribute>(section, "attributes")?;
        if attributes.is_none() {
            tracing::warn!("Metadata section without attributes");
        }
        Ok(Metadata { attributes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::DictionaryHandler;
    use crate::fixture::{MapBuilder, SectionBuilder, sample_map};
    use crate::DbError;

    #[test]
    fn test_sample_attributes() {
        let store = SectionStore::from_bytes(sample_map().build()).unwrap();
        let dictionary = DictionaryHandler::new()
            .map(&store, store.find("string").unwrap())
            .unwrap();
        let metadata = MetadataHandler::new()
            .map(&store, store.find(SECTION).unwrap())
            .unwrap();

        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata.get(&dictionary, "Territory", "Id"), Some("usc00001"));
        assert_eq!(metadata.get(&dictionary, "territory", "name"), Some("Sample County"));
        assert_eq!(metadata.get(&dictionary, "Version", "Date"), Some("2026-01-01"));
        assert_eq!(metadata.get(&dictionary, "Version", "Id"), None);
        assert_eq!(metadata.get(&dictionary, "Unknown", "Id"), None);
    }

    #[test]
    fn test_empty_metadata_section() {
        let store = SectionStore::from_bytes(
            MapBuilder::new()
                .with_section(SectionBuilder::parent(SECTION))
                .build(),
        )
        .unwrap();
        let metadata = MetadataHandler::new()
            .map(&store, store.find(SECTION).unwrap())
            .unwrap();
        assert!(metadata.is_empty());
        assert_eq!(metadata.iter().count(), 0);
    }

    #[test]
    fn test_attribute_size_checked() {
        let store = SectionStore::from_bytes(
            MapBuilder::new()
                .with_section(
                    SectionBuilder::parent(SECTION)
                        .with_child(SectionBuilder::leaf("attributes", vec![0; 10], 1)),
                )
                .build(),
        )
        .unwrap();
        assert!(matches!(
            MetadataHandler::new().map(&store, store.find(SECTION).unwrap()),
            Err(DbError::RecordSize { .. })
        ));
    }
}
