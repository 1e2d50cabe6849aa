//! Map file builder for tests and benchmarks
//!
//! Production map files come from the external map builder. This module writes the same
//! layout for synthetic tiles so the reader can be exercised end to end.

use crate::dictionary::{EDGE_STRING, EDGE_TREE};
use crate::geometry::{Area, Position};
use crate::section::{BYTE_ORDER, FILE_HEADER_SIZE, MAGIC, NAME_SIZE, SECTION_HEADER_SIZE, VERSION};
use std::collections::BTreeMap;
use std::path::Path;

/// Values that can be written as fixed-size records
pub trait Encode {
    fn encode(&self, out: &mut Vec<u8>);
}

impl Encode for u32 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Encode for i32 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Encode for Position {
    fn encode(&self, out: &mut Vec<u8>) {
        self.longitude.encode(out);
        self.latitude.encode(out);
    }
}

impl Encode for Area {
    fn encode(&self, out: &mut Vec<u8>) {
        for edge in [self.west, self.south, self.east, self.north] {
            edge.encode(out);
        }
    }
}

enum Content {
    Leaf { data: Vec<u8>, count: usize },
    Parent { children: Vec<SectionBuilder> },
}

/// One section to be written
pub struct SectionBuilder {
    name: String,
    content: Content,
}

impl SectionBuilder {
    /// Leaf section with raw data and a declared record count
    pub fn leaf(name: &str, data: Vec<u8>, count: usize) -> Self {
        assert!(name.len() <= NAME_SIZE, "section name too long: {name}");
        Self {
            name: name.to_string(),
            content: Content::Leaf { data, count },
        }
    }

    /// Leaf section holding an array of records
    pub fn records<T: Encode>(name: &str, records: &[T]) -> Self {
        let mut data = Vec::new();
        for record in records {
            record.encode(&mut data);
        }
        Self::leaf(name, data, records.len())
    }

    /// Empty parent section
    pub fn parent(name: &str) -> Self {
        assert!(name.len() <= NAME_SIZE, "section name too long: {name}");
        Self {
            name: name.to_string(),
            content: Content::Parent {
                children: Vec::new(),
            },
        }
    }

    pub fn with_child(mut self, child: SectionBuilder) -> Self {
        self.push(child);
        self
    }

    /// Append a child section
    ///
    /// # Panics
    /// If this is a leaf section.
    pub fn push(&mut self, child: SectionBuilder) {
        match &mut self.content {
            Content::Parent { children } => children.push(child),
            Content::Leaf { .. } => panic!("cannot add children to leaf section {}", self.name),
        }
    }

    fn write(&self, out: &mut Vec<u8>) -> usize {
        let header_offset = out.len();
        out.resize(header_offset + SECTION_HEADER_SIZE, 0);
        let data_start = out.len();

        let (first, last, count) = match &self.content {
            Content::Leaf { data, count } => {
                out.extend_from_slice(data);
                (0, 0, *count)
            }
            Content::Parent { children } => {
                let mut offsets = Vec::with_capacity(children.len());
                for child in children {
                    let offset = child.write(out);
                    if let Some(&previous) = offsets.last() {
                        patch_u32(out, previous + NAME_SIZE + 8, offset as u32);
                    }
                    offsets.push(offset);
                }
                (
                    offsets.first().copied().unwrap_or(0),
                    offsets.last().copied().unwrap_or(0),
                    children.len(),
                )
            }
        };

        let size = out.len() - data_start;
        let header = &mut out[header_offset..header_offset + SECTION_HEADER_SIZE];
        header[..self.name.len()].copy_from_slice(self.name.as_bytes());
        patch_u32(out, header_offset + NAME_SIZE, first as u32);
        patch_u32(out, header_offset + NAME_SIZE + 4, last as u32);
        patch_u32(out, header_offset + NAME_SIZE + 12, size as u32);
        patch_u32(out, header_offset + NAME_SIZE + 16, count as u32);
        header_offset
    }
}

fn patch_u32(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// A whole map file
pub struct MapBuilder {
    root: SectionBuilder,
}

impl Default for MapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MapBuilder {
    pub fn new() -> Self {
        Self {
            root: SectionBuilder::parent(""),
        }
    }

    pub fn root_mut(&mut self) -> &mut SectionBuilder {
        &mut self.root
    }

    pub fn with_section(mut self, section: SectionBuilder) -> Self {
        self.root.push(section);
        self
    }

    /// Serialize the file
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&BYTE_ORDER.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        debug_assert_eq!(out.len(), FILE_HEADER_SIZE);
        self.root.write(&mut out);
        out
    }

    pub fn write(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.build())
    }
}

/// One string volume, compiled into data/index/tree/node sections
pub struct VolumeBuilder {
    name: String,
    strings: Vec<String>,
    ids: BTreeMap<String, u32>,
    with_trie: bool,
}

impl VolumeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            // Slot 0 is the empty string
            strings: vec![String::new()],
            ids: BTreeMap::new(),
            with_trie: true,
        }
    }

    /// Skip the tree/node sections (a volume that only supports id lookups)
    pub fn without_trie(mut self) -> Self {
        self.with_trie = false;
        self
    }

    /// Add a string, returning its id. Strings differing only by ASCII case share an id.
    pub fn insert(&mut self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let key = text.to_ascii_lowercase();
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(text.to_string());
        self.ids.insert(key, id);
        id
    }

    pub fn with(mut self, text: &str) -> Self {
        self.insert(text);
        self
    }

    pub fn build(&self) -> SectionBuilder {
        let mut data = Vec::new();
        let mut index = Vec::with_capacity(self.strings.len());
        for text in &self.strings {
            index.push(data.len() as u32);
            data.extend_from_slice(text.as_bytes());
            data.push(0);
        }

        let data_len = data.len();
        let mut volume = SectionBuilder::parent(&self.name)
            .with_child(SectionBuilder::leaf("data", data, data_len))
            .with_child(SectionBuilder::records("index", &index));

        if self.with_trie {
            let mut trie = TrieBuilder::default();
            let items: Vec<(&[u8], u32)> = self
                .ids
                .iter()
                .map(|(key, id)| (key.as_bytes(), *id))
                .collect();
            trie.build_node(&items, 0);
            volume.push(SectionBuilder::leaf(
                "tree",
                trie.tree_bytes,
                trie.tree_count,
            ));
            volume.push(SectionBuilder::leaf(
                "node",
                trie.node_bytes,
                trie.node_count,
            ));
        }
        volume
    }
}

#[derive(Default)]
struct TrieBuilder {
    tree_bytes: Vec<u8>,
    tree_count: usize,
    node_bytes: Vec<u8>,
    node_count: usize,
}

impl TrieBuilder {
    /// Build the node for `items` (sorted, lowercase) sharing their first `depth` bytes
    fn build_node(&mut self, items: &[(&[u8], u32)], depth: usize) -> u32 {
        let node = self.tree_count as u32;
        self.tree_bytes.extend_from_slice(&[0; 8]);
        self.tree_count += 1;

        // Group by the byte at `depth`; a finished word groups under 0
        let mut groups: Vec<(u8, Vec<(&[u8], u32)>)> = Vec::new();
        for &(key, id) in items {
            let character = key.get(depth).copied().unwrap_or(0);
            match groups.last_mut() {
                Some((last, group)) if *last == character => group.push((key, id)),
                _ => groups.push((character, vec![(key, id)])),
            }
        }

        // Reserve this node's contiguous edge run before recursing
        let first = self.node_count;
        self.node_bytes.resize(self.node_bytes.len() + groups.len() * 8, 0);
        self.node_count += groups.len();

        for (i, (character, group)) in groups.iter().enumerate() {
            let (flags, index) = if group.len() == 1 {
                (EDGE_STRING, group[0].1)
            } else {
                (EDGE_TREE, self.build_node(group, depth + 1))
            };
            let offset = (first + i) * 8;
            let edge = &mut self.node_bytes[offset..offset + 8];
            edge[0] = *character;
            edge[1] = flags;
            edge[4..8].copy_from_slice(&index.to_le_bytes());
        }

        let offset = node as usize * 8;
        let record = &mut self.tree_bytes[offset..offset + 8];
        record[0..4].copy_from_slice(&(first as u32).to_le_bytes());
        record[4..6].copy_from_slice(&(groups.len() as u16).to_le_bytes());
        record[6..8].copy_from_slice(&(depth as u16).to_le_bytes());
        node
    }
}

/// A square grid over one tile
pub struct GridBuilder {
    west: i32,
    south: i32,
    step_longitude: i32,
    step_latitude: i32,
    count_longitude: i32,
    count_latitude: i32,
    /// (position, count_points), kept sorted by position
    squares: BTreeMap<i32, i32>,
}

impl GridBuilder {
    pub fn new(
        origin: Position,
        step_longitude: i32,
        step_latitude: i32,
        count_longitude: i32,
        count_latitude: i32,
    ) -> Self {
        Self {
            west: origin.longitude,
            south: origin.latitude,
            step_longitude,
            step_latitude,
            count_longitude,
            count_latitude,
            squares: BTreeMap::new(),
        }
    }

    /// Populate cell (x, y)
    pub fn square(mut self, x: i32, y: i32, count_points: i32) -> Self {
        self.squares
            .insert(x * self.count_latitude + y, count_points);
        self
    }

    pub fn area(&self) -> Area {
        Area::new(
            self.west,
            self.south,
            self.west + self.step_longitude * self.count_longitude,
            self.south + self.step_latitude * self.count_latitude,
        )
    }

    /// Edges of grid cell (x, y)
    pub fn cell_area(&self, x: i32, y: i32) -> Area {
        let west = self.west + x * self.step_longitude;
        let south = self.south + y * self.step_latitude;
        Area::new(
            west,
            south,
            west + self.step_longitude,
            south + self.step_latitude,
        )
    }

    /// Grid positions of the populated squares, in square index order
    pub fn positions(&self) -> Vec<i32> {
        self.squares.keys().copied().collect()
    }

    pub fn build(&self) -> SectionBuilder {
        let mut global = Vec::new();
        self.area().encode(&mut global);
        for value in [
            self.step_longitude,
            self.step_latitude,
            self.count_longitude,
            self.count_latitude,
            self.squares.len() as i32,
        ] {
            value.encode(&mut global);
        }

        let mut data = Vec::new();
        for (&position, &count_points) in &self.squares {
            let x = position / self.count_latitude;
            let y = position % self.count_latitude;
            self.cell_area(x, y).encode(&mut data);
            position.encode(&mut data);
            count_points.encode(&mut data);
        }

        SectionBuilder::parent("square")
            .with_child(SectionBuilder::leaf("global", global, 1))
            .with_child(SectionBuilder::leaf("data", data, self.squares.len()))
    }
}

/// Features bucketed by square and category
pub struct FeatureBuilder {
    name: String,
    categories: usize,
    /// Per square: (category, feature count) in ascending category order
    squares: Vec<Vec<(u8, u32)>>,
    with_index2: bool,
}

impl FeatureBuilder {
    /// `name` is the section name ("line" or "point")
    pub fn new(name: &str, categories: usize) -> Self {
        Self {
            name: name.to_string(),
            categories,
            squares: Vec::new(),
            with_index2: false,
        }
    }

    /// Add the next square's (category, count) buckets
    pub fn square(mut self, buckets: &[(u8, u32)]) -> Self {
        let mut buckets = buckets.to_vec();
        buckets.sort_by_key(|(category, _)| *category);
        self.squares.push(buckets);
        self
    }

    /// Also write the second generation (index2 + bysquare2)
    pub fn with_index2(mut self) -> Self {
        self.with_index2 = true;
        self
    }

    /// Category of every feature id, in feature order
    pub fn feature_categories(&self) -> Vec<u8> {
        self.squares
            .iter()
            .flatten()
            .flat_map(|&(category, count)| std::iter::repeat_n(category, count as usize))
            .collect()
    }

    /// Square index of every feature id, in feature order
    pub fn feature_squares(&self) -> Vec<usize> {
        self.squares
            .iter()
            .enumerate()
            .flat_map(|(square, buckets)| {
                let total: u32 = buckets.iter().map(|(_, count)| count).sum();
                std::iter::repeat_n(square, total as usize)
            })
            .collect()
    }

    fn bysquare(&self) -> Vec<u8> {
        let mut rows = Vec::new();
        let mut next = 0i32;
        for buckets in &self.squares {
            let mut first = vec![-1i32; self.categories];
            let start = next;
            for &(category, count) in buckets {
                if count == 0 {
                    continue;
                }
                first[category as usize - 1] = next;
                next += count as i32;
            }
            for value in first {
                value.encode(&mut rows);
            }
            let last = if next > start { next - 1 } else { -1 };
            last.encode(&mut rows);
        }
        rows
    }

    /// Build the section; `data` supplies the record of each feature id
    pub fn build(&self, data: SectionBuilder) -> SectionBuilder {
        let rows = self.bysquare();
        let mut section = SectionBuilder::parent(&self.name)
            .with_child(data)
            .with_child(SectionBuilder::leaf(
                "bysquare1",
                rows.clone(),
                self.squares.len(),
            ));

        if self.with_index2 {
            // Same buckets, each bucket listed in reverse feature order
            let mut index2: Vec<u32> = Vec::new();
            let mut next = 0u32;
            for buckets in &self.squares {
                for &(_, count) in buckets {
                    index2.extend((next..next + count).rev());
                    next += count;
                }
            }
            section.push(SectionBuilder::records("index2", &index2));
            section.push(SectionBuilder::leaf(
                "bysquare2",
                rows,
                self.squares.len(),
            ));
        }
        section
    }

    /// Build a line section with synthetic (from, to) point ids
    pub fn build_lines(&self) -> SectionBuilder {
        let count = self.feature_categories().len() as u32;
        let lines: Vec<u32> = (0..count).flat_map(|id| [2 * id, 2 * id + 1]).collect();
        let mut data = Vec::new();
        for value in &lines {
            value.encode(&mut data);
        }
        self.build(SectionBuilder::leaf("data", data, count as usize))
    }

    /// Build a point section placing each point at the center of its square
    pub fn build_points(&self, grid: &GridBuilder) -> SectionBuilder {
        let positions = grid.positions();
        let points: Vec<Position> = self
            .feature_squares()
            .into_iter()
            .map(|square| {
                let position = positions[square];
                let cell = grid.cell_area(
                    position / grid.count_latitude,
                    position % grid.count_latitude,
                );
                Position::new(
                    (cell.west + cell.east) / 2,
                    (cell.south + cell.north) / 2,
                )
            })
            .collect();
        self.build(SectionBuilder::records("data", &points))
    }
}

/// Attribute triples referencing the "attributes" volume
pub fn metadata_section(
    attributes: &mut VolumeBuilder,
    triples: &[(&str, &str, &str)],
) -> SectionBuilder {
    let mut records = Vec::with_capacity(triples.len() * 3);
    for (category, name, value) in triples {
        records.push(attributes.insert(category));
        records.push(attributes.insert(name));
        records.push(attributes.insert(value));
    }
    let mut data = Vec::new();
    for value in &records {
        value.encode(&mut data);
    }
    SectionBuilder::parent("metadata").with_child(SectionBuilder::leaf(
        "attributes",
        data,
        triples.len(),
    ))
}

/// One degree in micro-degrees
pub const DEGREE: i32 = 1_000_000;

/// Street names of the sample tile, in id order starting at 1
pub const SAMPLE_STREETS: [&str; 5] = ["Main", "Maple", "Elm", "Elmwood", "Oak"];

/// The sample tile's grid: 2x2 degrees at (0, 0), one-degree steps, cells (0,0), (1,0) and
/// (1,1) populated
pub fn sample_grid() -> GridBuilder {
    GridBuilder::new(Position::new(0, 0), DEGREE, DEGREE, 2, 2)
        .square(0, 0, 3)
        .square(1, 0, 2)
        .square(1, 1, 4)
}

/// Line buckets of the sample tile (3 categories, category 2 empty in square 1)
pub fn sample_lines() -> FeatureBuilder {
    FeatureBuilder::new("line", 3)
        .square(&[(1, 2), (2, 1)])
        .square(&[(1, 1), (3, 3)])
        .square(&[(1, 3), (2, 2)])
        .with_index2()
}

/// Point buckets of the sample tile (2 categories, first generation only)
pub fn sample_points() -> FeatureBuilder {
    FeatureBuilder::new("point", 2)
        .square(&[(1, 1)])
        .square(&[(2, 2)])
        .square(&[(1, 1), (2, 1)])
}

/// A complete synthetic tile: dictionary, square grid, lines, points and metadata
pub fn sample_map() -> MapBuilder {
    let mut streets = VolumeBuilder::new("street");
    for name in SAMPLE_STREETS {
        streets.insert(name);
    }
    let mut attributes = VolumeBuilder::new("attributes");
    let metadata = metadata_section(
        &mut attributes,
        &[
            ("Territory", "Id", "usc00001"),
            ("Territory", "Name", "Sample County"),
            ("Version", "Date", "2026-01-01"),
        ],
    );

    let grid = sample_grid();
    MapBuilder::new()
        .with_section(
            SectionBuilder::parent("string")
                .with_child(attributes.build())
                .with_child(streets.build()),
        )
        .with_section(grid.build())
        .with_section(sample_lines().build_lines())
        .with_section(sample_points().build_points(&grid))
        .with_section(metadata)
}
