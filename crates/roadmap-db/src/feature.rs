//! Category bucketed feature index
//!
//! Lines and points are stored in flat tables, grouped by square and, inside a square, by
//! category. A "bysquare" table holds one row per populated square: the first feature of each
//! category (`-1` when the category is empty) followed by the square's last feature. The end
//! of a category is found by scanning forward to the next non-empty category, so rows never
//! store counts.
//!
//! A tile may carry a second generation of the index over a different feature ordering. Its
//! ranges point into an indirection table (`index2`) rather than at the features directly.

use crate::geometry::Position;
use crate::model::Handler;
use crate::record::{Record, SectionData, Table, read_i32, read_u32};
use crate::section::{SectionId, SectionStore};
use crate::square;
use crate::{Config, DbError, Result};
use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Which flat table a feature index covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FeatureKind {
    Line,
    Point,
}

impl FeatureKind {
    /// Top-level section holding this kind of feature
    pub fn section(self) -> &'static str {
        match self {
            FeatureKind::Line => "line",
            FeatureKind::Point => "point",
        }
    }
}

/// A line between two point ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Line {
    pub from: u32,
    pub to: u32,
}

impl Record for Line {
    const SIZE: usize = 8;

    fn decode(bytes: &[u8]) -> Self {
        Self {
            from: read_u32(bytes, 0),
            to: read_u32(bytes, 4),
        }
    }
}

impl Record for Position {
    const SIZE: usize = 8;

    fn decode(bytes: &[u8]) -> Self {
        Position::new(read_i32(bytes, 0), read_i32(bytes, 4))
    }
}

/// Generation of the by-square index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Ranges address the feature table directly
    One,
    /// Ranges address the `index2` indirection table
    Two,
}

#[derive(Debug)]
enum Features {
    Lines(Table<Line>),
    Points(Table<Position>),
}

impl Features {
    fn len(&self) -> usize {
        match self {
            Features::Lines(table) => table.len(),
            Features::Points(table) => table.len(),
        }
    }
}

/// One generation of per-square category ranges
#[derive(Debug)]
pub struct CategoryIndex {
    rows: SectionData,
    squares: usize,
    /// Categories stored per row
    categories: usize,
    /// Categories answered by lookups
    served: usize,
    indirection: Option<Table<u32>>,
}

impl CategoryIndex {
    fn map(
        store: &SectionStore,
        id: SectionId,
        target_len: usize,
        populated: Option<usize>,
        indirection: Option<Table<u32>>,
        config: &Config,
    ) -> Result<Self> {
        let section = store.section(id);
        let name = section.name().to_string();
        let squares = section.count();
        if let Some(populated) = populated.filter(|&populated| populated != squares) {
            return Err(DbError::corrupt(
                name,
                format!("{squares} rows for {populated} populated squares"),
            ));
        }

        let categories = if squares == 0 {
            0
        } else {
            let row_size = section.size() / squares;
            if row_size < 8 || row_size % 4 != 0 {
                return Err(DbError::RecordSize {
                    section: name,
                    size: section.size(),
                    count: squares,
                    record_size: row_size,
                });
            }
            row_size / 4 - 1
        };
        store.check_records(id, 4 * (categories + 1))?;

        let served = if categories > config.max_categories {
            tracing::error!(
                section = %name,
                categories,
                limit = config.max_categories,
                "Too many categories, extra categories ignored"
            );
            config.max_categories
        } else {
            categories
        };

        let index = Self {
            rows: store.data(id),
            squares,
            categories,
            served,
            indirection,
        };
        index.validate(&name, target_len)?;
        Ok(index)
    }

    fn validate(&self, name: &str, target_len: usize) -> Result<()> {
        for square in 0..self.squares {
            let mut previous = -1;
            for category in 0..self.categories {
                let first = self.first(square, category);
                if first < 0 {
                    continue;
                }
                if first < previous {
                    return Err(DbError::corrupt(
                        name,
                        format!("square {square}: category {} starts before the previous one", category + 1),
                    ));
                }
                previous = first;
            }

            let last = self.last(square);
            if previous >= 0 && (last < previous || last as usize >= target_len) {
                return Err(DbError::corrupt(
                    name,
                    format!("square {square}: range {previous}..={last} outside {target_len} entries"),
                ));
            }
        }
        Ok(())
    }

    #[inline]
    fn row_size(&self) -> usize {
        4 * (self.categories + 1)
    }

    /// First entry of a 0-based category, negative when empty
    #[inline]
    fn first(&self, square: usize, category: usize) -> i32 {
        read_i32(self.rows.as_slice(), square * self.row_size() + 4 * category)
    }

    #[inline]
    fn last(&self, square: usize) -> i32 {
        read_i32(self.rows.as_slice(), square * self.row_size() + 4 * self.categories)
    }

    /// Number of squares with a row
    #[inline]
    pub fn square_count(&self) -> usize {
        self.squares
    }

    /// Number of categories answered by lookups
    #[inline]
    pub fn category_count(&self) -> usize {
        self.served
    }

    /// Whether ranges go through the `index2` indirection
    #[inline]
    pub fn is_indirect(&self) -> bool {
        self.indirection.is_some()
    }

    /// Inclusive range of entries holding `category` (1-based) in `square`
    pub fn in_square(&self, square: u32, category: u8) -> Option<(u32, u32)> {
        let square = square as usize;
        let category = category as usize;
        if square >= self.squares || category == 0 || category > self.served {
            return None;
        }

        let first = self.first(square, category - 1);
        if first < 0 {
            return None;
        }
        // The next non-empty category bounds this one, even past the served ones
        let end = (category..self.categories)
            .map(|next| self.first(square, next))
            .find(|&next| next >= 0)
            .map_or_else(|| self.last(square), |next| next - 1);
        (end >= first).then_some((first as u32, end as u32))
    }

    /// Inclusive range of all entries of `square`
    pub fn square_range(&self, square: u32) -> Option<(u32, u32)> {
        let square = square as usize;
        if square >= self.squares {
            return None;
        }
        let first = (0..self.categories)
            .map(|category| self.first(square, category))
            .find(|&first| first >= 0)?;
        Some((first as u32, self.last(square) as u32))
    }

    /// Feature ids of an inclusive entry range
    fn ids(&self, range: Option<(u32, u32)>) -> FeatureIds<'_> {
        FeatureIds {
            entries: range.map_or(0..0, |(first, last)| first..last + 1),
            indirection: self.indirection.as_ref(),
        }
    }
}

/// Feature ids of one bucket, with the generation's indirection applied
#[derive(Debug, Clone)]
pub struct FeatureIds<'a> {
    entries: Range<u32>,
    indirection: Option<&'a Table<u32>>,
}

impl Iterator for FeatureIds<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let entry = self.entries.next()?;
        match self.indirection {
            Some(table) => table.get(entry as usize),
            None => Some(entry),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

/// Lines or points of a tile and their by-square category indices
#[derive(Debug)]
pub struct FeatureIndex {
    kind: FeatureKind,
    features: Features,
    index1: Option<CategoryIndex>,
    index2: Option<CategoryIndex>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl FeatureIndex {
    fn map(
        store: &SectionStore,
        section: SectionId,
        kind: FeatureKind,
        config: &Config,
    ) -> Result<Self> {
        let name = kind.section();
        let features = match kind {
            FeatureKind::Line => store.child_table::<Line>(section, "data")?.map(Features::Lines),
            FeatureKind::Point => store
                .child_table::<Position>(section, "data")?
                .map(Features::Points),
        }
        .ok_or_else(|| DbError::corrupt(name, "no data section"))?;
        let count = features.len();
        // Rows must line up with the tile's squares; a file without a grid has nothing to check
        let populated = store
            .find(&format!("{}/data", square::SECTION))
            .map(|id| store.section(id).count());

        let index1 = store
            .child(section, "bysquare1")
            .map(|id| CategoryIndex::map(store, id, count, populated, None, config))
            .transpose()?;

        let indirection = store.child_table::<u32>(section, "index2")?;
        let index2 = match (store.child(section, "bysquare2"), indirection) {
            (Some(id), Some(indirection)) => {
                if let Some(entry) = indirection.iter().position(|feature| feature as usize >= count) {
                    return Err(DbError::corrupt(
                        name,
                        format!("index2 entry {entry} points past {count} features"),
                    ));
                }
                let len = indirection.len();
                Some(CategoryIndex::map(store, id, len, populated, Some(indirection), config)?)
            }
            (Some(_), None) => return Err(DbError::corrupt(name, "bysquare2 without index2")),
            (None, Some(_)) => {
                tracing::warn!(section = name, "index2 without bysquare2, ignored");
                None
            }
            (None, None) => None,
        };

        if index1.is_none() && index2.is_none() {
            tracing::warn!(section = name, "No by-square index");
        }
        tracing::debug!(
            section = name,
            features = count,
            index1 = index1.is_some(),
            index2 = index2.is_some(),
            "Mapped feature index"
        );

        Ok(Self {
            kind,
            features,
            index1,
            index2,
        })
    }

    #[inline]
    pub fn kind(&self) -> FeatureKind {
        self.kind
    }

    /// Number of features in the flat table
    #[inline]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Line by id (`None` for a point index)
    pub fn line(&self, id: u32) -> Option<Line> {
        match &self.features {
            Features::Lines(table) => table.get(id as usize),
            Features::Points(_) => None,
        }
    }

    /// Point by id (`None` for a line index)
    pub fn point(&self, id: u32) -> Option<Position> {
        match &self.features {
            Features::Points(table) => table.get(id as usize),
            Features::Lines(_) => None,
        }
    }

    pub fn index1(&self) -> Option<&CategoryIndex> {
        self.index1.as_ref()
    }

    pub fn index2(&self) -> Option<&CategoryIndex> {
        self.index2.as_ref()
    }

    pub fn generation(&self, generation: Generation) -> Option<&CategoryIndex> {
        match generation {
            Generation::One => self.index1(),
            Generation::Two => self.index2(),
        }
    }

    /// Categories answered by the first available generation
    pub fn category_count(&self) -> usize {
        self.index1
            .as_ref()
            .or(self.index2.as_ref())
            .map_or(0, CategoryIndex::category_count)
    }

    /// Inclusive range of `category` (1-based) in `square`, in the generation's entry space
    pub fn in_square(&self, generation: Generation, square: u32, category: u8) -> Option<(u32, u32)> {
        self.generation(generation)?.in_square(square, category)
    }

    /// Inclusive range of all entries of `square`
    pub fn square_range(&self, generation: Generation, square: u32) -> Option<(u32, u32)> {
        self.generation(generation)?.square_range(square)
    }

    /// Ids of the features of `category` in `square`
    ///
    /// Empty when the generation is absent or the category has no features there.
    pub fn features(&self, generation: Generation, square: u32, category: u8) -> FeatureIds<'_> {
        match self.generation(generation) {
            Some(index) => index.ids(index.in_square(square, category)),
            None => FeatureIds {
                entries: 0..0,
                indirection: None,
            },
        }
    }
}

/// Handler mapping a "line" or "point" section into a [`FeatureIndex`]
#[derive(Debug, Clone)]
pub struct FeatureIndexHandler {
    kind: FeatureKind,
    config: Config,
}

impl FeatureIndexHandler {
    pub fn new(kind: FeatureKind, config: Config) -> Self {
        Self { kind, config }
    }
}

impl Handler for FeatureIndexHandler {
    type Context = FeatureIndex;

    fn map(&self, store: &SectionStore, section: SectionId) -> Result<FeatureIndex> {
        FeatureIndex::map(store, section, self.kind, &self.config)
    }
}
