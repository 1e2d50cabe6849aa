//! Square grid spatial index
//!
//! A map tile is cut into a uniform grid of `count_longitude x count_latitude` cells. Only the
//! populated cells ("squares") are stored, densely and sorted by grid position
//! (`x * count_latitude + y`). Resolving a grid position to a square index goes through a
//! resolver picked when the file is mapped:
//!
//! - **Dense**: a lookup table over the whole grid, for tiles where most cells are populated
//! - **Sparse**: an occupancy bitmap plus a linear scan of the squares, starting from the
//!   last hit (consecutive lookups rarely leave the neighborhood)

use crate::geometry::{Area, Position};
use crate::model::Handler;
use crate::record::{Record, Table, read_i32};
use crate::section::{SectionId, SectionStore};
use crate::{Config, DbError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Section name of the square index
pub const SECTION: &str = "square";

/// Largest grid accepted, which bounds the resolver tables built when a tile is mapped
const MAX_GRID_CELLS: u64 = 1 << 24;

/// Grid layout of one tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GridParameters {
    /// Bounding area of the whole tile
    pub area: Area,
    pub step_longitude: i32,
    pub step_latitude: i32,
    pub count_longitude: i32,
    pub count_latitude: i32,
    /// Number of populated squares
    pub count_squares: i32,
}

impl Record for GridParameters {
    const SIZE: usize = 36;

    fn decode(bytes: &[u8]) -> Self {
        Self {
            area: decode_area(bytes),
            step_longitude: read_i32(bytes, 16),
            step_latitude: read_i32(bytes, 20),
            count_longitude: read_i32(bytes, 24),
            count_latitude: read_i32(bytes, 28),
            count_squares: read_i32(bytes, 32),
        }
    }
}

impl GridParameters {
    /// Total number of grid cells
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.count_longitude as usize * self.count_latitude as usize
    }

    /// Grid position of cell (x, y), if it lies inside the grid
    #[inline]
    pub fn grid_position(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x >= self.count_longitude as i64 || y >= self.count_latitude as i64 {
            return None;
        }
        Some((x * self.count_latitude as i64 + y) as usize)
    }

    /// Column of a longitude, clamped to the grid
    #[inline]
    fn column(&self, longitude: i32) -> i64 {
        ((longitude as i64 - self.area.west as i64) / self.step_longitude as i64)
            .clamp(0, self.count_longitude as i64 - 1)
    }

    /// Row of a latitude, clamped to the grid
    #[inline]
    fn row(&self, latitude: i32) -> i64 {
        ((latitude as i64 - self.area.south as i64) / self.step_latitude as i64)
            .clamp(0, self.count_latitude as i64 - 1)
    }
}

/// One populated grid cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Square {
    /// Recorded edges (may differ slightly from the nominal cell because of rounding)
    pub edges: Area,
    /// Grid position (`x * count_latitude + y`)
    pub position: i32,
    /// Number of points inside the square
    pub count_points: i32,
}

impl Record for Square {
    const SIZE: usize = 24;

    fn decode(bytes: &[u8]) -> Self {
        Self {
            edges: decode_area(bytes),
            position: read_i32(bytes, 16),
            count_points: read_i32(bytes, 20),
        }
    }
}

fn decode_area(bytes: &[u8]) -> Area {
    Area::new(
        read_i32(bytes, 0),
        read_i32(bytes, 4),
        read_i32(bytes, 8),
        read_i32(bytes, 12),
    )
}

/// Result of locating a position in a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SquareRef {
    /// Index of a populated square
    Square(u32),
    /// Inside the tile but in no populated square; query the whole tile
    Global,
    /// Outside the tile
    Other,
}

/// Representation chosen for grid position lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverKind {
    Dense,
    Sparse,
}

/// Sentinel for an empty lookup cache
const NO_CACHE: u64 = u64::MAX;

/// Grid position to square index mapping
#[derive(Debug)]
enum Resolver {
    /// Square index + 1 per grid cell, 0 = empty
    Dense(Vec<u32>),
    /// One bit per grid cell, plus the last (grid position, square index) hit
    Sparse { bitmap: Vec<u64>, last: AtomicU64 },
}

impl Resolver {
    fn dense(grid: &GridParameters, squares: &Table<Square>) -> Self {
        let mut table = vec![0u32; grid.cell_count()];
        for (index, square) in squares.iter().enumerate() {
            table[square.position as usize] = index as u32 + 1;
        }
        Resolver::Dense(table)
    }

    fn sparse(grid: &GridParameters, squares: &Table<Square>) -> Self {
        let mut bitmap = vec![0u64; grid.cell_count().div_ceil(64)];
        for square in squares.iter() {
            let position = square.position as usize;
            bitmap[position / 64] |= 1 << (position % 64);
        }
        Resolver::Sparse {
            bitmap,
            last: AtomicU64::new(NO_CACHE),
        }
    }

    fn kind(&self) -> ResolverKind {
        match self {
            Resolver::Dense(_) => ResolverKind::Dense,
            Resolver::Sparse { .. } => ResolverKind::Sparse,
        }
    }

    fn resolve(&self, squares: &Table<Square>, position: usize) -> Option<u32> {
        match self {
            Resolver::Dense(table) => table.get(position)?.checked_sub(1),
            Resolver::Sparse { bitmap, last } => {
                if bitmap.get(position / 64)? & (1 << (position % 64)) == 0 {
                    return None;
                }

                let cached = last.load(Ordering::Relaxed);
                let (start, forward) = if cached == NO_CACHE {
                    (0, true)
                } else {
                    let cached_position = (cached >> 32) as usize;
                    let cached_index = (cached & 0xffff_ffff) as usize;
                    if cached_position == position {
                        return Some(cached_index as u32);
                    }
                    (cached_index, position > cached_position)
                };

                // Squares are sorted by position, so scan towards the target from the last hit
                let found = if forward {
                    (start..squares.len()).find(|&i| {
                        squares.get(i).is_some_and(|s| s.position as usize == position)
                    })
                } else {
                    (0..=start).rev().find(|&i| {
                        squares.get(i).is_some_and(|s| s.position as usize == position)
                    })
                }?;

                last.store(
                    ((position as u64) << 32) | found as u64,
                    Ordering::Relaxed,
                );
                Some(found as u32)
            }
        }
    }
}

/// Cells of width `step` needed to cover `start..=end`, at least one
fn cells_across(start: i32, end: i32, step: i32) -> i64 {
    let span = end as i64 - start as i64;
    (span + step as i64 - 1).div_euclid(step as i64).max(1)
}

/// The square grid of one tile
#[derive(Debug)]
pub struct SquareIndex {
    grid: GridParameters,
    squares: Table<Square>,
    resolver: Resolver,
    max_visible_squares: usize,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SquareIndex {
    fn map(store: &SectionStore, section: SectionId, config: &Config) -> Result<Self> {
        let global = store
            .child_table::<GridParameters>(section, "global")?
            .ok_or_else(|| DbError::corrupt(SECTION, "no global section"))?;
        let grid = match (global.len(), global.get(0)) {
            (1, Some(grid)) => grid,
            (count, _) => {
                return Err(DbError::corrupt(
                    SECTION,
                    format!("expected one global record, found {count}"),
                ));
            }
        };
        let squares = store
            .child_table::<Square>(section, "data")?
            .ok_or_else(|| DbError::corrupt(SECTION, "no data section"))?;

        Self::validate(&grid, &squares)?;

        let ratio = grid.cell_count() / squares.len().max(1);
        let resolver = if !squares.is_empty() && ratio < config.dense_ratio_threshold as usize {
            Resolver::dense(&grid, &squares)
        } else {
            Resolver::sparse(&grid, &squares)
        };

        tracing::debug!(
            squares = squares.len(),
            cells = grid.cell_count(),
            resolver = ?resolver.kind(),
            "Mapped square index"
        );

        Ok(Self {
            grid,
            squares,
            resolver,
            max_visible_squares: config.max_visible_squares,
        })
    }

    fn validate(grid: &GridParameters, squares: &Table<Square>) -> Result<()> {
        if grid.step_longitude <= 0
            || grid.step_latitude <= 0
            || grid.count_longitude <= 0
            || grid.count_latitude <= 0
        {
            return Err(DbError::corrupt(SECTION, "grid steps and counts must be positive"));
        }
        if !grid.area.is_valid() {
            return Err(DbError::corrupt(SECTION, "tile edges are inverted"));
        }
        let expected = (
            cells_across(grid.area.west, grid.area.east, grid.step_longitude),
            cells_across(grid.area.south, grid.area.north, grid.step_latitude),
        );
        if expected != (grid.count_longitude as i64, grid.count_latitude as i64) {
            return Err(DbError::corrupt(
                SECTION,
                format!(
                    "{}x{} grid does not match the tile edges, expected {}x{}",
                    grid.count_longitude, grid.count_latitude, expected.0, expected.1
                ),
            ));
        }
        let cells = grid.count_longitude as u64 * grid.count_latitude as u64;
        if cells > MAX_GRID_CELLS {
            return Err(DbError::corrupt(
                SECTION,
                format!("{cells} grid cells, at most {MAX_GRID_CELLS} supported"),
            ));
        }
        if grid.count_squares < 0
            || grid.count_squares as usize != squares.len()
            || squares.len() as u64 > cells
        {
            return Err(DbError::corrupt(
                SECTION,
                format!(
                    "{} squares declared, {} stored, {cells} grid cells",
                    grid.count_squares,
                    squares.len()
                ),
            ));
        }

        let mut previous = -1;
        for (index, square) in squares.iter().enumerate() {
            if square.position <= previous || square.position as u64 >= cells {
                return Err(DbError::corrupt(
                    SECTION,
                    format!("square {index} has position {} out of order", square.position),
                ));
            }
            if !square.edges.is_valid() {
                return Err(DbError::corrupt(
                    SECTION,
                    format!("square {index} has inverted edges"),
                ));
            }
            previous = square.position;
        }
        Ok(())
    }

    /// Grid layout of the tile
    #[inline]
    pub fn grid_parameters(&self) -> &GridParameters {
        &self.grid
    }

    /// Bounding area of the whole tile
    #[inline]
    pub fn area(&self) -> Area {
        self.grid.area
    }

    /// Number of populated squares
    #[inline]
    pub fn square_count(&self) -> usize {
        self.squares.len()
    }

    #[inline]
    pub fn resolver_kind(&self) -> ResolverKind {
        self.resolver.kind()
    }

    /// Square record by index
    #[inline]
    pub fn square(&self, index: u32) -> Option<Square> {
        self.squares.get(index as usize)
    }

    /// All squares in index order
    pub fn squares(&self) -> impl Iterator<Item = Square> + '_ {
        self.squares.iter()
    }

    /// Square index of a grid position, `None` for an empty cell
    #[inline]
    pub fn resolve(&self, grid_position: usize) -> Option<u32> {
        self.resolver.resolve(&self.squares, grid_position)
    }

    /// Find the square containing `position`
    ///
    /// The computed cell is checked first, then its four neighbors, because rounding in the
    /// map builder can leave a point just outside its nominal cell. The first square whose
    /// recorded edges contain the point wins, so a point on a shared edge maps to exactly one
    /// square.
    pub fn locate(&self, position: Position) -> SquareRef {
        if !self.grid.area.contains(position) {
            return SquareRef::Other;
        }

        let x = self.grid.column(position.longitude);
        let y = self.grid.row(position.latitude);
        let candidates = [(x, y), (x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)];

        candidates
            .into_iter()
            .filter_map(|(x, y)| self.grid.grid_position(x, y))
            .filter_map(|grid_position| self.resolve(grid_position))
            .find(|&index| {
                self.square(index)
                    .is_some_and(|square| square.edges.contains(position))
            })
            .map_or(SquareRef::Global, SquareRef::Square)
    }

    /// Edges of a square; the whole tile for [`SquareRef::Global`]
    pub fn edges(&self, square: SquareRef) -> Option<Area> {
        match square {
            SquareRef::Square(index) => self.square(index).map(|s| s.edges),
            SquareRef::Global => Some(self.grid.area),
            SquareRef::Other => None,
        }
    }

    /// West/south corner of a square
    pub fn min_corner(&self, square: SquareRef) -> Option<Position> {
        self.edges(square).map(|edges| edges.min_corner())
    }

    /// Number of points in a square; the tile total for [`SquareRef::Global`]
    pub fn count_points(&self, square: SquareRef) -> Option<i64> {
        match square {
            SquareRef::Square(index) => self.square(index).map(|s| s.count_points as i64),
            SquareRef::Global => Some(self.squares().map(|s| s.count_points as i64).sum()),
            SquareRef::Other => None,
        }
    }

    /// Indices of the populated squares intersecting `view`, in index order
    ///
    /// The result is truncated to the configured maximum.
    pub fn visible_squares(&self, view: &Area) -> Vec<u32> {
        let mut visible = Vec::new();
        if !view.is_valid() || !view.intersects(&self.grid.area) {
            return visible;
        }

        let west = view.west.max(self.grid.area.west);
        let east = view.east.min(self.grid.area.east);
        let south = view.south.max(self.grid.area.south);
        let north = view.north.min(self.grid.area.north);

        // One extra cell on each side catches squares whose recorded edges spill over
        let x_range = (self.grid.column(west) - 1).max(0)
            ..=(self.grid.column(east) + 1).min(self.grid.count_longitude as i64 - 1);
        let y_range = (self.grid.row(south) - 1).max(0)
            ..=(self.grid.row(north) + 1).min(self.grid.count_latitude as i64 - 1);

        for x in x_range {
            for y in y_range.clone() {
                let Some(index) = self
                    .grid
                    .grid_position(x, y)
                    .and_then(|grid_position| self.resolve(grid_position))
                else {
                    continue;
                };
                if !self.square(index).is_some_and(|s| s.edges.intersects(view)) {
                    continue;
                }
                if visible.len() >= self.max_visible_squares {
                    tracing::error!(
                        limit = self.max_visible_squares,
                        "Too many visible squares, result truncated"
                    );
                    return visible;
                }
                visible.push(index);
            }
        }
        visible
    }

    /// Squares with at least one point within `radius_meters` of `center`
    pub fn squares_near(&self, center: Position, radius_meters: f64) -> Vec<u32> {
        let mut near = self.visible_squares(&Area::around(center, radius_meters));
        near.retain(|&index| {
            self.square(index).is_some_and(|square| {
                square.edges.nearest(center).distance_meters(center) <= radius_meters
            })
        });
        near
    }
}

/// Handler mapping the "square" section into a [`SquareIndex`]
#[derive(Debug, Clone, Default)]
pub struct SquareIndexHandler {
    config: Config,
}

impl SquareIndexHandler {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl Handler for SquareIndexHandler {
    type Context = SquareIndex;

    fn map(&self, store: &SectionStore, section: SectionId) -> Result<SquareIndex> {
        SquareIndex::map(store, section, &self.config)
    }
}
