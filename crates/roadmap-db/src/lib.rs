//! RoadMap Map Database - Read-only access to compiled map files
//!
//! A map file is produced once by the map builder and never modified afterwards. This library
//! memory-maps it, walks its tree of named sections and hands each top-level section to a
//! caller-supplied handler that interprets the raw records.
//!
//! # Architecture
//!
//! - **[`SectionStore`]**: Memory-mapped file plus the parsed section tree
//! - **[`Model`] / [`Handler`]**: Section name to handler table, invoked while opening a file
//! - **[`Database`] / [`MapSession`]**: Open files and their mapped handler contexts
//! - **[`Dictionary`]**: String volumes stored as a flat character trie
//! - **[`SquareIndex`]**: Uniform grid of populated squares over the map tile
//! - **[`FeatureIndex`]**: Per-square, per-category ranges into the line and point tables
//!
//! # Validation
//!
//! Every structural check runs while a file is opened. Once [`Database::open`] succeeds, the
//! query operations can only answer "not found" (`None`), never fail.

mod config;
mod database;
pub mod dictionary;
pub mod feature;
#[cfg(any(test, feature = "fixture"))]
pub mod fixture;
pub mod geometry;
pub mod metadata;
mod model;
mod record;
mod section;
pub mod square;

// Public API exports
pub use config::Config;
pub use database::{Database, MapSession};
pub use dictionary::{Cursor, Dictionary, DictionaryHandler, StringId, Volume};
pub use feature::{CategoryIndex, FeatureIds, FeatureIndex, FeatureIndexHandler, FeatureKind, Generation, Line};
pub use geometry::{Area, Position};
pub use metadata::{Attribute, Metadata, MetadataHandler};
pub use model::{Handler, Model};
pub use record::{Record, SectionData, Table};
pub use section::{Section, SectionId, SectionStore};
pub use square::{GridParameters, ResolverKind, Square, SquareIndex, SquareIndexHandler, SquareRef};

use std::path::PathBuf;

/// Error types for loading map files
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad file header: {0}")]
    BadHeader(String),

    #[error("Map file was built with the opposite byte order")]
    ByteOrder,

    #[error("Corrupted section '{section}': {reason}")]
    Corrupt { section: String, reason: String },

    #[error(
        "Section '{section}' declares {count} records of {record_size} bytes but holds {size} bytes"
    )]
    RecordSize {
        section: String,
        size: usize,
        count: usize,
        record_size: usize,
    },

    #[error("Invalid context type for handler '{handler}'")]
    ContextType { handler: String },

    #[error("Map file is not open: {}", .0.display())]
    NotOpen(PathBuf),
}

impl DbError {
    pub(crate) fn corrupt(section: impl Into<String>, reason: impl Into<String>) -> Self {
        DbError::Corrupt {
            section: section.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
