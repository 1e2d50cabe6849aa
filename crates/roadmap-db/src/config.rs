//! Configuration shared by the standard section handlers

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for the standard handlers
///
/// These values only tune how already-validated data is served; they never change what a map
/// file is allowed to contain.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
    /// Grid cells per populated square below which the square index resolves grid positions
    /// through a dense lookup table. At or above it, a bitmap plus a linear scan is used.
    /// Default: 50
    pub dense_ratio_threshold: u32,
    /// Maximum number of squares returned by a visible-squares query. Larger windows are
    /// truncated and logged.
    /// Default: 4096
    pub max_visible_squares: usize,
    /// Maximum number of categories served per square. Extra categories in a map file are
    /// logged and ignored by category lookups.
    /// Default: 64
    pub max_categories: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dense_ratio_threshold: 50,
            max_visible_squares: 4096,
            max_categories: 64,
        }
    }
}
