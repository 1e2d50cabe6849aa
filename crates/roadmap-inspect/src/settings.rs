use clap::{Parser, Subcommand, ValueEnum};
use roadmap_db::{Config, FeatureKind, Generation};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// RoadMap Inspect - Examine and verify compiled map files
pub struct Settings {
    /// Map file to open
    #[clap(value_name = "FILE")]
    pub file: PathBuf,

    /// Grid cells per populated square below which grid lookups use a dense table
    #[clap(long, default_value = "50")]
    pub dense_ratio_threshold: u32,

    /// Maximum number of squares returned by a window query
    #[clap(long, default_value = "4096")]
    pub max_visible_squares: usize,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the section tree
    Tree,

    /// Print one string of a dictionary volume
    Lookup {
        #[clap(long)]
        volume: String,
        #[clap(long)]
        id: u32,
    },

    /// List the strings of a volume starting with a prefix
    Search {
        #[clap(long)]
        volume: String,
        prefix: String,
        #[clap(long, default_value = "20")]
        limit: usize,
    },

    /// Find the square holding a position (degrees)
    Locate {
        #[clap(long, allow_hyphen_values = true)]
        lon: f64,
        #[clap(long, allow_hyphen_values = true)]
        lat: f64,
    },

    /// List the features of one category in one square
    Features {
        #[clap(long)]
        square: u32,
        /// Category code, starting at 1
        #[clap(long)]
        category: u8,
        #[clap(long, default_value = "1", value_parser = clap::value_parser!(u8).range(1..=2))]
        generation: u8,
        #[clap(long, value_enum, default_value = "line")]
        kind: Kind,
    },

    /// Check every string and square of the file
    Verify,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Line,
    Point,
}

impl From<Kind> for FeatureKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Line => FeatureKind::Line,
            Kind::Point => FeatureKind::Point,
        }
    }
}

impl Settings {
    /// Handler configuration for the standard model
    pub fn config(&self) -> Config {
        Config {
            dense_ratio_threshold: self.dense_ratio_threshold,
            max_visible_squares: self.max_visible_squares,
            ..Config::default()
        }
    }
}

/// Generation from its command line number
pub fn generation(number: u8) -> Generation {
    if number == 2 {
        Generation::Two
    } else {
        Generation::One
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locate() {
        let settings =
            Settings::parse_from(["roadmap-inspect", "tile.rdm", "locate", "--lon", "-1.5", "--lat", "2"]);
        assert_eq!(settings.file, PathBuf::from("tile.rdm"));
        assert_eq!(settings.command, Command::Locate { lon: -1.5, lat: 2.0 });
        assert_eq!(settings.config(), Config::default());
    }

    #[test]
    fn test_parse_features_defaults() {
        let settings = Settings::parse_from([
            "roadmap-inspect",
            "--max-visible-squares",
            "10",
            "tile.rdm",
            "features",
            "--square",
            "1",
            "--category",
            "3",
        ]);
        assert_eq!(
            settings.command,
            Command::Features {
                square: 1,
                category: 3,
                generation: 1,
                kind: Kind::Line,
            }
        );
        assert_eq!(settings.config().max_visible_squares, 10);
    }

    #[test]
    fn test_generation_out_of_range() {
        let result = Settings::try_parse_from([
            "roadmap-inspect",
            "tile.rdm",
            "features",
            "--square",
            "0",
            "--category",
            "1",
            "--generation",
            "3",
        ]);
        assert!(result.is_err());
        assert_eq!(generation(2), Generation::Two);
        assert_eq!(generation(1), Generation::One);
    }
}
