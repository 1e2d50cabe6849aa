//! RoadMap Inspect - Command-line access to compiled map files

mod commands;
mod settings;

use clap::Parser;
use settings::Settings;
use std::path::PathBuf;
use std::process::ExitCode;

/// Error types for the inspector
#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("Map database error: {0}")]
    Db(#[from] roadmap_db::DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a map file path: {}", .0.display())]
    BadPath(PathBuf),

    #[error("Section '{0}' is missing from the map file")]
    MissingSection(&'static str),

    #[error("Unknown dictionary volume '{0}'")]
    UnknownVolume(String),

    #[error("Verification found {0} problems")]
    Verify(usize),
}

/// Log to stderr, filtered by RUST_LOG (default "info")
fn setup_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let settings = Settings::parse();
    setup_logging();
    tracing::debug!(?settings, "Parsed settings");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match commands::run(&settings, &mut out) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
