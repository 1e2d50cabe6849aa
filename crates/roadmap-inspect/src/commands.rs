//! Implementation of the inspector subcommands
//!
//! Every command writes its report to the given writer, so tests can capture it.

use crate::InspectError;
use crate::settings::{Command, Settings, generation};
use rayon::prelude::*;
use roadmap_db::square::SECTION as SQUARE_SECTION;
use roadmap_db::{
    Database, DbError, Dictionary, FeatureIndex, FeatureKind, Generation, MapSession, Model, Position,
    SquareIndex, SquareRef, Volume,
};
use std::io::Write;
use std::path::Path;

type Result<T> = std::result::Result<T, InspectError>;

/// Open the file of `settings` and run its command
pub fn run(settings: &Settings, out: &mut impl Write) -> Result<()> {
    let mut db = Database::new();
    let model = Model::standard(settings.config());
    let directory = settings.file.parent().unwrap_or(Path::new("."));
    let filename = settings
        .file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| InspectError::BadPath(settings.file.clone()))?;
    db.open(directory, filename, &model)?;
    let path = directory.join(filename);
    db.activate(&path)?;
    let session = db
        .session(&path)
        .ok_or_else(|| DbError::NotOpen(path.clone()))?;

    match &settings.command {
        Command::Tree => tree(session, out),
        Command::Lookup { volume, id } => lookup(volume_of(session, volume)?, *id, out),
        Command::Search {
            volume,
            prefix,
            limit,
        } => search(volume_of(session, volume)?, prefix, *limit, out),
        Command::Locate { lon, lat } => {
            locate(&db, session, Position::from_degrees(*lon, *lat), out)
        }
        Command::Features {
            square,
            category,
            generation: number,
            kind,
        } => {
            let kind = FeatureKind::from(*kind);
            let index = session
                .context::<FeatureIndex>(kind.section())
                .ok_or(InspectError::MissingSection(kind.section()))?;
            features(index, generation(*number), *square, *category, out)
        }
        Command::Verify => verify(session, out),
    }
}

fn volume_of<'a>(session: &'a MapSession, name: &str) -> Result<&'a Volume> {
    session
        .context::<Dictionary>(roadmap_db::dictionary::SECTION)
        .ok_or(InspectError::MissingSection(roadmap_db::dictionary::SECTION))?
        .volume(name)
        .ok_or_else(|| InspectError::UnknownVolume(name.to_string()))
}

fn tree(session: &MapSession, out: &mut impl Write) -> Result<()> {
    let store = session.store();
    for id in store.walk() {
        let section = store.section(id);
        let name = if section.level() == 0 { "/" } else { section.name() };
        writeln!(
            out,
            "{:indent$}{name} ({} records, {} bytes)",
            "",
            section.count(),
            section.size(),
            indent = 2 * section.level() as usize
        )?;
    }
    Ok(())
}

fn lookup(volume: &Volume, id: u32, out: &mut impl Write) -> Result<()> {
    match volume.get(id) {
        Some(text) => writeln!(out, "{id}\t{text}")?,
        None => writeln!(out, "{id}\t<none: {} strings>", volume.len())?,
    }
    Ok(())
}

fn search(volume: &Volume, prefix: &str, limit: usize, out: &mut impl Write) -> Result<()> {
    if let Some(mut cursor) = volume.cursor()
        && prefix.bytes().all(|character| cursor.advance(character))
        && let Some(completion) = cursor.completion()
    {
        writeln!(out, "completion\t{completion}")?;
    }
    for id in volume.search(prefix, limit) {
        writeln!(out, "{id}\t{}", volume.get(id).unwrap_or_default())?;
    }
    Ok(())
}

fn locate(db: &Database, session: &MapSession, position: Position, out: &mut impl Write) -> Result<()> {
    let (lon, lat) = position.to_degrees();
    match db.locate_tile(position) {
        Some(tile) => writeln!(out, "tile\t{}", tile.path().display())?,
        None => writeln!(out, "tile\t<none>")?,
    }

    let squares = session
        .context::<SquareIndex>(SQUARE_SECTION)
        .ok_or(InspectError::MissingSection(SQUARE_SECTION))?;
    let square = squares.locate(position);
    writeln!(out, "position\t{lon:.6} {lat:.6}")?;
    writeln!(out, "square\t{square:?}")?;
    if let Some(edges) = squares.edges(square) {
        let (west, south) = edges.min_corner().to_degrees();
        let (east, north) = edges.max_corner().to_degrees();
        writeln!(out, "edges\t{west:.6} {south:.6} {east:.6} {north:.6}")?;
    }
    if let Some(count) = squares.count_points(square) {
        writeln!(out, "points\t{count}")?;
    }
    Ok(())
}

fn features(
    index: &FeatureIndex,
    generation: Generation,
    square: u32,
    category: u8,
    out: &mut impl Write,
) -> Result<()> {
    for id in index.features(generation, square, category) {
        if let Some(line) = index.line(id) {
            writeln!(out, "{id}\t{} -> {}", line.from, line.to)?;
        } else if let Some(point) = index.point(id) {
            let (lon, lat) = point.to_degrees();
            writeln!(out, "{id}\t{lon:.6} {lat:.6}")?;
        }
    }
    Ok(())
}

/// Problems found by [`verify`]
#[derive(Debug, Default)]
struct Report {
    checked: usize,
    problems: Vec<String>,
}

impl Report {
    fn merge(mut self, other: Report) -> Report {
        self.checked += other.checked;
        self.problems.extend(other.problems);
        self
    }

    fn check(&mut self, ok: bool, problem: impl FnOnce() -> String) {
        self.checked += 1;
        if !ok {
            self.problems.push(problem());
        }
    }
}

/// Every string must be found again by its text
fn verify_volume(volume: &Volume) -> Report {
    (1..volume.len() as u32)
        .into_par_iter()
        .fold(Report::default, |mut report, id| {
            match volume.get(id) {
                Some("") => {}
                Some(text) => report.check(volume.locate(text) == Some(id), || {
                    format!("{}: '{text}' (id {id}) not found by its text", volume.name())
                }),
                None => report.check(false, || format!("{}: id {id} unreadable", volume.name())),
            }
            report
        })
        .reduce(Report::default, Report::merge)
}

/// Every square must be reached through its grid position and its center
fn verify_squares(squares: &SquareIndex) -> Report {
    (0..squares.square_count() as u32)
        .into_par_iter()
        .fold(Report::default, |mut report, index| {
            let Some(square) = squares.square(index) else {
                report.check(false, || format!("square {index} unreadable"));
                return report;
            };
            report.check(squares.resolve(square.position as usize) == Some(index), || {
                format!("square {index}: grid position {} not resolved", square.position)
            });
            let center = Position::new(
                ((square.edges.west as i64 + square.edges.east as i64) / 2) as i32,
                ((square.edges.south as i64 + square.edges.north as i64) / 2) as i32,
            );
            report.check(squares.locate(center) == SquareRef::Square(index), || {
                format!("square {index}: center not located in it")
            });
            report
        })
        .reduce(Report::default, Report::merge)
}

/// Every by-square row must exist and point at real features
fn verify_features(index: &FeatureIndex, square_count: usize) -> Report {
    let mut report = Report::default();
    for generation in [Generation::One, Generation::Two] {
        let Some(category_index) = index.generation(generation) else {
            continue;
        };
        report.check(category_index.square_count() == square_count, || {
            format!(
                "{} {generation:?}: {} rows for {square_count} squares",
                index.kind().section(),
                category_index.square_count()
            )
        });

        let categories = category_index.category_count() as u8;
        let rows = (0..category_index.square_count() as u32)
            .into_par_iter()
            .fold(Report::default, |mut report, square| {
                for category in 1..=categories {
                    for id in index.features(generation, square, category) {
                        report.check((id as usize) < index.len(), || {
                            format!(
                                "{} {generation:?}: square {square} category {category} has feature {id}",
                                index.kind().section()
                            )
                        });
                    }
                }
                report
            })
            .reduce(Report::default, Report::merge);
        report = report.merge(rows);
    }
    report
}

fn verify(session: &MapSession, out: &mut impl Write) -> Result<()> {
    let mut report = Report::default();

    if let Some(dictionary) = session.context::<Dictionary>(roadmap_db::dictionary::SECTION) {
        for volume in dictionary.volumes() {
            let volume_report = verify_volume(volume);
            writeln!(out, "volume {}: {} strings checked", volume.name(), volume_report.checked)?;
            report = report.merge(volume_report);
        }
    }

    let squares = session.context::<SquareIndex>(SQUARE_SECTION);
    if let Some(squares) = squares {
        let squares_report = verify_squares(squares);
        writeln!(out, "square: {} checks", squares_report.checked)?;
        report = report.merge(squares_report);
    }

    for kind in [FeatureKind::Line, FeatureKind::Point] {
        let Some(index) = session.context::<FeatureIndex>(kind.section()) else {
            continue;
        };
        let square_count = squares.map_or(0, SquareIndex::square_count);
        let features_report = verify_features(index, square_count);
        writeln!(out, "{}: {} checks", kind.section(), features_report.checked)?;
        report = report.merge(features_report);
    }

    for problem in &report.problems {
        tracing::error!("{problem}");
        writeln!(out, "problem\t{problem}")?;
    }
    if report.problems.is_empty() {
        writeln!(out, "ok: {} checks", report.checked)?;
        Ok(())
    } else {
        Err(InspectError::Verify(report.problems.len()))
    }
}
