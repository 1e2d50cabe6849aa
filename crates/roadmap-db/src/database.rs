//! Open map files and their handler contexts
//!
//! [`Database::open`] maps a file and runs every matching handler; the resulting
//! [`MapSession`] is the handle queries go through. Activation only records which session is
//! current for each handler name, so several files can stay open and be queried side by side.

use crate::geometry::Position;
use crate::model::{ErasedHandler, Model};
use crate::section::SectionStore;
use crate::square::{self, SquareIndex};
use crate::{DbError, Result};
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A context produced by one handler
struct MappedContext {
    name: String,
    handler: Arc<dyn ErasedHandler>,
    context: Box<dyn Any>,
}

/// One open map file
pub struct MapSession {
    path: PathBuf,
    store: SectionStore,
    contexts: Vec<MappedContext>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl MapSession {
    /// Map a file and run the model's handlers over its top-level sections
    fn open(path: PathBuf, model: &Model) -> Result<Self> {
        let store = SectionStore::open(&path)?;
        Self::with_store(path, store, model)
    }

    fn with_store(path: PathBuf, store: SectionStore, model: &Model) -> Result<Self> {
        let mut contexts = Vec::new();
        for entry in model.entries() {
            let Some(section) = store.child(store.root(), &entry.name) else {
                tracing::debug!(section = %entry.name, path = %path.display(), "Section absent");
                continue;
            };

            match entry.handler.map(&store, section) {
                Ok(context) => contexts.push(MappedContext {
                    name: entry.name.clone(),
                    handler: entry.handler.clone(),
                    context,
                }),
                Err(err) => {
                    // Release what was already mapped before giving up on the file
                    for mapped in contexts.drain(..).rev() {
                        if let Err(unmap_err) = mapped.handler.unmap(&mapped.name, mapped.context) {
                            tracing::warn!(section = %mapped.name, err = %unmap_err, "Cannot unmap section");
                        }
                    }
                    return Err(err);
                }
            }
            tracing::debug!(section = %entry.name, "Mapped section");
        }

        Ok(Self {
            path,
            store,
            contexts,
        })
    }

    /// Full path of the map file
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parsed section tree
    #[inline]
    pub fn store(&self) -> &SectionStore {
        &self.store
    }

    /// Context mapped by the handler bound to `name`
    ///
    /// Returns `None` if the file has no such section or the context is of another type.
    pub fn context<C: Any>(&self, name: &str) -> Option<&C> {
        self.contexts
            .iter()
            .find(|mapped| mapped.name == name)
            .and_then(|mapped| mapped.context.downcast_ref::<C>())
    }

    /// Names of the sections that were mapped, in model order
    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.contexts.iter().map(|mapped| mapped.name.as_str())
    }

    fn activate(&self) -> Result<()> {
        for mapped in &self.contexts {
            mapped
                .handler
                .activate(&mapped.name, mapped.context.as_ref())?;
        }
        Ok(())
    }

    fn unmap(self) -> Result<()> {
        let mut result = Ok(());
        for mapped in self.contexts.into_iter().rev() {
            if let Err(err) = mapped.handler.unmap(&mapped.name, mapped.context) {
                result = Err(err);
            }
        }
        result
    }
}

impl std::fmt::Debug for MapSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapSession")
            .field("path", &self.path)
            .field("store", &self.store)
            .field("sections", &self.handler_names().collect::<Vec<_>>())
            .finish()
    }
}

/// Set of open map files
#[derive(Default)]
pub struct Database {
    /// Open sessions, in opening order
    sessions: Vec<MapSession>,
    /// Current session path per handler name
    active: HashMap<String, PathBuf>,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `directory/filename` with the given model
    ///
    /// Opening a file that is already open returns the existing session. On failure nothing
    /// from the file is kept.
    pub fn open(
        &mut self,
        directory: impl AsRef<Path>,
        filename: &str,
        model: &Model,
    ) -> Result<&MapSession> {
        let path = directory.as_ref().join(filename);
        if let Some(index) = self.position(&path) {
            return Ok(&self.sessions[index]);
        }

        let session = MapSession::open(path.clone(), model).map_err(|err| {
            tracing::error!(path = %path.display(), %err, "Cannot open map file");
            err
        })?;
        tracing::info!(
            path = %path.display(),
            sections = session.store.len(),
            "Opened map file"
        );

        self.sessions.push(session);
        Ok(&self.sessions[self.sessions.len() - 1])
    }

    /// Open a map file already held in memory, registered under `path`
    pub fn open_bytes(
        &mut self,
        path: impl Into<PathBuf>,
        bytes: Vec<u8>,
        model: &Model,
    ) -> Result<&MapSession> {
        let path = path.into();
        if let Some(index) = self.position(&path) {
            return Ok(&self.sessions[index]);
        }
        let session = SectionStore::from_bytes(bytes)
            .and_then(|store| MapSession::with_store(path.clone(), store, model))
            .map_err(|err| {
                tracing::error!(path = %path.display(), %err, "Cannot open map file");
                err
            })?;
        tracing::info!(
            path = %path.display(),
            sections = session.store.len(),
            "Opened map file"
        );

        self.sessions.push(session);
        Ok(&self.sessions[self.sessions.len() - 1])
    }

    /// Make the file the current one for each of its handlers
    pub fn activate(&mut self, path: impl AsRef<Path>) -> Result<&MapSession> {
        let path = path.as_ref();
        let index = self
            .position(path)
            .ok_or_else(|| DbError::NotOpen(path.to_path_buf()))?;

        let session = &self.sessions[index];
        session.activate()?;
        for name in session.handler_names() {
            self.active.insert(name.to_string(), session.path.clone());
        }
        tracing::debug!(path = %path.display(), "Activated map file");
        Ok(&self.sessions[index])
    }

    /// The current session for a handler name
    pub fn active_session(&self, name: &str) -> Option<&MapSession> {
        let path = self.active.get(name)?;
        self.session(path)
    }

    /// The current context for a handler name
    pub fn active<C: Any>(&self, name: &str) -> Option<&C> {
        self.active_session(name)?.context::<C>(name)
    }

    /// Session of an open file
    pub fn session(&self, path: impl AsRef<Path>) -> Option<&MapSession> {
        self.position(path.as_ref()).map(|index| &self.sessions[index])
    }

    /// Open sessions, in opening order
    pub fn sessions(&self) -> impl Iterator<Item = &MapSession> {
        self.sessions.iter()
    }

    /// First open file whose square grid covers `position`
    pub fn locate_tile(&self, position: Position) -> Option<&MapSession> {
        self.sessions.iter().find(|session| {
            session
                .context::<SquareIndex>(square::SECTION)
                .is_some_and(|index| index.area().contains(position))
        })
    }

    /// Unmap every context of a file and release its mapping
    pub fn close(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let index = self
            .position(path)
            .ok_or_else(|| DbError::NotOpen(path.to_path_buf()))?;

        let session = self.sessions.remove(index);
        self.active.retain(|_, active| active != path);
        session.unmap()?;
        tracing::info!(path = %path.display(), "Closed map file");
        Ok(())
    }

    /// Close every open file
    pub fn end(&mut self) -> Result<()> {
        self.active.clear();
        let mut result = Ok(());
        for session in self.sessions.drain(..).rev() {
            let path = session.path.clone();
            if let Err(err) = session.unmap() {
                tracing::error!(path = %path.display(), %err, "Cannot unmap map file");
                result = Err(err);
            }
        }
        result
    }

    fn position(&self, path: &Path) -> Option<usize> {
        self.sessions.iter().position(|session| session.path == path)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.end();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("sessions", &self.sessions)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::Dictionary;
    use crate::feature::{FeatureIndex, Generation};
    use crate::fixture::{MapBuilder, SectionBuilder, sample_map};
    use crate::model::Handler;
    use crate::section::SectionId;
    use crate::square::SquareRef;
    use crate::{Config, Metadata};
    use std::sync::Mutex;

    fn write_sample(dir: &Path, name: &str) {
        sample_map().write(dir.join(name)).unwrap();
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    struct Recording(Arc<Events>);

    impl Handler for Recording {
        type Context = String;

        fn map(&self, store: &SectionStore, section: SectionId) -> Result<String> {
            let name = store.name(section).to_string();
            self.0.0.lock().unwrap().push(format!("map {name}"));
            Ok(name)
        }

        fn activate(&self, context: &String) {
            self.0.0.lock().unwrap().push(format!("activate {context}"));
        }

        fn unmap(&self, context: String) {
            self.0.0.lock().unwrap().push(format!("unmap {context}"));
        }
    }

    struct Failing;

    impl Handler for Failing {
        type Context = ();

        fn map(&self, _store: &SectionStore, section: SectionId) -> Result<()> {
            Err(DbError::corrupt(format!("{section:?}"), "rejected"))
        }
    }

    #[test]
    fn test_handler_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "tile.rdm");
        let events = Arc::new(Events::default());
        let model = Model::new()
            .with("square", Recording(events.clone()))
            .with("line", Recording(events.clone()))
            .with("zip", Recording(events.clone()));

        let mut db = Database::new();
        let session = db.open(dir.path(), "tile.rdm", &model).unwrap();
        assert_eq!(
            session.handler_names().collect::<Vec<_>>(),
            vec!["square", "line"]
        );
        db.activate(dir.path().join("tile.rdm")).unwrap();
        db.close(dir.path().join("tile.rdm")).unwrap();

        assert_eq!(
            *events.0.lock().unwrap(),
            vec![
                "map square",
                "map line",
                "activate square",
                "activate line",
                "unmap line",
                "unmap square",
            ]
        );
    }

    #[test]
    fn test_failed_open_unmaps_and_keeps_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "tile.rdm");
        let events = Arc::new(Events::default());
        let model = Model::new()
            .with("string", Recording(events.clone()))
            .with("square", Failing);

        let mut db = Database::new();
        assert!(db.open(dir.path(), "tile.rdm", &model).is_err());
        assert_eq!(db.sessions().count(), 0);
        assert_eq!(
            *events.0.lock().unwrap(),
            vec!["map string", "unmap string"]
        );
    }

    #[test]
    fn test_failed_open_bytes_keeps_nothing() {
        let events = Arc::new(Events::default());
        let model = Model::new()
            .with("string", Recording(events.clone()))
            .with("square", Failing);

        let mut db = Database::new();
        assert!(matches!(
            db.open_bytes("tile.rdm", b"not a map".to_vec(), &model),
            Err(DbError::BadHeader(_))
        ));
        assert!(matches!(
            db.open_bytes("tile.rdm", sample_map().build(), &model),
            Err(DbError::Corrupt { .. })
        ));
        assert_eq!(db.sessions().count(), 0);
        assert_eq!(
            *events.0.lock().unwrap(),
            vec!["map string", "unmap string"]
        );
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Database::new();
        let model = Model::standard(Config::default());
        assert!(matches!(
            db.open(dir.path(), "missing.rdm", &model),
            Err(DbError::Io(_))
        ));
        assert!(matches!(
            db.activate(dir.path().join("missing.rdm")),
            Err(DbError::NotOpen(_))
        ));
    }

    #[test]
    fn test_open_twice_returns_same_session() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "tile.rdm");
        let model = Model::standard(Config::default());

        let mut db = Database::new();
        db.open(dir.path(), "tile.rdm", &model).unwrap();
        db.open(dir.path(), "tile.rdm", &model).unwrap();
        assert_eq!(db.sessions().count(), 1);
    }

    #[test]
    fn test_active_context_follows_activation() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "a.rdm");
        write_sample(dir.path(), "b.rdm");
        let model = Model::standard(Config::default());

        let mut db = Database::new();
        db.open(dir.path(), "a.rdm", &model).unwrap();
        db.open(dir.path(), "b.rdm", &model).unwrap();
        assert!(db.active::<Dictionary>("string").is_none());

        db.activate(dir.path().join("a.rdm")).unwrap();
        assert_eq!(
            db.active_session("string").unwrap().path(),
            dir.path().join("a.rdm")
        );

        db.activate(dir.path().join("b.rdm")).unwrap();
        assert_eq!(
            db.active_session("square").unwrap().path(),
            dir.path().join("b.rdm")
        );
        // The previous file is still open and queryable through its own session
        let a = db.session(dir.path().join("a.rdm")).unwrap();
        assert!(a.context::<Dictionary>("string").is_some());

        db.close(dir.path().join("b.rdm")).unwrap();
        assert!(db.active::<Dictionary>("string").is_none());
        db.end().unwrap();
        assert_eq!(db.sessions().count(), 0);
    }

    #[test]
    fn test_context_type_mismatch_is_none() {
        let mut db = Database::new();
        let model = Model::standard(Config::default());
        let session = db
            .open_bytes("memory.rdm", sample_map().build(), &model)
            .unwrap();
        assert!(session.context::<Dictionary>("string").is_some());
        assert!(session.context::<SquareIndex>("string").is_none());
    }

    #[test]
    fn test_missing_optional_section() {
        let bytes = MapBuilder::new()
            .with_section(SectionBuilder::parent("string"))
            .build();
        let mut db = Database::new();
        let model = Model::standard(Config::default());
        let session = db.open_bytes("index-only.rdm", bytes, &model).unwrap();
        assert!(session.context::<Metadata>("metadata").is_none());
        assert!(session.context::<SquareIndex>("square").is_none());
        assert!(db.locate_tile(Position::new(0, 0)).is_none());
    }

    /// Run every kind of query once and collect the answers as text
    fn query_everything(session: &MapSession) -> Vec<String> {
        let mut answers = Vec::new();
        let dictionary = session.context::<Dictionary>("string").unwrap();
        let streets = dictionary.volume("street").unwrap();
        for id in 0..streets.len() as u32 {
            answers.push(format!("{id}={:?}", streets.get(id)));
        }
        answers.push(format!("{:?}", streets.search("e", 10)));

        let squares = session.context::<SquareIndex>("square").unwrap();
        let lines = session.context::<FeatureIndex>("line").unwrap();
        let position = Position::from_degrees(1.5, 1.5);
        let square = squares.locate(position);
        answers.push(format!("{square:?}"));
        if let SquareRef::Square(square) = square {
            for category in 1..=3 {
                answers.push(format!(
                    "{:?}",
                    lines
                        .features(Generation::Two, square, category)
                        .collect::<Vec<_>>()
                ));
            }
        }
        answers
    }

    #[test]
    fn test_open_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_sample(dir.path(), "tile.rdm");
        let model = Model::standard(Config::default());
        let path = dir.path().join("tile.rdm");
        let mut db = Database::new();

        let mut runs = Vec::new();
        for _ in 0..2 {
            db.open(dir.path(), "tile.rdm", &model).unwrap();
            let session = db.activate(&path).unwrap();
            runs.push(query_everything(session));
            db.close(&path).unwrap();
        }
        assert_eq!(runs[0], runs[1]);
        assert!(!runs[0].is_empty());
    }

    #[test]
    fn test_locate_tile() {
        let mut db = Database::new();
        let model = Model::standard(Config::default());
        db.open_bytes("tile.rdm", sample_map().build(), &model)
            .unwrap();

        let session = db.locate_tile(Position::from_degrees(1.5, 0.5)).unwrap();
        assert_eq!(session.path(), Path::new("tile.rdm"));
        assert!(db.locate_tile(Position::from_degrees(5.0, 5.0)).is_none());
    }
}
