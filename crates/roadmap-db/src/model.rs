//! Section handlers and the model binding them to section names

use crate::section::{SectionId, SectionStore};
use crate::{Config, DbError, Result};
use std::any::Any;
use std::sync::Arc;

/// Interprets one top-level section of a map file
///
/// `map` runs while the file is opened and is the only place allowed to fail: it must check
/// everything later queries rely on. The resulting context is owned by the
/// [`MapSession`](crate::MapSession) until the file is closed.
pub trait Handler: Send + Sync + 'static {
    type Context: Any;

    /// Build the context for `section`
    fn map(&self, store: &SectionStore, section: SectionId) -> Result<Self::Context>;

    /// Called when the file becomes the current one for this handler
    fn activate(&self, _context: &Self::Context) {}

    /// Release the context when the file is closed
    fn unmap(&self, context: Self::Context) {
        drop(context);
    }
}

/// Object-safe form of [`Handler`], with contexts erased to `dyn Any`
pub(crate) trait ErasedHandler: Send + Sync {
    fn map(&self, store: &SectionStore, section: SectionId) -> Result<Box<dyn Any>>;
    fn activate(&self, name: &str, context: &dyn Any) -> Result<()>;
    fn unmap(&self, name: &str, context: Box<dyn Any>) -> Result<()>;
}

impl<H: Handler> ErasedHandler for H {
    fn map(&self, store: &SectionStore, section: SectionId) -> Result<Box<dyn Any>> {
        Ok(Box::new(Handler::map(self, store, section)?))
    }

    fn activate(&self, name: &str, context: &dyn Any) -> Result<()> {
        let context = context
            .downcast_ref::<H::Context>()
            .ok_or_else(|| DbError::ContextType {
                handler: name.to_string(),
            })?;
        Handler::activate(self, context);
        Ok(())
    }

    fn unmap(&self, name: &str, context: Box<dyn Any>) -> Result<()> {
        let context = context
            .downcast::<H::Context>()
            .map_err(|_| DbError::ContextType {
                handler: name.to_string(),
            })?;
        Handler::unmap(self, *context);
        Ok(())
    }
}

/// A (section name, handler) pair
#[derive(Clone)]
pub(crate) struct ModelEntry {
    pub name: String,
    pub handler: Arc<dyn ErasedHandler>,
}

/// Ordered table of section handlers, assembled before opening files
///
/// Sections are mapped in model order. Handlers only see the section store, so one that
/// cross-checks another section reads it from the store directly.
#[derive(Clone, Default)]
pub struct Model {
    entries: Vec<ModelEntry>,
}

impl Model {
    /// An empty model
    pub fn new() -> Self {
        Self::default()
    }

    /// The handlers for every section this library understands
    pub fn standard(config: Config) -> Self {
        use crate::dictionary::{self, DictionaryHandler};
        use crate::feature::{FeatureIndexHandler, FeatureKind};
        use crate::metadata::{self, MetadataHandler};
        use crate::square::{self, SquareIndexHandler};

        Self::new()
            .with(dictionary::SECTION, DictionaryHandler::new())
            .with(square::SECTION, SquareIndexHandler::new(config.clone()))
            .with(
                FeatureKind::Line.section(),
                FeatureIndexHandler::new(FeatureKind::Line, config.clone()),
            )
            .with(
                FeatureKind::Point.section(),
                FeatureIndexHandler::new(FeatureKind::Point, config),
            )
            .with(metadata::SECTION, MetadataHandler::new())
    }

    /// Bind `handler` to the top-level section `name`
    ///
    /// A later entry for the same name replaces the earlier one.
    pub fn with(mut self, name: &str, handler: impl Handler) -> Self {
        let entry = ModelEntry {
            name: name.to_string(),
            handler: Arc::new(handler),
        };
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self
    }

    pub(crate) fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    /// Section names, in model order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
