//! This module contains the registry of patch sets a dispatcher chooses from

use std::fmt;

use tracing::debug;

use super::PatchSet;
use crate::memory::MemoryAccessor;

/// Builds a fresh patch set
pub type Factory<M> = Box<dyn Fn() -> Box<dyn PatchSet<M>>>;

/// Patch sets by identifier, in registration order
pub struct PatchCatalog<M: MemoryAccessor> {
    /// Identifier and factory of every registered set
    entries: Vec<(String, Factory<M>)>,
}

impl<M: MemoryAccessor> PatchCatalog<M> {
    /// Creates an empty catalog
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers a factory under `id`, replacing any factory registered under the same identifier.
    ///
    /// A replaced factory keeps its position in the registration order.
    pub fn register<F>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn PatchSet<M>> + 'static,
    {
        let id = id.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some(entry) => {
                debug!("replacing patch set {id}");
                entry.1 = Box::new(factory);
            }
            None => self.entries.push((id, Box::new(factory))),
        }
        self
    }

    /// Registers a patch set built with [`Default`]
    pub fn register_default<S>(&mut self, id: impl Into<String>) -> &mut Self
    where
        S: PatchSet<M> + Default + 'static,
    {
        self.register(id, || Box::new(S::default()))
    }

    /// Builds the set registered under `id`
    pub fn create(&self, id: &str) -> Option<Box<dyn PatchSet<M>>> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, factory)| factory())
    }

    /// Identifiers in registration order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    /// Number of registered sets
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no set is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identifier and factory of every set, in registration order
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, &Factory<M>)> {
        self.entries.iter().map(|(id, factory)| (id.as_str(), factory))
    }
}

impl<M: MemoryAccessor> Default for PatchCatalog<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemoryAccessor> fmt::Debug for PatchCatalog<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}
