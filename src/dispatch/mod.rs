//! # Dispatch
//!
//! This module covers picking the patch set for the host executable and applying it once.
//!
//! A [`Dispatcher`] moves through [`DispatchState`] in order:
//! `Unidentified` -> `Identified` -> `PatchSetSelected` -> `Applied` or `Failed`.
//! Finding no patch set for the host is not an error, the dispatcher simply stays `Identified`.

use std::env;
use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigFile, FILE_NAME};
use crate::memory::MemoryAccessor;
use crate::patcher::{PatchEngine, Tally};

pub mod catalog;
pub mod context;
pub mod table;

pub use catalog::PatchCatalog;
pub use context::{ModuleContext, VersionInfo};
pub use table::StaticPatchSet;

/// Setting that forces a patch set by identifier, bypassing [`PatchSet::applicable`]
pub const PATCH_SET_KEY: &str = "patch_set";

/// Setting that turns patching off for an executable
pub const ENABLED_KEY: &str = "enabled";

/// Patches for one game.
///
/// Patch sets are built by their catalog factory for every dispatch and dropped after applying.
/// A failing patch must never stop the remaining ones, so `apply` has no error to return.
pub trait PatchSet<M: MemoryAccessor> {
    /// Display name
    fn name(&self) -> &str;

    /// Whether this set was written for the host described by `context`
    fn applicable(&self, context: &ModuleContext) -> bool;

    /// Applies every patch through `engine`
    fn apply(&mut self, engine: &mut PatchEngine<M>, context: &ModuleContext);
}

/// Progress of a [`Dispatcher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchState {
    /// Nothing is known about the host yet
    Unidentified,
    /// The host is known. Stays here when no patch set applies
    Identified,
    /// A patch set was picked and is about to be applied
    PatchSetSelected(String),
    /// The patch set ran and patched something, or had nothing to patch
    Applied(Tally),
    /// The patch set ran and every one of its patches failed
    Failed(Tally),
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unidentified => f.write_str("unidentified"),
            Self::Identified => f.write_str("identified"),
            Self::PatchSetSelected(id) => write!(f, "patch set {id} selected"),
            Self::Applied(tally) => write!(f, "applied, {tally}"),
            Self::Failed(tally) => write!(f, "failed, {tally}"),
        }
    }
}

/// Errors of the dispatcher
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The host executable could not be identified
    #[error("could not identify the host executable: {reason}")]
    UnknownHost {
        /// What went wrong
        reason: String,
    },
    /// A step was requested in the wrong state
    #[error("cannot {step} while {state}")]
    OutOfOrder {
        /// Requested step
        step: &'static str,
        /// State the dispatcher was in
        state: DispatchState,
    },
}

/// Runs the patch set matching the host through a [`PatchEngine`]
pub struct Dispatcher<M: MemoryAccessor> {
    /// Sets to choose from
    catalog: PatchCatalog<M>,
    /// Current state
    state: DispatchState,
    /// Host description, once identified
    context: Option<ModuleContext>,
    /// Set picked by [`Dispatcher::select`], until applied
    selected: Option<Box<dyn PatchSet<M>>>,
}

impl<M: MemoryAccessor> Dispatcher<M> {
    /// Creates an unidentified dispatcher
    pub fn new(catalog: PatchCatalog<M>) -> Self {
        Self {
            catalog,
            state: DispatchState::Unidentified,
            context: None,
            selected: None,
        }
    }

    /// Returns the current state
    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    /// Returns the host description, once identified
    pub fn context(&self) -> Option<&ModuleContext> {
        self.context.as_ref()
    }

    /// Records the host description
    pub fn identify(&mut self, context: ModuleContext) -> Result<(), DispatchError> {
        self.require(DispatchState::Unidentified, "identify")?;
        info!("identified host {context}");
        self.context = Some(context);
        self.state = DispatchState::Identified;
        Ok(())
    }

    /// Picks the patch set for the host, returning its identifier.
    ///
    /// A set named by the `patch_set` setting is taken without asking it, otherwise the first registered set
    /// that declares itself applicable. With `enabled = false`, or when nothing matches, no set is picked and
    /// the dispatcher stays `Identified`.
    pub fn select(&mut self) -> Result<Option<&str>, DispatchError> {
        self.require(DispatchState::Identified, "select a patch set")?;
        let Some(context) = &self.context else {
            return Err(self.out_of_order("select a patch set"));
        };

        if !context.config.get_bool(ENABLED_KEY, true) {
            info!("patching is disabled for {}", context.executable_name);
            return Ok(None);
        }

        let forced = context.config.get_string(PATCH_SET_KEY, "");
        let selected = if forced.is_empty() {
            self.catalog
                .entries()
                .map(|(id, factory)| (id, factory()))
                .find(|(_, set)| set.applicable(context))
                .map(|(id, set)| (id.to_owned(), set))
        } else {
            let set = self.catalog.create(&forced);
            if set.is_none() {
                warn!("configured patch set {forced} is not registered");
            }
            set.map(|set| (forced, set))
        };

        let Some((id, set)) = selected else {
            info!("no patch set for {context}");
            return Ok(None);
        };
        info!("selected patch set {id} ({})", set.name());
        self.selected = Some(set);
        self.state = DispatchState::PatchSetSelected(id);
        Ok(self.selected_id())
    }

    /// Identifier of the selected patch set, until it is applied
    pub fn selected_id(&self) -> Option<&str> {
        match &self.state {
            DispatchState::PatchSetSelected(id) => Some(id.as_str()),
            _ => None,
        }
    }

    /// Applies the selected patch set once and settles on `Applied` or `Failed`
    pub fn apply(&mut self, engine: &mut PatchEngine<M>) -> Result<&DispatchState, DispatchError> {
        let (Some(mut set), Some(context)) = (self.selected.take(), &self.context) else {
            return Err(self.out_of_order("apply"));
        };

        let before = engine.tally();
        set.apply(engine, context);
        let tally = engine.tally().since(&before);

        self.state = if tally.attempted > 0 && tally.succeeded == 0 {
            warn!("{}: every patch failed, {tally}", set.name());
            DispatchState::Failed(tally)
        } else {
            info!("{}: {tally}", set.name());
            DispatchState::Applied(tally)
        };
        Ok(&self.state)
    }

    /// Selects and applies in one go. See [`Dispatcher::select`] and [`Dispatcher::apply`]
    pub fn run(&mut self, engine: &mut PatchEngine<M>) -> Result<&DispatchState, DispatchError> {
        if self.select()?.is_some() {
            self.apply(engine)?;
        }
        Ok(&self.state)
    }

    /// Fails unless the dispatcher is in `state`
    fn require(&self, state: DispatchState, step: &'static str) -> Result<(), DispatchError> {
        if self.state == state {
            Ok(())
        } else {
            Err(self.out_of_order(step))
        }
    }

    /// Error for `step` requested in the current state
    fn out_of_order(&self, step: &'static str) -> DispatchError {
        DispatchError::OutOfOrder {
            step,
            state: self.state.clone(),
        }
    }
}

impl<M: MemoryAccessor> fmt::Debug for Dispatcher<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("catalog", &self.catalog)
            .field("state", &self.state)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Accessor [`attach`] patches the current process through
#[cfg(windows)]
pub type LiveMemory = crate::memory::process::ProcessMemory;

/// Accessor [`attach`] patches the current process through
#[cfg(not(windows))]
pub type LiveMemory = crate::memory::local::LocalMemory;

/// Identifies the current process and applies the matching patch set of `catalog`.
///
/// Settings are read from [`FILE_NAME`] next to the executable. A missing or broken settings file leaves
/// every setting at its default. Meant to be called once, from the attach hook of an injected library.
///
/// # Safety
///
/// The patch sets of `catalog` write to the code of the running process. Their addresses must be valid
/// for the host they declare themselves applicable to, and no other thread may execute the patched code
/// while it is rewritten.
pub unsafe fn attach(catalog: PatchCatalog<LiveMemory>) -> Result<DispatchState, DispatchError> {
    let path = env::current_exe().map_err(|e| DispatchError::UnknownHost {
        reason: e.to_string(),
    })?;

    let settings = match path.parent() {
        Some(dir) => ConfigFile::load_or_default(&dir.join(FILE_NAME)).unwrap_or_else(|e| {
            warn!("ignoring settings: {e}");
            ConfigFile::default()
        }),
        None => ConfigFile::default(),
    };

    let mut dispatcher = Dispatcher::new(catalog);
    dispatcher.identify(ModuleContext::from_path(&path, &settings)?)?;

    let mut engine = PatchEngine::new(live_memory());
    let state = dispatcher.run(&mut engine)?.clone();
    Ok(state)
}

/// Accessor for the current process
#[cfg(windows)]
unsafe fn live_memory() -> LiveMemory {
    LiveMemory::current()
}

/// Accessor for the current process
#[cfg(not(windows))]
unsafe fn live_memory() -> LiveMemory {
    LiveMemory::new()
}
