//! This module contains patch sets described in TOML rather than code
//!
//! ```toml
//! name = "Assault Rigs"
//! executable = "ar"
//!
//! [[patch]]
//! description = "memory check on hosts with more than 4 GB"
//! address = 0x434B63
//! expected = "0F 8E 32 01 00 00"
//! replacement = "90 90 90 90 90 90"
//!
//! [[patch]]
//! description = "640 BY 480 label"
//! address = 0x486AC0
//! expected = "36 34 30 20 42 59 20 34 38 30"
//! replacement = "43 55 53 54 4F 4D 20 20 20 20"
//! config = "resolution_override"
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use super::{ModuleContext, PatchSet, VersionInfo};
use crate::config::ConfigError;
use crate::memory::{Address, MemoryAccessor};
use crate::patcher::PatchEngine;

/// One patch of a [`StaticPatchSet`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PatchEntry {
    /// What the patch does, for the log
    #[serde(default)]
    pub description: Option<String>,
    /// Address to patch
    pub address: usize,
    /// Hex pattern that must be present. Unconditional patch when missing
    #[serde(default)]
    pub expected: Option<String>,
    /// Hex pattern to write
    pub replacement: String,
    /// Boolean setting that switches the patch on or off
    #[serde(default)]
    pub config: Option<String>,
    /// Whether the patch applies when its setting is missing
    #[serde(default = "enabled", rename = "default")]
    pub default_enabled: bool,
}

/// Patches are on unless switched off
fn enabled() -> bool {
    true
}

impl PatchEntry {
    /// Whether the settings of `context` switch this patch on
    pub fn is_enabled(&self, context: &ModuleContext) -> bool {
        match &self.config {
            Some(key) => context.config.get_bool(key, self.default_enabled),
            None => true,
        }
    }
}

/// Patch set loaded from a TOML document
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StaticPatchSet {
    /// Display name
    pub name: String,
    /// [`executable_name`](super::context::executable_name) the set applies to
    pub executable: String,
    /// Only apply to this file version, when given
    #[serde(default)]
    pub version: Option<VersionInfo>,
    /// Patches in application order
    #[serde(default, rename = "patch")]
    pub patches: Vec<PatchEntry>,
}

impl StaticPatchSet {
    /// Parses a patch set document
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses the patch set document at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text)
    }
}

impl<M: MemoryAccessor> PatchSet<M> for StaticPatchSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn applicable(&self, context: &ModuleContext) -> bool {
        self.executable.eq_ignore_ascii_case(&context.executable_name)
            && self
                .version
                .map_or(true, |version| context.version == Some(version))
    }

    fn apply(&mut self, engine: &mut PatchEngine<M>, context: &ModuleContext) {
        for entry in &self.patches {
            let address = Address::new(entry.address);
            if !entry.is_enabled(context) {
                debug!(
                    "skipping patch at {address} ({})",
                    entry.description.as_deref().unwrap_or("switched off")
                );
                continue;
            }
            match &entry.expected {
                Some(expected) => engine.patch_hex(address, expected, &entry.replacement),
                None => engine.patch_unconditional_hex(address, &entry.replacement),
            };
        }
    }
}
