//! This module contains what a patch set learns about the host executable

use std::fmt;
use std::fs;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use pelite::image::VS_VERSION;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::DispatchError;
use crate::config::{Config, ConfigFile};

/// File version of an executable, as stored in its version resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct VersionInfo {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Patch version
    pub patch: u16,
    /// Build number
    pub build: u16,
}

/// A version string that isn't four dot-separated numbers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// Not exactly four components
    #[error("expected four components, found {0}")]
    Components(usize),
    /// A component is not a 16-bit number
    #[error("invalid component: {0}")]
    Number(#[from] ParseIntError),
}

impl VersionInfo {
    /// Builds a version from its four components
    pub const fn new(major: u16, minor: u16, patch: u16, build: u16) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Reads the file version from the version resource of a PE image on disk.
    ///
    /// Returns `None` when the image can't be read or carries no version resource.
    pub fn read(path: &Path) -> Option<Self> {
        let bytes = fs::read(path)
            .map_err(|e| debug!("could not read {}: {e}", path.display()))
            .ok()?;
        Self::from_image(&bytes)
    }

    /// Reads the file version from a PE image, 32 or 64-bit
    pub fn from_image(bytes: &[u8]) -> Option<Self> {
        use pelite::pe32::{Pe as _, PeFile as PeFile32};
        use pelite::pe64::{Pe as _, PeFile as PeFile64};

        let resources = match PeFile32::from_bytes(bytes) {
            Ok(file) => file.resources(),
            Err(pelite::Error::PeMagic) => {
                PeFile64::from_bytes(bytes).and_then(|file| file.resources())
            }
            Err(e) => Err(e),
        }
        .ok()?;
        let fixed = resources.version_info().ok()?.fixed()?;
        Some(Self::from(fixed.dwFileVersion))
    }
}

impl From<VS_VERSION> for VersionInfo {
    fn from(version: VS_VERSION) -> Self {
        Self::new(version.Major, version.Minor, version.Patch, version.Build)
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

impl FromStr for VersionInfo {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s
            .trim()
            .split('.')
            .map(|part| part.trim().parse::<u16>())
            .collect::<Result<Vec<_>, _>>()?;
        match parts[..] {
            [major, minor, patch, build] => Ok(Self::new(major, minor, patch, build)),
            _ => Err(VersionError::Components(parts.len())),
        }
    }
}

impl TryFrom<String> for VersionInfo {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Name the catalog knows an executable by: the file name without extension, lowercased
pub fn executable_name(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .filter(|name| !name.is_empty())
}

/// Everything a patch set may look at when deciding whether and how to patch
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleContext {
    /// Path of the executable, when known
    pub path: Option<PathBuf>,
    /// See [`executable_name`]
    pub executable_name: String,
    /// File version of the executable, when it has one
    pub version: Option<VersionInfo>,
    /// Settings of the executable
    pub config: Config,
}

impl ModuleContext {
    /// Context for an executable known by name only
    pub fn new(executable_name: impl Into<String>, config: Config) -> Self {
        Self {
            path: None,
            executable_name: executable_name.into().to_lowercase(),
            version: None,
            config,
        }
    }

    /// Sets the file version
    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = Some(version);
        self
    }

    /// Identifies the executable at `path`, reading its version and picking its settings from `settings`
    pub fn from_path(path: &Path, settings: &ConfigFile) -> Result<Self, DispatchError> {
        let name = executable_name(path).ok_or_else(|| DispatchError::UnknownHost {
            reason: format!("{} has no file name", path.display()),
        })?;
        Ok(Self {
            path: Some(path.to_owned()),
            config: settings.for_module(&name),
            version: VersionInfo::read(path),
            executable_name: name,
        })
    }
}

impl fmt::Display for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.executable_name)?;
        if let Some(version) = &self.version {
            write!(f, " {version}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::config::ConfigFile;
    use crate::dispatch::context::{executable_name, ModuleContext, VersionError, VersionInfo};
    use crate::dispatch::DispatchError;

    #[test]
    /// Names are case-folded with the extension stripped
    fn test_executable_name() {
        assert_eq!(
            executable_name(Path::new("/games/TOMB/TOMB.EXE")).as_deref(),
            Some("tomb")
        );
        assert_eq!(executable_name(Path::new("/games/ar/AR.exe")).as_deref(), Some("ar"));
        assert_eq!(executable_name(Path::new("wipeout")).as_deref(), Some("wipeout"));
        assert_eq!(executable_name(Path::new("/")), None);
    }

    #[test]
    /// Versions round-trip through their dotted form
    fn test_version_parse() {
        let version: VersionInfo = "1.0.0.52".parse().unwrap();
        assert_eq!(version, VersionInfo::new(1, 0, 0, 52));
        assert_eq!(version.to_string(), "1.0.0.52");

        assert_eq!("1.0".parse::<VersionInfo>(), Err(VersionError::Components(2)));
        assert!(matches!(
            "1.0.0.x".parse::<VersionInfo>(),
            Err(VersionError::Number(_))
        ));
    }

    #[test]
    /// Anything that isn't a PE image has no version
    fn test_no_version() {
        assert_eq!(VersionInfo::from_image(b"#!/bin/sh\n"), None);

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(VersionInfo::read(&dir.path().join("missing.exe")), None);
    }

    #[test]
    /// Contexts built from a path pick the matching settings table
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Tomb.exe");
        std::fs::write(&path, b"MZ").unwrap();

        let settings = ConfigFile::parse("[tomb]\nfov_override = false").unwrap();
        let context = ModuleContext::from_path(&path, &settings).unwrap();

        assert_eq!(context.executable_name, "tomb");
        assert_eq!(context.version, None);
        assert!(!context.config.get_bool("fov_override", true));
        assert_eq!(context.to_string(), "tomb");

        assert!(matches!(
            ModuleContext::from_path(Path::new("/"), &settings),
            Err(DispatchError::UnknownHost { .. })
        ));
    }
}
