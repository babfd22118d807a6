//! # Config
//!
//! This module covers the settings patch sets read their feature toggles from.
//!
//! Settings live in a TOML file next to the executable. Top-level keys apply to every game, a table named
//! after an executable applies to that game only and overrides the top-level keys:
//!
//! ```toml
//! enabled = true
//!
//! [tomb]
//! fov_override = true
//! fov_value = 80.0
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use toml::{Table, Value};
use tracing::debug;

/// Name of the settings file looked up next to the executable
pub const FILE_NAME: &str = "rtpatch.toml";

/// Errors while loading a settings file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read
    #[error("could not read {}: {source}", path.display())]
    Io {
        /// File that was read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The file is not valid TOML
    #[error("invalid settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings of one game.
///
/// Every getter takes the value to use when the key is missing or holds a value of another type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Values by key
    values: BTreeMap<String, Value>,
}

impl Config {
    /// Creates empty settings, every getter returns its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Whether `key` has a value of any type
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns a boolean setting
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.typed(key, default, Value::as_bool)
    }

    /// Returns an integer setting. Integers outside of `i32` count as mistyped
    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        self.typed(key, default, |value| {
            value.as_integer().and_then(|i| i32::try_from(i).ok())
        })
    }

    /// Returns a float setting. Integers are accepted too
    pub fn get_float(&self, key: &str, default: f32) -> f32 {
        self.typed(key, default, |value| {
            value
                .as_float()
                .or_else(|| value.as_integer().map(|i| i as f64))
                .map(|f| f as f32)
        })
    }

    /// Returns a string setting
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.typed(key, default.to_owned(), |value| value.as_str().map(str::to_owned))
    }

    /// Looks up `key` and converts it, falling back to `default`
    fn typed<T: fmt::Debug>(
        &self,
        key: &str,
        default: T,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> T {
        let Some(value) = self.values.get(key) else {
            return default;
        };
        match convert(value) {
            Some(converted) => converted,
            None => {
                debug!("setting {key} = {value} has an unexpected type, using {default:?}");
                default
            }
        }
    }
}

/// A parsed settings file holding the settings of every game
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    /// Top-level table of the document
    table: Table,
}

impl ConfigFile {
    /// Parses a settings document
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            table: text.parse::<Table>()?,
        })
    }

    /// Reads and parses the settings file at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Like [`ConfigFile::load`], but a missing file yields empty settings
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                debug!("no settings file at {}", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Settings of the executable called `name`: top-level keys overridden by the table named `name`.
    ///
    /// Table names are matched ignoring ASCII case. Tables of other executables are left out.
    pub fn for_module(&self, name: &str) -> Config {
        let mut values: BTreeMap<String, Value> = self
            .table
            .iter()
            .filter(|(_, value)| !value.is_table())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let section = self
            .table
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value.as_table());
        if let Some(section) = section {
            values.extend(section.iter().map(|(key, value)| (key.clone(), value.clone())));
        }

        Config { values }
    }
}
