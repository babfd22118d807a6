//! # Logging
//!
//! This module installs the `tracing` subscriber the patch engine reports through.
//!
//! Failed patches are logged at `warn`, successful ones at `debug`, dispatcher progress at `info`.
//! `RUST_LOG` overrides [`DEFAULT_DIRECTIVE`].

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_DIRECTIVE: &str = "rtpatch=info";

/// Name of the log file written next to the executable
pub const FILE_NAME: &str = "rtpatch.log";

/// Filter from `RUST_LOG`, or [`DEFAULT_DIRECTIVE`]
fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Logs to stderr.
///
/// Returns `false` when a subscriber was already installed, which is harmless.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Appends logs to the file at `path`.
///
/// Injected libraries usually have no console to write to. Returns `Ok(false)` when a subscriber was
/// already installed.
pub fn init_with_file(path: &Path) -> io::Result<bool> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .is_ok())
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::EnvFilter;

    use crate::logging::{init, DEFAULT_DIRECTIVE};

    #[test]
    /// Installing a second subscriber is refused without panicking
    fn test_init_twice() {
        init();
        assert!(!init());
    }

    #[test]
    /// The default directive is a valid filter
    fn test_default_directive() {
        assert!(EnvFilter::try_new(DEFAULT_DIRECTIVE).is_ok());
    }
}
