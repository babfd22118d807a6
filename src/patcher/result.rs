//! This module contains the outcome types of patch attempts

use std::fmt;

use thiserror::Error;

use crate::chunk::{Chunk, ParseError};
use crate::memory::{Address, MemoryError};

/// Why a patch attempt failed
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchFailure {
    /// Expected and replacement bytes differ in length. Nothing was accessed
    #[error("expected {expected} bytes but the replacement has {replacement}")]
    SizeMismatch {
        /// Length of the expected bytes
        expected: usize,
        /// Length of the replacement bytes
        replacement: usize,
    },
    /// The range could not be made writable. Nothing else was attempted
    #[error("protection change failed: {0}")]
    ProtectionFailed(MemoryError),
    /// The current bytes could not be read
    #[error("read failed: {0}")]
    ReadFailed(MemoryError),
    /// The current bytes differ from the expected bytes. Nothing was written
    #[error("memory does not contain the expected bytes")]
    VerificationMismatch,
    /// The replacement could not be written
    #[error("write failed: {0}")]
    WriteFailed(MemoryError),
    /// A hex pattern handed to the engine was malformed. Nothing was accessed
    #[error("invalid pattern: {0}")]
    InvalidPattern(ParseError),
    /// A call or jump target is further than a 32-bit displacement reaches. Nothing was accessed
    #[error("target {target:#x} is out of rel32 range of {call_site}")]
    DisplacementOutOfRange {
        /// Address of the call or jump
        call_site: Address,
        /// Address it should reach
        target: usize,
    },
}

impl From<ParseError> for PatchFailure {
    fn from(e: ParseError) -> Self {
        Self::InvalidPattern(e)
    }
}

/// Record of a single patch attempt, successful or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchResult {
    /// Patched address
    pub address: Address,
    /// Number of bytes the patch covers
    pub size: usize,
    /// Bytes that had to be present, for verified patches
    pub expected: Option<Chunk>,
    /// Bytes found in memory, or the replacement after a successful write
    pub actual: Option<Chunk>,
    /// Bytes the patch writes
    pub replacement: Chunk,
    /// Why the attempt failed. `None` on success
    pub failure: Option<PatchFailure>,
}

impl PatchResult {
    /// Starts a record for a patch that has not been attempted yet
    pub(crate) fn new(address: Address, expected: Option<Chunk>, replacement: Chunk) -> Self {
        Self {
            address,
            size: expected.as_ref().map_or(replacement.len(), |e| e.len()),
            expected,
            actual: None,
            replacement,
            failure: None,
        }
    }

    /// Marks the record as failed
    pub(crate) fn fail(mut self, failure: PatchFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Whether the replacement was written
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Whether the attempt failed because memory held something else than expected
    pub fn is_mismatch(&self) -> bool {
        matches!(self.failure, Some(PatchFailure::VerificationMismatch))
    }
}

impl fmt::Display for PatchResult {
    /// Formats the result as a single diagnostic line
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patch at {} with {} bytes ", self.address, self.size)?;
        match &self.failure {
            None => f.write_str("succeeded")?,
            Some(failure) => write!(f, "failed ({failure})")?,
        }
        if let Some(expected) = &self.expected {
            write!(f, "; expected: {expected}")?;
        }
        if let Some(actual) = self.actual.as_ref().filter(|_| !self.succeeded()) {
            write!(f, "; actual: {actual}")?;
        }
        write!(f, "; replacement: {}", self.replacement)
    }
}

/// Running count of patch attempts made through an engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    /// Attempts made
    pub attempted: usize,
    /// Attempts that wrote their replacement
    pub succeeded: usize,
    /// Attempts that failed
    pub failed: usize,
    /// Protection restores that failed. These never count as failed attempts
    pub restore_failures: usize,
}

impl Tally {
    /// Counts made since `earlier` was taken from the same engine.
    ///
    /// Counts never go below zero, even when `earlier` is actually the later tally.
    pub fn since(&self, earlier: &Tally) -> Tally {
        Tally {
            attempted: self.attempted.saturating_sub(earlier.attempted),
            succeeded: self.succeeded.saturating_sub(earlier.succeeded),
            failed: self.failed.saturating_sub(earlier.failed),
            restore_failures: self
                .restore_failures
                .saturating_sub(earlier.restore_failures),
        }
    }

    /// Records one attempt
    pub(crate) fn record(&mut self, result: &PatchResult) {
        self.attempted += 1;
        if result.succeeded() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

impl fmt::Display for Tally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} patches applied",
            self.succeeded, self.attempted
        )?;
        if self.restore_failures > 0 {
            write!(f, ", {} protection restores failed", self.restore_failures)?;
        }
        Ok(())
    }
}
