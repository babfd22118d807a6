//! This module contains patch operations, a patch described as data

use crate::chunk::{Chunk, ParseError};
use crate::memory::Address;

/// A patch described as data.
///
/// With `expected` bytes the patch is verified: it is only written over exactly those bytes.
/// Without, it is unconditional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOperation {
    /// Address to patch
    pub address: Address,
    /// Bytes that must be present for the patch to be written
    pub expected: Option<Chunk>,
    /// Bytes to write
    pub replacement: Chunk,
}

impl PatchOperation {
    /// Creates a verified patch
    pub fn verified(
        address: Address,
        expected: impl Into<Chunk>,
        replacement: impl Into<Chunk>,
    ) -> Self {
        Self {
            address,
            expected: Some(expected.into()),
            replacement: replacement.into(),
        }
    }

    /// Creates an unconditional patch
    pub fn unconditional(address: Address, replacement: impl Into<Chunk>) -> Self {
        Self {
            address,
            expected: None,
            replacement: replacement.into(),
        }
    }

    /// Creates a patch from hex patterns
    pub fn from_hex(
        address: Address,
        expected: Option<&str>,
        replacement: &str,
    ) -> Result<Self, ParseError> {
        Ok(Self {
            address,
            expected: expected.map(Chunk::from_hex).transpose()?,
            replacement: Chunk::from_hex(replacement)?,
        })
    }

    /// Whether the patch checks the current bytes before writing
    pub fn is_verified(&self) -> bool {
        self.expected.is_some()
    }
}
