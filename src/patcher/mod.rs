//! # Patcher
//!
//! This module covers the patch engine, which overwrites code and data of the current process.
//!
//! Every attempt follows the same sequence: make the range writable, optionally check that it holds the
//! expected bytes, write the replacement, restore the previous protection. Once the protection has been
//! changed it is restored on every path, whatever the outcome.
//!
//! Attempts never panic and never return early with an error: each one yields a [`PatchResult`] so that
//! callers can carry on with their remaining patches.

use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::memory::{Address, MemoryAccessor};

mod mem;
pub mod operation;
pub mod result;

pub use operation::PatchOperation;
pub use result::{PatchFailure, PatchResult, Tally};

use mem::Unprotected;

/// Verified patch executor.
///
/// The engine owns its accessor: nothing else touches the memory while patches are applied.
/// It is meant to be driven from a single thread. Other threads of the process are not suspended, so
/// code being rewritten must not run concurrently.
#[derive(Debug)]
pub struct PatchEngine<M: MemoryAccessor> {
    /// Accessor for the patched memory
    memory: M,
    /// Counts of attempts made so far
    tally: Tally,
}

impl<M: MemoryAccessor> PatchEngine<M> {
    /// Creates an engine writing through `memory`
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            tally: Tally::default(),
        }
    }

    /// Returns the accessor
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Consumes the engine, returning the accessor
    pub fn into_inner(self) -> M {
        self.memory
    }

    /// Returns the counts of attempts made so far
    pub fn tally(&self) -> Tally {
        self.tally
    }

    /// Replaces `expected` with `replacement` at `address`.
    ///
    /// Nothing is written unless memory holds exactly `expected`, and both must be the same length.
    /// Applying the same patch twice fails the second time, since memory then holds the replacement.
    pub fn patch_verified(
        &mut self,
        address: Address,
        expected: &[u8],
        replacement: &[u8],
    ) -> PatchResult {
        let result = PatchResult::new(
            address,
            Some(Chunk::from(expected)),
            Chunk::from(replacement),
        );

        if expected.len() != replacement.len() {
            let failure = PatchFailure::SizeMismatch {
                expected: expected.len(),
                replacement: replacement.len(),
            };
            return Self::finish(&mut self.tally, result.fail(failure));
        }

        self.attempt(result, |memory, result| {
            let current = memory
                .read(address, expected.len())
                .map_err(PatchFailure::ReadFailed)?;
            let matches = current.as_slice() == expected;
            result.actual = Some(current);
            if !matches {
                return Err(PatchFailure::VerificationMismatch);
            }

            memory
                .write(address, replacement)
                .map_err(PatchFailure::WriteFailed)
        })
    }

    /// Writes `replacement` at `address` without looking at what is there.
    ///
    /// Meant for sites whose current bytes differ between builds, such as jump displacements.
    pub fn patch_unconditional(&mut self, address: Address, replacement: &[u8]) -> PatchResult {
        let result = PatchResult::new(address, None, Chunk::from(replacement));

        self.attempt(result, |memory, _| {
            memory
                .write(address, replacement)
                .map_err(PatchFailure::WriteFailed)
        })
    }

    /// Verified patch with both byte sequences given as hex patterns
    pub fn patch_hex(&mut self, address: Address, expected: &str, replacement: &str) -> PatchResult {
        match Chunk::from_hex(replacement) {
            Ok(replacement) => self.patch_hex_chunk(address, expected, &replacement),
            Err(e) => self.reject(address, Chunk::from_hex(expected).ok(), Chunk::new(), e.into()),
        }
    }

    /// Verified patch with the expected bytes given as a hex pattern
    pub fn patch_hex_chunk(&mut self, address: Address, expected: &str, replacement: &[u8]) -> PatchResult {
        match Chunk::from_hex(expected) {
            Ok(expected) => self.patch_verified(address, &expected, replacement),
            Err(e) => self.reject(address, None, Chunk::from(replacement), e.into()),
        }
    }

    /// Unconditional patch with the replacement given as a hex pattern
    pub fn patch_unconditional_hex(&mut self, address: Address, replacement: &str) -> PatchResult {
        match Chunk::from_hex(replacement) {
            Ok(replacement) => self.patch_unconditional(address, &replacement),
            Err(e) => self.reject(address, None, Chunk::new(), e.into()),
        }
    }

    /// Replaces `expected` with as many `nop`s
    pub fn patch_nop(&mut self, address: Address, expected: &str) -> PatchResult {
        match Chunk::from_hex(expected) {
            Ok(expected) => self.patch_verified(address, &expected, &Chunk::nops(expected.len())),
            Err(e) => self.reject(address, None, Chunk::new(), e.into()),
        }
    }

    /// Applies a patch described as data
    pub fn apply(&mut self, operation: &PatchOperation) -> PatchResult {
        match &operation.expected {
            Some(expected) => {
                self.patch_verified(operation.address, expected, &operation.replacement)
            }
            None => self.patch_unconditional(operation.address, &operation.replacement),
        }
    }

    /// Runs `body` with the range of `result` unprotected, restoring the protection afterwards
    fn attempt<F>(&mut self, mut result: PatchResult, body: F) -> PatchResult
    where
        F: FnOnce(&mut M, &mut PatchResult) -> Result<(), PatchFailure>,
    {
        let mut unprotected =
            match Unprotected::unprotect(&mut self.memory, result.address, result.size) {
                Ok(unprotected) => unprotected,
                Err(e) => {
                    let result = result.fail(PatchFailure::ProtectionFailed(e));
                    return Self::finish(&mut self.tally, result);
                }
            };

        let outcome = body(unprotected.memory(), &mut result);

        // the outcome stands whether or not the protection comes back
        if unprotected.restore().is_err() {
            self.tally.restore_failures += 1;
        }

        match outcome {
            Ok(()) => {
                result.actual = Some(result.replacement.clone());
                Self::finish(&mut self.tally, result)
            }
            Err(failure) => Self::finish(&mut self.tally, result.fail(failure)),
        }
    }

    /// Records a patch that failed before memory was touched
    pub(crate) fn reject(
        &mut self,
        address: Address,
        expected: Option<Chunk>,
        replacement: Chunk,
        failure: PatchFailure,
    ) -> PatchResult {
        let result = PatchResult::new(address, expected, replacement).fail(failure);
        Self::finish(&mut self.tally, result)
    }

    /// Counts and logs a finished attempt.
    ///
    /// Takes the tally alone so it can run while the accessor is still borrowed.
    fn finish(tally: &mut Tally, result: PatchResult) -> PatchResult {
        tally.record(&result);
        if result.succeeded() {
            debug!("{result}");
        } else {
            warn!("{result}");
        }
        result
    }
}
