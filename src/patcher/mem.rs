//! This module contains the guard that makes a range writable for the duration of a patch

use tracing::warn;

use crate::memory::{Address, MemoryAccessor, MemoryError};

/// Keeps a range at [`MemoryAccessor::READ_WRITE_EXECUTE`] and restores its previous protection when dropped.
///
/// Restoring never fails the patch that was written under the guard: a failed restore is logged
/// and reported through [`Unprotected::restore`] only.
pub(crate) struct Unprotected<'a, M: MemoryAccessor> {
    /// Accessor the range belongs to
    memory: &'a mut M,
    /// Start of the range
    address: Address,
    /// Length of the range
    len: usize,
    /// Protection to restore. `None` once restored
    previous: Option<M::Protection>,
}

impl<'a, M: MemoryAccessor> Unprotected<'a, M> {
    /// Makes `[address, address + len)` readable, writable and executable
    pub(crate) fn unprotect(
        memory: &'a mut M,
        address: Address,
        len: usize,
    ) -> Result<Self, MemoryError> {
        let previous = memory.protect(address, len, M::READ_WRITE_EXECUTE)?;
        Ok(Self {
            memory,
            address,
            len,
            previous: Some(previous),
        })
    }

    /// Accessor to read and write the unprotected range through
    pub(crate) fn memory(&mut self) -> &mut M {
        self.memory
    }

    /// Restores the previous protection now rather than when the guard goes out of scope
    pub(crate) fn restore(mut self) -> Result<(), MemoryError> {
        self.restore_previous()
    }

    /// Restores the previous protection if it hasn't been restored yet
    fn restore_previous(&mut self) -> Result<(), MemoryError> {
        let Some(previous) = self.previous.take() else {
            return Ok(());
        };

        self.memory
            .protect(self.address, self.len, previous)
            .map(|_| ())
            .map_err(|e| {
                warn!(
                    "could not restore protection {previous:?} of {} bytes at {}: {e}",
                    self.len, self.address
                );
                e
            })
    }
}

impl<M: MemoryAccessor> Drop for Unprotected<'_, M> {
    fn drop(&mut self) {
        // already logged
        let _ = self.restore_previous();
    }
}
