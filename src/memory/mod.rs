//! # Memory
//!
//! This module covers memory accessors, which read, write and re-protect the memory that patches are applied to.
//!
//! - [`local::LocalMemory`]: the current process, through direct copies and the `region` crate
//! - [`process::ProcessMemory`]: the current process, through the Win32 process memory API (Windows only)
//! - [`mock::MockMemory`]: a deterministic in-memory address space for tests

use std::fmt;

use thiserror::Error;

use crate::chunk::Chunk;

pub mod local;
pub mod mock;
#[cfg(windows)]
pub mod process;

/// An address inside the patched process.
///
/// Addresses are plain numbers; only memory accessors turn them into pointers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// Wraps a raw address
    pub const fn new(address: usize) -> Self {
        Self(address)
    }

    /// Returns the raw address
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns the address `offset` bytes further, or `None` on overflow
    pub fn checked_add(self, offset: usize) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }

    /// Converts the address into a pointer.
    ///
    /// Only accessors call this, the pointer is never dereferenced elsewhere.
    pub(crate) fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address into a mutable pointer. See [`Address::as_ptr`].
    pub(crate) fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl From<usize> for Address {
    fn from(address: usize) -> Self {
        Self(address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::UpperHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

/// Errors from memory accessors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// Fewer bytes than requested could be read
    #[error("could not read {len} bytes at {address}: {reason}")]
    Read {
        /// Start of the read
        address: Address,
        /// Requested length
        len: usize,
        /// What the accessor reported
        reason: String,
    },
    /// Fewer bytes than requested were written
    #[error("could not write {len} bytes at {address}: {reason}")]
    Write {
        /// Start of the write
        address: Address,
        /// Requested length
        len: usize,
        /// What the accessor reported
        reason: String,
    },
    /// The protection of the range could not be changed
    #[error("could not change protection of {len} bytes at {address}: {reason}")]
    Protect {
        /// Start of the range
        address: Address,
        /// Length of the range
        len: usize,
        /// What the accessor reported
        reason: String,
    },
}

/// Read, write and protection primitives over an address space.
///
/// Every operation is fallible and reports partial transfers as errors.
/// Accessors are used exclusively by one [`PatchEngine`](crate::patcher::PatchEngine) at a time.
pub trait MemoryAccessor {
    /// Page protection value understood by this accessor
    type Protection: Copy + fmt::Debug + PartialEq;

    /// Protection that allows reading, writing and executing
    const READ_WRITE_EXECUTE: Self::Protection;

    /// Reads `len` bytes at `address`
    fn read(&mut self, address: Address, len: usize) -> Result<Chunk, MemoryError>;

    /// Writes all of `bytes` at `address`
    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Changes the protection of the pages covering `[address, address + len)`.
    ///
    /// Returns the protection the range had before, which is passed back in here to restore it.
    fn protect(
        &mut self,
        address: Address,
        len: usize,
        protection: Self::Protection,
    ) -> Result<Self::Protection, MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::Address;

    #[test]
    /// Addresses format like the patch diagnostics expect
    fn test_address_format() {
        let address = Address::new(0x434B63);
        assert_eq!(address.to_string(), "0x434b63");
        assert_eq!(format!("{address:X}"), "434B63");
        assert_eq!(format!("{address:#010x}"), "0x00434b63");
    }

    #[test]
    /// Offsets never wrap around the address space
    fn test_checked_add() {
        assert_eq!(Address::new(0x1000).checked_add(5), Some(Address::new(0x1005)));
        assert_eq!(Address::new(usize::MAX).checked_add(1), None);
    }
}
