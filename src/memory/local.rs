//! This module contains an accessor for the current process built on the `region` crate

use std::ptr;

use region::Protection;

use super::{Address, MemoryAccessor, MemoryError};
use crate::chunk::Chunk;

/// Accessor for the memory of the current process.
///
/// Reads and writes are plain copies, guarded by a `region` query of the pages involved so that
/// unmapped, guarded or insufficiently protected memory is reported as an error instead of faulting.
#[derive(Debug)]
pub struct LocalMemory {
    /// Prevents construction outside [`LocalMemory::new`]
    _private: (),
}

impl LocalMemory {
    /// Creates an accessor for the current process.
    ///
    /// # Safety
    ///
    /// Every address handed to this accessor must be memory not tracked by Rust,
    /// or memory that the caller ensures is not read or written through Rust references while it is accessed.
    /// Writing to code that is currently executing on another thread is undefined behavior.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }

    /// Checks that every page covering the range is mapped, unguarded and allows `access`
    fn check_access(address: Address, len: usize, access: Protection) -> Result<(), String> {
        let regions = region::query_range(address.as_ptr::<u8>(), len.max(1))
            .map_err(|e| e.to_string())?;

        for region in regions {
            let region = region.map_err(|e| e.to_string())?;
            if region.is_guarded() {
                return Err(format!("page at {:#x} is guarded", region.as_range().start));
            }
            if !region.protection().contains(access) {
                return Err(format!(
                    "page at {:#x} is {:?}",
                    region.as_range().start,
                    region.protection()
                ));
            }
        }

        Ok(())
    }

    /// Returns the protection shared by every page covering the range
    fn current_protection(address: Address, len: usize) -> Result<Protection, String> {
        let mut current = None;

        for region in region::query_range(address.as_ptr::<u8>(), len.max(1))
            .map_err(|e| e.to_string())?
        {
            let protection = region.map_err(|e| e.to_string())?.protection();
            match current {
                None => current = Some(protection),
                // a single value could not restore both protections later
                Some(p) if p != protection => {
                    return Err(format!("range mixes {p:?} and {protection:?} pages"))
                }
                Some(_) => {}
            }
        }

        current.ok_or_else(|| "range is not mapped".to_string())
    }
}

impl MemoryAccessor for LocalMemory {
    type Protection = Protection;

    const READ_WRITE_EXECUTE: Protection = Protection::READ_WRITE_EXECUTE;

    fn read(&mut self, address: Address, len: usize) -> Result<Chunk, MemoryError> {
        Self::check_access(address, len, Protection::READ).map_err(|reason| MemoryError::Read {
            address,
            len,
            reason,
        })?;

        let mut data = Vec::with_capacity(len);

        // Safety: `check_access` verified the whole range is mapped and readable,
        // `new`'s contract covers aliasing
        unsafe {
            ptr::copy(address.as_ptr::<u8>(), data.as_mut_ptr(), len);
            data.set_len(len);
        }

        Ok(Chunk::from(data))
    }

    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        Self::check_access(address, bytes.len(), Protection::WRITE).map_err(|reason| {
            MemoryError::Write {
                address,
                len: bytes.len(),
                reason,
            }
        })?;

        // Safety: `check_access` verified the whole range is mapped and writable
        unsafe {
            ptr::copy(bytes.as_ptr(), address.as_mut_ptr::<u8>(), bytes.len());
        }

        Ok(())
    }

    fn protect(
        &mut self,
        address: Address,
        len: usize,
        protection: Protection,
    ) -> Result<Protection, MemoryError> {
        let error = |reason: String| MemoryError::Protect {
            address,
            len,
            reason,
        };

        let previous = Self::current_protection(address, len).map_err(error)?;

        // Safety: only the protection changes, `new`'s contract covers what is mapped there
        unsafe { region::protect(address.as_ptr::<u8>(), len.max(1), protection) }
            .map_err(|e| error(e.to_string()))?;

        Ok(previous)
    }
}
