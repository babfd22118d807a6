//! This module contains an accessor for the current process built on the Win32 process memory API

use std::ffi::c_void;

use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Memory::{
    VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
};
use windows::Win32::System::Threading::GetCurrentProcess;

use super::{Address, MemoryAccessor, MemoryError};
use crate::chunk::Chunk;

/// Accessor for the memory of the current process through `ReadProcessMemory`, `WriteProcessMemory`
/// and `VirtualProtect`.
///
/// Byte counts reported by the API are checked against the requested length, so partial transfers fail.
#[derive(Debug)]
pub struct ProcessMemory {
    /// Pseudo handle of the current process, never closed
    process: HANDLE,
}

impl ProcessMemory {
    /// Opens the current process.
    ///
    /// # Safety
    ///
    /// Every address handed to this accessor must be memory not tracked by Rust,
    /// or memory that the caller ensures is not read or written through Rust references while it is accessed.
    /// Writing to code that is currently executing on another thread is undefined behavior.
    pub unsafe fn current() -> Self {
        Self {
            process: GetCurrentProcess(),
        }
    }
}

impl MemoryAccessor for ProcessMemory {
    type Protection = PAGE_PROTECTION_FLAGS;

    const READ_WRITE_EXECUTE: PAGE_PROTECTION_FLAGS = PAGE_EXECUTE_READWRITE;

    fn read(&mut self, address: Address, len: usize) -> Result<Chunk, MemoryError> {
        let mut data = vec![0u8; len];
        let mut read = 0usize;

        // Safety: `data` is valid for `len` bytes, the source is checked by the API
        let result = unsafe {
            ReadProcessMemory(
                self.process,
                address.as_ptr::<c_void>(),
                data.as_mut_ptr().cast(),
                len,
                Some(&mut read as *mut usize),
            )
        };

        transferred(result, read, len, |reason| MemoryError::Read {
            address,
            len,
            reason,
        })?;
        Ok(Chunk::from(data))
    }

    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut written = 0usize;

        // Safety: `bytes` is valid for its length, the destination is checked by the API
        let result = unsafe {
            WriteProcessMemory(
                self.process,
                address.as_ptr::<c_void>(),
                bytes.as_ptr().cast(),
                bytes.len(),
                Some(&mut written as *mut usize),
            )
        };

        transferred(result, written, bytes.len(), |reason| MemoryError::Write {
            address,
            len: bytes.len(),
            reason,
        })
    }

    fn protect(
        &mut self,
        address: Address,
        len: usize,
        protection: PAGE_PROTECTION_FLAGS,
    ) -> Result<PAGE_PROTECTION_FLAGS, MemoryError> {
        let mut previous = PAGE_PROTECTION_FLAGS::default();

        // Safety: only the protection changes, `current`'s contract covers what is mapped there
        unsafe {
            VirtualProtect(
                address.as_ptr::<c_void>(),
                len.max(1),
                protection,
                &mut previous,
            )
        }
            .map_err(|e| MemoryError::Protect {
                address,
                len,
                reason: e.to_string(),
            })?;

        Ok(previous)
    }
}

/// Fails when a transfer reported an error or moved fewer than `len` bytes
fn transferred(
    result: windows::core::Result<()>,
    moved: usize,
    len: usize,
    error: impl FnOnce(String) -> MemoryError,
) -> Result<(), MemoryError> {
    match result {
        Err(e) => Err(error(e.to_string())),
        Ok(()) if moved != len => Err(error(format!("only {moved} of {len} bytes transferred"))),
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use region::Protection;
    use windows::Win32::Foundation::E_FAIL;
    use windows::Win32::System::Memory::{PAGE_EXECUTE_READWRITE, PAGE_READONLY};

    use crate::memory::process::{transferred, ProcessMemory};
    use crate::memory::{Address, MemoryAccessor, MemoryError};

    /// Allocates `pages` pages filled with `0xCC`, the first left with `protection`, any others without access
    fn pages(pages: usize, protection: Protection) -> region::Allocation {
        let size = region::page::size();
        let mut allocation = region::alloc(size * pages, Protection::READ_WRITE).unwrap();
        unsafe {
            std::ptr::write_bytes(allocation.as_mut_ptr::<u8>(), 0xCC, allocation.len());
            region::protect(allocation.as_ptr::<u8>(), size, protection).unwrap();
            if pages > 1 {
                let rest = allocation.as_ptr::<u8>().add(size);
                region::protect(rest, size * (pages - 1), Protection::NONE).unwrap();
            }
        }
        allocation
    }

    /// Address of the first byte of `allocation`
    fn base(allocation: &region::Allocation) -> Address {
        Address::new(allocation.as_ptr::<u8>() as usize)
    }

    #[test]
    /// Protection changes report the previous protection and can be undone
    fn test_protect_roundtrip() {
        let allocation = pages(1, Protection::READ);
        let address = base(&allocation);
        let mut memory = unsafe { ProcessMemory::current() };

        let previous = memory
            .protect(address, 4, PAGE_EXECUTE_READWRITE)
            .unwrap();
        assert_eq!(previous, PAGE_READONLY);

        memory.write(address, &[0x31, 0xC0, 0x40, 0xC3]).unwrap();
        assert_eq!(memory.read(address, 4).unwrap().to_hex(), "31 C0 40 C3");

        let unlocked = memory.protect(address, 4, previous).unwrap();
        assert_eq!(unlocked, PAGE_EXECUTE_READWRITE);
        assert_eq!(
            region::query(allocation.as_ptr::<u8>()).unwrap().protection(),
            Protection::READ
        );
    }

    #[test]
    /// Zero-length ranges re-protect the page holding the address
    fn test_protect_empty_range() {
        let allocation = pages(1, Protection::READ);
        let address = base(&allocation);
        let mut memory = unsafe { ProcessMemory::current() };

        assert_eq!(
            memory.protect(address, 0, PAGE_EXECUTE_READWRITE).unwrap(),
            PAGE_READONLY
        );
        assert_eq!(memory.protect(address, 0, PAGE_READONLY).unwrap(), PAGE_EXECUTE_READWRITE);
    }

    #[test]
    /// Inaccessible pages can be neither read nor written
    fn test_no_access() {
        let allocation = pages(1, Protection::NONE);
        let address = base(&allocation);
        let mut memory = unsafe { ProcessMemory::current() };

        assert!(matches!(
            memory.write(address, &[0xC3]),
            Err(MemoryError::Write { len: 1, .. })
        ));
        assert!(matches!(
            memory.read(address, 8),
            Err(MemoryError::Read { len: 8, .. })
        ));
    }

    #[test]
    /// Reads running into an inaccessible page fail as a whole
    fn test_partial_read() {
        let allocation = pages(2, Protection::READ);
        let end = base(&allocation).get() + region::page::size();
        let mut memory = unsafe { ProcessMemory::current() };

        assert!(matches!(
            memory.read(Address::new(end - 2), 4),
            Err(MemoryError::Read { len: 4, .. })
        ));
        assert_eq!(memory.read(Address::new(end - 2), 2).unwrap().to_hex(), "CC CC");
    }

    #[test]
    /// Short transfers are errors even when the API reports success
    fn test_short_count() {
        let error = |reason: String| MemoryError::Write {
            address: Address::new(0x1000),
            len: 4,
            reason,
        };

        assert_eq!(transferred(Ok(()), 4, 4, error), Ok(()));
        assert_eq!(
            transferred(Ok(()), 2, 4, error),
            Err(error("only 2 of 4 bytes transferred".to_string()))
        );
        assert!(matches!(
            transferred(Err(E_FAIL.into()), 0, 4, error),
            Err(MemoryError::Write { len: 4, .. })
        ));
    }
}
