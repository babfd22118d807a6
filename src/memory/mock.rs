//! This module contains a deterministic in-memory accessor for tests
//!
//! [`MockMemory`] models an address space as a map of bytes plus a map of page protections.
//! It enforces protections the way a real process does, can be told to fail any primitive,
//! and records every primitive call it served so tests can assert on the exact sequence.

use std::collections::{BTreeMap, BTreeSet};

use region::Protection;

use super::{Address, MemoryAccessor, MemoryError};
use crate::chunk::Chunk;

/// Page size of the mock address space
pub const PAGE_SIZE: usize = 0x1000;

/// A primitive call served by [`MockMemory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// [`MemoryAccessor::read`]
    Read {
        /// Start of the read
        address: Address,
        /// Length of the read
        len: usize,
    },
    /// [`MemoryAccessor::write`]
    Write {
        /// Start of the write
        address: Address,
        /// Length of the write
        len: usize,
    },
    /// [`MemoryAccessor::protect`]
    Protect {
        /// Start of the range
        address: Address,
        /// Length of the range
        len: usize,
        /// Requested protection
        protection: Protection,
    },
}

/// Deterministic address space for tests
#[derive(Debug, Clone, Default)]
pub struct MockMemory {
    /// Mapped bytes
    bytes: BTreeMap<usize, u8>,
    /// Protection of every mapped page, keyed by page base
    pages: BTreeMap<usize, Protection>,
    /// Indices of `protect` calls that should fail
    failing_protects: BTreeSet<usize>,
    /// Number of `protect` calls served so far
    protect_calls: usize,
    /// Whether reads fail
    failing_reads: bool,
    /// Whether writes fail
    failing_writes: bool,
    /// Every call served, in order
    log: Vec<Access>,
}

impl MockMemory {
    /// Creates an empty address space
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `address`, giving every page they touch `protection`.
    ///
    /// Bytes that would lie past the end of the address space are dropped.
    pub fn map(mut self, address: usize, bytes: &[u8], protection: Protection) -> Self {
        for page in Self::pages_covering(Address::new(address), bytes.len()) {
            self.pages.insert(page, protection);
        }
        for (i, byte) in bytes.iter().enumerate() {
            let Some(at) = address.checked_add(i) else {
                break;
            };
            self.bytes.insert(at, *byte);
        }
        self
    }

    /// Maps a hex pattern at `address`. See [`MockMemory::map`].
    ///
    /// # Panics
    ///
    /// Panics when `pattern` is not valid hex.
    pub fn map_hex(self, address: usize, pattern: &str, protection: Protection) -> Self {
        let chunk = Chunk::from_hex(pattern).expect("mock pattern must be valid hex");
        self.map(address, &chunk, protection)
    }

    /// Makes the `index`-th call to `protect` (counting from zero) fail
    pub fn fail_protect_call(mut self, index: usize) -> Self {
        self.failing_protects.insert(index);
        self
    }

    /// Makes every read fail
    pub fn fail_reads(mut self, fail: bool) -> Self {
        self.failing_reads = fail;
        self
    }

    /// Makes every write fail
    pub fn fail_writes(mut self, fail: bool) -> Self {
        self.failing_writes = fail;
        self
    }

    /// Returns mapped bytes without checking protection or logging the access
    pub fn peek(&self, address: usize, len: usize) -> Option<Chunk> {
        (0..len)
            .map(|i| address.checked_add(i).and_then(|a| self.bytes.get(&a).copied()))
            .collect::<Option<Vec<_>>>()
            .map(Chunk::from)
    }

    /// Returns the protection of the page containing `address`
    pub fn protection(&self, address: usize) -> Option<Protection> {
        self.pages.get(&(address - address % PAGE_SIZE)).copied()
    }

    /// Returns a snapshot of every page protection
    pub fn protections(&self) -> BTreeMap<usize, Protection> {
        self.pages.clone()
    }

    /// Returns every call served so far
    pub fn log(&self) -> &[Access] {
        &self.log
    }

    /// Returns the number of reads and writes served so far
    pub fn transfers(&self) -> usize {
        self.log
            .iter()
            .filter(|a| matches!(a, Access::Read { .. } | Access::Write { .. }))
            .count()
    }

    /// Forgets every call served so far
    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Returns the base of every page touching `[address, address + len)`
    fn pages_covering(address: Address, len: usize) -> impl Iterator<Item = usize> {
        let start = address.get() - address.get() % PAGE_SIZE;
        let end = address.get().saturating_add(len.max(1));
        (start..end).step_by(PAGE_SIZE)
    }

    /// Checks that every page of the range is mapped and allows `access`
    fn check_access(&self, address: Address, len: usize, access: Protection) -> Result<(), String> {
        for page in Self::pages_covering(address, len) {
            match self.pages.get(&page) {
                None => return Err(format!("page {page:#x} is not mapped")),
                Some(p) if !p.contains(access) => {
                    return Err(format!("page {page:#x} is {p:?}"));
                }
                Some(_) => {}
            }
        }
        for i in 0..len {
            match address.get().checked_add(i) {
                None => return Err("range wraps around the address space".to_string()),
                Some(a) if !self.bytes.contains_key(&a) => {
                    return Err(format!("byte {a:#x} is not mapped"));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl MemoryAccessor for MockMemory {
    type Protection = Protection;

    const READ_WRITE_EXECUTE: Protection = Protection::READ_WRITE_EXECUTE;

    fn read(&mut self, address: Address, len: usize) -> Result<Chunk, MemoryError> {
        self.log.push(Access::Read { address, len });

        let error = |reason: String| MemoryError::Read {
            address,
            len,
            reason,
        };
        if self.failing_reads {
            return Err(error("injected read failure".to_string()));
        }
        self.check_access(address, len, Protection::READ)
            .map_err(error)?;

        self.peek(address.get(), len)
            .ok_or_else(|| error("range is not mapped".to_string()))
    }

    fn write(&mut self, address: Address, bytes: &[u8]) -> Result<(), MemoryError> {
        self.log.push(Access::Write {
            address,
            len: bytes.len(),
        });

        let error = |reason: String| MemoryError::Write {
            address,
            len: bytes.len(),
            reason,
        };
        if self.failing_writes {
            return Err(error("injected write failure".to_string()));
        }
        self.check_access(address, bytes.len(), Protection::WRITE)
            .map_err(error)?;

        // `check_access` saw every byte of the range mapped, so no address overflows
        for (i, byte) in bytes.iter().enumerate() {
            self.bytes.insert(address.get() + i, *byte);
        }
        Ok(())
    }

    fn protect(
        &mut self,
        address: Address,
        len: usize,
        protection: Protection,
    ) -> Result<Protection, MemoryError> {
        self.log.push(Access::Protect {
            address,
            len,
            protection,
        });

        let call = self.protect_calls;
        self.protect_calls += 1;

        let error = |reason: String| MemoryError::Protect {
            address,
            len,
            reason,
        };
        if self.failing_protects.contains(&call) {
            return Err(error(format!("injected failure of protect call {call}")));
        }

        let mut previous = None;
        for page in Self::pages_covering(address, len) {
            let current = *self
                .pages
                .get(&page)
                .ok_or_else(|| error(format!("page {page:#x} is not mapped")))?;
            match previous {
                None => previous = Some(current),
                Some(p) if p != current => {
                    return Err(error(format!("range mixes {p:?} and {current:?} pages")));
                }
                Some(_) => {}
            }
        }

        for page in Self::pages_covering(address, len) {
            self.pages.insert(page, protection);
        }

        previous.ok_or_else(|| error("range is empty".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use region::Protection;

    use crate::memory::mock::{Access, MockMemory, PAGE_SIZE};
    use crate::memory::{Address, MemoryAccessor, MemoryError};

    #[test]
    /// Protection is enforced on reads and writes
    fn test_enforces_protection() {
        let mut memory = MockMemory::new().map_hex(0x1000, "C3 90 90 90", Protection::READ);

        assert_eq!(
            memory.read(Address::new(0x1000), 4).unwrap().to_hex(),
            "C3 90 90 90"
        );
        assert!(matches!(
            memory.write(Address::new(0x1000), &[0x31]),
            Err(MemoryError::Write { .. })
        ));

        let previous = memory
            .protect(Address::new(0x1000), 4, Protection::READ_WRITE_EXECUTE)
            .unwrap();
        assert_eq!(previous, Protection::READ);
        memory.write(Address::new(0x1000), &[0x31]).unwrap();
        assert_eq!(memory.peek(0x1000, 2).unwrap().to_hex(), "31 90");
    }

    #[test]
    /// Unmapped bytes can't be read, even on a mapped page
    fn test_unmapped() {
        let mut memory = MockMemory::new().map_hex(0x1000, "C3", Protection::READ);
        assert!(memory.read(Address::new(0x1000), 2).is_err());
        assert!(memory.read(Address::new(0x8000), 1).is_err());
        assert!(memory
            .protect(Address::new(0x8000), 1, Protection::READ)
            .is_err());
    }

    #[test]
    /// Ranges spanning pages with different protections can't be re-protected
    fn test_mixed_pages() {
        let mut memory = MockMemory::new()
            .map(PAGE_SIZE - 2, &[0; 2], Protection::READ)
            .map(PAGE_SIZE, &[0; 2], Protection::READ_EXECUTE);

        let result = memory.protect(Address::new(PAGE_SIZE - 2), 4, Protection::READ_WRITE);
        assert!(matches!(result, Err(MemoryError::Protect { .. })));
        assert_eq!(memory.protection(PAGE_SIZE - 1), Some(Protection::READ));
        assert_eq!(memory.protection(PAGE_SIZE), Some(Protection::READ_EXECUTE));
    }

    #[test]
    /// Ranges running past the end of the address space fail instead of overflowing
    fn test_end_of_address_space() {
        let last = usize::MAX - 1;
        let mut memory = MockMemory::new().map(last, &[0x74, 0x0A, 0xEB], Protection::READ_WRITE);

        assert_eq!(memory.peek(last, 2).unwrap().to_hex(), "74 0A");
        assert_eq!(memory.peek(last, 3), None);
        assert!(matches!(
            memory.read(Address::new(last), 3),
            Err(MemoryError::Read { len: 3, .. })
        ));
        assert!(matches!(
            memory.write(Address::new(usize::MAX), &[0x90, 0x90]),
            Err(MemoryError::Write { len: 2, .. })
        ));
        assert_eq!(memory.peek(usize::MAX, 1).unwrap().to_hex(), "0A");
    }

    #[test]
    /// Injected failures hit exactly the selected calls, and every call is logged
    fn test_injection_and_log() {
        let mut memory = MockMemory::new()
            .map_hex(0x2000, "E8 00 00 00 00", Protection::READ_EXECUTE)
            .fail_protect_call(1);

        let address = Address::new(0x2000);
        let previous = memory
            .protect(address, 5, Protection::READ_WRITE_EXECUTE)
            .unwrap();
        assert!(memory.protect(address, 5, previous).is_err());
        assert!(memory.protect(address, 5, previous).is_ok());

        assert_eq!(memory.log().len(), 3);
        assert_eq!(
            memory.log()[0],
            Access::Protect {
                address,
                len: 5,
                protection: Protection::READ_WRITE_EXECUTE
            }
        );
        assert_eq!(memory.transfers(), 0);

        let mut memory = memory.fail_reads(true);
        assert!(memory.read(address, 1).is_err());
        assert_eq!(memory.transfers(), 1);
    }
}
