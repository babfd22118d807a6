//! # Hook
//!
//! This module covers call site redirection: rewriting a near `call` or `jmp` so that it lands on a
//! replacement function.
//!
//! Redirections are ordinary verified patches. The instruction at the call site must match the expected
//! prefix, which is usually the original instruction with its displacement.

use std::fmt;

use thiserror::Error;

use crate::chunk::Chunk;
use crate::code::x86::{rel32, REL32_LEN};
use crate::memory::{Address, MemoryAccessor};
use crate::patcher::{PatchEngine, PatchFailure, PatchResult};

/// Opcode of a 5-byte relative branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Near `call rel32`
    Call = 0xE8,
    /// Near `jmp rel32`
    Jump = 0xE9,
}

/// A byte that is neither [`Opcode::Call`] nor [`Opcode::Jump`]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{0:#04x} is neither a near call nor a near jump")]
pub struct UnknownOpcode(pub u8);

impl TryFrom<u8> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0xE8 => Ok(Self::Call),
            0xE9 => Ok(Self::Jump),
            _ => Err(UnknownOpcode(byte)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        opcode as u8
    }
}

/// Address of code a call site is redirected to.
///
/// Kept apart from [`Address`] so that a patch target can't be mixed up with the patched location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionPointer(usize);

impl FunctionPointer {
    /// Wraps a raw code address
    pub const fn from_raw(address: usize) -> Self {
        Self(address)
    }

    /// Takes the address of a function, usually `handler as *const ()`
    pub fn from_ptr<T>(function: *const T) -> Self {
        Self(function as usize)
    }

    /// Returns the raw code address
    pub const fn address(self) -> usize {
        self.0
    }
}

impl fmt::Display for FunctionPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A call site redirection described as data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDescriptor {
    /// Address of the instruction to rewrite
    pub call_site: Address,
    /// Bytes that must be at the call site, as long as the emitted instruction
    pub expected_prefix: Chunk,
    /// Where the rewritten instruction lands
    pub target: FunctionPointer,
    /// Branch to emit
    pub opcode: Opcode,
}

impl HookDescriptor {
    /// Redirects the `call` at `call_site` to `target`
    pub fn call(call_site: Address, expected_prefix: impl Into<Chunk>, target: FunctionPointer) -> Self {
        Self {
            call_site,
            expected_prefix: expected_prefix.into(),
            target,
            opcode: Opcode::Call,
        }
    }

    /// Replaces the instruction at `call_site` with a `jmp` to `target`
    pub fn jump(call_site: Address, expected_prefix: impl Into<Chunk>, target: FunctionPointer) -> Self {
        Self {
            call_site,
            expected_prefix: expected_prefix.into(),
            target,
            opcode: Opcode::Jump,
        }
    }
}

impl<M: MemoryAccessor> PatchEngine<M> {
    /// Rewrites the instruction at `call_site` into a branch to `target`.
    ///
    /// The call site must hold `expected`, which has to be exactly 5 bytes long.
    pub fn patch_call(
        &mut self,
        call_site: Address,
        expected: &str,
        target: FunctionPointer,
        opcode: Opcode,
    ) -> PatchResult {
        match Chunk::from_hex(expected) {
            Ok(expected) => self.redirect(call_site, expected, target, opcode),
            Err(e) => self.reject(call_site, None, Chunk::new(), e.into()),
        }
    }

    /// Applies a redirection described as data
    pub fn hook(&mut self, descriptor: &HookDescriptor) -> PatchResult {
        self.redirect(
            descriptor.call_site,
            descriptor.expected_prefix.clone(),
            descriptor.target,
            descriptor.opcode,
        )
    }

    /// Encodes the branch and writes it over `expected`
    fn redirect(
        &mut self,
        call_site: Address,
        expected: Chunk,
        target: FunctionPointer,
        opcode: Opcode,
    ) -> PatchResult {
        if expected.len() != REL32_LEN {
            let failure = PatchFailure::SizeMismatch {
                expected: expected.len(),
                replacement: REL32_LEN,
            };
            return self.reject(call_site, Some(expected), Chunk::new(), failure);
        }

        match rel32(opcode.into(), call_site.get(), target.address()) {
            Some(replacement) => self.patch_verified(call_site, &expected, &replacement),
            None => {
                let failure = PatchFailure::DisplacementOutOfRange {
                    call_site,
                    target: target.address(),
                };
                self.reject(call_site, Some(expected), Chunk::new(), failure)
            }
        }
    }
}
