//! # Code
//!
//! This module covers the machine code the crate emits itself

pub mod x86;
