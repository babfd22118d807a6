#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod chunk;
pub mod code;
pub mod config;
pub mod dispatch;
pub mod hook;
pub mod logging;
pub mod memory;
pub mod patcher;
