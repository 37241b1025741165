//! Mach-O file format handling.
//!
//! This module provides the on-disk record types, the constants shared with
//! the Mach-O format, and the [`MachWidth`] abstraction that lets the engine
//! treat 32-bit and 64-bit images with one implementation.

mod constants;
mod structs;
mod width;

#[cfg(test)]
pub(crate) mod testing;

pub use constants::*;
pub use structs::*;
pub use width::*;
