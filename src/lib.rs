//! machkit - A validating Mach-O engine for kernel extensions.
//!
//! This library parses untrusted 32-bit and 64-bit Mach-O images (optionally
//! wrapped in a fat archive), walks their segments and sections, resolves
//! symbols and relocations, and rewrites images in place or into a new
//! buffer. Every offset and size read from the file is bounds-checked before
//! it is dereferenced; malformed input yields an [`Error`], never a panic.
//!
//! # Features
//!
//! - Fat archive slice selection
//! - One context type for both widths, parameterized by [`MachWidth`]
//! - Segment/section walking and address lookups
//! - Symbol table, string pool, indirect table and relocation loading
//! - Expansion of a file image into its virtual-memory layout
//! - Load command stripping and segment merging
//! - C++ runtime name helpers for kext metaclasses and vtables
//!
//! # Example
//!
//! ```no_run
//! use machkit::{MachoContext64, SegmentRecord};
//!
//! fn main() -> machkit::Result<()> {
//!     let data = std::fs::read("MyDriver.kext/Contents/MacOS/MyDriver").unwrap();
//!     let ctx = MachoContext64::new(&data[..], 0)?;
//!
//!     for segment in ctx.segments() {
//!         println!("{} {:#x}", segment.name(), segment.command.vmaddr());
//!     }
//!
//!     let expanded = ctx.expand_to_vec(true)?;
//!     std::fs::write("MyDriver.expanded", expanded).unwrap();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod cxx;
pub mod error;
pub mod fat;
pub mod macho;
pub mod relocation;
pub mod symbols;
pub mod transform;
pub mod util;
pub mod walker;

// Re-export main types
pub use context::{
    detect_bitness, runtime_entry_address, Limits, LoadCommandRef, MachoContext, MachoContext32,
    MachoContext64,
};
pub use error::{Error, ErrorKind, Result};
pub use fat::{fat_architectures, select_architecture, FatSlice};
pub use macho::{Bitness, HeaderRecord, MachWidth, Macho32, Macho64, SectionRecord, SegmentRecord};
pub use relocation::{RelocationInfo, RelocationPool, RelocationTable};
pub use symbols::{RelocationTarget, Symbol, SymbolSlot, SymbolTableView, SymbolTables};
pub use transform::{strip_load_commands, Expansion};
pub use walker::{SectionRef, SegmentRef};
