//! Mach-O binary structures.
//!
//! Little-endian on-disk records. Where the format differs by width a record
//! comes in a 32-bit and a 64-bit shape, and [`MachWidth`](super::MachWidth)
//! picks one.

use std::fmt;

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use super::constants::*;
use crate::util::{encode_fixed_name, fixed_name_str};

// =============================================================================
// Header Structures
// =============================================================================

/// 32-bit Mach-O header.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader {
    /// MH_MAGIC
    pub magic: u32,
    /// Processor family
    pub cputype: u32,
    /// Processor variant
    pub cpusubtype: u32,
    /// Kind of image (MH_OBJECT, MH_KEXT_BUNDLE, ...)
    pub filetype: u32,
    /// Count of load commands after the header
    pub ncmds: u32,
    /// Byte length of the load command list
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
}

impl MachHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 28;
}

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// MH_MAGIC_64
    pub magic: u32,
    /// Processor family
    pub cputype: u32,
    /// Processor variant
    pub cpusubtype: u32,
    /// Kind of image (MH_OBJECT, MH_KEXT_BUNDLE, ...)
    pub filetype: u32,
    /// Count of load commands after the header
    pub ncmds: u32,
    /// Byte length of the load command list
    pub sizeofcmds: u32,
    /// MH_* flags
    pub flags: u32,
    /// Padding to a word boundary
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;
}

// =============================================================================
// Fat Archive
// =============================================================================

/// Fat archive header. Stored big-endian on disk.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct FatHeader {
    /// FAT_MAGIC
    pub magic: u32,
    /// Number of architecture entries that follow
    pub nfat_arch: u32,
}

impl FatHeader {
    /// Size of the fat header.
    pub const SIZE: usize = 8;
}

/// Fat architecture entry, with fields already converted to host order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FatArch {
    /// CPU type of the slice
    pub cputype: u32,
    /// CPU subtype of the slice
    pub cpusubtype: u32,
    /// Offset of the slice in the archive
    pub offset: u32,
    /// Size of the slice
    pub size: u32,
    /// Alignment as a power of two
    pub align: u32,
}

impl FatArch {
    /// Size of an on-disk architecture entry.
    pub const SIZE: usize = 20;
}

// =============================================================================
// Load Command Header
// =============================================================================

/// Common prefix of every load command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    /// LC_* code
    pub cmd: u32,
    /// Command length including this header
    pub cmdsize: u32,
}

impl LoadCommand {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segment Commands
// =============================================================================

/// 32-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand {
    /// LC_SEGMENT
    pub cmd: u32,
    /// Command length, section records included
    pub cmdsize: u32,
    /// Segment name, NUL-padded but not necessarily terminated
    pub segname: [u8; 16],
    /// Load address
    pub vmaddr: u32,
    /// Bytes reserved in memory
    pub vmsize: u32,
    /// Container-relative offset of the file contents
    pub fileoff: u32,
    /// Bytes backed by the file
    pub filesize: u32,
    /// Most permissive protection allowed
    pub maxprot: u32,
    /// Protection at load time
    pub initprot: u32,
    /// Section records following this command
    pub nsects: u32,
    /// SG_* flags
    pub flags: u32,
}

impl SegmentCommand {
    /// Size of the command without its sections.
    pub const SIZE: usize = 56;
}

impl Default for SegmentCommand {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT,
            cmdsize: Self::SIZE as u32,
            ..FromZeros::new_zeroed()
        }
    }
}

/// 64-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Command length, section records included
    pub cmdsize: u32,
    /// Segment name, NUL-padded but not necessarily terminated
    pub segname: [u8; 16],
    /// Load address
    pub vmaddr: u64,
    /// Bytes reserved in memory
    pub vmsize: u64,
    /// Container-relative offset of the file contents
    pub fileoff: u64,
    /// Bytes backed by the file
    pub filesize: u64,
    /// Most permissive protection allowed
    pub maxprot: u32,
    /// Protection at load time
    pub initprot: u32,
    /// Section records following this command
    pub nsects: u32,
    /// SG_* flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size of the command without its sections.
    pub const SIZE: usize = 72;
}

impl Default for SegmentCommand64 {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT_64,
            cmdsize: Self::SIZE as u32,
            ..FromZeros::new_zeroed()
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// 32-bit section.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section {
    /// Section name, NUL-padded but not necessarily terminated
    pub sectname: [u8; 16],
    /// Segment name, NUL-padded but not necessarily terminated
    pub segname: [u8; 16],
    /// Load address
    pub addr: u32,
    /// Byte length in memory
    pub size: u32,
    /// File offset of the contents, zero for zero-fill
    pub offset: u32,
    /// Alignment exponent
    pub align: u32,
    /// File offset of the section's relocations
    pub reloff: u32,
    /// Relocation count
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Type-specific (indirect index or stub size)
    pub reserved1: u32,
    /// Type-specific (indirect index or stub size)
    pub reserved2: u32,
}

impl Section {
    /// Size of one section record.
    pub const SIZE: usize = 68;
}

/// 64-bit section.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section64 {
    /// Section name, NUL-padded but not necessarily terminated
    pub sectname: [u8; 16],
    /// Segment name, NUL-padded but not necessarily terminated
    pub segname: [u8; 16],
    /// Load address
    pub addr: u64,
    /// Byte length in memory
    pub size: u64,
    /// File offset of the contents, zero for zero-fill
    pub offset: u32,
    /// Alignment exponent
    pub align: u32,
    /// File offset of the section's relocations
    pub reloff: u32,
    /// Relocation count
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Type-specific (indirect index or stub size)
    pub reserved1: u32,
    /// Type-specific (indirect index or stub size)
    pub reserved2: u32,
    /// Unused
    pub reserved3: u32,
}

impl Section64 {
    /// Size of one section record.
    pub const SIZE: usize = 80;
}

// =============================================================================
// Symbol Table Commands
// =============================================================================

/// Symbol table command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    /// LC_SYMTAB
    pub cmd: u32,
    /// Command length
    pub cmdsize: u32,
    /// File offset of the nlist records
    pub symoff: u32,
    /// Count of nlist records
    pub nsyms: u32,
    /// File offset of the string pool
    pub stroff: u32,
    /// Byte length of the string pool
    pub strsize: u32,
}

impl SymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

impl Default for SymtabCommand {
    fn default() -> Self {
        Self {
            cmd: LC_SYMTAB,
            cmdsize: Self::SIZE as u32,
            ..FromZeros::new_zeroed()
        }
    }
}

/// Dynamic symbol table command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DysymtabCommand {
    /// LC_DYSYMTAB
    pub cmd: u32,
    /// Command length
    pub cmdsize: u32,
    /// First local symbol
    pub ilocalsym: u32,
    /// Local symbol count
    pub nlocalsym: u32,
    /// First exported symbol
    pub iextdefsym: u32,
    /// Exported symbol count
    pub nextdefsym: u32,
    /// First undefined symbol
    pub iundefsym: u32,
    /// Undefined symbol count
    pub nundefsym: u32,
    /// Table of contents offset
    pub tocoff: u32,
    /// Table of contents entries
    pub ntoc: u32,
    /// Module table offset
    pub modtaboff: u32,
    /// Module table entries
    pub nmodtab: u32,
    /// Referenced symbol table offset
    pub extrefsymoff: u32,
    /// Referenced symbol entries
    pub nextrefsyms: u32,
    /// Indirect symbol table offset
    pub indirectsymoff: u32,
    /// Indirect symbol entries
    pub nindirectsyms: u32,
    /// External relocation pool offset
    pub extreloff: u32,
    /// External relocation count
    pub nextrel: u32,
    /// Local relocation pool offset
    pub locreloff: u32,
    /// Local relocation count
    pub nlocrel: u32,
}

impl DysymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 80;

    /// Adds `delta` to every nonzero pool offset.
    ///
    /// Used when the LINKEDIT segment moves during expansion.
    pub fn shift_offsets(&mut self, delta: u32) -> Option<()> {
        for field in [
            &mut self.tocoff,
            &mut self.modtaboff,
            &mut self.extrefsymoff,
            &mut self.indirectsymoff,
            &mut self.extreloff,
            &mut self.locreloff,
        ] {
            if *field != 0 {
                *field = field.checked_add(delta)?;
            }
        }
        Some(())
    }
}

impl Default for DysymtabCommand {
    fn default() -> Self {
        Self {
            cmd: LC_DYSYMTAB,
            cmdsize: Self::SIZE as u32,
            ..FromZeros::new_zeroed()
        }
    }
}

/// 32-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist {
    /// Name offset in the string pool
    pub n_strx: u32,
    /// N_STAB, N_PEXT, N_TYPE and N_EXT bits
    pub n_type: u8,
    /// One-based section ordinal, or NO_SECT
    pub n_sect: u8,
    /// Descriptor bits
    pub n_desc: u16,
    /// Address, or a string index for N_INDR
    pub n_value: u32,
}

impl Nlist {
    /// Size of one symbol record.
    pub const SIZE: usize = 12;
}

/// 64-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist64 {
    /// Name offset in the string pool
    pub n_strx: u32,
    /// N_STAB, N_PEXT, N_TYPE and N_EXT bits
    pub n_type: u8,
    /// One-based section ordinal, or NO_SECT
    pub n_sect: u8,
    /// Descriptor bits
    pub n_desc: u16,
    /// Address, or a string index for N_INDR
    pub n_value: u64,
}

impl Nlist64 {
    /// Size of one symbol record.
    pub const SIZE: usize = 16;
}

// =============================================================================
// UUID Command
// =============================================================================

/// UUID command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct UuidCommand {
    /// LC_UUID
    pub cmd: u32,
    /// Command length
    pub cmdsize: u32,
    /// UUID
    pub uuid: [u8; 16],
}

impl UuidCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

impl Default for UuidCommand {
    fn default() -> Self {
        Self {
            cmd: LC_UUID,
            cmdsize: Self::SIZE as u32,
            ..FromZeros::new_zeroed()
        }
    }
}

// =============================================================================
// Thread Command
// =============================================================================

/// Thread command header, followed by `count` 32-bit words of state.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ThreadCommand {
    /// LC_THREAD or LC_UNIXTHREAD
    pub cmd: u32,
    /// Command length
    pub cmdsize: u32,
    /// Flavor of the first thread state
    pub flavor: u32,
    /// Size of the first thread state in 32-bit words
    pub count: u32,
}

impl ThreadCommand {
    /// Size of the fixed part of this command.
    pub const SIZE: usize = 16;
}

// =============================================================================
// Names and Display
// =============================================================================

macro_rules! impl_segment_display {
    ($ty:ty) => {
        impl $ty {
            /// Returns the segment name as a string.
            pub fn name(&self) -> &str {
                fixed_name_str(&self.segname)
            }

            /// Sets the segment name from a string.
            pub fn set_name(&mut self, name: &str) {
                self.segname = encode_fixed_name(name);
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    "Segment {{ name: \"{}\", vm: {:#x}+{:#x}, file: {:#x}+{:#x}, sects: {} }}",
                    self.name(),
                    self.vmaddr,
                    self.vmsize,
                    self.fileoff,
                    self.filesize,
                    self.nsects
                )
            }
        }
    };
}

macro_rules! impl_section_display {
    ($ty:ty) => {
        impl $ty {
            /// Returns the section name as a string.
            pub fn name(&self) -> &str {
                fixed_name_str(&self.sectname)
            }

            /// Returns the segment name as a string.
            pub fn segment_name(&self) -> &str {
                fixed_name_str(&self.segname)
            }

            /// Sets the section and segment names.
            pub fn set_names(&mut self, segment: &str, section: &str) {
                self.segname = encode_fixed_name(segment);
                self.sectname = encode_fixed_name(section);
            }

            /// Returns the section type.
            #[inline]
            pub fn section_type(&self) -> u32 {
                self.flags & SECTION_TYPE
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    "Section {{ name: \"{},{}\", addr: {:#x}+{:#x}, offset: {:#x} }}",
                    self.segment_name(),
                    self.name(),
                    self.addr,
                    self.size,
                    self.offset
                )
            }
        }
    };
}

impl_segment_display!(SegmentCommand);
impl_segment_display!(SegmentCommand64);
impl_section_display!(Section);
impl_section_display!(Section64);
