//! Record width abstraction.
//!
//! 32-bit and 64-bit Mach-O images share every algorithm in this crate but
//! differ in header, segment, section and symbol record shapes. [`MachWidth`]
//! names those shapes and the handful of per-width constants, and the record
//! traits expose normalized `u64` accessors so engine code is written once.
//!
//! Setters that narrow a `u64` back into a 32-bit field fail instead of
//! truncating.

use std::fmt::Debug;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::relocation::{relocation_is_pair_x86, relocation_is_pair_x86_64};

// =============================================================================
// Record Traits
// =============================================================================

/// A fixed-size on-disk record.
pub trait Record: FromBytes + IntoBytes + KnownLayout + Immutable + Copy + Debug {
    /// Size of the record in bytes.
    const SIZE: usize;
}

/// A Mach-O header of either width.
pub trait HeaderRecord: Record {
    /// Magic number.
    fn magic(&self) -> u32;
    /// CPU type.
    fn cputype(&self) -> u32;
    /// CPU subtype.
    fn cpusubtype(&self) -> u32;
    /// File type.
    fn filetype(&self) -> u32;
    /// Number of load commands.
    fn ncmds(&self) -> u32;
    /// Size of the load command list.
    fn sizeofcmds(&self) -> u32;
    /// Header flags.
    fn flags(&self) -> u32;
    /// Sets the number of load commands.
    fn set_ncmds(&mut self, value: u32);
    /// Sets the size of the load command list.
    fn set_sizeofcmds(&mut self, value: u32);
}

/// A segment command of either width.
pub trait SegmentRecord: Record {
    /// Size of this command including its sections.
    fn cmdsize(&self) -> u32;
    /// Raw segment name field.
    fn segname(&self) -> &[u8; 16];
    /// Virtual address.
    fn vmaddr(&self) -> u64;
    /// Virtual size.
    fn vmsize(&self) -> u64;
    /// Container-absolute file offset.
    fn fileoff(&self) -> u64;
    /// Bytes mapped from the file.
    fn filesize(&self) -> u64;
    /// Maximum protection.
    fn maxprot(&self) -> u32;
    /// Initial protection.
    fn initprot(&self) -> u32;
    /// Number of sections that follow.
    fn nsects(&self) -> u32;
    /// Sets the virtual size.
    fn set_vmsize(&mut self, value: u64) -> Result<()>;
    /// Sets the file offset.
    fn set_fileoff(&mut self, value: u64) -> Result<()>;
    /// Sets the file size.
    fn set_filesize(&mut self, value: u64) -> Result<()>;
    /// Sets both protections.
    fn set_protection(&mut self, maxprot: u32, initprot: u32);
}

/// A section record of either width.
pub trait SectionRecord: Record {
    /// Raw section name field.
    fn sectname(&self) -> &[u8; 16];
    /// Raw owning segment name field.
    fn segname(&self) -> &[u8; 16];
    /// Virtual address.
    fn addr(&self) -> u64;
    /// Size in bytes.
    fn size(&self) -> u64;
    /// File offset, or zero for zero-fill sections.
    fn offset(&self) -> u32;
    /// Alignment exponent.
    fn align(&self) -> u32;
    /// File offset of the relocation entries.
    fn reloff(&self) -> u32;
    /// Number of relocation entries.
    fn nreloc(&self) -> u32;
    /// Type and attribute flags.
    fn flags(&self) -> u32;
    /// Sets the file offset.
    fn set_offset(&mut self, value: u32);
    /// Sets the relocation pool offset.
    fn set_reloff(&mut self, value: u32);
}

/// A symbol table entry of either width.
pub trait NlistRecord: Record {
    /// String table index.
    fn strx(&self) -> u32;
    /// Type byte.
    fn n_type(&self) -> u8;
    /// Section ordinal.
    fn n_sect(&self) -> u8;
    /// Descriptor.
    fn n_desc(&self) -> u16;
    /// Value.
    fn n_value(&self) -> u64;
}

// =============================================================================
// Width Trait
// =============================================================================

/// Runtime tag for the two record layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bitness {
    /// 32-bit records.
    Narrow,
    /// 64-bit records.
    Wide,
}

impl Bitness {
    /// Returns the pointer size in bytes.
    pub fn word_size(self) -> usize {
        match self {
            Bitness::Narrow => 4,
            Bitness::Wide => 8,
        }
    }
}

/// Compile-time description of one record layout.
pub trait MachWidth: Copy + Debug + Send + Sync + 'static {
    /// Header record.
    type Header: HeaderRecord;
    /// Segment command record.
    type Segment: SegmentRecord;
    /// Section record.
    type Section: SectionRecord;
    /// Symbol table entry.
    type Nlist: NlistRecord;

    /// Runtime tag.
    const BITNESS: Bitness;
    /// Expected header magic.
    const MAGIC: u32;
    /// CPU type accepted by the context builder.
    const CPU_TYPE: u32;
    /// Segment load command code.
    const SEGMENT_COMMAND: u32;
    /// Pointer size and load command alignment.
    const WORD_SIZE: usize;
    /// Largest value a word can hold.
    const MAX_WORD: u64;

    /// Returns true if the context builder accepts this file type.
    fn supports_file_type(filetype: u32) -> bool;

    /// Returns true if `kind` introduces a relocation pair.
    fn relocation_is_pair(kind: u8) -> bool;

    /// Thread state flavor and program counter offset for LC_UNIXTHREAD.
    fn entry_state() -> (u32, usize);

    /// Adds two words, failing if the sum leaves the width's address space.
    #[inline]
    fn checked_add(a: u64, b: u64) -> Option<u64> {
        a.checked_add(b).filter(|&sum| sum <= Self::MAX_WORD)
    }

    /// Subtracts two words with the width's wraparound.
    #[inline]
    fn wrapping_sub(a: u64, b: u64) -> u64 {
        a.wrapping_sub(b) & Self::MAX_WORD
    }
}

/// 32-bit record layout.
#[derive(Debug, Clone, Copy)]
pub struct Macho32;

/// 64-bit record layout.
#[derive(Debug, Clone, Copy)]
pub struct Macho64;

impl MachWidth for Macho32 {
    type Header = MachHeader;
    type Segment = SegmentCommand;
    type Section = Section;
    type Nlist = Nlist;

    const BITNESS: Bitness = Bitness::Narrow;
    const MAGIC: u32 = MH_MAGIC;
    const CPU_TYPE: u32 = CPU_TYPE_X86;
    const SEGMENT_COMMAND: u32 = LC_SEGMENT;
    const WORD_SIZE: usize = 4;
    const MAX_WORD: u64 = u32::MAX as u64;

    fn supports_file_type(filetype: u32) -> bool {
        matches!(
            filetype,
            MH_OBJECT | MH_EXECUTE | MH_KEXT_BUNDLE | MH_FILESET
        )
    }

    fn relocation_is_pair(kind: u8) -> bool {
        relocation_is_pair_x86(kind)
    }

    fn entry_state() -> (u32, usize) {
        (X86_THREAD_STATE32, X86_THREAD_STATE32_EIP)
    }
}

impl MachWidth for Macho64 {
    type Header = MachHeader64;
    type Segment = SegmentCommand64;
    type Section = Section64;
    type Nlist = Nlist64;

    const BITNESS: Bitness = Bitness::Wide;
    const MAGIC: u32 = MH_MAGIC_64;
    const CPU_TYPE: u32 = CPU_TYPE_X86_64;
    const SEGMENT_COMMAND: u32 = LC_SEGMENT_64;
    const WORD_SIZE: usize = 8;
    const MAX_WORD: u64 = u64::MAX;

    fn supports_file_type(filetype: u32) -> bool {
        matches!(filetype, MH_EXECUTE | MH_KEXT_BUNDLE | MH_FILESET)
    }

    fn relocation_is_pair(kind: u8) -> bool {
        relocation_is_pair_x86_64(kind)
    }

    fn entry_state() -> (u32, usize) {
        (X86_THREAD_STATE64, X86_THREAD_STATE64_RIP)
    }
}

// =============================================================================
// Record Implementations
// =============================================================================

fn narrow(value: u64, what: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::overflow(what))
}

fn widen(value: u64, _what: &'static str) -> Result<u64> {
    Ok(value)
}

macro_rules! impl_record {
    ($($ty:ty),*) => {
        $(impl Record for $ty {
            const SIZE: usize = <$ty>::SIZE;
        })*
    };
}

impl_record!(
    MachHeader,
    MachHeader64,
    SegmentCommand,
    SegmentCommand64,
    Section,
    Section64,
    Nlist,
    Nlist64
);

macro_rules! impl_header_record {
    ($ty:ty) => {
        impl HeaderRecord for $ty {
            fn magic(&self) -> u32 {
                self.magic
            }
            fn cputype(&self) -> u32 {
                self.cputype
            }
            fn cpusubtype(&self) -> u32 {
                self.cpusubtype
            }
            fn filetype(&self) -> u32 {
                self.filetype
            }
            fn ncmds(&self) -> u32 {
                self.ncmds
            }
            fn sizeofcmds(&self) -> u32 {
                self.sizeofcmds
            }
            fn flags(&self) -> u32 {
                self.flags
            }
            fn set_ncmds(&mut self, value: u32) {
                self.ncmds = value;
            }
            fn set_sizeofcmds(&mut self, value: u32) {
                self.sizeofcmds = value;
            }
        }
    };
}

impl_header_record!(MachHeader);
impl_header_record!(MachHeader64);

macro_rules! impl_segment_record {
    ($ty:ty, $set:ident) => {
        impl SegmentRecord for $ty {
            fn cmdsize(&self) -> u32 {
                self.cmdsize
            }
            fn segname(&self) -> &[u8; 16] {
                &self.segname
            }
            fn vmaddr(&self) -> u64 {
                self.vmaddr.into()
            }
            fn vmsize(&self) -> u64 {
                self.vmsize.into()
            }
            fn fileoff(&self) -> u64 {
                self.fileoff.into()
            }
            fn filesize(&self) -> u64 {
                self.filesize.into()
            }
            fn maxprot(&self) -> u32 {
                self.maxprot
            }
            fn initprot(&self) -> u32 {
                self.initprot
            }
            fn nsects(&self) -> u32 {
                self.nsects
            }
            fn set_vmsize(&mut self, value: u64) -> Result<()> {
                self.vmsize = $set(value, "segment vmsize")?;
                Ok(())
            }
            fn set_fileoff(&mut self, value: u64) -> Result<()> {
                self.fileoff = $set(value, "segment fileoff")?;
                Ok(())
            }
            fn set_filesize(&mut self, value: u64) -> Result<()> {
                self.filesize = $set(value, "segment filesize")?;
                Ok(())
            }
            fn set_protection(&mut self, maxprot: u32, initprot: u32) {
                self.maxprot = maxprot;
                self.initprot = initprot;
            }
        }
    };
}

impl_segment_record!(SegmentCommand, narrow);
impl_segment_record!(SegmentCommand64, widen);

macro_rules! impl_section_record {
    ($ty:ty) => {
        impl SectionRecord for $ty {
            fn sectname(&self) -> &[u8; 16] {
                &self.sectname
            }
            fn segname(&self) -> &[u8; 16] {
                &self.segname
            }
            fn addr(&self) -> u64 {
                self.addr.into()
            }
            fn size(&self) -> u64 {
                self.size.into()
            }
            fn offset(&self) -> u32 {
                self.offset
            }
            fn align(&self) -> u32 {
                self.align
            }
            fn reloff(&self) -> u32 {
                self.reloff
            }
            fn nreloc(&self) -> u32 {
                self.nreloc
            }
            fn flags(&self) -> u32 {
                self.flags
            }
            fn set_offset(&mut self, value: u32) {
                self.offset = value;
            }
            fn set_reloff(&mut self, value: u32) {
                self.reloff = value;
            }
        }
    };
}

impl_section_record!(Section);
impl_section_record!(Section64);

macro_rules! impl_nlist_record {
    ($ty:ty) => {
        impl NlistRecord for $ty {
            fn strx(&self) -> u32 {
                self.n_strx
            }
            fn n_type(&self) -> u8 {
                self.n_type
            }
            fn n_sect(&self) -> u8 {
                self.n_sect
            }
            fn n_desc(&self) -> u16 {
                self.n_desc
            }
            fn n_value(&self) -> u64 {
                self.n_value.into()
            }
        }
    };
}

impl_nlist_record!(Nlist);
impl_nlist_record!(Nlist64);
