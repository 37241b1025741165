//! Mach-O constants and flags used by the kext engine.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit image magic as read little-endian
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 32-bit image magic as read little-endian
pub const MH_MAGIC: u32 = 0xFEEDFACE;

/// Fat archive magic read big-endian
pub const FAT_MAGIC: u32 = 0xCAFEBABE;

/// Fat archive magic read little-endian
pub const FAT_CIGAM: u32 = 0xBEBAFECA;

// =============================================================================
// File Types
// =============================================================================

/// Relocatable object file
pub const MH_OBJECT: u32 = 0x1;
/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Kernel extension bundle
pub const MH_KEXT_BUNDLE: u32 = 0xB;
/// File set (kernel collection)
pub const MH_FILESET: u32 = 0xC;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

/// Returns a short architecture name for a CPU type.
pub fn cpu_type_name(cputype: u32) -> &'static str {
    match cputype {
        CPU_TYPE_X86 => "i386",
        CPU_TYPE_X86_64 => "x86_64",
        CPU_TYPE_ARM => "arm",
        CPU_TYPE_ARM64 => "arm64",
        _ => "unknown",
    }
}

/// Parses a short architecture name into a CPU type.
pub fn cpu_type_from_name(name: &str) -> Option<u32> {
    match name {
        "i386" | "x86" => Some(CPU_TYPE_X86),
        "x86_64" => Some(CPU_TYPE_X86_64),
        "arm" => Some(CPU_TYPE_ARM),
        "arm64" => Some(CPU_TYPE_ARM64),
        _ => None,
    }
}

// =============================================================================
// Load Commands
// =============================================================================

/// Set on commands the loader must understand
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// 32-bit segment
pub const LC_SEGMENT: u32 = 0x1;
/// Symbol and string table location
pub const LC_SYMTAB: u32 = 0x2;
/// Thread state without a stack
pub const LC_THREAD: u32 = 0x4;
/// Thread state carrying the entry point
pub const LC_UNIXTHREAD: u32 = 0x5;
/// Symbol grouping, indirect table and relocation pools
pub const LC_DYSYMTAB: u32 = 0xB;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// Image UUID
pub const LC_UUID: u32 = 0x1B;
/// Code signature blob
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Compressed binding info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed binding info, required form
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Function start table
pub const LC_FUNCTION_STARTS: u32 = 0x26;
/// Data-in-code ranges
pub const LC_DATA_IN_CODE: u32 = 0x29;
/// Designated requirements of linked dylibs
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2B;
/// Kernel collection entry
pub const LC_FILESET_ENTRY: u32 = 0x35 | LC_REQ_DYLD;

/// Commands removed when an expanded image is stripped.
pub const STRIPPED_LOAD_COMMANDS: [u32; 7] = [
    LC_CODE_SIGNATURE,
    LC_DYLD_INFO,
    LC_DYLD_INFO_ONLY,
    LC_FUNCTION_STARTS,
    LC_DATA_IN_CODE,
    LC_DYLIB_CODE_SIGN_DRS,
    LC_UNIXTHREAD,
];

// =============================================================================
// Layout
// =============================================================================

/// Page size segments are laid out on in an expanded image.
pub const MACHO_PAGE_SIZE: u64 = 0x1000;

/// Largest section alignment exponent.
pub const MAX_SECTION_ALIGN: u32 = 31;

/// Segment holding symbol, string and relocation pools.
pub const SEG_LINKEDIT: &str = "__LINKEDIT";

// =============================================================================
// Section Types
// =============================================================================

/// Mask selecting the section type
pub const SECTION_TYPE: u32 = 0x0000_00FF;

/// Zero-fill section
pub const S_ZEROFILL: u32 = 0x1;

// =============================================================================
// Section Attributes
// =============================================================================

/// Only instructions
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;

/// Some instructions
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;

// =============================================================================
// Symbol Types
// =============================================================================

/// Any bit set marks a debugging entry
pub const N_STAB: u8 = 0xE0;
/// Private external symbol bit
pub const N_PEXT: u8 = 0x10;
/// Type field mask
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;

/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Absolute symbol
pub const N_ABS: u8 = 0x2;
/// Defined in section n_sect
pub const N_SECT: u8 = 0xE;
/// Alias of another symbol, named by n_value
pub const N_INDR: u8 = 0xA;

/// No section
pub const NO_SECT: u8 = 0;

// Debugging entries whose n_sect names a section.

/// Procedure
pub const N_FUN: u8 = 0x24;
/// Static symbol
pub const N_STSYM: u8 = 0x26;
/// .lcomm symbol
pub const N_LCSYM: u8 = 0x28;
/// Begin nsect symbol
pub const N_BNSYM: u8 = 0x2E;
/// Source line
pub const N_SLINE: u8 = 0x44;
/// End nsect symbol
pub const N_ENSYM: u8 = 0x4E;
/// Main source file name
pub const N_SO: u8 = 0x64;
/// Included source file name
pub const N_SOL: u8 = 0x84;
/// Alternate entry point
pub const N_ENTRY: u8 = 0xA4;
/// Left bracket
pub const N_LBRAC: u8 = 0xC0;
/// Right bracket
pub const N_RBRAC: u8 = 0xE0;
/// End common
pub const N_ECOMM: u8 = 0xE4;
/// End common (local name)
pub const N_ECOML: u8 = 0xE8;

/// Debugging entry types that refer to a section.
pub const SECTION_STAB_TYPES: [u8; 13] = [
    N_FUN, N_STSYM, N_LCSYM, N_BNSYM, N_SLINE, N_ENSYM, N_SO, N_SOL, N_ENTRY, N_ECOMM, N_ECOML,
    N_LBRAC, N_RBRAC,
];

// =============================================================================
// Relocation Types
// =============================================================================

/// Local relocation whose symbol number means "absolute, no section"
pub const R_ABS: u32 = 0;

/// Mask selecting the scattered flag in the first relocation word
pub const R_SCATTERED: u32 = 0x8000_0000;

/// Generic (i386) relocation types.
pub const GENERIC_RELOC_VANILLA: u8 = 0;
/// Second half of a pair
pub const GENERIC_RELOC_PAIR: u8 = 1;
/// Section difference, followed by a pair
pub const GENERIC_RELOC_SECTDIFF: u8 = 2;
/// Prebound lazy pointer
pub const GENERIC_RELOC_PB_LA_PTR: u8 = 3;
/// Local section difference, followed by a pair
pub const GENERIC_RELOC_LOCAL_SECTDIFF: u8 = 4;
/// Thread local variable
pub const GENERIC_RELOC_TLV: u8 = 5;

/// Absolute address
pub const X86_64_RELOC_UNSIGNED: u8 = 0;
/// Signed 32-bit displacement
pub const X86_64_RELOC_SIGNED: u8 = 1;
/// CALL/JMP with 32-bit displacement
pub const X86_64_RELOC_BRANCH: u8 = 2;
/// MOVQ load of a GOT entry
pub const X86_64_RELOC_GOT_LOAD: u8 = 3;
/// Other GOT references
pub const X86_64_RELOC_GOT: u8 = 4;
/// Must be followed by an X86_64_RELOC_UNSIGNED
pub const X86_64_RELOC_SUBTRACTOR: u8 = 5;
/// Signed 32-bit displacement with a -1 addend
pub const X86_64_RELOC_SIGNED_1: u8 = 6;
/// Signed 32-bit displacement with a -2 addend
pub const X86_64_RELOC_SIGNED_2: u8 = 7;
/// Signed 32-bit displacement with a -4 addend
pub const X86_64_RELOC_SIGNED_4: u8 = 8;
/// Thread local variable
pub const X86_64_RELOC_TLV: u8 = 9;

// =============================================================================
// Thread State
// =============================================================================

/// i386 general purpose thread state
pub const X86_THREAD_STATE32: u32 = 1;
/// x86_64 general purpose thread state
pub const X86_THREAD_STATE64: u32 = 4;

/// Offset of eip in x86_THREAD_STATE32
pub const X86_THREAD_STATE32_EIP: usize = 10 * 4;
/// Offset of rip in x86_THREAD_STATE64
pub const X86_THREAD_STATE64_RIP: usize = 16 * 8;

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Header flags relevant to kext images.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// No undefined references remain
        const NOUNDEFS = 0x1;
        /// Output of an incremental link
        const INCRLINK = 0x2;
        /// Input for the dynamic linker
        const DYLDLINK = 0x4;
        /// Two-level namespace bindings
        const TWOLEVEL = 0x80;
        /// Sections may be split at symbol boundaries
        const SUBSECTIONS_VIA_SYMBOLS = 0x2000;
        /// Loaded at a randomized address
        const PIE = 0x200000;
    }
}

bitflags! {
    /// Segment memory protection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        /// Readable
        const READ = 0x1;
        /// Writable
        const WRITE = 0x2;
        /// Executable
        const EXECUTE = 0x4;
    }
}

impl VmProt {
    /// Renders the protection as an `rwx` triple.
    pub fn to_rwx(self) -> String {
        format!(
            "{}{}{}",
            if self.contains(VmProt::READ) { "r" } else { "-" },
            if self.contains(VmProt::WRITE) { "w" } else { "-" },
            if self.contains(VmProt::EXECUTE) { "x" } else { "-" },
        )
    }
}
