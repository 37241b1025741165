//! Relocation records.
//!
//! Relocation entries pack several fields into one 32-bit word. The field
//! order inside that word depends on the host's bit-field layout in C, so
//! here every field is decoded and encoded with explicit shifts and masks
//! against the little-endian on-disk word.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::macho::*;
use crate::util::read_struct;

// =============================================================================
// Plain Relocation
// =============================================================================

const SYMBOLNUM_MASK: u32 = 0x00FF_FFFF;
const PCREL_SHIFT: u32 = 24;
const LENGTH_SHIFT: u32 = 25;
const EXTERN_SHIFT: u32 = 27;
const TYPE_SHIFT: u32 = 28;

/// One `relocation_info` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RelocationInfo {
    /// Offset of the relocated location from the start of the first segment
    pub r_address: i32,
    /// Packed symbol number, pc-relative flag, length, extern flag and type
    pub r_info: u32,
}

impl RelocationInfo {
    /// Size of a relocation entry.
    pub const SIZE: usize = 8;

    /// Encodes a relocation entry.
    ///
    /// `symbol_number` keeps its low 24 bits, `length` its low 2 bits and
    /// `kind` its low 4 bits.
    pub fn new(
        address: i32,
        symbol_number: u32,
        pc_relative: bool,
        length: u8,
        is_extern: bool,
        kind: u8,
    ) -> Self {
        let r_info = (symbol_number & SYMBOLNUM_MASK)
            | (u32::from(pc_relative) << PCREL_SHIFT)
            | ((u32::from(length) & 0x3) << LENGTH_SHIFT)
            | (u32::from(is_extern) << EXTERN_SHIFT)
            | ((u32::from(kind) & 0xF) << TYPE_SHIFT);
        Self {
            r_address: address,
            r_info,
        }
    }

    /// Target address, relative to the first segment.
    #[inline]
    pub fn address(&self) -> u32 {
        self.r_address as u32
    }

    /// Symbol index when extern, otherwise the 1-based section ordinal.
    #[inline]
    pub fn symbol_number(&self) -> u32 {
        self.r_info & SYMBOLNUM_MASK
    }

    /// True if the location is relative to the program counter.
    #[inline]
    pub fn pc_relative(&self) -> bool {
        (self.r_info >> PCREL_SHIFT) & 1 != 0
    }

    /// Size class: 0=byte, 1=word, 2=long, 3=quad.
    #[inline]
    pub fn length(&self) -> u8 {
        ((self.r_info >> LENGTH_SHIFT) & 0x3) as u8
    }

    /// True if `symbol_number` is a symbol index.
    #[inline]
    pub fn is_extern(&self) -> bool {
        (self.r_info >> EXTERN_SHIFT) & 1 != 0
    }

    /// Machine-specific relocation type.
    #[inline]
    pub fn kind(&self) -> u8 {
        (self.r_info >> TYPE_SHIFT) as u8
    }

    /// True if this record is actually a scattered relocation.
    #[inline]
    pub fn is_scattered(&self) -> bool {
        (self.r_address as u32) & R_SCATTERED != 0
    }
}

// =============================================================================
// Scattered Relocation
// =============================================================================

const SCATTERED_ADDRESS_MASK: u32 = 0x00FF_FFFF;
const SCATTERED_TYPE_SHIFT: u32 = 24;
const SCATTERED_LENGTH_SHIFT: u32 = 28;
const SCATTERED_PCREL_SHIFT: u32 = 30;

/// One `scattered_relocation_info` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ScatteredRelocationInfo {
    /// Packed scattered flag, pc-relative flag, length, type and address
    pub r_word0: u32,
    /// Address of the relocatable expression's target
    pub r_value: i32,
}

impl ScatteredRelocationInfo {
    /// Encodes a scattered relocation. `address` keeps its low 24 bits.
    pub fn new(address: u32, kind: u8, length: u8, pc_relative: bool, value: i32) -> Self {
        let r_word0 = R_SCATTERED
            | (u32::from(pc_relative) << SCATTERED_PCREL_SHIFT)
            | ((u32::from(length) & 0x3) << SCATTERED_LENGTH_SHIFT)
            | ((u32::from(kind) & 0xF) << SCATTERED_TYPE_SHIFT)
            | (address & SCATTERED_ADDRESS_MASK);
        Self {
            r_word0,
            r_value: value,
        }
    }

    /// Reinterprets a plain record; `None` if the scattered bit is clear.
    pub fn from_plain(info: &RelocationInfo) -> Option<Self> {
        info.is_scattered().then(|| Self {
            r_word0: info.r_address as u32,
            r_value: info.r_info as i32,
        })
    }

    /// Offset of the relocated location.
    #[inline]
    pub fn address(&self) -> u32 {
        self.r_word0 & SCATTERED_ADDRESS_MASK
    }

    /// Machine-specific relocation type.
    #[inline]
    pub fn kind(&self) -> u8 {
        ((self.r_word0 >> SCATTERED_TYPE_SHIFT) & 0xF) as u8
    }

    /// Size class.
    #[inline]
    pub fn length(&self) -> u8 {
        ((self.r_word0 >> SCATTERED_LENGTH_SHIFT) & 0x3) as u8
    }

    /// True if the location is relative to the program counter.
    #[inline]
    pub fn pc_relative(&self) -> bool {
        (self.r_word0 >> SCATTERED_PCREL_SHIFT) & 1 != 0
    }
}

// =============================================================================
// Two-Level Hint
// =============================================================================

/// One `twolevel_hint` record: an 8-bit sub-image index and a 24-bit TOC index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct TwoLevelHint {
    /// Packed hint word
    pub raw: u32,
}

impl TwoLevelHint {
    /// Encodes a hint. `toc_index` keeps its low 24 bits.
    pub fn new(sub_image: u8, toc_index: u32) -> Self {
        Self {
            raw: u32::from(sub_image) | ((toc_index & 0x00FF_FFFF) << 8),
        }
    }

    /// Index into the sub-images.
    #[inline]
    pub fn sub_image(&self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Index into the table of contents.
    #[inline]
    pub fn toc_index(&self) -> u32 {
        self.raw >> 8
    }
}

// =============================================================================
// Pair Rules
// =============================================================================

/// True if an i386 relocation of this type is followed by a pair entry.
#[inline]
pub fn relocation_is_pair_x86(kind: u8) -> bool {
    kind == GENERIC_RELOC_SECTDIFF || kind == GENERIC_RELOC_LOCAL_SECTDIFF
}

/// True if an x86_64 relocation of this type is followed by a pair entry.
#[inline]
pub fn relocation_is_pair_x86_64(kind: u8) -> bool {
    kind == X86_64_RELOC_SUBTRACTOR
}

/// True if this type is valid as the second half of an x86_64 pair.
#[inline]
pub fn is_relocation_pair_type_x86_64(kind: u8) -> bool {
    kind == X86_64_RELOC_UNSIGNED
}

/// True if an x86_64 relocation of this type must survive linking.
#[inline]
pub fn preserve_relocation_x86_64(kind: u8) -> bool {
    kind == X86_64_RELOC_UNSIGNED
}

// =============================================================================
// Relocation Pools
// =============================================================================

/// Which relocation pool of the dynamic symbol table to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationPool {
    /// Section-relative relocations.
    Local,
    /// Symbol-relative relocations.
    External,
}

/// A validated view of one relocation pool.
#[derive(Debug, Clone, Copy)]
pub struct RelocationTable<'a> {
    data: &'a [u8],
}

impl<'a> RelocationTable<'a> {
    /// Wraps `data`, which must hold a whole number of entries.
    pub fn new(data: &'a [u8]) -> Option<Self> {
        (data.len() % RelocationInfo::SIZE == 0).then_some(Self { data })
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / RelocationInfo::SIZE
    }

    /// True if the pool holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the entry at `index`.
    pub fn get(&self, index: usize) -> Option<RelocationInfo> {
        read_struct(self.data, index.checked_mul(RelocationInfo::SIZE)?)
    }

    /// Iterates over all entries, including pair halves.
    pub fn iter(&self) -> impl Iterator<Item = RelocationInfo> + 'a {
        let data = self.data;
        (0..self.len()).filter_map(move |i| read_struct(data, i * RelocationInfo::SIZE))
    }

    /// Finds the entry whose target address equals `address`.
    ///
    /// Local entries against absolute symbols are ignored, and the second
    /// half of a pair is never matched on its own.
    pub fn find_by_address<W: MachWidth>(&self, address: u64) -> Option<RelocationInfo> {
        let mut index = 0;
        while index < self.len() {
            let relocation = self.get(index)?;
            index += 1;

            if !relocation.is_extern() && relocation.symbol_number() == R_ABS {
                continue;
            }

            if u64::from(relocation.address()) == address {
                return Some(relocation);
            }

            if W::relocation_is_pair(relocation.kind()) {
                index += 1;
            }
        }
        None
    }
}
