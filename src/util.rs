//! Bounds-checked primitives for binary data processing.
//!
//! Every reader returns `None` instead of panicking when the requested range
//! does not fit the slice, so engine code can propagate failures with `?`
//! or `ok_or`. Arithmetic helpers are checked for the same reason.

use byteorder::{ByteOrder, LittleEndian};
use zerocopy::{FromBytes, Immutable, IntoBytes};

// =============================================================================
// Checked Unaligned Reads
// =============================================================================

/// Returns `len` bytes of `data` starting at `offset`, if they exist.
#[inline(always)]
pub fn slice_at(data: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    data.get(offset..offset.checked_add(len)?)
}

/// Mutable variant of [`slice_at`].
#[inline(always)]
pub fn slice_at_mut(data: &mut [u8], offset: usize, len: usize) -> Option<&mut [u8]> {
    data.get_mut(offset..offset.checked_add(len)?)
}

/// Reads a little-endian u32 from a byte slice at the given offset.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> Option<u32> {
    slice_at(data, offset, 4).map(LittleEndian::read_u32)
}

/// Reads a little-endian u64 from a byte slice at the given offset.
#[inline(always)]
pub fn read_u64_le_at(data: &[u8], offset: usize) -> Option<u64> {
    slice_at(data, offset, 8).map(LittleEndian::read_u64)
}

/// Reads a little-endian word of `width` bytes (4 or 8).
#[inline]
pub fn read_word_le_at(data: &[u8], offset: usize, width: usize) -> Option<u64> {
    match width {
        4 => read_u32_le_at(data, offset).map(u64::from),
        8 => read_u64_le_at(data, offset),
        _ => None,
    }
}

/// Copies a record out of `data` at `offset`.
#[inline]
pub fn read_struct<T: FromBytes>(data: &[u8], offset: usize) -> Option<T> {
    let tail = data.get(offset..)?;
    T::read_from_prefix(tail).ok().map(|(value, _)| value)
}

/// Writes a record into `data` at `offset`. Returns `None` if it does not fit.
#[inline]
pub fn write_struct<T: IntoBytes + Immutable>(data: &mut [u8], offset: usize, value: &T) -> Option<()> {
    let bytes = value.as_bytes();
    slice_at_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Some(())
}

// =============================================================================
// Byte Search
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Uses `memchr` so long string pools are scanned with SIMD where available.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Returns the NUL-terminated string starting at `offset`, without the terminator.
///
/// A string running to the end of `data` without a terminator is rejected.
#[inline]
pub fn c_str_at(data: &[u8], offset: usize) -> Option<&[u8]> {
    let tail = data.get(offset..)?;
    let end = memchr::memchr(0, tail)?;
    Some(&tail[..end])
}

/// Returns the meaningful bytes of a fixed 16-byte name field.
///
/// The field is not necessarily NUL-terminated.
#[inline]
pub fn fixed_name(field: &[u8; 16]) -> &[u8] {
    &field[..memchr_null(field)]
}

/// Compares a fixed 16-byte name field against `name`.
#[inline]
pub fn fixed_name_eq(field: &[u8; 16], name: &str) -> bool {
    fixed_name(field) == name.as_bytes()
}

/// Renders a fixed 16-byte name field for display.
#[inline]
pub fn fixed_name_str(field: &[u8; 16]) -> &str {
    std::str::from_utf8(fixed_name(field)).unwrap_or("")
}

/// Encodes `name` into a fixed 16-byte field, truncating if needed.
pub fn encode_fixed_name(name: &str) -> [u8; 16] {
    let mut field = [0u8; 16];
    let bytes = name.as_bytes();
    let len = bytes.len().min(16);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

// =============================================================================
// Alignment Utilities
// =============================================================================

/// Aligns a value up to the given power-of-two alignment.
///
/// Returns `None` if the result does not fit in a `u64`.
#[inline(always)]
pub const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// Checks if a value is aligned to the given power-of-two alignment.
#[inline(always)]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    debug_assert!(alignment.is_power_of_two());
    (value & (alignment - 1)) == 0
}
