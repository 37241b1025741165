//! Error types for the Mach-O engine.
//!
//! Every failure an engine operation can report is one of the variants below.
//! Variants are grouped by the broad [`ErrorKind`] they belong to, so callers
//! that only care about the category can match on [`Error::kind`].

use thiserror::Error;

/// Broad failure categories shared by every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Magic, alignment, or structural violation.
    InvalidFormat,
    /// An offset or size would reach outside the declared file size.
    OutOfBounds,
    /// Checked arithmetic detected wraparound.
    Overflow,
    /// A requested architecture, segment, section or symbol does not exist.
    NotFound,
    /// CPU type, file type, or a configured limit is outside the supported set.
    Unsupported,
}

/// The main error type for Mach-O engine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ==================== Format Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMagic(u32),

    #[error("invalid {what} at offset {offset:#x}")]
    InvalidFormat { what: &'static str, offset: u64 },

    #[error("data alignment error: offset {offset:#x} not aligned to {alignment}")]
    AlignmentError { offset: u64, alignment: u64 },

    #[error("load command sizes sum to {actual:#x}, header declares {declared:#x}")]
    CommandSizeMismatch { declared: u32, actual: u64 },

    // ==================== Bounds Errors ====================
    #[error("{what} at {offset:#x}+{size:#x} exceeds limit {limit:#x}")]
    OutOfBounds {
        what: &'static str,
        offset: u64,
        size: u64,
        limit: u64,
    },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: u64, available: u64 },

    // ==================== Arithmetic Errors ====================
    #[error("arithmetic overflow computing {0}")]
    Overflow(&'static str),

    // ==================== Lookup Errors ====================
    #[error("no fat slice for CPU type {cpu_type:#x}")]
    ArchitectureNotFound { cpu_type: u32 },

    #[error("symbol table not found in Mach-O")]
    SymbolTableNotFound,

    #[error("fewer than two segments match prefix '{prefix}'")]
    NothingToMerge { prefix: String },

    // ==================== Support Errors ====================
    #[error("unsupported CPU type: {0:#x}")]
    UnsupportedCpuType(u32),

    #[error("unsupported Mach-O file type: {0:#x}")]
    UnsupportedFileType(u32),

    #[error("{what} count {count} exceeds configured limit {limit}")]
    LimitExceeded {
        what: &'static str,
        count: u64,
        limit: u64,
    },

    #[error("{0}")]
    Unsupported(&'static str),
}

/// A specialized Result type for Mach-O engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the broad category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidMagic(_)
            | Error::InvalidFormat { .. }
            | Error::AlignmentError { .. }
            | Error::CommandSizeMismatch { .. } => ErrorKind::InvalidFormat,
            Error::OutOfBounds { .. } | Error::BufferTooSmall { .. } => ErrorKind::OutOfBounds,
            Error::Overflow(_) => ErrorKind::Overflow,
            Error::ArchitectureNotFound { .. }
            | Error::SymbolTableNotFound
            | Error::NothingToMerge { .. } => ErrorKind::NotFound,
            Error::UnsupportedCpuType(_)
            | Error::UnsupportedFileType(_)
            | Error::LimitExceeded { .. }
            | Error::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Returns true if this error reports a missing item rather than corruption.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Creates an invalid format error.
    #[inline]
    pub fn invalid(what: &'static str, offset: impl Into<u64>) -> Self {
        Error::InvalidFormat {
            what,
            offset: offset.into(),
        }
    }

    /// Creates an out of bounds error.
    #[inline]
    pub fn out_of_bounds(what: &'static str, offset: u64, size: u64, limit: u64) -> Self {
        Error::OutOfBounds {
            what,
            offset,
            size,
            limit,
        }
    }

    /// Creates an overflow error.
    #[inline]
    pub fn overflow(what: &'static str) -> Self {
        Error::Overflow(what)
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall {
            needed: needed as u64,
            available: available as u64,
        }
    }
}
