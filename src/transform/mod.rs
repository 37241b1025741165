//! Rewrites of a validated image.
//!
//! Two passes are provided:
//!
//! 1. **Expansion** - Lays the on-disk image out in its page-aligned runtime
//!    form, into a caller-owned buffer, optionally stripping load commands
//!    that no longer apply to the rewritten file
//! 2. **Segment Merging** - Folds a run of same-prefixed segment commands into
//!    the first one, in place

mod expand;
mod merge;

pub use expand::*;
