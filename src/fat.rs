//! Fat archive architecture selection.
//!
//! A fat archive prefixes several Mach-O images, one per CPU type, with a
//! big-endian table of contents. Selecting an architecture yields the byte
//! range of its image; a buffer that is not a fat archive is returned whole.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::debug;

use crate::error::{Error, Result};
use crate::macho::*;

/// Byte range of one architecture inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatSlice {
    /// Offset of the image from the start of the buffer
    pub offset: usize,
    /// Size of the image
    pub size: usize,
}

/// Returns true if `data` starts with a fat magic in either byte order.
pub fn is_fat(data: &[u8]) -> bool {
    data.len() >= FatHeader::SIZE
        && matches!(BigEndian::read_u32(data), FAT_MAGIC | FAT_CIGAM)
}

/// Reads and bounds-checks the architecture table.
///
/// Returns `None` if `data` is not a fat archive.
fn read_fat_table(data: &[u8]) -> Result<Option<Vec<FatArch>>> {
    if data.len() < FatHeader::SIZE {
        return Ok(None);
    }
    match BigEndian::read_u32(data) {
        FAT_MAGIC => read_entries::<BigEndian>(data).map(Some),
        FAT_CIGAM => read_entries::<LittleEndian>(data).map(Some),
        _ => Ok(None),
    }
}

fn read_entries<E: ByteOrder>(data: &[u8]) -> Result<Vec<FatArch>> {
    let count = E::read_u32(&data[4..]);
    let table_end = (count as usize)
        .checked_mul(FatArch::SIZE)
        .and_then(|size| size.checked_add(FatHeader::SIZE))
        .ok_or(Error::overflow("fat architecture table"))?;
    if table_end > data.len() {
        return Err(Error::out_of_bounds(
            "fat architecture table",
            FatHeader::SIZE as u64,
            table_end as u64,
            data.len() as u64,
        ));
    }

    Ok(data[FatHeader::SIZE..table_end]
        .chunks_exact(FatArch::SIZE)
        .map(|entry| FatArch {
            cputype: E::read_u32(&entry[0..]),
            cpusubtype: E::read_u32(&entry[4..]),
            offset: E::read_u32(&entry[8..]),
            size: E::read_u32(&entry[12..]),
            align: E::read_u32(&entry[16..]),
        })
        .collect())
}

/// Lists the architecture entries of a fat archive.
///
/// A non-fat buffer yields an empty list.
pub fn fat_architectures(data: &[u8]) -> Result<Vec<FatArch>> {
    Ok(read_fat_table(data)?.unwrap_or_default())
}

/// Selects the image for `cpu_type`.
///
/// `data` may be only the prefix of the file that has been read so far;
/// `full_size` is the size of the whole file and bounds every slice. A
/// buffer that is not a fat archive yields `(0, full_size)`.
pub fn select_architecture(data: &[u8], full_size: usize, cpu_type: u32) -> Result<FatSlice> {
    let Some(entries) = read_fat_table(data)? else {
        return Ok(FatSlice {
            offset: 0,
            size: full_size,
        });
    };

    let entry = entries
        .iter()
        .find(|entry| entry.cputype == cpu_type)
        .ok_or(Error::ArchitectureNotFound { cpu_type })?;

    if entry.offset == 0 {
        return Err(Error::invalid("fat slice offset", 0u64));
    }
    let end = u64::from(entry.offset) + u64::from(entry.size);
    if end > full_size as u64 {
        return Err(Error::out_of_bounds(
            "fat slice",
            entry.offset.into(),
            entry.size.into(),
            full_size as u64,
        ));
    }

    debug!(
        "Selected {} slice at {:#x}+{:#x}",
        cpu_type_name(cpu_type),
        entry.offset,
        entry.size
    );

    Ok(FatSlice {
        offset: entry.offset as usize,
        size: entry.size as usize,
    })
}
