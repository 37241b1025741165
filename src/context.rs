//! Validated view of one Mach-O image.
//!
//! [`MachoContext`] is built once per buffer. Construction checks the header
//! and walks every load command; afterwards the walker, loader and resolver
//! operate on the validated image without re-checking the command list.

use std::cell::OnceCell;
use std::marker::PhantomData;

use tracing::debug;
use zerocopy::{FromBytes, FromZeros};

use crate::error::{Error, Result};
use crate::fat::{is_fat, select_architecture};
use crate::macho::*;
use crate::symbols::SymbolTables;
use crate::util::{align_up, read_struct, read_u32_le_at, read_word_le_at, slice_at};

// =============================================================================
// Limits
// =============================================================================

/// Upper bounds on counts read from untrusted size fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of load commands
    pub max_commands: u32,
    /// Maximum number of sections in one segment
    pub max_sections: u32,
    /// Maximum number of symbols in the symbol table
    pub max_symbols: u32,
    /// Maximum number of entries in one relocation pool
    pub max_relocations: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_commands: 0x1_0000,
            max_sections: 0x1_0000,
            max_symbols: 0x10_0000,
            max_relocations: 0x10_0000,
        }
    }
}

// =============================================================================
// Load Commands
// =============================================================================

/// One load command inside the image.
#[derive(Debug, Clone, Copy)]
pub struct LoadCommandRef<'a> {
    /// Offset of the command from the start of the image
    pub offset: usize,
    /// Command type
    pub cmd: u32,
    /// Declared command size
    pub cmdsize: u32,
    /// The command bytes, `cmdsize` long
    pub data: &'a [u8],
}

/// Cursor over the load command list.
///
/// Stops early at the first command that no longer fits the declared region.
#[derive(Debug, Clone)]
pub struct LoadCommands<'a> {
    image: &'a [u8],
    offset: usize,
    end: usize,
    word_size: usize,
}

impl<'a> LoadCommands<'a> {
    fn new(image: &'a [u8], start: usize, end: usize, word_size: usize) -> Self {
        Self {
            image,
            offset: start,
            end: end.min(image.len()),
            word_size,
        }
    }
}

impl<'a> Iterator for LoadCommands<'a> {
    type Item = LoadCommandRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset.checked_add(LoadCommand::SIZE)? > self.end {
            return None;
        }
        let cmd = read_u32_le_at(self.image, self.offset)?;
        let cmdsize = read_u32_le_at(self.image, self.offset + 4)?;
        let size = cmdsize as usize;
        if size < LoadCommand::SIZE
            || size % self.word_size != 0
            || self.offset + size > self.end
        {
            self.offset = self.end;
            return None;
        }

        let item = LoadCommandRef {
            offset: self.offset,
            cmd,
            cmdsize,
            data: &self.image[self.offset..self.offset + size],
        };
        self.offset += size;
        Some(item)
    }
}

// =============================================================================
// Context
// =============================================================================

/// A validated Mach-O image of width `W` over the buffer `B`.
///
/// The buffer may be a fat archive; the slice for the width's CPU type is
/// selected during construction. Segment file offsets are container-absolute
/// and are translated through `container_offset`.
pub struct MachoContext<W: MachWidth, B: AsRef<[u8]>> {
    data: B,
    start: usize,
    file_size: usize,
    container_offset: u64,
    limits: Limits,
    pub(crate) symbols: OnceCell<SymbolTables>,
    _width: PhantomData<W>,
}

/// Context over a 32-bit image.
pub type MachoContext32<B> = MachoContext<Macho32, B>;
/// Context over a 64-bit image.
pub type MachoContext64<B> = MachoContext<Macho64, B>;

impl<W: MachWidth, B: AsRef<[u8]>> std::fmt::Debug for MachoContext<W, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachoContext")
            .field("bitness", &W::BITNESS)
            .field("start", &self.start)
            .field("file_size", &self.file_size)
            .field("container_offset", &self.container_offset)
            .finish_non_exhaustive()
    }
}

impl<W: MachWidth, B: AsRef<[u8]>> MachoContext<W, B> {
    /// Validates `data` and builds a context with default [`Limits`].
    pub fn new(data: B, container_offset: u64) -> Result<Self> {
        Self::with_limits(data, container_offset, Limits::default())
    }

    /// Validates `data` and builds a context.
    pub fn with_limits(data: B, container_offset: u64, limits: Limits) -> Result<Self> {
        let (start, file_size) = validate::<W>(data.as_ref(), &limits).inspect_err(|e| {
            debug!("Rejected {:?} image: {}", W::BITNESS, e);
        })?;

        Ok(Self {
            data,
            start,
            file_size,
            container_offset,
            limits,
            symbols: OnceCell::new(),
            _width: PhantomData,
        })
    }

    /// Consumes the context and returns the buffer.
    pub fn into_inner(self) -> B {
        self.data
    }

    /// Returns the selected image bytes.
    ///
    /// Construction checks that the slice lies inside the buffer and holds a
    /// full header. The empty fallback is only reachable through a buffer
    /// whose `AsRef` length changes after construction.
    pub fn image(&self) -> &[u8] {
        let image = self
            .data
            .as_ref()
            .get(self.start..self.start + self.file_size);
        debug_assert!(image.is_some(), "image slice outside the buffer");
        image.unwrap_or(&[])
    }

    /// Returns a copy of the header.
    pub fn header(&self) -> W::Header {
        let header = read_struct(self.image(), 0);
        debug_assert!(header.is_some(), "image shorter than its header");
        header.unwrap_or_else(W::Header::new_zeroed)
    }

    /// Size of the selected image.
    pub fn file_size(&self) -> usize {
        self.file_size
    }

    /// Offset of the image inside the container its segment offsets refer to.
    pub fn container_offset(&self) -> u64 {
        self.container_offset
    }

    /// Offset of the image inside the buffer (nonzero for fat slices).
    pub fn slice_offset(&self) -> usize {
        self.start
    }

    /// Record width of the image.
    pub fn bitness(&self) -> Bitness {
        W::BITNESS
    }

    /// Configured limits.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Size of the header plus the load command list.
    pub fn header_size(&self) -> usize {
        W::Header::SIZE + self.header().sizeofcmds() as usize
    }

    /// Iterates the load commands.
    pub fn commands(&self) -> LoadCommands<'_> {
        LoadCommands::new(self.image(), W::Header::SIZE, self.header_size(), W::WORD_SIZE)
    }

    /// Returns the first command of type `cmd` after `previous`.
    pub fn next_command(
        &self,
        cmd: u32,
        previous: Option<&LoadCommandRef<'_>>,
    ) -> Option<LoadCommandRef<'_>> {
        let after = previous.map_or(0, |p| p.offset + 1);
        self.commands()
            .filter(|c| c.offset >= after)
            .find(|c| c.cmd == cmd)
    }

    /// Reads the first command of type `cmd` as `T`, with its offset.
    pub(crate) fn command_record<T: FromBytes>(&self, cmd: u32) -> Option<(usize, T)> {
        let command = self.next_command(cmd, None)?;
        if (command.cmdsize as usize) < std::mem::size_of::<T>() {
            return None;
        }
        Some((command.offset, read_struct(command.data, 0)?))
    }

    /// Translates a container-absolute file offset into an image offset.
    pub(crate) fn image_offset(&self, file_offset: u64) -> Option<u64> {
        file_offset.checked_sub(self.container_offset)
    }

    // =========================================================================
    // Whole-image queries
    // =========================================================================

    /// Returns the UUID from the first LC_UUID command.
    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.command_record::<UuidCommand>(LC_UUID)
            .map(|(_, cmd)| cmd.uuid)
    }

    /// Returns the highest segment end address.
    pub fn last_address(&self) -> u64 {
        self.segments()
            .map(|seg| seg.command.vmaddr().wrapping_add(seg.command.vmsize()) & W::MAX_WORD)
            .max()
            .unwrap_or(0)
    }

    /// Returns the sum of page-aligned segment sizes.
    ///
    /// Fails on overflow or when the total does not fit 32 bits.
    pub fn vm_size(&self) -> Option<u32> {
        let mut total: u64 = 0;
        for seg in self.segments() {
            total = W::checked_add(total, seg.command.vmsize())?;
            total = align_up(total, MACHO_PAGE_SIZE).filter(|&t| t <= W::MAX_WORD)?;
        }
        u32::try_from(total).ok()
    }

    /// Returns the program counter stored in LC_UNIXTHREAD.
    pub fn entry_address(&self) -> Option<u64> {
        let command = self.next_command(LC_UNIXTHREAD, None)?;
        thread_entry::<W>(command.data)
    }

    /// Translates a virtual address into an image offset and the bytes
    /// remaining in its segment's virtual range.
    pub fn file_offset_by_address(&self, address: u64) -> Option<(usize, u64)> {
        self.segments().find_map(|seg| {
            let base = seg.command.vmaddr();
            let delta = address.checked_sub(base)?;
            if delta >= seg.command.vmsize() {
                return None;
            }
            let offset = self
                .image_offset(seg.command.fileoff())?
                .checked_add(delta)?;
            let offset = usize::try_from(offset).ok()?;
            (offset < self.file_size).then_some((offset, seg.command.vmsize() - delta))
        })
    }
}

impl<W: MachWidth, B: AsRef<[u8]> + AsMut<[u8]>> MachoContext<W, B> {
    /// Returns the selected image bytes for in-place mutation.
    pub(crate) fn image_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.start + self.file_size);
        let image = self.data.as_mut().get_mut(start..end);
        debug_assert!(image.is_some(), "image slice outside the buffer");
        image.unwrap_or(&mut [])
    }
}

/// Runs the construction checks, returning the selected slice.
fn validate<W: MachWidth>(data: &[u8], limits: &Limits) -> Result<(usize, usize)> {
    let slice = select_architecture(data, data.len(), W::CPU_TYPE)?;
    if slice.offset % 4 != 0 {
        return Err(Error::AlignmentError {
            offset: slice.offset as u64,
            alignment: 4,
        });
    }
    let image = slice_at(data, slice.offset, slice.size)
        .ok_or(Error::buffer_too_small(slice.offset + slice.size, data.len()))?;

    let header: W::Header =
        read_struct(image, 0).ok_or(Error::buffer_too_small(W::Header::SIZE, image.len()))?;
    if header.magic() != W::MAGIC {
        return Err(Error::InvalidMagic(header.magic()));
    }

    let commands_end = W::Header::SIZE as u64 + u64::from(header.sizeofcmds());
    if commands_end > image.len() as u64 {
        return Err(Error::out_of_bounds(
            "load commands",
            W::Header::SIZE as u64,
            header.sizeofcmds().into(),
            image.len() as u64,
        ));
    }
    if header.ncmds() > limits.max_commands {
        return Err(Error::LimitExceeded {
            what: "load command",
            count: header.ncmds().into(),
            limit: limits.max_commands.into(),
        });
    }

    let mut offset = W::Header::SIZE;
    let mut total: u32 = 0;
    for _ in 0..header.ncmds() {
        if offset + LoadCommand::SIZE > commands_end as usize {
            return Err(Error::out_of_bounds(
                "load command",
                offset as u64,
                LoadCommand::SIZE as u64,
                commands_end,
            ));
        }
        let cmdsize = read_u32_le_at(image, offset + 4).ok_or(Error::invalid("load command", offset as u64))?;
        if (cmdsize as usize) < LoadCommand::SIZE || cmdsize as usize % W::WORD_SIZE != 0 {
            return Err(Error::invalid("load command size", offset as u64));
        }
        total = total
            .checked_add(cmdsize)
            .ok_or(Error::overflow("load command sizes"))?;
        offset += cmdsize as usize;
    }
    if total != header.sizeofcmds() {
        return Err(Error::CommandSizeMismatch {
            declared: header.sizeofcmds(),
            actual: total.into(),
        });
    }

    if header.cputype() != W::CPU_TYPE {
        return Err(Error::UnsupportedCpuType(header.cputype()));
    }
    if !W::supports_file_type(header.filetype()) {
        return Err(Error::UnsupportedFileType(header.filetype()));
    }

    Ok((slice.offset, slice.size))
}

/// Reads the program counter out of an LC_UNIXTHREAD command body.
fn thread_entry<W: MachWidth>(command: &[u8]) -> Option<u64> {
    let thread: ThreadCommand = read_struct(command, 0)?;
    let (flavor, pc_offset) = W::entry_state();
    if thread.flavor != flavor {
        return None;
    }
    let state_size = (thread.count as usize).checked_mul(4)?;
    if pc_offset + W::WORD_SIZE > state_size {
        return None;
    }
    read_word_le_at(command, ThreadCommand::SIZE + pc_offset, W::WORD_SIZE)
}

/// Reads the entry point of a loaded image without building a context.
///
/// The width is taken from the magic. Only the load command list is
/// bounds-checked.
pub fn runtime_entry_address(image: &[u8]) -> Option<u64> {
    match read_u32_le_at(image, 0)? {
        MH_MAGIC => runtime_entry::<Macho32>(image),
        MH_MAGIC_64 => runtime_entry::<Macho64>(image),
        _ => None,
    }
}

fn runtime_entry<W: MachWidth>(image: &[u8]) -> Option<u64> {
    let header: W::Header = read_struct(image, 0)?;
    let end = W::Header::SIZE.checked_add(header.sizeofcmds() as usize)?;
    LoadCommands::new(image, W::Header::SIZE, end, W::WORD_SIZE)
        .take(header.ncmds() as usize)
        .find(|c| c.cmd == LC_UNIXTHREAD)
        .and_then(|c| thread_entry::<W>(c.data))
}

/// Determines the record width of a buffer, honouring fat archives.
///
/// For fat archives the x86-64 slice is preferred over the x86 slice.
pub fn detect_bitness(data: &[u8]) -> Result<Bitness> {
    let offset = if is_fat(data) {
        select_architecture(data, data.len(), CPU_TYPE_X86_64)
            .or_else(|_| select_architecture(data, data.len(), CPU_TYPE_X86))?
            .offset
    } else {
        0
    };
    let magic = read_u32_le_at(data, offset).ok_or(Error::buffer_too_small(offset + 4, data.len()))?;
    match magic {
        MH_MAGIC_64 => Ok(Bitness::Wide),
        MH_MAGIC => Ok(Bitness::Narrow),
        other => Err(Error::InvalidMagic(other)),
    }
}
