//! Image expansion and load command stripping.
//!
//! Expansion follows the same walk twice: once with no destination to learn
//! the required size, and once writing into a buffer of at least that size.
//! Every write is bounds-checked, so a short destination fails instead of
//! producing a truncated image.

use tracing::debug;
use zerocopy::{Immutable, IntoBytes};

use crate::context::MachoContext;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::relocation::RelocationInfo;
use crate::util::{align_up, fixed_name_str, read_struct, read_u32_le_at, slice_at, write_struct};

/// Outcome of [`MachoContext::expand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expansion {
    /// Bytes the expanded image occupies
    pub size: usize,
    /// Offset of the first segment's data; nonzero only for object files,
    /// whose header is padded to a page of its own
    pub first_segment_offset: u64,
}

/// Destination of an expansion pass. Without a buffer only bounds are tracked.
struct Output<'a> {
    buffer: Option<&'a mut [u8]>,
}

impl Output<'_> {
    /// Fails if `end` lies past the destination.
    fn reserve(&self, end: u64) -> Result<()> {
        match &self.buffer {
            Some(buffer) if end > buffer.len() as u64 => Err(Error::BufferTooSmall {
                needed: end,
                available: buffer.len() as u64,
            }),
            _ => Ok(()),
        }
    }

    fn range(&mut self, offset: u64, len: u64) -> Result<Option<&mut [u8]>> {
        let end = offset.checked_add(len).ok_or(Error::overflow("output range"))?;
        self.reserve(end)?;
        Ok(self
            .buffer
            .as_deref_mut()
            .map(|buffer| &mut buffer[offset as usize..end as usize]))
    }

    fn zero(&mut self, offset: u64, len: u64) -> Result<()> {
        if let Some(range) = self.range(offset, len)? {
            range.fill(0);
        }
        Ok(())
    }

    fn copy(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if let Some(range) = self.range(offset, bytes.len() as u64)? {
            range.copy_from_slice(bytes);
        }
        Ok(())
    }

    fn write<T: IntoBytes + Immutable>(&mut self, offset: usize, value: &T) -> Result<()> {
        self.copy(offset as u64, value.as_bytes())
    }
}

fn add<W: MachWidth>(a: u64, b: u64, what: &'static str) -> Result<u64> {
    W::checked_add(a, b).ok_or(Error::overflow(what))
}

fn narrow(value: u64, what: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::overflow(what))
}

impl<W: MachWidth, B: AsRef<[u8]>> MachoContext<W, B> {
    /// Expands the image into its runtime layout.
    ///
    /// With `destination` set to `None` nothing is written and the returned
    /// size is the buffer size a writing pass needs. Stripping only happens
    /// when writing; the computed size is the same either way.
    pub fn expand(&self, destination: Option<&mut [u8]>, strip: bool) -> Result<Expansion> {
        let writing = destination.is_some();
        let mut out = Output {
            buffer: destination,
        };
        let image = self.image();
        let header = self.header();
        let is_object = header.filetype() == MH_OBJECT;
        let header_size = self.header_size() as u64;

        let header_bytes = slice_at(image, 0, header_size as usize)
            .ok_or(Error::buffer_too_small(header_size as usize, image.len()))?;
        out.copy(0, header_bytes)?;

        // Objects place no segment over the header, so it gets its own page.
        let header_size_aligned = if is_object {
            let aligned =
                align_up(header_size, MACHO_PAGE_SIZE).ok_or(Error::overflow("header size"))?;
            out.zero(header_size, aligned - header_size)?;
            aligned
        } else {
            0
        };

        let mut first_segment_offset = 0;
        let mut first_vmaddr = None;
        let mut delta: u64 = 0;
        let mut current_size: u64 = 0;
        let mut found_linkedit = false;
        let mut placed_sections = Vec::new();

        for segment in self.segments() {
            let command = segment.command;
            if command.filesize() > command.vmsize() {
                return Err(Error::invalid("segment file size", segment.offset as u64));
            }

            debug!(
                "Source segment {} offset {:#x} size {:#x} delta {:#x}",
                segment.name(),
                command.fileoff(),
                command.filesize(),
                delta
            );

            let original_delta = delta;
            delta = align_up(delta, MACHO_PAGE_SIZE).ok_or(Error::overflow("segment delta"))?;

            let mut copy_offset = self
                .image_offset(command.fileoff())
                .ok_or(Error::invalid("segment file offset", command.fileoff()))?;
            let mut copy_filesize = command.filesize();
            let mut copy_vmsize = command.vmsize();

            if is_object && copy_offset <= header_size_aligned {
                delta = header_size_aligned - header_size;
                if copy_offset > header_size {
                    delta -= copy_offset - header_size;
                }
                first_segment_offset = header_size_aligned;
            } else if !is_object && copy_offset <= header_size {
                // The header is already in place.
                let skipped = header_size - copy_offset;
                copy_offset = header_size;
                copy_filesize = copy_filesize
                    .checked_sub(skipped)
                    .ok_or(Error::invalid("header segment", segment.offset as u64))?;
                copy_vmsize = copy_vmsize
                    .checked_sub(skipped)
                    .ok_or(Error::invalid("header segment", segment.offset as u64))?;
            }

            let base_vmaddr = *first_vmaddr.get_or_insert(command.vmaddr());

            let placed = add::<W>(copy_offset, delta, "segment placement")?;
            current_size = add::<W>(placed, copy_vmsize, "expanded size")?;
            out.reserve(current_size)?;

            let source = slice_at(image, copy_offset as usize, copy_filesize as usize).ok_or(
                Error::out_of_bounds(
                    "segment data",
                    copy_offset,
                    copy_filesize,
                    image.len() as u64,
                ),
            )?;
            if delta > original_delta {
                out.zero(copy_offset + original_delta, delta - original_delta)?;
            }
            out.copy(placed, source)?;
            out.zero(placed + copy_filesize, copy_vmsize - copy_filesize)?;

            let segment_offset = add::<W>(command.fileoff(), delta, "segment file offset")?;
            debug!(
                "Destination segment {} offset {:#x} size {:#x} delta {:#x}",
                segment.name(),
                segment_offset,
                command.vmsize(),
                delta
            );

            if !is_object {
                let image_offset = self
                    .image_offset(segment_offset)
                    .ok_or(Error::invalid("segment file offset", segment_offset))?;
                if W::wrapping_sub(command.vmaddr(), image_offset) != base_vmaddr {
                    return Err(Error::invalid("segment layout", segment.offset as u64));
                }
            }

            let mut placed_command = command;
            placed_command.set_fileoff(segment_offset)?;
            placed_command.set_filesize(command.vmsize())?;
            out.write(segment.offset, &placed_command)?;

            if segment.is_named(SEG_LINKEDIT) {
                found_linkedit = true;
                self.shift_linkedit_commands(&mut out, narrow(delta, "__LINKEDIT delta")?)?;
            }

            let segment_delta = delta;
            let mut cursor = segment_offset;
            for index in 0..command.nsects() {
                let record_offset = segment.section_offset(index);
                let mut section: W::Section = read_struct(image, record_offset)
                    .ok_or(Error::invalid("section record", record_offset as u64))?;
                let size = narrow(section.size(), "section size")?;

                let offset = if section.offset() == 0 {
                    // Zero-fill sections get room after the preceding data.
                    let offset = narrow(cursor, "section offset")?;
                    cursor = add::<W>(cursor, size.into(), "section offset")?;
                    delta = add::<W>(delta, size.into(), "section delta")?;
                    offset
                } else {
                    let offset = section
                        .offset()
                        .checked_add(narrow(delta, "section delta")?)
                        .ok_or(Error::overflow("section offset"))?;
                    cursor = add::<W>(offset.into(), size.into(), "section offset")?;
                    offset
                };

                debug!(
                    "Section {} offset {:#x} -> {:#x} delta {:#x}",
                    fixed_name_str(section.sectname()),
                    section.offset(),
                    offset,
                    delta
                );
                section.set_offset(offset);
                out.write(record_offset, &section)?;
                placed_sections.push((record_offset, section));
            }

            delta = add::<W>(
                segment_delta,
                command.vmsize() - command.filesize(),
                "segment delta",
            )?;
        }

        if !found_linkedit {
            debug!("No __LINKEDIT segment, moving relocation and symbol pools");
            let end = self.move_loose_pools(&mut out, placed_sections, delta)?;
            current_size = current_size.max(end);
        }

        // Images without segments, such as resource-only kexts, are kept as is.
        if current_size == 0 {
            let file_size = self.file_size() as u64;
            out.reserve(file_size)?;
            out.copy(header_size, &image[header_size as usize..])?;
            current_size = file_size;
        }

        narrow(current_size, "expanded size")?;

        if strip {
            if let Some(buffer) = out.buffer.as_deref_mut() {
                strip_commands::<W>(buffer)?;
            }
        }

        debug!(
            "Expanded image to {:#x} bytes{}",
            current_size,
            if writing { "" } else { " (size only)" }
        );

        Ok(Expansion {
            size: current_size as usize,
            first_segment_offset,
        })
    }

    /// Adds `delta` to the pool offsets of LC_SYMTAB and LC_DYSYMTAB.
    fn shift_linkedit_commands(&self, out: &mut Output<'_>, delta: u32) -> Result<()> {
        if let Some((offset, mut symtab)) = self.command_record::<SymtabCommand>(LC_SYMTAB) {
            for field in [&mut symtab.symoff, &mut symtab.stroff] {
                if *field != 0 {
                    *field = field
                        .checked_add(delta)
                        .ok_or(Error::overflow("symbol table offset"))?;
                }
            }
            out.write(offset, &symtab)?;
        }
        if let Some((offset, mut dysymtab)) = self.command_record::<DysymtabCommand>(LC_DYSYMTAB) {
            dysymtab
                .shift_offsets(delta)
                .ok_or(Error::overflow("dynamic symbol table offset"))?;
            out.write(offset, &dysymtab)?;
        }
        Ok(())
    }

    /// Moves per-section relocations and the symbol and string pools of an
    /// image without __LINKEDIT, realigning each pool. Returns the end of the
    /// last pool written.
    ///
    /// `sections` holds each section record as already placed, keyed by its
    /// offset in the command list.
    fn move_loose_pools(
        &self,
        out: &mut Output<'_>,
        sections: Vec<(usize, W::Section)>,
        mut delta: u64,
    ) -> Result<u64> {
        let mut end: u64 = 0;

        for (record_offset, mut section) in sections {
            if section.reloff() == 0 {
                continue;
            }
            let len = u64::from(section.nreloc()) * RelocationInfo::SIZE as u64;
            let reloff = self.move_pool(
                out,
                section.reloff(),
                len,
                RelocationInfo::SIZE as u64,
                &mut delta,
                &mut end,
            )?;
            debug!(
                "Section {} relocations {:#x} -> {:#x} delta {:#x}",
                fixed_name_str(section.sectname()),
                section.reloff(),
                reloff,
                delta
            );
            section.set_reloff(reloff);
            out.write(record_offset, &section)?;
        }

        if let Some((offset, mut symtab)) = self.command_record::<SymtabCommand>(LC_SYMTAB) {
            if symtab.symoff != 0 {
                let len = u64::from(symtab.nsyms) * W::Nlist::SIZE as u64;
                symtab.symoff = self.move_pool(
                    out,
                    symtab.symoff,
                    len,
                    W::WORD_SIZE as u64,
                    &mut delta,
                    &mut end,
                )?;
            }
            if symtab.stroff != 0 {
                symtab.stroff = self.move_pool(
                    out,
                    symtab.stroff,
                    symtab.strsize.into(),
                    1,
                    &mut delta,
                    &mut end,
                )?;
            }
            debug!(
                "Symbol table {:#x}, strings {:#x}, delta {:#x}",
                symtab.symoff, symtab.stroff, delta
            );
            out.write(offset, &symtab)?;
        }

        Ok(end)
    }

    /// Copies `len` bytes at `file_offset` to their realigned position.
    /// Returns the new file offset.
    fn move_pool(
        &self,
        out: &mut Output<'_>,
        file_offset: u32,
        len: u64,
        alignment: u64,
        delta: &mut u64,
        end: &mut u64,
    ) -> Result<u32> {
        let image = self.image();
        let source = self
            .image_offset(file_offset.into())
            .ok_or(Error::invalid("pool offset", file_offset))?;
        let aligned = align_up(u64::from(file_offset) + *delta, alignment)
            .ok_or(Error::overflow("pool offset"))?;
        *delta = aligned - u64::from(file_offset);
        let placed = add::<W>(source, *delta, "pool placement")?;
        *end = (*end).max(add::<W>(placed, len, "pool end")?);

        let bytes = slice_at(image, source as usize, len as usize)
            .ok_or(Error::out_of_bounds("pool", source, len, image.len() as u64))?;
        out.copy(placed, bytes)?;
        narrow(aligned, "pool offset")
    }

    /// Returns the buffer size [`MachoContext::expand`] needs.
    pub fn expanded_size(&self) -> Result<usize> {
        Ok(self.expand(None, false)?.size)
    }

    /// Expands the image into a newly allocated buffer.
    pub fn expand_to_vec(&self, strip: bool) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; self.expanded_size()?];
        let expansion = self.expand(Some(&mut buffer), strip)?;
        buffer.truncate(expansion.size);
        Ok(buffer)
    }
}

/// Removes the load commands listed in [`STRIPPED_LOAD_COMMANDS`] from an
/// image, compacting the command list and zeroing the vacated tail.
///
/// The width is taken from the magic. Returns the number of commands removed.
/// The image is left untouched if its command list is malformed.
pub fn strip_load_commands(image: &mut [u8]) -> Result<u32> {
    match read_u32_le_at(image, 0) {
        Some(MH_MAGIC) => strip_commands::<Macho32>(image),
        Some(MH_MAGIC_64) => strip_commands::<Macho64>(image),
        Some(other) => Err(Error::InvalidMagic(other)),
        None => Err(Error::buffer_too_small(4, image.len())),
    }
}

fn strip_commands<W: MachWidth>(image: &mut [u8]) -> Result<u32> {
    let mut header: W::Header = read_struct(image, 0)
        .ok_or(Error::buffer_too_small(W::Header::SIZE, image.len()))?;
    let start = W::Header::SIZE;
    let end = start + header.sizeofcmds() as usize;
    if end > image.len() {
        return Err(Error::out_of_bounds(
            "load commands",
            start as u64,
            header.sizeofcmds().into(),
            image.len() as u64,
        ));
    }

    let mut commands = Vec::with_capacity(header.ncmds() as usize);
    let mut offset = start;
    for _ in 0..header.ncmds() {
        let (Some(cmd), Some(cmdsize)) = (
            read_u32_le_at(image, offset),
            read_u32_le_at(image, offset + 4),
        ) else {
            return Err(Error::invalid("load command", offset as u64));
        };
        let size = cmdsize as usize;
        if size < LoadCommand::SIZE || offset + size > end {
            return Err(Error::invalid("load command size", offset as u64));
        }
        commands.push((offset, size, STRIPPED_LOAD_COMMANDS.contains(&cmd)));
        offset += size;
    }

    let mut kept_end = start;
    let mut removed = 0;
    for (offset, size, strip) in commands {
        if strip {
            removed += 1;
        } else {
            image.copy_within(offset..offset + size, kept_end);
            kept_end += size;
        }
    }
    if removed == 0 {
        return Ok(0);
    }
    image[kept_end..end].fill(0);

    header.set_ncmds(header.ncmds() - removed);
    header.set_sizeofcmds((kept_end - start) as u32);
    write_struct(image, 0, &header).ok_or(Error::buffer_too_small(W::Header::SIZE, image.len()))?;

    debug!("Stripped {} load commands", removed);
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{MachoContext32, MachoContext64};
    use crate::error::ErrorKind;
    use crate::macho::testing::*;
    use crate::util::read_u64_le_at;

    fn scenario_a() -> Vec<u8> {
        ImageBuilder::<Macho64>::new(MH_KEXT_BUNDLE)
            .segment("__TEXT", 0, 0x2000, 0, 0x1000, &[])
            .code_signature(0x800, 0x10)
            .data(0x100, vec![0xAAu8; 0x100])
            .file_size(0x1000)
            .build()
    }

    #[test]
    fn test_scenario_a_strip() {
        let data = scenario_a();
        let ctx = MachoContext64::new(&data[..], 0).unwrap();
        assert_eq!(ctx.expanded_size().unwrap(), 0x2000);

        let out = ctx.expand_to_vec(true).unwrap();
        assert_eq!(out.len(), 0x2000);

        let expanded = MachoContext64::new(&out[..], 0).unwrap();
        let header = expanded.header();
        assert_eq!(header.ncmds(), 1);
        assert_eq!(header.sizeofcmds() as usize, SegmentCommand64::SIZE);
        assert!(expanded.next_command(LC_CODE_SIGNATURE, None).is_none());

        let text = expanded.segment_by_name("__TEXT").unwrap();
        assert_eq!(text.command.fileoff(), 0);
        assert_eq!(text.command.filesize(), 0x2000);

        // The vacated command bytes and the demand-zero tail are zero.
        let commands_end = MachHeader64::SIZE + SegmentCommand64::SIZE;
        assert!(out[commands_end..commands_end + 16].iter().all(|&b| b == 0));
        assert!(out[0x100..0x200].iter().all(|&b| b == 0xAA));
        assert!(out[0x1000..0x2000].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_size_only_ignores_strip() {
        let data = scenario_a();
        let ctx = MachoContext64::new(&data[..], 0).unwrap();
        let sized = ctx.expand(None, true).unwrap();
        assert_eq!(sized.size, 0x2000);
        assert_eq!(sized.first_segment_offset, 0);
        // The source is never modified.
        assert_eq!(ctx.header().ncmds(), 2);
    }

    #[test]
    fn test_expand_sample_round_trip() {
        let data = sample_kext::<Macho64>();
        let ctx = MachoContext64::new(&data[..], 0).unwrap();
        assert_eq!(ctx.expanded_size().unwrap(), 0x4000);

        let out = ctx.expand_to_vec(false).unwrap();
        assert_eq!(out.len(), 0x4000);

        let expanded = MachoContext64::new(&out[..], 0).unwrap();
        let layout: Vec<_> = expanded
            .segments()
            .map(|s| (s.command.vmaddr(), s.command.fileoff(), s.command.filesize()))
            .collect();
        assert_eq!(
            layout,
            vec![(0, 0, 0x2000), (0x2000, 0x2000, 0x1000), (0x3000, 0x3000, 0x1000)]
        );
        for segment in expanded.segments() {
            assert_eq!(segment.command.fileoff(), segment.command.vmaddr());
        }

        let offsets: Vec<_> = expanded
            .segments()
            .flat_map(|s| expanded.sections(&s).map(|sect| sect.record.offset()).collect::<Vec<_>>())
            .collect();
        assert_eq!(offsets, vec![0x800, 0xC00, 0x2000, 0x2100]);

        let (_, symtab) = expanded.command_record::<SymtabCommand>(LC_SYMTAB).unwrap();
        assert_eq!(symtab.symoff, 0x3000);
        assert_eq!(symtab.stroff, 0x3200);
        let (_, dysymtab) = expanded
            .command_record::<DysymtabCommand>(LC_DYSYMTAB)
            .unwrap();
        assert_eq!(dysymtab.extreloff, 0x3100);
        assert_eq!(dysymtab.locreloff, 0x3140);

        assert!(out[0x800..0xC00].iter().all(|&b| b == 0xC3));
        assert!(out[0x1000..0x2000].iter().all(|&b| b == 0));
        assert_eq!(read_u64_le_at(&out, 0x2030), Some(SAMPLE_ENTRY));
        assert!(out[0x3400..].iter().all(|&b| b == 0));

        // Tables still resolve after the move.
        let start = expanded.symbol_by_name("_start").unwrap();
        assert_eq!(start.value, SAMPLE_ENTRY);
        let target = expanded.symbol_by_relocation_offset(0x2030).unwrap();
        assert_eq!(target.symbol().unwrap().value, SAMPLE_ENTRY);
        assert_eq!(expanded.uuid(), Some(SAMPLE_UUID));
        assert_eq!(expanded.entry_address(), Some(SAMPLE_ENTRY));
    }

    #[test]
    fn test_expand_sample_32() {
        let data = sample_kext::<Macho32>();
        let ctx = MachoContext32::new(&data[..], 0).unwrap();
        let out = ctx.expand_to_vec(true).unwrap();
        assert_eq!(out.len(), 0x4000);

        let expanded = MachoContext32::new(&out[..], 0).unwrap();
        assert_eq!(expanded.header().ncmds(), 6);
        assert_eq!(expanded.entry_address(), None);
        assert_eq!(expanded.uuid(), Some(SAMPLE_UUID));
        assert_eq!(expanded.symbol_by_name("_start").unwrap().value, SAMPLE_ENTRY);
    }

    #[test]
    fn test_destination_too_small() {
        let data = sample_kext::<Macho64>();
        let ctx = MachoContext64::new(&data[..], 0).unwrap();
        let mut buffer = vec![0u8; 0x3FFF];
        let err = ctx.expand(Some(&mut buffer), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBounds);

        let mut exact = vec![0u8; 0x4000];
        assert_eq!(ctx.expand(Some(&mut exact), true).unwrap().size, 0x4000);
    }

    #[test]
    fn test_expand_object_without_linkedit() {
        let (strings, strx) = string_pool(&["_main"]);
        let text = [TestSection {
            sectname: "__text",
            addr: 0,
            size: 0x20,
            offset: 0xB0,
            align: 4,
            reloff: 0xD0,
            nreloc: 1,
            ..Default::default()
        }];
        let reloc = relocation_bytes(&[RelocationInfo::new(0x4, 1, true, 2, false, 1)]);
        let data = ImageBuilder::<Macho32>::new(MH_OBJECT)
            .segment("", 0, 0x20, 0xB0, 0x20, &text)
            .symtab(0xD8, 1, 0xE4, strings.len() as u32)
            .data(0xB0, vec![0x90u8; 0x20])
            .data(0xD0, reloc.clone())
            .data(0xD8, nlist_bytes::<Macho32>(strx[0], N_SECT | N_EXT, 1, 0x10))
            .data(0xE4, strings)
            .file_size(0x100)
            .build();
        assert_eq!(MachoContext32::new(&data[..], 0).unwrap().header_size(), 0xB0);

        let ctx = MachoContext32::new(&data[..], 0).unwrap();
        let sized = ctx.expand(None, false).unwrap();
        assert_eq!(sized.size, 0x103C);
        assert_eq!(sized.first_segment_offset, 0x1000);

        let out = ctx.expand_to_vec(false).unwrap();
        assert!(out[0xB0..0x1000].iter().all(|&b| b == 0));
        assert!(out[0x1000..0x1020].iter().all(|&b| b == 0x90));
        assert_eq!(&out[0x1020..0x1028], &reloc[..]);

        let expanded = MachoContext32::new(&out[..], 0).unwrap();
        let section = expanded.segment_section_by_name("", "__text").unwrap();
        assert_eq!(section.record.offset(), 0x1000);
        assert_eq!(section.record.reloff(), 0x1020);

        let (_, symtab) = expanded.command_record::<SymtabCommand>(LC_SYMTAB).unwrap();
        assert_eq!(symtab.symoff, 0x1028);
        assert_eq!(symtab.stroff, 0x1034);
        let main = expanded.symbol_by_name("_main").unwrap();
        assert_eq!(expanded.symbol_file_offset(&main), Some((0x1010, 0x10)));
    }

    #[test]
    fn test_expand_object_with_zero_fill_section() {
        let (strings, strx) = string_pool(&["_main", "_buf"]);
        let sections = [
            TestSection {
                sectname: "__text",
                addr: 0,
                size: 0x20,
                offset: 0x100,
                align: 4,
                reloff: 0x120,
                nreloc: 1,
                ..Default::default()
            },
            TestSection {
                sectname: "__bss",
                addr: 0x20,
                size: 0x10,
                offset: 0,
                align: 4,
                flags: S_ZEROFILL,
                ..Default::default()
            },
        ];
        let reloc = relocation_bytes(&[RelocationInfo::new(0x4, 1, true, 2, false, 1)]);
        let mut symbols = nlist_bytes::<Macho32>(strx[0], N_SECT | N_EXT, 1, 0x10);
        symbols.extend(nlist_bytes::<Macho32>(strx[1], N_SECT | N_EXT, 2, 0x24));
        let data = ImageBuilder::<Macho32>::new(MH_OBJECT)
            .segment("", 0, 0x30, 0x100, 0x20, &sections)
            .symtab(0x128, 2, 0x140, strings.len() as u32)
            .data(0x100, vec![0x90u8; 0x20])
            .data(0x120, reloc.clone())
            .data(0x128, symbols)
            .data(0x140, strings)
            .file_size(0x150)
            .build();

        let ctx = MachoContext32::new(&data[..], 0).unwrap();
        let sized = ctx.expand(None, false).unwrap();
        let out = ctx.expand_to_vec(false).unwrap();
        assert_eq!(sized.size, out.len());
        assert_eq!(sized.size, 0x1060);
        assert_eq!(ctx.expand(None, true).unwrap(), sized);

        let expanded = MachoContext32::new(&out[..], 0).unwrap();
        let segment = expanded.segment_by_name("").unwrap();
        assert_eq!(segment.command.fileoff(), 0x1000);
        assert_eq!(segment.command.filesize(), 0x30);

        let text = expanded.segment_section_by_name("", "__text").unwrap();
        assert_eq!(text.record.offset(), 0x1000);
        assert_eq!(text.record.reloff(), 0x1030);
        let bss = expanded.segment_section_by_name("", "__bss").unwrap();
        assert_eq!(bss.record.offset(), 0x1020);
        assert_eq!(bss.record.reloff(), 0);
        assert_eq!(expanded.sections(&segment).count(), 2);

        assert!(out[0x1000..0x1020].iter().all(|&b| b == 0x90));
        assert!(out[0x1020..0x1030].iter().all(|&b| b == 0));
        assert_eq!(&out[0x1030..0x1038], &reloc[..]);

        let (_, symtab) = expanded.command_record::<SymtabCommand>(LC_SYMTAB).unwrap();
        assert_eq!(symtab.symoff, 0x1038);
        assert_eq!(symtab.stroff, 0x1050);
        let buf = expanded.symbol_by_name("_buf").unwrap();
        assert_eq!(expanded.symbol_file_offset(&buf), Some((0x1024, 0xC)));
        let main = expanded.symbol_by_name("_main").unwrap();
        assert_eq!(expanded.symbol_file_offset(&main), Some((0x1010, 0x10)));
    }

    #[test]
    fn test_expand_without_segments() {
        let data = ImageBuilder::<Macho64>::new(MH_KEXT_BUNDLE)
            .uuid(SAMPLE_UUID)
            .data(0x100, vec![0x5Au8; 0x40])
            .file_size(0x200)
            .build();
        let ctx = MachoContext64::new(&data[..], 0).unwrap();
        assert_eq!(ctx.expanded_size().unwrap(), 0x200);
        assert_eq!(ctx.expand_to_vec(false).unwrap(), data);
    }

    #[test]
    fn test_rejects_file_size_over_vm_size() {
        let data = ImageBuilder::<Macho64>::new(MH_KEXT_BUNDLE)
            .segment("__TEXT", 0, 0x1000, 0, 0x2000, &[])
            .file_size(0x2000)
            .build();
        let ctx = MachoContext64::new(&data[..], 0).unwrap();
        assert_eq!(ctx.expanded_size().unwrap_err().kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_rejects_inconsistent_layout() {
        let data = ImageBuilder::<Macho64>::new(MH_KEXT_BUNDLE)
            .segment("__TEXT", 0, 0x1000, 0, 0x1000, &[])
            .segment("__DATA", 0x1800, 0x1000, 0x1000, 0x1000, &[])
            .file_size(0x2000)
            .build();
        let ctx = MachoContext64::new(&data[..], 0).unwrap();
        assert_eq!(ctx.expanded_size().unwrap_err().kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_strip_load_commands() {
        let mut data = sample_kext::<Macho64>();
        let before = MachoContext64::new(&data[..], 0).unwrap().header();
        let thread_size = MachoContext64::new(&data[..], 0)
            .unwrap()
            .next_command(LC_UNIXTHREAD, None)
            .unwrap()
            .cmdsize;

        assert_eq!(strip_load_commands(&mut data).unwrap(), 2);

        let ctx = MachoContext64::new(&data[..], 0).unwrap();
        let after = ctx.header();
        assert_eq!(after.ncmds(), before.ncmds() - 2);
        assert_eq!(after.sizeofcmds(), before.sizeofcmds() - thread_size - 16);
        let tail = MachHeader64::SIZE + after.sizeofcmds() as usize;
        let old_end = MachHeader64::SIZE + before.sizeofcmds() as usize;
        assert!(data[tail..old_end].iter().all(|&b| b == 0));
        assert_eq!(ctx.uuid(), Some(SAMPLE_UUID));
        assert!(ctx.symbol_by_name("_start").is_some());

        // Nothing left to strip.
        assert_eq!(strip_load_commands(&mut data).unwrap(), 0);
    }

    #[test]
    fn test_strip_rejects_bad_input() {
        let mut garbage = vec![0x11u8; 0x40];
        assert_eq!(
            strip_load_commands(&mut garbage).unwrap_err().kind(),
            ErrorKind::InvalidFormat
        );

        let mut data = sample_kext::<Macho64>();
        // Claim one command more than the list holds.
        let ncmds = read_u32_le_at(&data, 16).unwrap();
        data[16..20].copy_from_slice(&(ncmds + 1).to_le_bytes());
        let snapshot = data.clone();
        assert!(strip_load_commands(&mut data).is_err());
        assert_eq!(data, snapshot);
    }
}
