//! Segment and section traversal.
//!
//! Every segment and section handed out here has been bounds-checked against
//! the image at the moment it was read. Nothing is cached: a section seen as
//! valid earlier is checked again on the next visit, since expansion and
//! merging rewrite the command list in place.

use tracing::trace;

use crate::context::MachoContext;
use crate::macho::*;
use crate::relocation::RelocationInfo;
use crate::util::{fixed_name_eq, fixed_name_str, read_struct};

/// A validated segment command.
#[derive(Debug, Clone, Copy)]
pub struct SegmentRef<W: MachWidth> {
    /// Offset of the command from the start of the image
    pub offset: usize,
    /// The command record
    pub command: W::Segment,
}

impl<W: MachWidth> SegmentRef<W> {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        fixed_name_str(self.command.segname())
    }

    /// Returns true if the segment name equals `name`.
    pub fn is_named(&self, name: &str) -> bool {
        fixed_name_eq(self.command.segname(), name)
    }

    /// Offset of the section record at `index`.
    pub(crate) fn section_offset(&self, index: u32) -> usize {
        self.offset + W::Segment::SIZE + index as usize * W::Section::SIZE
    }
}

/// A validated section record.
#[derive(Debug, Clone, Copy)]
pub struct SectionRef<W: MachWidth> {
    /// Offset of the record from the start of the image
    pub offset: usize,
    /// Position inside the owning segment
    pub index: u32,
    /// The section record
    pub record: W::Section,
}

impl<W: MachWidth> SectionRef<W> {
    /// Returns the section name.
    pub fn name(&self) -> &str {
        fixed_name_str(self.record.sectname())
    }

    /// Returns the owning segment name as recorded in the section.
    pub fn segment_name(&self) -> &str {
        fixed_name_str(self.record.segname())
    }

    /// Returns true if `address` lies in `[addr, addr + size)`.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.record.addr()
            && address - self.record.addr() < self.record.size()
    }
}

impl<W: MachWidth, B: AsRef<[u8]>> MachoContext<W, B> {
    /// Returns the segment command following `previous`.
    ///
    /// Yields `None` both when no segment is left and when the next segment
    /// command fails validation.
    pub fn next_segment(&self, previous: Option<&SegmentRef<W>>) -> Option<SegmentRef<W>> {
        let after = previous.map_or(0, |p| p.offset + 1);
        let command = self
            .commands()
            .filter(|c| c.offset >= after)
            .find(|c| c.cmd == W::SEGMENT_COMMAND)?;

        if (command.cmdsize as usize) < W::Segment::SIZE {
            trace!("Segment command at {:#x} is truncated", command.offset);
            return None;
        }
        let segment: W::Segment = read_struct(command.data, 0)?;

        if segment.nsects() > self.limits().max_sections {
            trace!(
                "Segment {} declares {} sections, limit is {}",
                fixed_name_str(segment.segname()),
                segment.nsects(),
                self.limits().max_sections
            );
            return None;
        }
        let sections_end =
            W::Segment::SIZE as u64 + u64::from(segment.nsects()) * W::Section::SIZE as u64;
        if sections_end > u64::from(command.cmdsize) {
            trace!(
                "Segment {} sections overrun its command ({:#x} > {:#x})",
                fixed_name_str(segment.segname()),
                sections_end,
                command.cmdsize
            );
            return None;
        }

        let file_end = self
            .image_offset(segment.fileoff())
            .and_then(|start| W::checked_add(start, segment.filesize()));
        if !matches!(file_end, Some(end) if end <= self.file_size() as u64) {
            trace!(
                "Segment {} file range {:#x}+{:#x} is outside the image",
                fixed_name_str(segment.segname()),
                segment.fileoff(),
                segment.filesize()
            );
            return None;
        }

        if W::checked_add(segment.vmaddr(), segment.vmsize()).is_none() {
            trace!(
                "Segment {} address range wraps",
                fixed_name_str(segment.segname())
            );
            return None;
        }

        Some(SegmentRef {
            offset: command.offset,
            command: segment,
        })
    }

    /// Iterates the segments until the first invalid one.
    pub fn segments(&self) -> Segments<'_, W, B> {
        Segments {
            context: self,
            previous: None,
        }
    }

    /// Returns the section following `previous` inside `segment`.
    pub fn next_section(
        &self,
        segment: &SegmentRef<W>,
        previous: Option<&SectionRef<W>>,
    ) -> Option<SectionRef<W>> {
        let index = previous.map_or(0, |p| p.index + 1);
        self.section_at(segment, index)
    }

    /// Iterates the sections of `segment` until the first invalid one.
    pub fn sections<'a>(&'a self, segment: &SegmentRef<W>) -> Sections<'a, W, B> {
        Sections {
            context: self,
            segment: *segment,
            previous: None,
        }
    }

    fn section_at(&self, segment: &SegmentRef<W>, index: u32) -> Option<SectionRef<W>> {
        if index >= segment.command.nsects() {
            return None;
        }
        let offset = segment.section_offset(index);
        let record: W::Section = read_struct(self.image(), offset)?;
        if !self.section_is_sane(&record, &segment.command) {
            trace!(
                "Section {},{} failed validation",
                fixed_name_str(record.segname()),
                fixed_name_str(record.sectname())
            );
            return None;
        }
        Some(SectionRef {
            offset,
            index,
            record,
        })
    }

    fn section_is_sane(&self, section: &W::Section, segment: &W::Segment) -> bool {
        if section.align() > MAX_SECTION_ALIGN {
            return false;
        }
        let offset = u64::from(section.offset());
        if offset != 0 && offset < segment.fileoff() {
            return false;
        }

        let segment_top = segment.vmaddr().saturating_add(segment.vmsize());
        match W::checked_add(section.addr(), section.size()) {
            Some(top) if top <= segment_top => {}
            _ => return false,
        }

        let segment_file_top = segment.fileoff().saturating_add(segment.filesize());
        match W::checked_add(offset, section.size()) {
            Some(top) if top <= segment_file_top => {}
            _ => return false,
        }

        if section.nreloc() != 0 {
            let pool_end = u32::try_from(self.container_offset())
                .ok()
                .and_then(|base| section.reloff().checked_sub(base))
                .and_then(|start| {
                    section
                        .nreloc()
                        .checked_mul(RelocationInfo::SIZE as u32)?
                        .checked_add(start)
                });
            match pool_end {
                Some(end) if end as usize <= self.file_size() => {}
                _ => return false,
            }
        }

        true
    }

    /// Returns the section at `index` counting across all segments.
    pub fn section_by_global_index(&self, index: u32) -> Option<SectionRef<W>> {
        let mut base: u32 = 0;
        for segment in self.segments() {
            match base.checked_add(segment.command.nsects()) {
                Some(next) if index >= next => base = next,
                _ => return self.section_at(&segment, index - base),
            }
        }
        None
    }

    /// Returns the first segment named `name`.
    pub fn segment_by_name(&self, name: &str) -> Option<SegmentRef<W>> {
        self.segments().find(|segment| segment.is_named(name))
    }

    /// Returns the section named `name` inside `segment`.
    pub fn section_by_name(&self, segment: &SegmentRef<W>, name: &str) -> Option<SectionRef<W>> {
        self.sections(segment)
            .find(|section| fixed_name_eq(section.record.sectname(), name))
    }

    /// Returns the section `section` of the segment `segment`.
    pub fn segment_section_by_name(&self, segment: &str, section: &str) -> Option<SectionRef<W>> {
        let segment = self.segment_by_name(segment)?;
        self.section_by_name(&segment, section)
    }

    /// Returns the section containing `address`.
    pub fn section_by_address(&self, address: u64) -> Option<SectionRef<W>> {
        self.segments()
            .filter(|segment| {
                address >= segment.command.vmaddr()
                    && address - segment.command.vmaddr() < segment.command.vmsize()
            })
            .find_map(|segment| self.sections(&segment).find(|s| s.contains(address)))
    }
}

/// Iterator over validated segments.
#[derive(Debug)]
pub struct Segments<'a, W: MachWidth, B: AsRef<[u8]>> {
    context: &'a MachoContext<W, B>,
    previous: Option<SegmentRef<W>>,
}

impl<W: MachWidth, B: AsRef<[u8]>> Iterator for Segments<'_, W, B> {
    type Item = SegmentRef<W>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.context.next_segment(self.previous.as_ref())?;
        self.previous = Some(next);
        Some(next)
    }
}

/// Iterator over the validated sections of one segment.
#[derive(Debug)]
pub struct Sections<'a, W: MachWidth, B: AsRef<[u8]>> {
    context: &'a MachoContext<W, B>,
    segment: SegmentRef<W>,
    previous: Option<SectionRef<W>>,
}

impl<W: MachWidth, B: AsRef<[u8]>> Iterator for Sections<'_, W, B> {
    type Item = SectionRef<W>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self
            .context
            .next_section(&self.segment, self.previous.as_ref())?;
        self.previous = Some(next);
        Some(next)
    }
}
