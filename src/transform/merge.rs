//! Segment merging.

use std::cell::OnceCell;

use tracing::debug;

use crate::context::MachoContext;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::util::{fixed_name, read_struct, write_struct};

impl<W: MachWidth, B: AsRef<[u8]> + AsMut<[u8]>> MachoContext<W, B> {
    /// Folds the run of segments whose names start with `prefix` into the
    /// first segment of the run.
    ///
    /// The run must be contiguous in the command list, hold at least two
    /// segments, and have no zero-fill tails; segments after the first must
    /// carry no sections. Everything is checked before the image is touched.
    pub fn merge_by_prefix(&mut self, prefix: &str) -> Result<()> {
        let matches = |cmd: u32, data: &[u8]| -> bool {
            cmd == W::SEGMENT_COMMAND
                && read_struct::<W::Segment>(data, 0)
                    .is_some_and(|s| fixed_name(s.segname()).starts_with(prefix.as_bytes()))
        };

        let commands: Vec<(usize, u32, bool)> = self
            .commands()
            .map(|c| (c.offset, c.cmdsize, matches(c.cmd, c.data)))
            .collect();
        let nothing = || Error::NothingToMerge {
            prefix: prefix.to_string(),
        };

        let first = commands
            .iter()
            .position(|&(_, _, matched)| matched)
            .ok_or_else(nothing)?;
        let run = commands[first..]
            .iter()
            .take_while(|&&(_, _, matched)| matched)
            .count();
        if run < 2 {
            return Err(nothing());
        }

        let image = self.image();
        let segments = commands[first..first + run]
            .iter()
            .map(|&(offset, _, _)| {
                read_struct::<W::Segment>(image, offset)
                    .ok_or(Error::invalid("segment command", offset as u64))
            })
            .collect::<Result<Vec<_>>>()?;

        if segments.iter().any(|s| s.vmsize() != s.filesize()) {
            return Err(Error::Unsupported("merging segments with a zero-fill tail"));
        }
        if segments[1..].iter().any(|s| s.nsects() != 0) {
            return Err(Error::Unsupported("merging segments that carry sections"));
        }

        let head = segments[0];
        let tail = segments[run - 1];
        let vmsize = tail
            .vmaddr()
            .checked_sub(head.vmaddr())
            .and_then(|span| W::checked_add(span, tail.vmsize()))
            .ok_or(Error::overflow("merged segment size"))?;
        let filesize = tail
            .fileoff()
            .checked_sub(head.fileoff())
            .and_then(|span| W::checked_add(span, tail.filesize()))
            .ok_or(Error::overflow("merged segment file size"))?;
        let (maxprot, initprot) = segments.iter().fold((0, 0), |(max, init), s| {
            (max | s.maxprot(), init | s.initprot())
        });

        let mut merged = head;
        merged.set_vmsize(vmsize)?;
        merged.set_filesize(filesize)?;
        merged.set_protection(maxprot, initprot);

        let (head_offset, _, _) = commands[first];
        let (remove_start, _, _) = commands[first + 1];
        let (last_offset, last_size, _) = commands[first + run - 1];
        let remove_end = last_offset + last_size as usize;
        let removed_bytes = remove_end - remove_start;
        let removed = (run - 1) as u32;

        let mut header = self.header();
        let commands_end = self.header_size();
        header.set_ncmds(header.ncmds() - removed);
        header.set_sizeofcmds(header.sizeofcmds() - removed_bytes as u32);

        let image = self.image_mut();
        image.copy_within(remove_end..commands_end, remove_start);
        image[commands_end - removed_bytes..commands_end].fill(0);
        write_struct(image, head_offset, &merged)
            .ok_or(Error::invalid("segment command", head_offset as u64))?;
        write_struct(image, 0, &header).ok_or(Error::invalid("header", 0u64))?;

        self.symbols = OnceCell::new();

        debug!(
            "Merged {} segments with prefix {} into {:#x}+{:#x}",
            run,
            prefix,
            merged.vmaddr(),
            vmsize
        );
        Ok(())
    }
}
