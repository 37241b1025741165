//! Synthetic image builder shared by unit tests.

use std::marker::PhantomData;

use byteorder::{BigEndian, ByteOrder};
use zerocopy::IntoBytes;

use super::*;
use crate::relocation::RelocationInfo;

/// Section description for [`ImageBuilder::segment`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TestSection {
    pub sectname: &'static str,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
}

/// Builds little-endian Mach-O images of either width.
pub struct ImageBuilder<W: MachWidth> {
    filetype: u32,
    cputype: u32,
    commands: Vec<u8>,
    ncmds: u32,
    file_size: usize,
    blobs: Vec<(usize, Vec<u8>)>,
    _width: PhantomData<W>,
}

impl<W: MachWidth> ImageBuilder<W> {
    pub fn new(filetype: u32) -> Self {
        Self {
            filetype,
            cputype: W::CPU_TYPE,
            commands: Vec::new(),
            ncmds: 0,
            file_size: 0,
            blobs: Vec::new(),
            _width: PhantomData,
        }
    }

    pub fn cputype(mut self, cputype: u32) -> Self {
        self.cputype = cputype;
        self
    }

    pub fn file_size(mut self, size: usize) -> Self {
        self.file_size = size;
        self
    }

    /// Appends a command with `payload` padded to the word size.
    pub fn raw_command(mut self, cmd: u32, payload: &[u8]) -> Self {
        let mut size = LoadCommand::SIZE + payload.len();
        size = size.div_ceil(W::WORD_SIZE) * W::WORD_SIZE;
        let start = self.commands.len();
        self.commands.extend_from_slice(&cmd.to_le_bytes());
        self.commands.extend_from_slice(&(size as u32).to_le_bytes());
        self.commands.extend_from_slice(payload);
        self.commands.resize(start + size, 0);
        self.ncmds += 1;
        self
    }

    pub fn segment(
        self,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        sections: &[TestSection],
    ) -> Self {
        let prot = (VmProt::READ | VmProt::WRITE).bits();
        self.segment_with_prot(name, vmaddr, vmsize, fileoff, filesize, prot, sections)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn segment_with_prot(
        mut self,
        name: &str,
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        prot: u32,
        sections: &[TestSection],
    ) -> Self {
        let cmdsize = (W::Segment::SIZE + sections.len() * W::Section::SIZE) as u32;
        match W::BITNESS {
            Bitness::Narrow => {
                let mut seg = SegmentCommand {
                    cmdsize,
                    vmaddr: vmaddr as u32,
                    vmsize: vmsize as u32,
                    fileoff: fileoff as u32,
                    filesize: filesize as u32,
                    maxprot: prot,
                    initprot: prot,
                    nsects: sections.len() as u32,
                    ..Default::default()
                };
                seg.set_name(name);
                self.commands.extend_from_slice(seg.as_bytes());
                for s in sections {
                    let mut sect = Section {
                        addr: s.addr as u32,
                        size: s.size as u32,
                        offset: s.offset,
                        align: s.align,
                        reloff: s.reloff,
                        nreloc: s.nreloc,
                        flags: s.flags,
                        ..Default::default()
                    };
                    sect.set_names(name, s.sectname);
                    self.commands.extend_from_slice(sect.as_bytes());
                }
            }
            Bitness::Wide => {
                let mut seg = SegmentCommand64 {
                    cmdsize,
                    vmaddr,
                    vmsize,
                    fileoff,
                    filesize,
                    maxprot: prot,
                    initprot: prot,
                    nsects: sections.len() as u32,
                    ..Default::default()
                };
                seg.set_name(name);
                self.commands.extend_from_slice(seg.as_bytes());
                for s in sections {
                    let mut sect = Section64 {
                        addr: s.addr,
                        size: s.size,
                        offset: s.offset,
                        align: s.align,
                        reloff: s.reloff,
                        nreloc: s.nreloc,
                        flags: s.flags,
                        ..Default::default()
                    };
                    sect.set_names(name, s.sectname);
                    self.commands.extend_from_slice(sect.as_bytes());
                }
            }
        }
        self.ncmds += 1;
        self
    }

    pub fn symtab(mut self, symoff: u32, nsyms: u32, stroff: u32, strsize: u32) -> Self {
        let cmd = SymtabCommand {
            symoff,
            nsyms,
            stroff,
            strsize,
            ..Default::default()
        };
        self.commands.extend_from_slice(cmd.as_bytes());
        self.ncmds += 1;
        self
    }

    pub fn dysymtab(mut self, cmd: DysymtabCommand) -> Self {
        self.commands.extend_from_slice(cmd.as_bytes());
        self.ncmds += 1;
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        let cmd = UuidCommand {
            uuid,
            ..Default::default()
        };
        self.commands.extend_from_slice(cmd.as_bytes());
        self.ncmds += 1;
        self
    }

    /// Appends an LC_UNIXTHREAD whose program counter is `pc`.
    pub fn unix_thread(self, pc: u64) -> Self {
        let (flavor, pc_offset) = W::entry_state();
        let state_words: u32 = match W::BITNESS {
            Bitness::Narrow => 16,
            Bitness::Wide => 42,
        };
        let mut payload = Vec::new();
        payload.extend_from_slice(&flavor.to_le_bytes());
        payload.extend_from_slice(&state_words.to_le_bytes());
        let mut state = vec![0u8; state_words as usize * 4];
        state[pc_offset..pc_offset + W::WORD_SIZE]
            .copy_from_slice(&pc.to_le_bytes()[..W::WORD_SIZE]);
        payload.extend_from_slice(&state);
        self.raw_command(LC_UNIXTHREAD, &payload)
    }

    pub fn code_signature(self, dataoff: u32, datasize: u32) -> Self {
        let mut payload = Vec::new();
        payload.extend_from_slice(&dataoff.to_le_bytes());
        payload.extend_from_slice(&datasize.to_le_bytes());
        self.raw_command(LC_CODE_SIGNATURE, &payload)
    }

    pub fn data(mut self, offset: usize, bytes: impl Into<Vec<u8>>) -> Self {
        self.blobs.push((offset, bytes.into()));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let header_size = W::Header::SIZE;
        let commands_end = header_size + self.commands.len();
        let blobs_end = self
            .blobs
            .iter()
            .map(|(offset, bytes)| offset + bytes.len())
            .max()
            .unwrap_or(0);
        let size = self.file_size.max(commands_end).max(blobs_end);
        let mut image = vec![0u8; size];

        let sizeofcmds = self.commands.len() as u32;
        match W::BITNESS {
            Bitness::Narrow => {
                let header = MachHeader {
                    magic: MH_MAGIC,
                    cputype: self.cputype,
                    cpusubtype: 3,
                    filetype: self.filetype,
                    ncmds: self.ncmds,
                    sizeofcmds,
                    flags: HeaderFlags::NOUNDEFS.bits(),
                };
                image[..header_size].copy_from_slice(header.as_bytes());
            }
            Bitness::Wide => {
                let header = MachHeader64 {
                    magic: MH_MAGIC_64,
                    cputype: self.cputype,
                    cpusubtype: 3,
                    filetype: self.filetype,
                    ncmds: self.ncmds,
                    sizeofcmds,
                    flags: HeaderFlags::NOUNDEFS.bits(),
                    reserved: 0,
                };
                image[..header_size].copy_from_slice(header.as_bytes());
            }
        }
        image[header_size..commands_end].copy_from_slice(&self.commands);
        for (offset, bytes) in &self.blobs {
            image[*offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        image
    }
}

/// Encodes one symbol table entry of width `W`.
pub fn nlist_bytes<W: MachWidth>(strx: u32, n_type: u8, n_sect: u8, value: u64) -> Vec<u8> {
    match W::BITNESS {
        Bitness::Narrow => Nlist {
            n_strx: strx,
            n_type,
            n_sect,
            n_desc: 0,
            n_value: value as u32,
        }
        .as_bytes()
        .to_vec(),
        Bitness::Wide => Nlist64 {
            n_strx: strx,
            n_type,
            n_sect,
            n_desc: 0,
            n_value: value,
        }
        .as_bytes()
        .to_vec(),
    }
}

/// Builds a string pool starting with an empty string, padded to 8 bytes.
///
/// Returns the pool and the index of each name.
pub fn string_pool(names: &[&str]) -> (Vec<u8>, Vec<u32>) {
    let mut pool = vec![0u8];
    let mut indices = Vec::with_capacity(names.len());
    for name in names {
        indices.push(pool.len() as u32);
        pool.extend_from_slice(name.as_bytes());
        pool.push(0);
    }
    pool.resize(pool.len().div_ceil(8) * 8, 0);
    (pool, indices)
}

/// Encodes relocation entries.
pub fn relocation_bytes(entries: &[RelocationInfo]) -> Vec<u8> {
    entries.iter().flat_map(|r| r.as_bytes().to_vec()).collect()
}

/// Wraps slices into a fat archive. Entries are `(cputype, offset, size)`.
pub fn fat_archive(entries: &[(u32, u32, u32)], total_size: usize) -> Vec<u8> {
    let mut data = vec![0u8; total_size];
    BigEndian::write_u32(&mut data[0..], FAT_MAGIC);
    BigEndian::write_u32(&mut data[4..], entries.len() as u32);
    for (i, (cputype, offset, size)) in entries.iter().enumerate() {
        let base = FatHeader::SIZE + i * FatArch::SIZE;
        BigEndian::write_u32(&mut data[base..], *cputype);
        BigEndian::write_u32(&mut data[base + 4..], 3);
        BigEndian::write_u32(&mut data[base + 8..], *offset);
        BigEndian::write_u32(&mut data[base + 12..], *size);
        BigEndian::write_u32(&mut data[base + 16..], 12);
    }
    data
}

// =============================================================================
// Sample Kext
// =============================================================================

pub const SAMPLE_FILE_SIZE: usize = 0x2400;
pub const SAMPLE_SYMOFF: u32 = 0x2000;
pub const SAMPLE_EXTRELOFF: u32 = 0x2100;
pub const SAMPLE_LOCRELOFF: u32 = 0x2140;
pub const SAMPLE_INDIRECTOFF: u32 = 0x2180;
pub const SAMPLE_STROFF: u32 = 0x2200;
pub const SAMPLE_ENTRY: u64 = 0x810;
pub const SAMPLE_UUID: [u8; 16] = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
];

pub const SAMPLE_SYMBOLS: [&str; 8] = [
    "_local_helper",
    "_start",
    "__ZN8MyDriver10superClassE",
    "__ZTV8MyDriver",
    "__ZTVN8MyDriver9MetaClassE",
    "_IOLog",
    "__ZN8OSObject10gMetaClassE",
    "_alias",
];

/// Pair-introducing relocation type for width `W`.
pub fn pair_kind<W: MachWidth>() -> u8 {
    match W::BITNESS {
        Bitness::Narrow => GENERIC_RELOC_SECTDIFF,
        Bitness::Wide => X86_64_RELOC_SUBTRACTOR,
    }
}

/// A kext with `__TEXT`, `__DATA` and `__LINKEDIT`, a full symbol table,
/// relocations, an indirect symbol, a uuid, a unix thread and a code signature.
///
/// Sections, in global order: `__text`, `__const`, `__data`, `__bss`.
pub fn sample_kext<W: MachWidth>() -> Vec<u8> {
    let (strings, strx) = string_pool(&SAMPLE_SYMBOLS);
    let ext = N_EXT;

    let mut symbols = Vec::new();
    symbols.extend(nlist_bytes::<W>(strx[0], N_SECT, 1, 0x800));
    symbols.extend(nlist_bytes::<W>(strx[1], N_SECT | ext, 1, 0x810));
    symbols.extend(nlist_bytes::<W>(strx[2], N_SECT | ext, 3, 0x2000));
    symbols.extend(nlist_bytes::<W>(strx[3], N_SECT | ext, 3, 0x2010));
    symbols.extend(nlist_bytes::<W>(strx[4], N_SECT | ext, 3, 0x2040));
    symbols.extend(nlist_bytes::<W>(strx[5], N_UNDF | ext, NO_SECT, 0));
    symbols.extend(nlist_bytes::<W>(strx[6], N_UNDF | ext, NO_SECT, 0));

    let indirect = nlist_bytes::<W>(strx[7], N_INDR | ext, NO_SECT, strx[1] as u64);

    let length = if W::WORD_SIZE == 8 { 3 } else { 2 };
    let external = relocation_bytes(&[
        RelocationInfo::new(0x2018, 1, false, length, true, pair_kind::<W>()),
        RelocationInfo::new(0x2020, 4, false, length, true, X86_64_RELOC_UNSIGNED),
        RelocationInfo::new(0x2000, 6, false, length, true, X86_64_RELOC_UNSIGNED),
    ]);
    let local = relocation_bytes(&[RelocationInfo::new(
        0x2030,
        3,
        false,
        length,
        false,
        X86_64_RELOC_UNSIGNED,
    )]);

    let dysymtab = DysymtabCommand {
        ilocalsym: 0,
        nlocalsym: 1,
        iextdefsym: 1,
        nextdefsym: 4,
        iundefsym: 5,
        nundefsym: 2,
        indirectsymoff: SAMPLE_INDIRECTOFF,
        nindirectsyms: 1,
        extreloff: SAMPLE_EXTRELOFF,
        nextrel: 3,
        locreloff: SAMPLE_LOCRELOFF,
        nlocrel: 1,
        ..Default::default()
    };

    let text_sections = [
        TestSection {
            sectname: "__text",
            addr: 0x800,
            size: 0x400,
            offset: 0x800,
            align: 4,
            flags: S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
            ..Default::default()
        },
        TestSection {
            sectname: "__const",
            addr: 0xC00,
            size: 0x100,
            offset: 0xC00,
            align: 3,
            ..Default::default()
        },
    ];
    let data_sections = [
        TestSection {
            sectname: "__data",
            addr: 0x2000,
            size: 0x100,
            offset: 0x1000,
            align: 3,
            ..Default::default()
        },
        TestSection {
            sectname: "__bss",
            addr: 0x2100,
            size: 0x80,
            offset: 0,
            align: 3,
            flags: S_ZEROFILL,
            ..Default::default()
        },
    ];

    ImageBuilder::<W>::new(MH_KEXT_BUNDLE)
        .segment("__TEXT", 0, 0x2000, 0, 0x1000, &text_sections)
        .segment("__DATA", 0x2000, 0x1000, 0x1000, 0x1000, &data_sections)
        .segment("__LINKEDIT", 0x3000, 0x1000, 0x2000, 0x400, &[])
        .symtab(SAMPLE_SYMOFF, 7, SAMPLE_STROFF, strings.len() as u32)
        .dysymtab(dysymtab)
        .uuid(SAMPLE_UUID)
        .unix_thread(SAMPLE_ENTRY)
        .code_signature(0x2300, 0x10)
        .data(0x800, vec![0xC3u8; 0x400])
        .data(0x1030, SAMPLE_ENTRY.to_le_bytes()[..W::WORD_SIZE].to_vec())
        .data(SAMPLE_SYMOFF as usize, symbols)
        .data(SAMPLE_EXTRELOFF as usize, external)
        .data(SAMPLE_LOCRELOFF as usize, local)
        .data(SAMPLE_INDIRECTOFF as usize, indirect)
        .data(SAMPLE_STROFF as usize, strings)
        .file_size(SAMPLE_FILE_SIZE)
        .build()
}
