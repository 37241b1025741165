//! Symbol tables, relocation pools and symbol resolution.
//!
//! The loader validates the symbol table, string pool, dynamic symbol
//! groups, indirect symbol table and both relocation pools as one unit: either
//! every range checks out and the result is cached, or nothing is cached and
//! the error is returned. Individual symbols are still re-checked whenever
//! they are looked up.

use std::ops::Range;

use tracing::debug;

use crate::context::MachoContext;
use crate::error::{Error, Result};
use crate::macho::*;
use crate::relocation::{RelocationInfo, RelocationPool, RelocationTable};
use crate::util::{c_str_at, is_aligned, read_struct, read_word_le_at, slice_at};

// =============================================================================
// Symbols
// =============================================================================

/// Where a symbol record is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolSlot {
    /// Index into the main symbol table
    Table(u32),
    /// Index into the indirect symbol table
    Indirect(u32),
}

/// A symbol table entry, widened to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    /// Storage location of the record
    pub slot: SymbolSlot,
    /// Offset of the name in the string pool
    pub string_index: u32,
    /// Type byte
    pub n_type: u8,
    /// One-based section ordinal, or `NO_SECT`
    pub n_sect: u8,
    /// Descriptor
    pub n_desc: u16,
    /// Value
    pub value: u64,
}

impl Symbol {
    fn from_record<N: NlistRecord>(slot: SymbolSlot, record: &N) -> Self {
        Self {
            slot,
            string_index: record.strx(),
            n_type: record.n_type(),
            n_sect: record.n_sect(),
            n_desc: record.n_desc(),
            value: record.n_value(),
        }
    }

    /// True for debugger (STAB) entries.
    #[inline]
    pub fn is_stab(&self) -> bool {
        self.n_type & N_STAB != 0
    }

    /// True if the external bit is set.
    #[inline]
    pub fn is_external(&self) -> bool {
        self.n_type & N_EXT != 0
    }

    /// True if the private external bit is set.
    #[inline]
    pub fn is_private_external(&self) -> bool {
        self.n_type & N_PEXT != 0
    }

    /// The `N_TYPE` field.
    #[inline]
    pub fn type_bits(&self) -> u8 {
        self.n_type & N_TYPE
    }

    fn is_section_type(&self) -> bool {
        if self.is_stab() {
            SECTION_STAB_TYPES.contains(&self.n_type)
        } else {
            self.type_bits() == N_SECT
        }
    }

    /// True if the symbol is located in a section.
    pub fn is_section(&self) -> bool {
        self.is_section_type() && self.n_sect != NO_SECT
    }

    /// True for non-STAB absolute or section symbols.
    pub fn is_defined(&self) -> bool {
        !self.is_stab() && (self.type_bits() == N_ABS || self.is_section_type())
    }

    /// True for non-STAB `N_INDR` symbols.
    pub fn is_indirect(&self) -> bool {
        !self.is_stab() && self.type_bits() == N_INDR
    }
}

/// Result of a relocation-driven symbol lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationTarget {
    /// A relocation exists and refers to this symbol.
    Symbol(Symbol),
    /// A relocation exists but its symbol could not be resolved.
    Unresolved,
}

impl RelocationTarget {
    /// Returns the resolved symbol, if any.
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            RelocationTarget::Symbol(symbol) => Some(symbol),
            RelocationTarget::Unresolved => None,
        }
    }
}

// =============================================================================
// Loaded Tables
// =============================================================================

/// A validated byte range holding `count` records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Pool {
    offset: usize,
    count: u32,
}

/// Validated locations of the symbol and relocation tables.
///
/// Offsets are relative to the start of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTables {
    symbols: Pool,
    strings: Pool,
    dysymtab: Option<DysymtabCommand>,
    indirect: Pool,
    local_relocations: Pool,
    external_relocations: Pool,
}

impl SymbolTables {
    /// Number of entries in the main symbol table.
    pub fn symbol_count(&self) -> u32 {
        self.symbols.count
    }

    /// Size of the string pool in bytes.
    pub fn string_size(&self) -> u32 {
        self.strings.count
    }

    /// Number of indirect symbol table entries.
    pub fn indirect_count(&self) -> u32 {
        self.indirect.count
    }

    /// The dynamic symbol table command, if the image has one.
    pub fn dysymtab(&self) -> Option<&DysymtabCommand> {
        self.dysymtab.as_ref()
    }

    /// Number of entries in a relocation pool.
    pub fn relocation_count(&self, pool: RelocationPool) -> u32 {
        match pool {
            RelocationPool::Local => self.local_relocations.count,
            RelocationPool::External => self.external_relocations.count,
        }
    }

    fn undefined_window(&self) -> Range<u32> {
        self.dysymtab
            .map_or(0..0, |d| d.iundefsym..d.iundefsym + d.nundefsym)
    }
}

/// A view of the main or indirect symbol table.
#[derive(Debug, Clone, Copy)]
pub struct SymbolTableView<'a, W: MachWidth> {
    data: &'a [u8],
    count: u32,
    indirect: bool,
    groups: Option<DysymtabCommand>,
    _width: std::marker::PhantomData<W>,
}

impl<'a, W: MachWidth> SymbolTableView<'a, W> {
    /// Number of entries.
    pub fn len(&self) -> u32 {
        self.count
    }

    /// True if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the entry at `index`.
    pub fn get(&self, index: u32) -> Option<Symbol> {
        if index >= self.count {
            return None;
        }
        let record: W::Nlist = read_struct(self.data, index as usize * W::Nlist::SIZE)?;
        let slot = if self.indirect {
            SymbolSlot::Indirect(index)
        } else {
            SymbolSlot::Table(index)
        };
        Some(Symbol::from_record(slot, &record))
    }

    /// Iterates all entries.
    pub fn iter(&self) -> impl Iterator<Item = Symbol> + 'a {
        let view = *self;
        (0..self.count).filter_map(move |i| view.get(i))
    }

    /// Index window of locally defined symbols.
    pub fn locals(&self) -> Range<u32> {
        self.groups
            .map_or(0..0, |d| d.ilocalsym..d.ilocalsym + d.nlocalsym)
    }

    /// Index window of externally defined symbols.
    pub fn externals(&self) -> Range<u32> {
        self.groups
            .map_or(0..0, |d| d.iextdefsym..d.iextdefsym + d.nextdefsym)
    }

    /// Index window of undefined symbols.
    pub fn undefined(&self) -> Range<u32> {
        self.groups
            .map_or(0..0, |d| d.iundefsym..d.iundefsym + d.nundefsym)
    }
}

// =============================================================================
// Loader
// =============================================================================

impl<W: MachWidth, B: AsRef<[u8]>> MachoContext<W, B> {
    /// Validates a byte range of `count` records of `record_size` bytes
    /// starting at the container-absolute `file_offset`.
    fn validate_pool(
        &self,
        what: &'static str,
        file_offset: u32,
        count: u32,
        record_size: usize,
        alignment: usize,
    ) -> Result<Pool> {
        let offset = self
            .image_offset(file_offset.into())
            .ok_or(Error::out_of_bounds(
                what,
                file_offset.into(),
                0,
                self.file_size() as u64,
            ))?;
        let size = u64::from(count) * record_size as u64;
        let end = offset.checked_add(size).ok_or(Error::overflow(what))?;
        if end > self.file_size() as u64 {
            return Err(Error::out_of_bounds(what, offset, size, self.file_size() as u64));
        }
        if !is_aligned(offset, alignment as u64) {
            return Err(Error::AlignmentError {
                offset,
                alignment: alignment as u64,
            });
        }
        Ok(Pool {
            offset: offset as usize,
            count,
        })
    }

    fn validate_optional_pool(
        &self,
        what: &'static str,
        file_offset: u32,
        count: u32,
        record_size: usize,
        alignment: usize,
    ) -> Result<Pool> {
        match (file_offset, count) {
            (_, 0) | (0, _) => Ok(Pool::default()),
            _ => self.validate_pool(what, file_offset, count, record_size, alignment),
        }
    }

    fn check_limit(what: &'static str, count: u32, limit: u32) -> Result<()> {
        if count > limit {
            return Err(Error::LimitExceeded {
                what,
                count: count.into(),
                limit: limit.into(),
            });
        }
        Ok(())
    }

    /// Validates the tables described by `symtab` and `dysymtab`.
    ///
    /// Nothing is cached; see [`MachoContext::symbol_tables`].
    pub fn load_symbol_tables(
        &self,
        symtab: &SymtabCommand,
        dysymtab: Option<&DysymtabCommand>,
    ) -> Result<SymbolTables> {
        let limits = *self.limits();
        Self::check_limit("symbol", symtab.nsyms, limits.max_symbols)?;

        let symbols = self.validate_pool(
            "symbol table",
            symtab.symoff,
            symtab.nsyms,
            W::Nlist::SIZE,
            W::WORD_SIZE,
        )?;
        let strings = self.validate_pool("string table", symtab.stroff, symtab.strsize, 1, 1)?;
        let last = strings
            .count
            .checked_sub(1)
            .map(|n| strings.offset + n as usize);
        match last.and_then(|i| self.image().get(i)) {
            Some(0) => {}
            _ => return Err(Error::invalid("string table terminator", symtab.stroff)),
        }

        let mut tables = SymbolTables {
            symbols,
            strings,
            dysymtab: None,
            indirect: Pool::default(),
            local_relocations: Pool::default(),
            external_relocations: Pool::default(),
        };

        let Some(dysymtab) = dysymtab else {
            return Ok(tables);
        };

        for (what, index, count) in [
            ("local symbol group", dysymtab.ilocalsym, dysymtab.nlocalsym),
            ("external symbol group", dysymtab.iextdefsym, dysymtab.nextdefsym),
            ("undefined symbol group", dysymtab.iundefsym, dysymtab.nundefsym),
        ] {
            match index.checked_add(count) {
                Some(end) if end <= symtab.nsyms => {}
                _ => {
                    return Err(Error::out_of_bounds(
                        what,
                        index.into(),
                        count.into(),
                        symtab.nsyms.into(),
                    ))
                }
            }
        }

        Self::check_limit("indirect symbol", dysymtab.nindirectsyms, limits.max_symbols)?;
        Self::check_limit("external relocation", dysymtab.nextrel, limits.max_relocations)?;
        Self::check_limit("local relocation", dysymtab.nlocrel, limits.max_relocations)?;

        tables.indirect = self.validate_optional_pool(
            "indirect symbol table",
            dysymtab.indirectsymoff,
            dysymtab.nindirectsyms,
            W::Nlist::SIZE,
            W::WORD_SIZE,
        )?;
        tables.external_relocations = self.validate_optional_pool(
            "external relocations",
            dysymtab.extreloff,
            dysymtab.nextrel,
            RelocationInfo::SIZE,
            4,
        )?;
        tables.local_relocations = self.validate_optional_pool(
            "local relocations",
            dysymtab.locreloff,
            dysymtab.nlocrel,
            RelocationInfo::SIZE,
            4,
        )?;
        tables.dysymtab = Some(*dysymtab);

        Ok(tables)
    }

    /// Loads and caches the tables named by LC_SYMTAB and LC_DYSYMTAB.
    pub fn symbol_tables(&self) -> Result<&SymbolTables> {
        if let Some(tables) = self.symbols.get() {
            return Ok(tables);
        }

        let (_, symtab) = self
            .command_record::<SymtabCommand>(LC_SYMTAB)
            .ok_or(Error::SymbolTableNotFound)?;
        let dysymtab = self
            .command_record::<DysymtabCommand>(LC_DYSYMTAB)
            .map(|(_, cmd)| cmd);

        let tables = self
            .load_symbol_tables(&symtab, dysymtab.as_ref())
            .inspect_err(|e| debug!("Rejected symbol tables: {}", e))?;
        Ok(self.symbols.get_or_init(|| tables))
    }

    fn string_pool(&self, tables: &SymbolTables) -> &[u8] {
        slice_at(self.image(), tables.strings.offset, tables.strings.count as usize).unwrap_or(&[])
    }

    fn view(&self, pool: Pool, indirect: bool, groups: Option<DysymtabCommand>) -> SymbolTableView<'_, W> {
        let len = pool.count as usize * W::Nlist::SIZE;
        SymbolTableView {
            data: slice_at(self.image(), pool.offset, len).unwrap_or(&[]),
            count: pool.count,
            indirect,
            groups,
            _width: std::marker::PhantomData,
        }
    }

    /// Returns the main symbol table after checking every entry.
    pub fn symbol_table(&self) -> Result<SymbolTableView<'_, W>> {
        let tables = self.symbol_tables()?;
        let view = self.view(tables.symbols, false, tables.dysymtab);
        if let Some(bad) = view.iter().find(|s| !self.symbol_is_sane(s)) {
            return Err(Error::invalid("symbol string index", bad.string_index));
        }
        Ok(view)
    }

    /// Returns the indirect symbol table after checking every entry.
    pub fn indirect_symbols(&self) -> Result<SymbolTableView<'_, W>> {
        let tables = self.symbol_tables()?;
        let view = self.view(tables.indirect, true, None);
        if let Some(bad) = view.iter().find(|s| !self.symbol_is_sane(s)) {
            return Err(Error::invalid("indirect symbol string index", bad.string_index));
        }
        Ok(view)
    }

    /// Returns a relocation pool. A pool the image does not have is empty.
    pub fn relocations(&self, pool: RelocationPool) -> Result<RelocationTable<'_>> {
        let tables = self.symbol_tables()?;
        let range = match pool {
            RelocationPool::Local => tables.local_relocations,
            RelocationPool::External => tables.external_relocations,
        };
        slice_at(
            self.image(),
            range.offset,
            range.count as usize * RelocationInfo::SIZE,
        )
        .and_then(RelocationTable::new)
        .ok_or(Error::invalid("relocation pool", range.offset as u64))
    }

    // =========================================================================
    // Resolver
    // =========================================================================

    /// True if the symbol's storage slot exists and its name is in the pool.
    pub fn symbol_is_sane(&self, symbol: &Symbol) -> bool {
        let Ok(tables) = self.symbol_tables() else {
            return false;
        };
        let in_slot = match symbol.slot {
            SymbolSlot::Table(index) => index < tables.symbols.count,
            SymbolSlot::Indirect(index) => {
                tables.dysymtab.is_some() && index < tables.indirect.count
            }
        };
        in_slot && symbol.string_index < tables.strings.count
    }

    fn read_symbol(&self, pool: Pool, slot: SymbolSlot, index: u32) -> Option<Symbol> {
        if index >= pool.count {
            return None;
        }
        let offset = pool.offset + index as usize * W::Nlist::SIZE;
        let record: W::Nlist = read_struct(self.image(), offset)?;
        Some(Symbol::from_record(slot, &record))
    }

    /// Returns the symbol at `index` in the main table.
    pub fn symbol_by_index(&self, index: u32) -> Option<Symbol> {
        let tables = self.symbol_tables().ok()?;
        self.read_symbol(tables.symbols, SymbolSlot::Table(index), index)
            .filter(|symbol| self.symbol_is_sane(symbol))
    }

    /// Returns the symbol at `index` in the indirect table.
    pub fn indirect_symbol_by_index(&self, index: u32) -> Option<Symbol> {
        let tables = self.symbol_tables().ok()?;
        self.read_symbol(tables.indirect, SymbolSlot::Indirect(index), index)
            .filter(|symbol| self.symbol_is_sane(symbol))
    }

    /// Finds a defined symbol by name.
    ///
    /// With a dynamic symbol table the local group is searched, then the
    /// external group; otherwise the whole table is searched.
    pub fn symbol_by_name(&self, name: &str) -> Option<Symbol> {
        let tables = self.symbol_tables().ok()?;
        match tables.dysymtab {
            Some(d) => self
                .find_defined(d.ilocalsym..d.ilocalsym + d.nlocalsym, name)
                .or_else(|| self.find_defined(d.iextdefsym..d.iextdefsym + d.nextdefsym, name)),
            None => self.find_defined(0..tables.symbols.count, name),
        }
    }

    fn find_defined(&self, window: Range<u32>, name: &str) -> Option<Symbol> {
        for index in window {
            let symbol = self.symbol_by_index(index)?;
            if !symbol.is_defined() {
                continue;
            }
            if self.symbol_name(&symbol) == Some(name) {
                return Some(symbol);
            }
        }
        None
    }

    /// Returns the first main-table symbol whose value equals `value`.
    pub fn symbol_by_value(&self, value: u64) -> Option<Symbol> {
        let tables = self.symbol_tables().ok()?;
        (0..tables.symbols.count)
            .filter_map(|i| self.read_symbol(tables.symbols, SymbolSlot::Table(i), i))
            .find(|symbol| symbol.value == value)
            .filter(|symbol| self.symbol_is_sane(symbol))
    }

    /// True if the symbol is defined and stored outside the undefined and
    /// indirect windows.
    pub fn is_local_defined(&self, symbol: &Symbol) -> bool {
        let Ok(tables) = self.symbol_tables() else {
            return false;
        };
        match symbol.slot {
            SymbolSlot::Indirect(_) if tables.dysymtab.is_some() => return false,
            SymbolSlot::Table(index) if tables.undefined_window().contains(&index) => {
                return false
            }
            _ => {}
        }
        symbol.is_defined()
    }

    /// Returns the symbol's name.
    pub fn symbol_name(&self, symbol: &Symbol) -> Option<&str> {
        let tables = self.symbol_tables().ok()?;
        let name = c_str_at(self.string_pool(tables), symbol.string_index as usize)?;
        std::str::from_utf8(name).ok()
    }

    /// Returns the name an `N_INDR` symbol refers to.
    pub fn indirect_symbol_name(&self, symbol: &Symbol) -> Option<&str> {
        if !symbol.is_indirect() {
            return None;
        }
        let tables = self.symbol_tables().ok()?;
        if symbol.value >= u64::from(tables.strings.count) {
            return None;
        }
        let name = c_str_at(self.string_pool(tables), symbol.value as usize)?;
        std::str::from_utf8(name).ok()
    }

    /// True unless the symbol is locally defined with a value outside every
    /// segment.
    pub fn is_symbol_value_in_range(&self, symbol: &Symbol) -> bool {
        if !self.is_local_defined(symbol) {
            return true;
        }
        self.segments().any(|segment| {
            symbol.value >= segment.command.vmaddr()
                && symbol.value - segment.command.vmaddr() < segment.command.vmsize()
        })
    }

    /// Finds the relocation in `pool` whose target address is `address`.
    pub fn relocation_by_offset(&self, pool: RelocationPool, address: u64) -> Option<RelocationInfo> {
        self.relocations(pool).ok()?.find_by_address::<W>(address)
    }

    /// Resolves the external relocation at `address`.
    pub fn symbol_by_extern_relocation_offset(&self, address: u64) -> Option<RelocationTarget> {
        if address >= self.file_size() as u64 {
            return None;
        }
        self.extern_relocation_target(address)
    }

    fn extern_relocation_target(&self, address: u64) -> Option<RelocationTarget> {
        let relocation = self.relocation_by_offset(RelocationPool::External, address)?;
        Some(
            self.symbol_by_index(relocation.symbol_number())
                .map_or(RelocationTarget::Unresolved, RelocationTarget::Symbol),
        )
    }

    /// Resolves the relocation at `address`.
    ///
    /// External relocations name their symbol. For a local relocation the
    /// pointer stored at `address` is read and matched against symbol values.
    pub fn symbol_by_relocation_offset(&self, address: u64) -> Option<RelocationTarget> {
        let top = W::checked_add(address, W::WORD_SIZE as u64)?;
        if top > self.file_size() as u64 {
            return None;
        }

        if let Some(target) = self.extern_relocation_target(address) {
            return Some(target);
        }

        self.relocation_by_offset(RelocationPool::Local, address)?;
        let (offset, max_size) = self.file_offset_by_address(address)?;
        if max_size < W::WORD_SIZE as u64 {
            return None;
        }
        if !is_aligned(offset as u64, W::WORD_SIZE as u64) {
            return Some(RelocationTarget::Unresolved);
        }
        let pointer = read_word_le_at(self.image(), offset, W::WORD_SIZE)?;
        Some(
            self.symbol_by_value(pointer)
                .map_or(RelocationTarget::Unresolved, RelocationTarget::Symbol),
        )
    }

    /// Relocates a section symbol as if its section were placed at
    /// `link_address`, honouring the section alignment.
    ///
    /// Symbols that are not section-based are left untouched.
    pub fn relocate_symbol(&self, link_address: u64, symbol: &mut Symbol) -> Result<()> {
        if !symbol.is_section() {
            return Ok(());
        }
        let section = self
            .section_by_global_index(u32::from(symbol.n_sect) - 1)
            .ok_or(Error::invalid("symbol section ordinal", symbol.n_sect))?;

        let address = section.record.addr();
        let alignment = 1u64 << section.record.align();
        let placed = address.wrapping_add(link_address) & W::MAX_WORD;
        let aligned = placed.wrapping_add(alignment - 1) & !(alignment - 1) & W::MAX_WORD;
        let shift = W::wrapping_sub(aligned, address);
        if shift < link_address {
            return Err(Error::overflow("section placement"));
        }

        symbol.value =
            W::checked_add(symbol.value, shift).ok_or(Error::overflow("relocated symbol value"))?;
        Ok(())
    }

    /// Returns the image offset of the data a symbol points to and the
    /// number of bytes available from there.
    pub fn symbol_file_offset(&self, symbol: &Symbol) -> Option<(usize, u64)> {
        if symbol.n_sect == NO_SECT {
            return None;
        }

        let section = self
            .section_by_global_index(u32::from(symbol.n_sect) - 1)
            .filter(|section| section.record.size() != 0);
        let (base, delta, size) = match section {
            Some(section) => {
                let delta = symbol.value.checked_sub(section.record.addr())?;
                if delta > section.record.size() {
                    return None;
                }
                (u64::from(section.record.offset()), delta, section.record.size())
            }
            None => {
                let segment = self.segments().find(|segment| {
                    symbol.value >= segment.command.vmaddr()
                        && symbol.value - segment.command.vmaddr() < segment.command.vmsize()
                })?;
                (
                    segment.command.fileoff(),
                    symbol.value - segment.command.vmaddr(),
                    segment.command.vmsize(),
                )
            }
        };

        let offset = self.image_offset(base)?.checked_add(delta)?;
        if offset > self.file_size() as u64 {
            return None;
        }
        Some((offset as usize, size - delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Limits, MachoContext32, MachoContext64};
    use crate::error::ErrorKind;
    use crate::macho::testing::*;
    use crate::util::write_struct;

    fn context64(data: &[u8]) -> MachoContext64<&[u8]> {
        MachoContext64::new(data, 0).unwrap()
    }

    fn symtab_of(data: &[u8]) -> (usize, SymtabCommand) {
        context64(data).command_record::<SymtabCommand>(LC_SYMTAB).unwrap()
    }

    #[test]
    fn test_load_sample() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);
        let tables = ctx.symbol_tables().unwrap();
        assert_eq!(tables.symbol_count(), 7);
        assert_eq!(tables.indirect_count(), 1);
        assert_eq!(tables.relocation_count(RelocationPool::External), 3);
        assert_eq!(tables.relocation_count(RelocationPool::Local), 1);
        assert!(ctx.symbols.get().is_some());

        let view = ctx.symbol_table().unwrap();
        assert_eq!(view.len(), 7);
        assert_eq!(view.locals(), 0..1);
        assert_eq!(view.externals(), 1..5);
        assert_eq!(view.undefined(), 5..7);
        let names: Vec<_> = view.iter().filter_map(|s| ctx.symbol_name(&s)).collect();
        assert_eq!(names, &SAMPLE_SYMBOLS[..7]);
    }

    #[test]
    fn test_cached_tables_match_reload() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);
        let (_, symtab) = symtab_of(&data);
        let (_, dysymtab) = ctx.command_record::<DysymtabCommand>(LC_DYSYMTAB).unwrap();
        let cached = ctx.symbol_tables().unwrap().clone();
        let reloaded = ctx.load_symbol_tables(&symtab, Some(&dysymtab)).unwrap();
        assert_eq!(cached, reloaded);

        let without = ctx.load_symbol_tables(&symtab, None).unwrap();
        assert_ne!(cached, without);
        assert_eq!(without.indirect_count(), 0);
    }

    #[test]
    fn test_load_32() {
        let data = sample_kext::<Macho32>();
        let ctx = MachoContext32::new(&data[..], 0).unwrap();
        let start = ctx.symbol_by_name("_start").unwrap();
        assert_eq!(start.value, SAMPLE_ENTRY);
        assert_eq!(start.slot, SymbolSlot::Table(1));
        assert_eq!(ctx.indirect_symbols().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_symtab() {
        let data = ImageBuilder::<Macho64>::new(MH_KEXT_BUNDLE).file_size(0x100).build();
        let ctx = context64(&data);
        assert_eq!(ctx.symbol_tables().unwrap_err(), Error::SymbolTableNotFound);
        assert!(ctx.symbol_by_index(0).is_none());
        assert!(ctx.symbol_by_name("_start").is_none());
    }

    #[test]
    fn test_load_rejects_bad_ranges() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);
        let (_, symtab) = symtab_of(&data);

        let past_end = SymtabCommand { nsyms: 0x1000, ..symtab };
        assert_eq!(
            ctx.load_symbol_tables(&past_end, None).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );

        // Ends inside "_alias".
        let unterminated = SymtabCommand { strsize: 130, ..symtab };
        assert_eq!(
            ctx.load_symbol_tables(&unterminated, None).unwrap_err().kind(),
            ErrorKind::InvalidFormat
        );

        let misaligned = SymtabCommand {
            symoff: symtab.symoff + 4,
            nsyms: 1,
            ..symtab
        };
        assert_eq!(
            ctx.load_symbol_tables(&misaligned, None).unwrap_err().kind(),
            ErrorKind::InvalidFormat
        );

        let empty_pool = SymtabCommand { strsize: 0, ..symtab };
        assert_eq!(
            ctx.load_symbol_tables(&empty_pool, None).unwrap_err().kind(),
            ErrorKind::InvalidFormat
        );
    }

    #[test]
    fn test_load_rejects_bad_dysymtab() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);
        let (_, symtab) = symtab_of(&data);
        let (_, dysymtab) = ctx.command_record::<DysymtabCommand>(LC_DYSYMTAB).unwrap();
        assert!(ctx.load_symbol_tables(&symtab, Some(&dysymtab)).is_ok());

        let groups = DysymtabCommand { nundefsym: 3, ..dysymtab };
        assert_eq!(
            ctx.load_symbol_tables(&symtab, Some(&groups)).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );

        let wrapping = DysymtabCommand {
            iextdefsym: u32::MAX,
            ..dysymtab
        };
        assert!(ctx.load_symbol_tables(&symtab, Some(&wrapping)).is_err());

        let relocs = DysymtabCommand {
            extreloff: SAMPLE_FILE_SIZE as u32 - 8,
            ..dysymtab
        };
        assert_eq!(
            ctx.load_symbol_tables(&symtab, Some(&relocs)).unwrap_err().kind(),
            ErrorKind::OutOfBounds
        );

        let misaligned = DysymtabCommand {
            locreloff: SAMPLE_LOCRELOFF + 2,
            ..dysymtab
        };
        assert_eq!(
            ctx.load_symbol_tables(&symtab, Some(&misaligned)).unwrap_err().kind(),
            ErrorKind::InvalidFormat
        );

        // A counted pool without an offset is absent, not malformed.
        let no_offset = DysymtabCommand {
            indirectsymoff: 0,
            locreloff: 0,
            ..dysymtab
        };
        let tables = ctx.load_symbol_tables(&symtab, Some(&no_offset)).unwrap();
        assert_eq!(tables.indirect_count(), 0);
        assert_eq!(tables.relocation_count(RelocationPool::Local), 0);
        assert_eq!(tables.relocation_count(RelocationPool::External), 3);

        let absent = DysymtabCommand {
            indirectsymoff: 0,
            nindirectsyms: 0,
            extreloff: 0,
            nextrel: 0,
            locreloff: 0,
            nlocrel: 0,
            ..dysymtab
        };
        let tables = ctx.load_symbol_tables(&symtab, Some(&absent)).unwrap();
        assert_eq!(tables.indirect_count(), 0);
        assert_eq!(tables.relocation_count(RelocationPool::Local), 0);
    }

    #[test]
    fn test_failed_load_caches_nothing() {
        let mut data = sample_kext::<Macho64>();
        let (offset, symtab) = symtab_of(&data);
        let broken = SymtabCommand {
            stroff: SAMPLE_FILE_SIZE as u32,
            ..symtab
        };
        write_struct(&mut data, offset, &broken).unwrap();

        let ctx = context64(&data);
        assert!(ctx.symbol_tables().is_err());
        assert!(ctx.symbols.get().is_none());
        assert!(ctx.symbol_table().is_err());
        assert!(ctx.relocations(RelocationPool::External).is_err());
    }

    #[test]
    fn test_symbol_limit() {
        let data = sample_kext::<Macho64>();
        let limits = Limits {
            max_symbols: 6,
            ..Default::default()
        };
        let ctx = MachoContext64::with_limits(&data[..], 0, limits).unwrap();
        assert_eq!(ctx.symbol_tables().unwrap_err().kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_string_index_at_pool_size_is_rejected() {
        let mut data = sample_kext::<Macho64>();
        let (_, symtab) = symtab_of(&data);
        // Point symbol 3 at exactly strsize.
        let entry = SAMPLE_SYMOFF as usize + 3 * Nlist64::SIZE;
        data[entry..entry + 4].copy_from_slice(&symtab.strsize.to_le_bytes());

        let ctx = context64(&data);
        assert!(ctx.symbol_tables().is_ok());
        assert!(ctx.symbol_by_index(3).is_none());
        assert!(ctx.symbol_by_index(2).is_some());
        assert_eq!(ctx.symbol_table().unwrap_err().kind(), ErrorKind::InvalidFormat);

        // One below the size is the pool's final NUL and is accepted.
        data[entry..entry + 4].copy_from_slice(&(symtab.strsize - 1).to_le_bytes());
        let ctx = context64(&data);
        let symbol = ctx.symbol_by_index(3).unwrap();
        assert_eq!(ctx.symbol_name(&symbol), Some(""));
    }

    #[test]
    fn test_symbol_by_name() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);

        let local = ctx.symbol_by_name("_local_helper").unwrap();
        assert_eq!(local.slot, SymbolSlot::Table(0));
        assert!(!local.is_external());

        let vtable = ctx.symbol_by_name("__ZTV8MyDriver").unwrap();
        assert_eq!(vtable.value, 0x2010);
        assert_eq!(vtable.n_sect, 3);
    }

    #[test]
    fn test_symbol_by_name_absent() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);
        assert!(ctx.symbol_by_name("_missing").is_none());
        // Undefined symbols are never returned.
        assert!(ctx.symbol_by_name("_IOLog").is_none());
        // Neither is the indirect alias.
        assert!(ctx.symbol_by_name("_alias").is_none());
        assert!(ctx.symbol_by_name("").is_none());
    }

    #[test]
    fn test_classification() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);

        let start = ctx.symbol_by_index(1).unwrap();
        assert!(start.is_defined());
        assert!(start.is_section());
        assert!(ctx.is_local_defined(&start));

        let undefined = ctx.symbol_by_index(5).unwrap();
        assert!(!undefined.is_defined());
        assert!(!ctx.is_local_defined(&undefined));

        let alias = ctx.indirect_symbol_by_index(0).unwrap();
        assert!(alias.is_indirect());
        assert!(!ctx.is_local_defined(&alias));
        assert_eq!(ctx.indirect_symbol_name(&alias), Some("_start"));
        assert_eq!(ctx.symbol_name(&alias), Some("_alias"));
        assert_eq!(ctx.indirect_symbol_name(&start), None);

        let stab = Symbol {
            n_type: N_FUN,
            n_sect: 1,
            ..start
        };
        assert!(stab.is_stab());
        assert!(stab.is_section());
        assert!(!stab.is_defined());

        let absolute = Symbol {
            n_type: N_ABS | N_EXT,
            n_sect: NO_SECT,
            ..start
        };
        assert!(absolute.is_defined());
        assert!(!absolute.is_section());
    }

    #[test]
    fn test_local_defined_without_dysymtab() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);
        let (_, symtab) = symtab_of(&data);
        let tables = ctx.load_symbol_tables(&symtab, None).unwrap();
        assert!(tables.dysymtab().is_none());
        ctx.symbols.set(tables).unwrap();

        let undefined = ctx.symbol_by_index(5).unwrap();
        assert!(!ctx.is_local_defined(&undefined));
        let start = ctx.symbol_by_index(1).unwrap();
        assert!(ctx.is_local_defined(&start));
        // Without groups the whole table is searched.
        assert!(ctx.symbol_by_name("_start").is_some());
    }

    #[test]
    fn test_value_in_range() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);
        let start = ctx.symbol_by_index(1).unwrap();
        assert!(ctx.is_symbol_value_in_range(&start));

        let outside = Symbol { value: 0x8000, ..start };
        assert!(!ctx.is_symbol_value_in_range(&outside));

        let undefined = Symbol {
            value: 0x8000,
            ..ctx.symbol_by_index(5).unwrap()
        };
        assert!(ctx.is_symbol_value_in_range(&undefined));
    }

    #[test]
    fn test_relocation_lookup() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);

        let first = ctx.relocation_by_offset(RelocationPool::External, 0x2018).unwrap();
        assert_eq!(first.symbol_number(), 1);
        // Second half of the subtractor pair.
        assert!(ctx.relocation_by_offset(RelocationPool::External, 0x2020).is_none());
        assert_eq!(
            ctx.relocation_by_offset(RelocationPool::External, 0x2000)
                .unwrap()
                .symbol_number(),
            6
        );
        assert!(ctx.relocation_by_offset(RelocationPool::Local, 0x2030).is_some());
        assert!(ctx.relocation_by_offset(RelocationPool::Local, 0x2018).is_none());
    }

    #[test]
    fn test_symbol_by_relocation_offset() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);

        let target = ctx.symbol_by_extern_relocation_offset(0x2000).unwrap();
        assert_eq!(ctx.symbol_name(target.symbol().unwrap()), Some("__ZN8OSObject10gMetaClassE"));
        assert!(ctx.symbol_by_extern_relocation_offset(0x2030).is_none());
        assert!(ctx.symbol_by_extern_relocation_offset(0x10_0000).is_none());

        let target = ctx.symbol_by_relocation_offset(0x2018).unwrap();
        assert_eq!(ctx.symbol_name(target.symbol().unwrap()), Some("_start"));

        // Local relocation: the stored pointer 0x810 resolves to _start.
        let target = ctx.symbol_by_relocation_offset(0x2030).unwrap();
        assert_eq!(target.symbol().unwrap().slot, SymbolSlot::Table(1));

        assert!(ctx.symbol_by_relocation_offset(0x2040).is_none());
        assert!(ctx.symbol_by_relocation_offset(SAMPLE_FILE_SIZE as u64 - 4).is_none());
    }

    #[test]
    fn test_relocation_to_unknown_value() {
        let mut data = sample_kext::<Macho64>();
        data[0x1030..0x1038].copy_from_slice(&0x1234u64.to_le_bytes());
        let ctx = context64(&data);
        assert_eq!(
            ctx.symbol_by_relocation_offset(0x2030),
            Some(RelocationTarget::Unresolved)
        );
    }

    #[test]
    fn test_relocate_symbol() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);

        // __text is 16-byte aligned at 0x800.
        let mut start = ctx.symbol_by_index(1).unwrap();
        ctx.relocate_symbol(0x10_0000, &mut start).unwrap();
        assert_eq!(start.value, 0x10_0810);

        let mut start = ctx.symbol_by_index(1).unwrap();
        ctx.relocate_symbol(0x10_0001, &mut start).unwrap();
        assert_eq!(start.value, 0x10_0820);

        let mut undefined = ctx.symbol_by_index(5).unwrap();
        ctx.relocate_symbol(0x10_0000, &mut undefined).unwrap();
        assert_eq!(undefined.value, 0);

        let mut bad = Symbol {
            n_sect: 9,
            ..ctx.symbol_by_index(1).unwrap()
        };
        assert!(ctx.relocate_symbol(0x10_0000, &mut bad).is_err());

        let mut overflow = ctx.symbol_by_index(1).unwrap();
        assert_eq!(
            ctx.relocate_symbol(u64::MAX - 0x100, &mut overflow)
                .unwrap_err()
                .kind(),
            ErrorKind::Overflow
        );
    }

    #[test]
    fn test_symbol_file_offset() {
        let data = sample_kext::<Macho64>();
        let ctx = context64(&data);

        let start = ctx.symbol_by_index(1).unwrap();
        assert_eq!(ctx.symbol_file_offset(&start), Some((0x810, 0x3F0)));

        let meta = ctx.symbol_by_name("__ZTVN8MyDriver9MetaClassE").unwrap();
        assert_eq!(ctx.symbol_file_offset(&meta), Some((0x1040, 0xC0)));

        let undefined = ctx.symbol_by_index(5).unwrap();
        assert_eq!(ctx.symbol_file_offset(&undefined), None);

        let before = Symbol { value: 0x700, ..start };
        assert_eq!(ctx.symbol_file_offset(&before), None);
    }
}
