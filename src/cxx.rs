//! Itanium-mangled names used by kext C++ runtime metadata.
//!
//! Kexts describe their classes through a handful of fixed-prefix symbols:
//! the vtable (`__ZTV<class>`), the metaclass vtable
//! (`__ZTVN<class>9MetaClassE`), the metaclass instance
//! (`__ZN<class>10gMetaClassE`) and the super-metaclass pointer
//! (`__ZN<class>10superClassE`). Class names are kept in their mangled
//! length-prefixed form, e.g. `8MyDriver`.

use crate::context::MachoContext;
use crate::macho::MachWidth;
use crate::symbols::Symbol;

/// Prefix of every mangled name.
pub const CXX_PREFIX: &str = "__Z";
/// Prefix of a vtable.
pub const VTABLE_PREFIX: &str = "__ZTV";
/// Prefix of a nested name inside a class.
pub const OSOBJ_PREFIX: &str = "__ZN";
/// Marks a reserved vtable slot.
pub const RESERVED_TOKEN: &str = "_RESERVED";
/// Suffix of a metaclass instance.
pub const METACLASS_TOKEN: &str = "10gMetaClassE";
/// Suffix of a super-metaclass pointer.
pub const SUPER_METACLASS_POINTER_TOKEN: &str = "10superClassE";
/// Prefix of a metaclass vtable.
pub const METACLASS_VTABLE_PREFIX: &str = "__ZTVN";
/// Suffix of a metaclass vtable.
pub const METACLASS_VTABLE_SUFFIX: &str = "9MetaClassE";
/// Placeholder bound to pure virtual slots.
pub const CXX_PURE_VIRTUAL: &str = "___cxa_pure_virtual";
/// Suffix of the symbol marking a final class.
pub const FINAL_CLASS_TOKEN: &str = "14__OSFinalClassEv";

/// Longest symbol name, including its terminator, that may be constructed.
pub const SYM_MAX_NAME_LEN: usize = 256;

/// True for the pure virtual placeholder.
pub fn is_pure_virtual(name: &str) -> bool {
    name == CXX_PURE_VIRTUAL
}

/// True for reserved vtable padding slots.
pub fn is_padslot(name: &str) -> bool {
    name.contains(RESERVED_TOKEN)
}

/// True for a super-metaclass pointer.
pub fn is_smcp(name: &str) -> bool {
    name.contains(SUPER_METACLASS_POINTER_TOKEN)
}

/// True for a metaclass instance.
pub fn is_metaclass_pointer(name: &str) -> bool {
    name.contains(METACLASS_TOKEN)
}

/// True for class and metaclass vtables.
pub fn is_vtable(name: &str) -> bool {
    name.starts_with(VTABLE_PREFIX)
}

/// True for any mangled C++ name.
pub fn is_cxx(name: &str) -> bool {
    name.starts_with(CXX_PREFIX)
}

fn strip_affixes<'a>(name: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)?
        .strip_suffix(suffix)
        .filter(|class| !class.is_empty())
}

/// Class name of a super-metaclass pointer.
pub fn class_name_from_smcp(name: &str) -> Option<&str> {
    strip_affixes(name, OSOBJ_PREFIX, SUPER_METACLASS_POINTER_TOKEN)
}

/// Class name of a metaclass instance.
pub fn class_name_from_metaclass_pointer(name: &str) -> Option<&str> {
    strip_affixes(name, OSOBJ_PREFIX, METACLASS_TOKEN)
}

/// Class name of a vtable.
pub fn class_name_from_vtable(name: &str) -> Option<&str> {
    name.strip_prefix(VTABLE_PREFIX)
}

fn compose(prefix: &str, class_name: &str, suffix: &str) -> Option<String> {
    let len = prefix.len() + class_name.len() + suffix.len();
    if len + 1 > SYM_MAX_NAME_LEN {
        return None;
    }
    let mut name = String::with_capacity(len);
    name.push_str(prefix);
    name.push_str(class_name);
    name.push_str(suffix);
    Some(name)
}

/// Prefix shared by the member functions of a class.
pub fn function_prefix(class_name: &str) -> Option<String> {
    compose(OSOBJ_PREFIX, class_name, "")
}

/// Vtable name of a class.
pub fn vtable_name(class_name: &str) -> Option<String> {
    compose(VTABLE_PREFIX, class_name, "")
}

/// Metaclass vtable name of a class.
pub fn meta_vtable_name(class_name: &str) -> Option<String> {
    compose(METACLASS_VTABLE_PREFIX, class_name, METACLASS_VTABLE_SUFFIX)
}

/// Name of the symbol marking a class final.
pub fn final_symbol_name(class_name: &str) -> Option<String> {
    compose(OSOBJ_PREFIX, class_name, FINAL_CLASS_TOKEN)
}

impl<W: MachWidth, B: AsRef<[u8]>> MachoContext<W, B> {
    /// Follows the relocation stored at a super-metaclass pointer to the
    /// superclass's metaclass symbol.
    pub fn metaclass_symbol_from_smcp(&self, smcp: &Symbol) -> Option<Symbol> {
        self.symbol_by_relocation_offset(smcp.value)?.symbol().copied()
    }

    /// Returns the vtable and metaclass vtable of the class owning a
    /// super-metaclass pointer.
    pub fn vtable_symbols_from_smcp(&self, smcp: &Symbol) -> Option<(Symbol, Symbol)> {
        let class_name = class_name_from_smcp(self.symbol_name(smcp)?)?;
        let vtable = self.symbol_by_name(&vtable_name(class_name)?)?;
        let meta_vtable = self.symbol_by_name(&meta_vtable_name(class_name)?)?;
        Some((vtable, meta_vtable))
    }
}
