//! Synthesizes miniature ELF symfiles for tests, shaped like the images
//! the runtime registers for JIT-compiled methods.

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

/// Builds an ELF image with one text symbol per `(name, len)` pair.
pub(crate) fn build_symfile(symbols: &[(&str, u64)]) -> Vec<u8> {
    let mut object = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = object.section_id(StandardSection::Text);
    for (name, len) in symbols {
        let code = vec![0x90u8; *len as usize];
        let value = object.append_section_data(text, &code, 1);
        object.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value,
            size: *len,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    }
    object.write().expect("writing a test ELF image cannot fail")
}
