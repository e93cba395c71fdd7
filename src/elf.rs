use object::{elf, Object, ObjectSegment, ObjectSymbol, SegmentFlags};

use crate::error::Error;

/// A symbol parsed out of an ELF image.
#[derive(Debug, Clone)]
pub(crate) struct ElfSymbol {
    pub name: String,
    pub vaddr: u64,
    pub len: u64,
}

/// Returns true if `data` starts with the ELF magic bytes.
pub fn is_valid_elf_file_magic(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == *b"\x7fELF"
}

/// A parsed ELF image, either the runtime library read from disk or a
/// miniature symfile copied out of the target.
pub(crate) struct ElfFile<'data> {
    object: object::File<'data>,
}

impl<'data> ElfFile<'data> {
    pub(crate) fn parse(data: &'data [u8]) -> Result<Self, Error> {
        Ok(Self {
            object: object::File::parse(data)?,
        })
    }

    pub(crate) fn is_64bit(&self) -> bool {
        self.object.is_64()
    }

    /// The lowest virtual address of an executable segment, together with
    /// that segment's file offset. `None` if the image has no executable
    /// segment.
    pub(crate) fn min_executable_vaddr(&self) -> Option<(u64, u64)> {
        let mut min: Option<(u64, u64)> = None;
        for segment in self.object.segments() {
            let executable = matches!(
                segment.flags(),
                SegmentFlags::Elf { p_flags } if p_flags & elf::PF_X != 0
            );
            if !executable {
                continue;
            }
            let vaddr = segment.address();
            if min.map_or(true, |(current, _)| vaddr < current) {
                min = Some((vaddr, segment.file_range().0));
            }
        }
        min
    }

    /// Calls `callback` for each named dynamic symbol.
    pub(crate) fn for_each_dynamic_symbol(&self, mut callback: impl FnMut(ElfSymbol)) {
        for symbol in self.object.dynamic_symbols() {
            if let Some(symbol) = convert_symbol(&symbol) {
                callback(symbol);
            }
        }
    }

    /// Calls `callback` for each named symbol, falling back to the dynamic
    /// symbol table when the image has no symtab.
    pub(crate) fn for_each_symbol(&self, mut callback: impl FnMut(ElfSymbol)) {
        let mut has_symtab = false;
        for symbol in self.object.symbols() {
            has_symtab = true;
            if let Some(symbol) = convert_symbol(&symbol) {
                callback(symbol);
            }
        }
        if !has_symtab {
            self.for_each_dynamic_symbol(callback);
        }
    }
}

fn convert_symbol<'data>(symbol: &impl ObjectSymbol<'data>) -> Option<ElfSymbol> {
    let name = symbol.name().ok()?;
    if name.is_empty() {
        return None;
    }
    Some(ElfSymbol {
        name: name.to_string(),
        vaddr: symbol.address(),
        len: symbol.size(),
    })
}
