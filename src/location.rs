use linear_map::LinearMap;
use log::{debug, error};

use crate::elf::ElfFile;

/// Name of the dynamic symbol locating the JIT code descriptor.
pub(crate) const JIT_DESCRIPTOR_SYMBOL: &str = "__jit_debug_descriptor";
/// Name of the dynamic symbol locating the dex file descriptor.
pub(crate) const DEX_DESCRIPTOR_SYMBOL: &str = "__dex_debug_descriptor";

/// Where the two descriptors live inside the runtime library, as offsets
/// relative to the page-aligned start of its first executable segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DescriptorsLocation {
    pub is_64bit: bool,
    /// 0 encodes a library without the expected symbols; such entries stay
    /// in the cache as negative results.
    pub jit_descriptor_rva: u64,
    pub dex_descriptor_rva: u64,
}

/// Resolves descriptor locations, caching one result per runtime-library
/// path so each library file is parsed at most once.
#[derive(Debug, Default)]
pub(crate) struct DescriptorsLocationCache {
    cache: LinearMap<String, DescriptorsLocation>,
}

impl DescriptorsLocationCache {
    /// Returns the descriptor locations inside the library at
    /// `art_lib_path`, or `None` if the library lacks the symbols.
    pub(crate) fn get(&mut self, art_lib_path: &str) -> Option<DescriptorsLocation> {
        if let Some(location) = self.cache.get(art_lib_path) {
            return (location.jit_descriptor_rva != 0).then_some(*location);
        }
        let location = resolve(art_lib_path).unwrap_or(DescriptorsLocation {
            is_64bit: false,
            jit_descriptor_rva: 0,
            dex_descriptor_rva: 0,
        });
        self.cache.insert(art_lib_path.to_string(), location);
        (location.jit_descriptor_rva != 0).then_some(location)
    }
}

fn resolve(art_lib_path: &str) -> Option<DescriptorsLocation> {
    let data = match std::fs::read(art_lib_path) {
        Ok(data) => data,
        Err(e) => {
            error!("failed to read {art_lib_path}: {e}");
            return None;
        }
    };
    let location = resolve_from_data(&data);
    if location.is_none() {
        debug!("{art_lib_path} does not export the debug descriptors");
    }
    location
}

fn resolve_from_data(data: &[u8]) -> Option<DescriptorsLocation> {
    let elf_file = match ElfFile::parse(data) {
        Ok(elf_file) => elf_file,
        Err(e) => {
            error!("failed to parse runtime library: {e}");
            return None;
        }
    };
    let (min_vaddr, _file_offset) = elf_file.min_executable_vaddr()?;
    // min_vaddr may not be page aligned, but the dynamic linker maps the
    // segment from its page-aligned start, so descriptor addresses are
    // applied relative to that page.
    let aligned_vaddr = min_vaddr & !(page_size() - 1);
    let mut jit_rva = 0u64;
    let mut dex_rva = 0u64;
    elf_file.for_each_dynamic_symbol(|symbol| {
        if symbol.name == JIT_DESCRIPTOR_SYMBOL {
            jit_rva = symbol.vaddr - aligned_vaddr;
        } else if symbol.name == DEX_DESCRIPTOR_SYMBOL {
            dex_rva = symbol.vaddr - aligned_vaddr;
        }
    });
    if jit_rva == 0 || dex_rva == 0 {
        return None;
    }
    Some(DescriptorsLocation {
        is_64bit: elf_file.is_64bit(),
        jit_descriptor_rva: jit_rva,
        dex_descriptor_rva: dex_rva,
    })
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size > 0 {
        page_size as u64
    } else {
        4096
    }
}
