use log::debug;

use crate::descriptor::{Descriptor, DescriptorKind};
use crate::location::DescriptorsLocationCache;
use crate::maps;

/// Map-name prefix of JIT cache regions inherited from the zygote.
pub(crate) const JIT_ZYGOTE_CACHE_MMAP_PREFIX: &str = "/memfd:jit-zygote-cache";

/// Returns true for the runtime library, release or debug variant.
pub(crate) fn is_art_lib(filename: &str) -> bool {
    filename.ends_with("libart.so") || filename.ends_with("libartd.so")
}

/// State kept for one monitored process.
#[derive(Debug)]
pub(crate) struct Process {
    pub pid: u32,
    pub initialized: bool,
    pub died: bool,
    /// Word size of the target, independent of the reader's.
    pub is_64bit: bool,
    pub jit_descriptor_addr: u64,
    pub dex_descriptor_addr: u64,
    pub last_jit_descriptor: Descriptor,
    pub last_dex_descriptor: Descriptor,
    /// `(start, end)` of JIT cache regions inherited from the zygote;
    /// symfiles inside them go into the zygote scratch file.
    pub jit_zygote_cache_ranges: Vec<(u64, u64)>,
}

impl Process {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid,
            initialized: false,
            died: false,
            is_64bit: false,
            jit_descriptor_addr: 0,
            dex_descriptor_addr: 0,
            last_jit_descriptor: Descriptor::empty(DescriptorKind::Jit),
            last_dex_descriptor: Descriptor::empty(DescriptorKind::Dex),
            jit_zygote_cache_ranges: Vec::new(),
        }
    }

    /// Locates the runtime library in the process's address space and
    /// resolves the two descriptor addresses.
    ///
    /// Returns false without marking the process dead when the library is
    /// not mapped or lacks the symbols; the next tick tries again. Failing
    /// to enumerate the maps at all means the process is gone.
    pub(crate) fn initialize(&mut self, locations: &mut DescriptorsLocationCache) -> bool {
        let thread_mmaps = match maps::get_thread_mmaps_in_process(self.pid) {
            Ok(thread_mmaps) => thread_mmaps,
            Err(e) => {
                debug!("failed to read maps of process {}: {e}", self.pid);
                self.died = true;
                return false;
            }
        };
        let Some(art_map) = thread_mmaps
            .iter()
            .find(|map| map.executable && is_art_lib(&map.name))
        else {
            return false;
        };
        let Some(location) = locations.get(&art_map.name) else {
            return false;
        };
        self.is_64bit = location.is_64bit;
        self.jit_descriptor_addr = location.jit_descriptor_rva + art_map.start_addr;
        self.dex_descriptor_addr = location.dex_descriptor_rva + art_map.start_addr;
        for map in &thread_mmaps {
            if map.name.starts_with(JIT_ZYGOTE_CACHE_MMAP_PREFIX) {
                self.jit_zygote_cache_ranges
                    .push((map.start_addr, map.start_addr + map.len));
            }
        }
        self.initialized = true;
        true
    }
}
