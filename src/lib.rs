//! A reader for the in-memory JIT debug interface of Android's ART
//! runtime, built for sampling profilers.
//!
//! ART publishes two linked lists in each app process: one of JIT-compiled
//! methods, each carrying a miniature in-memory ELF symfile, and one of
//! dex files resident in memory. Their heads live in two well-known
//! descriptors, `__jit_debug_descriptor` and `__dex_debug_descriptor`,
//! exported by the runtime library.
//!
//! [`JitDebugReader`] snapshots those lists from outside the target with
//! `process_vm_readv`, without stopping it. Consistency is negotiated
//! purely through the descriptors' seqlocks: a snapshot is used only if
//! the seqlock was even before the walk and unchanged after it. Newly
//! registered JIT symfiles are copied out, appended to scratch files on
//! the host, and reported as one record per contained symbol; dex entries
//! are resolved back to the file backing their mapping. Records are
//! either delivered immediately or reordered by timestamp in lockstep
//! with the profiler's sample stream.
//!
//! # Example
//!
//! ```no_run
//! use jit_debug_reader::{
//!     Error, JitDebugReader, JitDebugReaderConfig, ReadEventControl, SampleStreamEvent,
//!     SymFileOption, SyncOption,
//! };
//!
//! // The embedding event loop owns a periodic event with period
//! // `jit_debug_reader::UPDATE_INTERVAL` whose handler calls
//! // `read_all_processes`, and exposes a handle to pause it:
//! struct TimerHandle;
//! impl ReadEventControl for TimerHandle {
//!     fn enable(&mut self) -> Result<(), Error> {
//!         Ok(())
//!     }
//!     fn disable(&mut self) -> Result<(), Error> {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Error> {
//! let mut reader = JitDebugReader::new(JitDebugReaderConfig {
//!     symfile_prefix: "/tmp/perf".to_string(),
//!     symfile_option: SymFileOption::KeepSymFiles,
//!     sync_option: SyncOption::SyncWithRecords,
//! });
//! reader.register_debug_info_callback(
//!     Box::new(TimerHandle),
//!     Box::new(|batch, _sync_kernel_records| {
//!         for info in batch {
//!             println!("{info:?}");
//!         }
//!         true
//!     }),
//! )?;
//! // Route the profiler's record stream through the reader; processes
//! // that map libart.so and get sampled are monitored automatically.
//! reader.update_record(&SampleStreamEvent::Sample { pid: 1234, timestamp: 1 })?;
//! # Ok(())
//! # }
//! ```

mod apk;
mod code_entry;
mod descriptor;
mod elf;
mod error;
mod location;
mod maps;
mod process;
mod records;
mod remote_mem;
mod temp_symfile;
#[cfg(test)]
mod test_elf;

pub use apk::{apk_url, parse_extracted_in_memory_path};
pub use elf::is_valid_elf_file_magic;
pub use error::Error;
pub use maps::{get_thread_mmaps_in_process, ThreadMmap};
pub use records::{JitDebugInfo, SampleStreamEvent};
pub use remote_mem::{ProcessVmReader, RemoteMemoryRead};
pub use temp_symfile::TempSymFile;

use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use log::{debug, trace};

use crate::code_entry::{read_new_code_entries, CodeEntry};
use crate::descriptor::{descriptor_size, Descriptor, DescriptorKind};
use crate::location::DescriptorsLocationCache;
use crate::process::{is_art_lib, Process};
use crate::records::QueuedDebugInfo;

/// How often monitored processes are polled for descriptor changes.
///
/// Checking costs tens of microseconds per process (mostly spent in
/// `process_vm_readv`), so 100 ms keeps the overhead negligible while
/// picking up new code quickly, even when many processes are watched.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Symfiles larger than this are not copied out of the target.
pub const MAX_JIT_SYMFILE_SIZE: u64 = 1024 * 1024;

const JIT_APP_CACHE_FILE: &str = "jit_app_cache";
const JIT_ZYGOTE_CACHE_FILE: &str = "jit_zygote_cache";

/// What happens to the scratch symfiles when the reader goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymFileOption {
    /// Keep them on disk for later symbolization.
    KeepSymFiles,
    /// Unlink them when the reader is dropped.
    DropSymFiles,
}

/// When extracted debug info is handed to the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOption {
    /// Deliver each batch as soon as it is read.
    DumpImmediately,
    /// Buffer records and deliver them in timestamp order, paced by
    /// [`JitDebugReader::flush_debug_info`].
    SyncWithRecords,
}

/// Receives batches of extracted debug info.
///
/// The second argument asks the consumer to synchronize kernel-provided
/// records before processing the batch. Returning `false` aborts the
/// current tick with [`Error::CallbackFailed`].
pub type DebugInfoCallback = Box<dyn FnMut(&[JitDebugInfo], bool) -> bool>;

/// Controls the periodic read event on the embedding event loop.
///
/// The embedder registers a periodic event with period [`UPDATE_INTERVAL`]
/// whose handler calls [`JitDebugReader::read_all_processes`], then hands
/// the reader this handle. The reader keeps the event disabled while no
/// process is monitored and while a tick is in flight, so ticks never
/// overlap.
pub trait ReadEventControl {
    fn enable(&mut self) -> Result<(), Error>;
    fn disable(&mut self) -> Result<(), Error>;
}

/// Constructor configuration for [`JitDebugReader`].
#[derive(Debug, Clone)]
pub struct JitDebugReaderConfig {
    /// Scratch file paths are derived from this prefix plus a fixed suffix
    /// per cache kind.
    pub symfile_prefix: String,
    pub symfile_option: SymFileOption,
    pub sync_option: SyncOption,
}

/// Extracts JIT and dex debug info from running ART processes.
///
/// See the [crate docs](crate) for the overall data flow.
pub struct JitDebugReader {
    symfile_prefix: String,
    symfile_option: SymFileOption,
    sync_option: SyncOption,
    callback: Option<DebugInfoCallback>,
    read_event: Option<Box<dyn ReadEventControl>>,
    processes: HashMap<u32, Process>,
    /// Value: whether the process has been sampled at least once.
    pids_with_art_lib: HashMap<u32, bool>,
    descriptors_location_cache: DescriptorsLocationCache,
    debug_info_q: BinaryHeap<QueuedDebugInfo>,
    app_symfile: Option<TempSymFile>,
    zygote_symfile: Option<TempSymFile>,
}

impl JitDebugReader {
    pub fn new(config: JitDebugReaderConfig) -> Self {
        Self {
            symfile_prefix: config.symfile_prefix,
            symfile_option: config.symfile_option,
            sync_option: config.sync_option,
            callback: None,
            read_event: None,
            processes: HashMap::new(),
            pids_with_art_lib: HashMap::new(),
            descriptors_location_cache: DescriptorsLocationCache::default(),
            debug_info_q: BinaryHeap::new(),
            app_symfile: None,
            zygote_symfile: None,
        }
    }

    /// Registers the debug info callback and the handle of the periodic
    /// read event. The event starts out disabled; monitoring the first
    /// process enables it.
    pub fn register_debug_info_callback(
        &mut self,
        mut control: Box<dyn ReadEventControl>,
        callback: DebugInfoCallback,
    ) -> Result<(), Error> {
        control.disable()?;
        self.read_event = Some(control);
        self.callback = Some(callback);
        Ok(())
    }

    /// Starts watching `pid`. The process is initialized lazily on the
    /// next read.
    pub fn monitor_process(&mut self, pid: u32) -> Result<(), Error> {
        if !self.processes.contains_key(&pid) {
            self.processes.insert(pid, Process::new(pid));
            debug!("start monitoring process {pid}");
            if self.processes.len() == 1 {
                self.enable_read_event()?;
            }
        }
        Ok(())
    }

    /// Feeds one sample-stream event. Processes that map the runtime
    /// library are tracked; the first sample attributed to such a process
    /// registers it for monitoring and reads it immediately. Every event
    /// also paces the reorder queue via its timestamp.
    pub fn update_record(&mut self, event: &SampleStreamEvent) -> Result<(), Error> {
        match event {
            SampleStreamEvent::Mmap { pid, filename, .. } => {
                if is_art_lib(filename) {
                    self.pids_with_art_lib.entry(*pid).or_insert(false);
                }
            }
            SampleStreamEvent::Fork { pid, ppid, .. } => {
                if pid != ppid && self.pids_with_art_lib.contains_key(ppid) {
                    self.pids_with_art_lib.entry(*pid).or_insert(false);
                }
            }
            SampleStreamEvent::Sample { pid, .. } => {
                let newly_profiled = match self.pids_with_art_lib.get_mut(pid) {
                    Some(profiled) if !*profiled => {
                        *profiled = true;
                        true
                    }
                    _ => false,
                };
                if newly_profiled {
                    let pid = *pid;
                    self.monitor_process(pid)?;
                    self.read_single_process(pid)?;
                }
            }
            SampleStreamEvent::Other { .. } => {}
        }
        self.flush_debug_info(event.timestamp())
    }

    /// Drains the reorder queue of all records older than `timestamp`.
    /// No-op in [`SyncOption::DumpImmediately`] mode.
    pub fn flush_debug_info(&mut self, timestamp: u64) -> Result<(), Error> {
        if self.sync_option != SyncOption::SyncWithRecords {
            return Ok(());
        }
        let mut debug_info = Vec::new();
        while self
            .debug_info_q
            .peek()
            .map_or(false, |queued| queued.0.timestamp() < timestamp)
        {
            if let Some(queued) = self.debug_info_q.pop() {
                debug_info.push(queued.0);
            }
        }
        if debug_info.is_empty() {
            return Ok(());
        }
        self.invoke_callback(&debug_info, false)
    }

    /// The body of the periodic read event: reads every monitored process,
    /// sweeps the ones that died, and delivers what was found.
    pub fn read_all_processes(&mut self) -> Result<(), Error> {
        // Disabled for the duration of the tick so ticks never overlap.
        self.disable_read_event()?;
        let mut debug_info = Vec::new();
        let pids: Vec<u32> = self.processes.keys().copied().collect();
        for pid in pids {
            let Some(mut process) = self.processes.remove(&pid) else {
                continue;
            };
            let result = self.read_process(&mut process, &mut debug_info);
            if process.died {
                debug!("stop monitoring process {pid}");
            } else {
                self.processes.insert(pid, process);
            }
            result?;
        }
        self.add_debug_info(debug_info, true)?;
        if !self.processes.is_empty() {
            self.enable_read_event()?;
        }
        Ok(())
    }

    fn read_single_process(&mut self, pid: u32) -> Result<(), Error> {
        let Some(mut process) = self.processes.remove(&pid) else {
            return Ok(());
        };
        let mut debug_info = Vec::new();
        let result = self.read_process(&mut process, &mut debug_info);
        if process.died {
            debug!("stop monitoring process {pid}");
        } else {
            self.processes.insert(pid, process);
        }
        result?;
        self.add_debug_info(debug_info, false)
    }

    fn read_process(
        &mut self,
        process: &mut Process,
        debug_info: &mut Vec<JitDebugInfo>,
    ) -> Result<(), Error> {
        if process.died
            || (!process.initialized
                && !process.initialize(&mut self.descriptors_location_cache))
        {
            return Ok(());
        }
        let reader = ProcessVmReader::new(process.pid);
        self.read_initialized_process(&reader, process, debug_info)
    }

    fn read_initialized_process<R: RemoteMemoryRead>(
        &mut self,
        mem: &R,
        process: &mut Process,
        debug_info: &mut Vec<JitDebugInfo>,
    ) -> Result<(), Error> {
        let Some((jit_descriptor, dex_descriptor)) = read_descriptors(mem, process) else {
            return Ok(());
        };
        if jit_descriptor.action_seqlock == process.last_jit_descriptor.action_seqlock
            && dex_descriptor.action_seqlock == process.last_dex_descriptor.action_seqlock
        {
            return Ok(());
        }
        self.read_debug_info(mem, process, jit_descriptor, debug_info)?;
        self.read_debug_info(mem, process, dex_descriptor, debug_info)
    }

    /// Runs one extraction pass for one descriptor. Transient
    /// inconsistencies (odd seqlock, broken list, concurrent modification)
    /// drop the pass without advancing the cached descriptor, so the next
    /// tick retries.
    fn read_debug_info<R: RemoteMemoryRead>(
        &mut self,
        mem: &R,
        process: &mut Process,
        new_descriptor: Descriptor,
        debug_info: &mut Vec<JitDebugInfo>,
    ) -> Result<(), Error> {
        let old_descriptor = match new_descriptor.kind {
            DescriptorKind::Jit => process.last_jit_descriptor,
            DescriptorKind::Dex => process.last_dex_descriptor,
        };
        let has_update = new_descriptor.action_seqlock != old_descriptor.action_seqlock
            && new_descriptor.action_seqlock & 1 == 0;
        debug!(
            "{:?} symfiles of pid {}: old seqlock {}, new seqlock {}",
            new_descriptor.kind,
            process.pid,
            old_descriptor.action_seqlock,
            new_descriptor.action_seqlock
        );
        if !has_update {
            return Ok(());
        }
        // Adding or removing one code entry makes two increments of
        // action_seqlock, so at most (diff / 2) entries are new.
        let read_entry_limit = new_descriptor
            .action_seqlock
            .wrapping_sub(old_descriptor.action_seqlock)
            / 2;
        let new_entries = match read_new_code_entries(
            mem,
            &new_descriptor,
            old_descriptor.action_timestamp,
            read_entry_limit,
            process.is_64bit,
        ) {
            Ok(Some(new_entries)) => new_entries,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!("failed to read code entries of process {}: {e}", process.pid);
                process.died = true;
                return Ok(());
            }
        };
        // If the descriptor changed while we walked the list, the entries
        // may not match the snapshot; drop the pass.
        if is_descriptor_changed(mem, process, &new_descriptor) {
            return Ok(());
        }
        debug!(
            "{:?} symfiles of pid {}: read {} new entries",
            new_descriptor.kind,
            process.pid,
            new_entries.len()
        );

        if !new_entries.is_empty() {
            match new_descriptor.kind {
                DescriptorKind::Jit => {
                    self.read_jit_code_debug_info(mem, process, &new_entries, debug_info)?
                }
                DescriptorKind::Dex => {
                    read_dex_file_debug_info(process, &new_entries, debug_info)
                }
            }
        }
        match new_descriptor.kind {
            DescriptorKind::Jit => process.last_jit_descriptor = new_descriptor,
            DescriptorKind::Dex => process.last_dex_descriptor = new_descriptor,
        }
        Ok(())
    }

    /// Copies each new JIT symfile out of the target, appends it to the
    /// matching scratch file and emits one record per contained symbol.
    fn read_jit_code_debug_info<R: RemoteMemoryRead>(
        &mut self,
        mem: &R,
        process: &mut Process,
        jit_entries: &[CodeEntry],
        debug_info: &mut Vec<JitDebugInfo>,
    ) -> Result<(), Error> {
        let mut data = Vec::new();
        for jit_entry in jit_entries {
            if jit_entry.symfile_size > MAX_JIT_SYMFILE_SIZE {
                continue;
            }
            let size = jit_entry.symfile_size as usize;
            if data.len() < size {
                data.resize(size, 0);
            }
            if let Err(e) = mem.read_exact_at(jit_entry.symfile_addr, &mut data[..size]) {
                debug!(
                    "failed to read symfile at {:#x} of process {}: {e}",
                    jit_entry.symfile_addr, process.pid
                );
                process.died = true;
                continue;
            }
            if !is_valid_elf_file_magic(&data[..size]) {
                continue;
            }
            let symfile = self.get_temp_symfile(process, jit_entry)?;
            let file_offset = symfile.offset();
            symfile.write_entry(&data[..size])?;
            let location = format!(
                "{}:{}-{}",
                symfile.path(),
                file_offset,
                file_offset + jit_entry.symfile_size
            );
            match elf::ElfFile::parse(&data[..size]) {
                Ok(elf_file) => elf_file.for_each_symbol(|symbol| {
                    if symbol.len == 0 {
                        // Some arm mapping symbols have zero length.
                        return;
                    }
                    trace!(
                        "JIT symbol {} at [{:#x}-{:#x}] in entry {:#x}, stored in {location}",
                        symbol.name,
                        symbol.vaddr,
                        symbol.vaddr + symbol.len,
                        jit_entry.addr
                    );
                    debug_info.push(JitDebugInfo::JitSymbol {
                        pid: process.pid,
                        timestamp: jit_entry.register_timestamp,
                        symbol_vaddr: symbol.vaddr,
                        symbol_len: symbol.len,
                        symfile_location: location.clone(),
                        symfile_offset: file_offset,
                    });
                }),
                Err(e) => {
                    debug!("failed to parse symfile of process {}: {e}", process.pid)
                }
            }
        }
        if let Some(symfile) = &mut self.app_symfile {
            symfile.flush()?;
        }
        if let Some(symfile) = &mut self.zygote_symfile {
            symfile.flush()?;
        }
        Ok(())
    }

    /// Returns the scratch file for this entry, creating it on first use.
    /// Symfiles inside a zygote cache range of the process go into the
    /// shared zygote file, everything else into the app file.
    fn get_temp_symfile(
        &mut self,
        process: &Process,
        jit_entry: &CodeEntry,
    ) -> Result<&mut TempSymFile, Error> {
        let in_zygote_cache = process
            .jit_zygote_cache_ranges
            .iter()
            .any(|(start, end)| jit_entry.symfile_addr >= *start && jit_entry.symfile_addr < *end);
        let (slot, cache_file) = if in_zygote_cache {
            (&mut self.zygote_symfile, JIT_ZYGOTE_CACHE_FILE)
        } else {
            (&mut self.app_symfile, JIT_APP_CACHE_FILE)
        };
        let symfile = match slot.take() {
            Some(symfile) => symfile,
            None => TempSymFile::create(
                format!("{}_{}", self.symfile_prefix, cache_file),
                self.symfile_option == SymFileOption::DropSymFiles,
            )?,
        };
        Ok(slot.insert(symfile))
    }

    fn add_debug_info(
        &mut self,
        debug_info: Vec<JitDebugInfo>,
        sync_kernel_records: bool,
    ) -> Result<(), Error> {
        if debug_info.is_empty() {
            return Ok(());
        }
        match self.sync_option {
            SyncOption::SyncWithRecords => {
                for info in debug_info {
                    self.debug_info_q.push(QueuedDebugInfo(info));
                }
                Ok(())
            }
            SyncOption::DumpImmediately => self.invoke_callback(&debug_info, sync_kernel_records),
        }
    }

    fn invoke_callback(
        &mut self,
        debug_info: &[JitDebugInfo],
        sync_kernel_records: bool,
    ) -> Result<(), Error> {
        let callback = self.callback.as_mut().ok_or(Error::CallbackNotRegistered)?;
        if callback(debug_info, sync_kernel_records) {
            Ok(())
        } else {
            Err(Error::CallbackFailed)
        }
    }

    fn enable_read_event(&mut self) -> Result<(), Error> {
        match &mut self.read_event {
            Some(event) => event.enable(),
            None => Err(Error::CallbackNotRegistered),
        }
    }

    fn disable_read_event(&mut self) -> Result<(), Error> {
        match &mut self.read_event {
            Some(event) => event.disable(),
            None => Err(Error::CallbackNotRegistered),
        }
    }
}

/// Snapshots both descriptors of the process with a single scatter read.
/// Returns `None` (and marks the process dead on read failure) when no
/// usable snapshot could be taken.
fn read_descriptors<R: RemoteMemoryRead>(
    mem: &R,
    process: &mut Process,
) -> Option<(Descriptor, Descriptor)> {
    let size = descriptor_size(process.is_64bit);
    let mut jit_buf = vec![0u8; size];
    let mut dex_buf = vec![0u8; size];
    let mut reads = [
        (process.jit_descriptor_addr, &mut jit_buf[..]),
        (process.dex_descriptor_addr, &mut dex_buf[..]),
    ];
    if let Err(e) = mem.read_scatter(&mut reads) {
        debug!("failed to read descriptors of process {}: {e}", process.pid);
        process.died = true;
        return None;
    }
    let jit = Descriptor::parse(DescriptorKind::Jit, &jit_buf, process.is_64bit)?;
    let dex = Descriptor::parse(DescriptorKind::Dex, &dex_buf, process.is_64bit)?;
    Some((jit, dex))
}

/// Re-reads the descriptors and reports whether the one `prev` came from
/// moved underneath the walk.
fn is_descriptor_changed<R: RemoteMemoryRead>(
    mem: &R,
    process: &mut Process,
    prev: &Descriptor,
) -> bool {
    let Some((jit, dex)) = read_descriptors(mem, process) else {
        return true;
    };
    match prev.kind {
        DescriptorKind::Jit => prev.action_seqlock != jit.action_seqlock,
        DescriptorKind::Dex => prev.action_seqlock != dex.action_seqlock,
    }
}

/// Maps each new dex entry back to the file backing its mapping and emits
/// one record per resolved entry.
fn read_dex_file_debug_info(
    process: &mut Process,
    dex_entries: &[CodeEntry],
    debug_info: &mut Vec<JitDebugInfo>,
) {
    let thread_mmaps = match get_thread_mmaps_in_process(process.pid) {
        Ok(thread_mmaps) => thread_mmaps,
        Err(e) => {
            debug!("failed to read maps of process {}: {e}", process.pid);
            process.died = true;
            return;
        }
    };
    for dex_entry in dex_entries {
        if let Some(info) = resolve_dex_entry(process.pid, &thread_mmaps, dex_entry) {
            debug_info.push(info);
        }
    }
}

fn resolve_dex_entry(
    pid: u32,
    thread_mmaps: &[ThreadMmap],
    dex_entry: &CodeEntry,
) -> Option<JitDebugInfo> {
    // Index of the first map starting above the dex file.
    let index = thread_mmaps.partition_point(|map| map.start_addr <= dex_entry.symfile_addr);
    let map = thread_mmaps.get(index.checked_sub(1)?)?;
    if map.start_addr + map.len < dex_entry.symfile_addr + dex_entry.symfile_size {
        return None;
    }
    let (file_path, extracted_dex_file_map) =
        if let Some((apk_path, entry_path)) = parse_extracted_in_memory_path(&map.name) {
            (apk_url(&apk_path, &entry_path), Some(map.clone()))
        } else if is_regular_file(&map.name) {
            (map.name.clone(), None)
        } else {
            // Dex files that exist only in memory are not supported.
            return None;
        };
    // Offset of the dex file in the backing .vdex or .apk file.
    let dex_file_offset = dex_entry.symfile_addr - map.start_addr + map.pgoff;
    trace!(
        "dex file {file_path}+{dex_file_offset:#x} in map [{:#x}-{:#x}]",
        map.start_addr,
        map.start_addr + map.len
    );
    Some(JitDebugInfo::DexFile {
        pid,
        timestamp: dex_entry.register_timestamp,
        dex_file_offset,
        file_path,
        extracted_dex_file_map,
    })
}

fn is_regular_file(path: &str) -> bool {
    std::fs::metadata(path).map_or(false, |metadata| metadata.is_file())
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;
    use crate::code_entry::testing::build_entry_bytes;
    use crate::code_entry::CodeEntryFormat;
    use crate::descriptor::testing::DescriptorBytes;
    use crate::remote_mem::testing::FakeTargetMemory;

    const JIT_DESC_ADDR: u64 = 0x7000;
    const DEX_DESC_ADDR: u64 = 0x8000;

    #[derive(Default)]
    struct ControlState {
        enabled: Cell<bool>,
        enables: Cell<u32>,
        disables: Cell<u32>,
    }

    struct MockControl(Rc<ControlState>);

    impl ReadEventControl for MockControl {
        fn enable(&mut self) -> Result<(), Error> {
            self.0.enabled.set(true);
            self.0.enables.set(self.0.enables.get() + 1);
            Ok(())
        }

        fn disable(&mut self) -> Result<(), Error> {
            self.0.enabled.set(false);
            self.0.disables.set(self.0.disables.get() + 1);
            Ok(())
        }
    }

    fn test_reader(dir: &tempfile::TempDir, sync_option: SyncOption) -> JitDebugReader {
        JitDebugReader::new(JitDebugReaderConfig {
            symfile_prefix: dir.path().join("perf").to_string_lossy().into_owned(),
            symfile_option: SymFileOption::KeepSymFiles,
            sync_option,
        })
    }

    fn app_cache_path(dir: &tempfile::TempDir) -> String {
        format!("{}_jit_app_cache", dir.path().join("perf").to_string_lossy())
    }

    fn zygote_cache_path(dir: &tempfile::TempDir) -> String {
        format!("{}_jit_zygote_cache", dir.path().join("perf").to_string_lossy())
    }

    fn initialized_process(pid: u32) -> Process {
        let mut process = Process::new(pid);
        process.initialized = true;
        process.is_64bit = true;
        process.jit_descriptor_addr = JIT_DESC_ADDR;
        process.dex_descriptor_addr = DEX_DESC_ADDR;
        process
    }

    fn put_descriptors(mem: &FakeTargetMemory, jit: &DescriptorBytes, dex: &DescriptorBytes) {
        mem.put(JIT_DESC_ADDR, jit.build());
        mem.put(DEX_DESC_ADDR, dex.build());
    }

    fn dex_record(timestamp: u64) -> JitDebugInfo {
        JitDebugInfo::DexFile {
            pid: 1,
            timestamp,
            dex_file_offset: 0,
            file_path: "/system/framework/boot.vdex".to_string(),
            extracted_dex_file_map: None,
        }
    }

    #[test]
    fn extracts_a_registered_symfile_into_the_app_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let mem = FakeTargetMemory::new();
        let mut process = initialized_process(42);

        let dex_desc = DescriptorBytes::new(*b"Android1", true);
        put_descriptors(&mem, &DescriptorBytes::new(*b"Android1", true), &dex_desc);

        // First tick: both lists empty, seqlocks cached as 0.
        let mut out = Vec::new();
        reader
            .read_initialized_process(&mem, &mut process, &mut out)
            .unwrap();
        assert!(out.is_empty());

        // The target registers one symfile.
        let symfile = crate::test_elf::build_symfile(&[("jit_fn", 32)]);
        let symfile_size = symfile.len() as u64;
        mem.put(0x5000, symfile.clone());
        mem.put(
            0x100,
            build_entry_bytes(CodeEntryFormat::V1_64, 0, 0, 0x5000, symfile_size, 1000, 0),
        );
        let mut jit_desc = DescriptorBytes::new(*b"Android1", true);
        jit_desc.first_entry_addr = 0x100;
        jit_desc.action_seqlock = 2;
        jit_desc.action_timestamp = 1000;
        put_descriptors(&mem, &jit_desc, &dex_desc);

        let mut out = Vec::new();
        reader
            .read_initialized_process(&mem, &mut process, &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        let JitDebugInfo::JitSymbol {
            pid,
            timestamp,
            symbol_len,
            symfile_location,
            symfile_offset,
            ..
        } = &out[0]
        else {
            panic!("expected a JIT symbol record, got {:?}", out[0]);
        };
        assert_eq!(*pid, 42);
        assert_eq!(*timestamp, 1000);
        assert_eq!(*symbol_len, 32);
        assert_eq!(*symfile_offset, 0);
        assert!(symfile_location.ends_with(&format!(":0-{symfile_size}")));

        // The cached descriptor advanced to the even seqlock.
        assert_eq!(process.last_jit_descriptor.action_seqlock, 2);
        // The emitted byte range holds exactly the extracted symfile.
        assert_eq!(std::fs::read(app_cache_path(&dir)).unwrap(), symfile);
    }

    #[test]
    fn scratch_file_offsets_grow_with_each_symfile() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let mem = FakeTargetMemory::new();
        let mut process = initialized_process(42);

        let symfile_a = crate::test_elf::build_symfile(&[("method_a", 16)]);
        let symfile_b = crate::test_elf::build_symfile(&[("method_b", 24)]);
        mem.put(0x5000, symfile_a.clone());
        mem.put(0x9000, symfile_b.clone());
        // Newest first: the entry registered at 1100 heads the list.
        mem.put(
            0x200,
            build_entry_bytes(
                CodeEntryFormat::V1_64,
                0x100,
                0,
                0x9000,
                symfile_b.len() as u64,
                1100,
                0,
            ),
        );
        mem.put(
            0x100,
            build_entry_bytes(
                CodeEntryFormat::V1_64,
                0,
                0x200,
                0x5000,
                symfile_a.len() as u64,
                1000,
                0,
            ),
        );
        let mut jit_desc = DescriptorBytes::new(*b"Android1", true);
        jit_desc.first_entry_addr = 0x200;
        jit_desc.action_seqlock = 4;
        jit_desc.action_timestamp = 1100;
        put_descriptors(&mem, &jit_desc, &DescriptorBytes::new(*b"Android1", true));

        let mut out = Vec::new();
        reader
            .read_initialized_process(&mem, &mut process, &mut out)
            .unwrap();
        assert_eq!(out.len(), 2);
        let offsets: Vec<u64> = out
            .iter()
            .map(|info| match info {
                JitDebugInfo::JitSymbol { symfile_offset, .. } => *symfile_offset,
                other => panic!("expected a JIT symbol record, got {other:?}"),
            })
            .collect();
        assert_eq!(offsets, vec![0, symfile_b.len() as u64]);

        let mut expected = symfile_b;
        expected.extend_from_slice(&symfile_a);
        assert_eq!(std::fs::read(app_cache_path(&dir)).unwrap(), expected);
    }

    #[test]
    fn discards_the_pass_when_the_descriptor_changed_during_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let mem = FakeTargetMemory::new();
        let mut process = initialized_process(42);

        let symfile = crate::test_elf::build_symfile(&[("jit_fn", 32)]);
        mem.put(0x5000, symfile.clone());
        mem.put(
            0x100,
            build_entry_bytes(
                CodeEntryFormat::V1_64,
                0,
                0,
                0x5000,
                symfile.len() as u64,
                1000,
                0,
            ),
        );
        // By the time the descriptors are re-read, the target has already
        // moved on to seqlock 4.
        let mut jit_desc = DescriptorBytes::new(*b"Android1", true);
        jit_desc.first_entry_addr = 0x100;
        jit_desc.action_seqlock = 4;
        jit_desc.action_timestamp = 2000;
        put_descriptors(&mem, &jit_desc, &DescriptorBytes::new(*b"Android1", true));

        // The walk started from a snapshot taken at seqlock 2.
        let snapshot = Descriptor {
            kind: DescriptorKind::Jit,
            version: 1,
            first_entry_addr: 0x100,
            action_seqlock: 2,
            action_timestamp: 1000,
        };
        let mut out = Vec::new();
        reader
            .read_debug_info(&mem, &mut process, snapshot, &mut out)
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(process.last_jit_descriptor.action_seqlock, 0);
        assert!(std::fs::metadata(app_cache_path(&dir)).is_err());
    }

    #[test]
    fn stops_at_the_previous_action_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let mem = FakeTargetMemory::new();
        let mut process = initialized_process(42);
        process.last_jit_descriptor.action_timestamp = 600;

        let symfile = crate::test_elf::build_symfile(&[("newer_method", 8)]);
        mem.put(0x5000, symfile.clone());
        mem.put(
            0x100,
            build_entry_bytes(
                CodeEntryFormat::V1_64,
                0x200,
                0,
                0x5000,
                symfile.len() as u64,
                1000,
                0,
            ),
        );
        // The older entry was covered by a previous pass and its symfile
        // may be long gone; the walk must not touch it.
        mem.put(
            0x200,
            build_entry_bytes(CodeEntryFormat::V1_64, 0, 0x100, 0xdead0000, 64, 500, 0),
        );
        let mut jit_desc = DescriptorBytes::new(*b"Android1", true);
        jit_desc.first_entry_addr = 0x100;
        jit_desc.action_seqlock = 4;
        jit_desc.action_timestamp = 1000;
        put_descriptors(&mem, &jit_desc, &DescriptorBytes::new(*b"Android1", true));

        let mut out = Vec::new();
        reader
            .read_initialized_process(&mem, &mut process, &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp(), 1000);
        assert!(!process.died);
    }

    #[test]
    fn odd_descriptor_seqlock_is_not_acted_on() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let mem = FakeTargetMemory::new();
        let mut process = initialized_process(42);

        let mut jit_desc = DescriptorBytes::new(*b"Android1", true);
        jit_desc.first_entry_addr = 0x100;
        jit_desc.action_seqlock = 3;
        put_descriptors(&mem, &jit_desc, &DescriptorBytes::new(*b"Android1", true));

        let mut out = Vec::new();
        reader
            .read_initialized_process(&mem, &mut process, &mut out)
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(process.last_jit_descriptor.action_seqlock, 0);
    }

    #[test]
    fn zygote_cache_entries_go_into_the_zygote_scratch_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let mem = FakeTargetMemory::new();
        let mut process = initialized_process(42);
        process.jit_zygote_cache_ranges = vec![(0x10000, 0x20000)];

        let symfile = crate::test_elf::build_symfile(&[("boot_method", 8)]);
        mem.put(0x18000, symfile.clone());
        let entries = [CodeEntry {
            addr: 0x100,
            symfile_addr: 0x18000,
            symfile_size: symfile.len() as u64,
            register_timestamp: 1000,
        }];

        let mut out = Vec::new();
        reader
            .read_jit_code_debug_info(&mem, &mut process, &entries, &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(std::fs::read(zygote_cache_path(&dir)).unwrap(), symfile);
        assert!(std::fs::metadata(app_cache_path(&dir)).is_err());
    }

    #[test]
    fn oversized_symfiles_are_skipped_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let mem = FakeTargetMemory::new();
        let mut process = initialized_process(42);

        let symfile = crate::test_elf::build_symfile(&[("small_method", 8)]);
        mem.put(0x5000, symfile.clone());
        let entries = [
            // No memory exists behind this entry; it must be skipped on
            // size alone, before any read is attempted.
            CodeEntry {
                addr: 0x100,
                symfile_addr: 0x4000_0000,
                symfile_size: MAX_JIT_SYMFILE_SIZE + 1,
                register_timestamp: 1100,
            },
            CodeEntry {
                addr: 0x200,
                symfile_addr: 0x5000,
                symfile_size: symfile.len() as u64,
                register_timestamp: 1000,
            },
        ];

        let mut out = Vec::new();
        reader
            .read_jit_code_debug_info(&mem, &mut process, &entries, &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].timestamp(), 1000);
        assert!(!process.died);
    }

    #[test]
    fn unreadable_symfile_marks_the_process_dead_but_continues() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let mem = FakeTargetMemory::new();
        let mut process = initialized_process(42);

        let symfile = crate::test_elf::build_symfile(&[("live_method", 8)]);
        mem.put(0x5000, symfile.clone());
        let entries = [
            CodeEntry {
                addr: 0x100,
                symfile_addr: 0x4000_0000,
                symfile_size: 64,
                register_timestamp: 1100,
            },
            CodeEntry {
                addr: 0x200,
                symfile_addr: 0x5000,
                symfile_size: symfile.len() as u64,
                register_timestamp: 1000,
            },
        ];

        let mut out = Vec::new();
        reader
            .read_jit_code_debug_info(&mem, &mut process, &entries, &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(process.died);
    }

    #[test]
    fn non_elf_symfiles_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let mem = FakeTargetMemory::new();
        let mut process = initialized_process(42);

        mem.put(0x5000, b"dex\n035\0not an elf image".to_vec());
        let entries = [CodeEntry {
            addr: 0x100,
            symfile_addr: 0x5000,
            symfile_size: 24,
            register_timestamp: 1000,
        }];

        let mut out = Vec::new();
        reader
            .read_jit_code_debug_info(&mem, &mut process, &entries, &mut out)
            .unwrap();
        assert!(out.is_empty());
        assert!(std::fs::metadata(app_cache_path(&dir)).is_err());
    }

    #[test]
    fn reorder_queue_flushes_in_timestamp_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::SyncWithRecords);
        let batches: Rc<RefCell<Vec<(Vec<u64>, bool)>>> = Rc::default();
        let sink = batches.clone();
        reader
            .register_debug_info_callback(
                Box::new(MockControl(Rc::default())),
                Box::new(move |batch, sync_kernel_records| {
                    let timestamps = batch.iter().map(JitDebugInfo::timestamp).collect();
                    sink.borrow_mut().push((timestamps, sync_kernel_records));
                    true
                }),
            )
            .unwrap();

        for timestamp in [30, 10, 20, 40] {
            reader
                .add_debug_info(vec![dex_record(timestamp)], true)
                .unwrap();
        }
        reader.flush_debug_info(25).unwrap();
        reader.flush_debug_info(100).unwrap();
        // A flush with nothing old enough must not call back at all.
        reader.flush_debug_info(100).unwrap();

        let batches = batches.borrow();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], (vec![10, 20], false));
        assert_eq!(batches[1], (vec![30, 40], false));
    }

    #[test]
    fn immediate_mode_delivers_with_the_sync_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let batches: Rc<RefCell<Vec<(usize, bool)>>> = Rc::default();
        let sink = batches.clone();
        reader
            .register_debug_info_callback(
                Box::new(MockControl(Rc::default())),
                Box::new(move |batch, sync_kernel_records| {
                    sink.borrow_mut().push((batch.len(), sync_kernel_records));
                    true
                }),
            )
            .unwrap();

        reader.add_debug_info(vec![dex_record(5)], true).unwrap();
        reader.add_debug_info(vec![dex_record(6)], false).unwrap();
        // Flushing is a no-op in this mode.
        reader.flush_debug_info(100).unwrap();

        let batches = batches.borrow();
        assert_eq!(*batches, vec![(1, true), (1, false)]);
    }

    #[test]
    fn callback_refusal_aborts_the_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        reader
            .register_debug_info_callback(
                Box::new(MockControl(Rc::default())),
                Box::new(|_, _| false),
            )
            .unwrap();
        let result = reader.add_debug_info(vec![dex_record(5)], false);
        assert!(matches!(result, Err(Error::CallbackFailed)));
    }

    #[test]
    fn dead_process_is_swept_within_one_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let state = Rc::new(ControlState::default());
        reader
            .register_debug_info_callback(
                Box::new(MockControl(state.clone())),
                Box::new(|_, _| true),
            )
            .unwrap();

        // A pid that cannot exist: reading its maps fails immediately.
        reader.monitor_process(u32::MAX).unwrap();
        assert!(state.enabled.get());

        reader.read_all_processes().unwrap();
        assert!(reader.processes.is_empty());
        // With nothing left to monitor, the periodic event stays disabled.
        assert!(!state.enabled.get());
    }

    #[test]
    fn monitoring_requires_a_registered_callback() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        assert!(matches!(
            reader.monitor_process(1),
            Err(Error::CallbackNotRegistered)
        ));
    }

    #[test]
    fn sample_events_register_art_processes() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        let state = Rc::new(ControlState::default());
        reader
            .register_debug_info_callback(
                Box::new(MockControl(state.clone())),
                Box::new(|_, _| true),
            )
            .unwrap();

        let pid = std::process::id();
        reader
            .update_record(&SampleStreamEvent::Mmap {
                pid,
                filename: "/apex/com.android.art/lib64/libart.so".to_string(),
                timestamp: 10,
            })
            .unwrap();
        // Mapping alone does not start monitoring.
        assert!(reader.processes.is_empty());

        reader
            .update_record(&SampleStreamEvent::Sample { pid, timestamp: 11 })
            .unwrap();
        assert!(reader.processes.contains_key(&pid));
        assert_eq!(reader.pids_with_art_lib.get(&pid), Some(&true));
        assert!(state.enabled.get());

        // Samples of processes that never mapped the runtime are ignored.
        reader
            .update_record(&SampleStreamEvent::Sample {
                pid: pid + 1,
                timestamp: 12,
            })
            .unwrap();
        assert!(!reader.processes.contains_key(&(pid + 1)));
    }

    #[test]
    fn forks_inherit_art_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = test_reader(&dir, SyncOption::DumpImmediately);
        reader
            .update_record(&SampleStreamEvent::Mmap {
                pid: 1000,
                filename: "/system/lib/libart.so".to_string(),
                timestamp: 1,
            })
            .unwrap();
        reader
            .update_record(&SampleStreamEvent::Fork {
                pid: 1001,
                ppid: 1000,
                timestamp: 2,
            })
            .unwrap();
        assert_eq!(reader.pids_with_art_lib.get(&1001), Some(&false));

        // Forks of untracked parents are ignored, as are self-forks.
        reader
            .update_record(&SampleStreamEvent::Fork {
                pid: 2001,
                ppid: 2000,
                timestamp: 3,
            })
            .unwrap();
        assert!(!reader.pids_with_art_lib.contains_key(&2001));
    }

    #[test]
    fn resolves_a_dex_entry_inside_an_apk_mapping() {
        let thread_mmaps = vec![ThreadMmap {
            start_addr: 0x0,
            len: 0x4000,
            pgoff: 0x2000,
            executable: false,
            name: "/data/app/base.apk!classes2.dex".to_string(),
        }];
        let dex_entry = CodeEntry {
            addr: 0x100,
            symfile_addr: 0x1000,
            symfile_size: 0x100,
            register_timestamp: 7,
        };
        let JitDebugInfo::DexFile {
            pid,
            dex_file_offset,
            file_path,
            extracted_dex_file_map,
            ..
        } = resolve_dex_entry(9, &thread_mmaps, &dex_entry).unwrap()
        else {
            panic!("expected a dex file record");
        };
        assert_eq!(pid, 9);
        assert_eq!(dex_file_offset, 0x3000);
        assert_eq!(file_path, "/data/app/base.apk!/classes2.dex");
        assert!(extracted_dex_file_map.is_some());
    }

    #[test]
    fn resolves_a_dex_entry_backed_by_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let vdex = dir.path().join("boot.vdex");
        std::fs::write(&vdex, b"vdex").unwrap();
        let thread_mmaps = vec![ThreadMmap {
            start_addr: 0x4000,
            len: 0x4000,
            pgoff: 0,
            executable: false,
            name: vdex.to_string_lossy().into_owned(),
        }];
        let dex_entry = CodeEntry {
            addr: 0x100,
            symfile_addr: 0x4100,
            symfile_size: 0x100,
            register_timestamp: 7,
        };
        let JitDebugInfo::DexFile {
            dex_file_offset,
            file_path,
            extracted_dex_file_map,
            ..
        } = resolve_dex_entry(9, &thread_mmaps, &dex_entry).unwrap()
        else {
            panic!("expected a dex file record");
        };
        assert_eq!(dex_file_offset, 0x100);
        assert_eq!(file_path, vdex.to_string_lossy());
        assert!(extracted_dex_file_map.is_none());
    }

    #[test]
    fn skips_dex_entries_without_file_backing() {
        let thread_mmaps = vec![ThreadMmap {
            start_addr: 0x4000,
            len: 0x4000,
            pgoff: 0,
            executable: false,
            name: "[anon:dalvik-main space]".to_string(),
        }];
        let dex_entry = CodeEntry {
            addr: 0x100,
            symfile_addr: 0x4100,
            symfile_size: 0x100,
            register_timestamp: 7,
        };
        assert!(resolve_dex_entry(9, &thread_mmaps, &dex_entry).is_none());
    }

    #[test]
    fn skips_dex_entries_outside_every_mapping() {
        let thread_mmaps = vec![ThreadMmap {
            start_addr: 0x4000,
            len: 0x100,
            pgoff: 0,
            executable: false,
            name: "/data/app/base.apk!classes.dex".to_string(),
        }];
        // Starts inside the map but runs past its end.
        let dex_entry = CodeEntry {
            addr: 0x100,
            symfile_addr: 0x4080,
            symfile_size: 0x100,
            register_timestamp: 7,
        };
        assert!(resolve_dex_entry(9, &thread_mmaps, &dex_entry).is_none());
        // Below the lowest map.
        let dex_entry = CodeEntry {
            addr: 0x100,
            symfile_addr: 0x1000,
            symfile_size: 0x10,
            register_timestamp: 7,
        };
        assert!(resolve_dex_entry(9, &thread_mmaps, &dex_entry).is_none());
    }
}
