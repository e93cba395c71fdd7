use std::cmp::Ordering;

use crate::maps::ThreadMmap;

/// One event from the profiler's sample stream, projected down to the
/// fields the reader routes on.
///
/// The profiler feeds every record it sees to
/// [`update_record`](crate::JitDebugReader::update_record); mmap and mmap2
/// records collapse into [`Mmap`](Self::Mmap) because only the pid and the
/// mapped filename matter here.
#[derive(Debug, Clone)]
pub enum SampleStreamEvent {
    /// The process mapped a file.
    Mmap {
        pid: u32,
        filename: String,
        timestamp: u64,
    },
    /// The process forked a child.
    Fork { pid: u32, ppid: u32, timestamp: u64 },
    /// A sample was attributed to the process.
    Sample { pid: u32, timestamp: u64 },
    /// Any other record kind; only its timestamp is used, to pace the
    /// reorder queue.
    Other { timestamp: u64 },
}

impl SampleStreamEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            SampleStreamEvent::Mmap { timestamp, .. }
            | SampleStreamEvent::Fork { timestamp, .. }
            | SampleStreamEvent::Sample { timestamp, .. }
            | SampleStreamEvent::Other { timestamp } => *timestamp,
        }
    }
}

/// A single piece of debug info extracted from a monitored process, handed
/// to the debug info callback for symbolization and unwinding downstream.
#[derive(Debug, Clone)]
pub enum JitDebugInfo {
    /// One symbol of a JIT-compiled symfile. The symfile bytes have been
    /// persisted to a scratch file; `symfile_location` is
    /// `"<path>:<start>-<end>"`, the byte range of this symfile within it.
    JitSymbol {
        pid: u32,
        /// CLOCK_MONOTONIC time at which the target registered the symfile.
        timestamp: u64,
        symbol_vaddr: u64,
        symbol_len: u64,
        symfile_location: String,
        /// Start offset of the symfile within the scratch file.
        symfile_offset: u64,
    },
    /// A dex file registered with the runtime's bytecode debug list,
    /// resolved back to the file backing its mapping.
    DexFile {
        pid: u32,
        timestamp: u64,
        /// Offset of the dex file within the backing .vdex or .apk file.
        dex_file_offset: u64,
        file_path: String,
        /// Set when the dex file was extracted from an archive straight
        /// into memory; carries the mapping it was found in.
        extracted_dex_file_map: Option<ThreadMmap>,
    },
}

impl JitDebugInfo {
    pub fn pid(&self) -> u32 {
        match self {
            JitDebugInfo::JitSymbol { pid, .. } | JitDebugInfo::DexFile { pid, .. } => *pid,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            JitDebugInfo::JitSymbol { timestamp, .. }
            | JitDebugInfo::DexFile { timestamp, .. } => *timestamp,
        }
    }
}

/// Wrapper whose reversed ordering turns std's max-heap into a min-heap
/// keyed by timestamp, so the reorder queue pops oldest records first.
#[derive(Debug)]
pub(crate) struct QueuedDebugInfo(pub JitDebugInfo);

impl PartialEq for QueuedDebugInfo {
    fn eq(&self, other: &Self) -> bool {
        self.0.timestamp() == other.0.timestamp()
    }
}

impl Eq for QueuedDebugInfo {}

impl PartialOrd for QueuedDebugInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedDebugInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.timestamp().cmp(&self.0.timestamp())
    }
}
