use std::collections::HashSet;
use std::io;

use byteorder::{ByteOrder, NativeEndian, ReadBytesExt};

use crate::descriptor::{read_target_word, Descriptor};
use crate::remote_mem::RemoteMemoryRead;

/// Whether the 32-bit entry layouts carry no padding before `symfile_size`.
///
/// A 32-bit x86 runtime aligns u64 fields to 4 bytes, so a reader built for
/// x86-64 must decode the packed 32-bit layouts to match an x86 target. arm
/// and aarch64 agree on 8-byte alignment and see the padded forms.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
const TARGET_32BIT_ENTRIES_PACKED: bool = true;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
const TARGET_32BIT_ENTRIES_PACKED: bool = false;

/// The wire format of a code entry, selected by the descriptor's logical
/// version and the target's word size.
///
/// Wire form: `next_addr: word`, `prev_addr: word`, `symfile_addr: word`,
/// `symfile_size: u64`, `register_timestamp: u64`, and for version 2 a
/// trailing `seqlock: u32`. The 64-bit version 2 entry carries an explicit
/// 4-byte tail pad so that 32-bit readers see the same 48-byte layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CodeEntryFormat {
    V1_32,
    V1_64,
    V2_32,
    V2_64,
}

impl CodeEntryFormat {
    pub(crate) fn new(version: u32, is_64bit: bool) -> Option<Self> {
        match (version, is_64bit) {
            (1, false) => Some(Self::V1_32),
            (1, true) => Some(Self::V1_64),
            (2, false) => Some(Self::V2_32),
            (2, true) => Some(Self::V2_64),
            _ => None,
        }
    }

    fn is_64bit(self) -> bool {
        matches!(self, Self::V1_64 | Self::V2_64)
    }

    fn has_seqlock(self) -> bool {
        matches!(self, Self::V2_32 | Self::V2_64)
    }

    /// The exact number of bytes this entry occupies in the target, as seen
    /// from this host architecture.
    pub(crate) fn size(self) -> usize {
        self.size_with_packing(TARGET_32BIT_ENTRIES_PACKED)
    }

    fn size_with_packing(self, packed_32: bool) -> usize {
        match self {
            Self::V1_32 => {
                if packed_32 {
                    28
                } else {
                    32
                }
            }
            Self::V2_32 => {
                if packed_32 {
                    32
                } else {
                    40
                }
            }
            Self::V1_64 => 40,
            Self::V2_64 => 48,
        }
    }

    fn parse(self, data: &[u8]) -> Option<RawCodeEntry> {
        self.parse_with_packing::<NativeEndian>(data, TARGET_32BIT_ENTRIES_PACKED)
    }

    fn parse_with_packing<O: ByteOrder>(self, data: &[u8], packed_32: bool) -> Option<RawCodeEntry> {
        if data.len() < self.size_with_packing(packed_32) {
            return None;
        }
        let is_64bit = self.is_64bit();
        let mut cur = data;
        let next_addr = read_target_word::<O>(&mut cur, is_64bit).ok()?;
        let prev_addr = read_target_word::<O>(&mut cur, is_64bit).ok()?;
        let symfile_addr = read_target_word::<O>(&mut cur, is_64bit).ok()?;
        if !is_64bit && !packed_32 {
            let _pad = cur.read_u32::<O>().ok()?;
        }
        let symfile_size = cur.read_u64::<O>().ok()?;
        let register_timestamp = cur.read_u64::<O>().ok()?;
        let seqlock = if self.has_seqlock() {
            Some(cur.read_u32::<O>().ok()?)
        } else {
            None
        };
        Some(RawCodeEntry {
            next_addr,
            prev_addr,
            symfile_addr,
            symfile_size,
            register_timestamp,
            seqlock,
        })
    }
}

/// A code entry as decoded from the target, addresses widened to u64.
#[derive(Debug, Clone)]
struct RawCodeEntry {
    next_addr: u64,
    prev_addr: u64,
    symfile_addr: u64,
    symfile_size: u64,
    register_timestamp: u64,
    /// Per-entry seqlock, present in version 2 entries only.
    seqlock: Option<u32>,
}

impl RawCodeEntry {
    fn valid(&self) -> bool {
        match self.seqlock {
            // A version 2 entry is consistent while its seqlock is even;
            // deleted entries stay in the list with symfile_size == 0.
            Some(seqlock) => seqlock & 1 == 0,
            None => self.symfile_addr > 0 && self.symfile_size > 0,
        }
    }
}

/// A new code entry reported by a walk, ready for extraction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CodeEntry {
    /// Address of the list node itself in the target.
    pub addr: u64,
    pub symfile_addr: u64,
    pub symfile_size: u64,
    pub register_timestamp: u64,
}

/// Walks the linked list published by `descriptor`, collecting entries
/// registered after `last_action_timestamp`, newest first.
///
/// The walk is bounded by `read_entry_limit` because the seqlock delta
/// bounds how many entries can be new. `Ok(None)` means the list was
/// structurally broken (loop, bad back pointer, invalid entry) and this
/// pass must be dropped; `Err` means the target could not be read at all.
pub(crate) fn read_new_code_entries<R: RemoteMemoryRead>(
    mem: &R,
    descriptor: &Descriptor,
    last_action_timestamp: u64,
    read_entry_limit: u32,
    is_64bit: bool,
) -> io::Result<Option<Vec<CodeEntry>>> {
    let Some(format) = CodeEntryFormat::new(descriptor.version, is_64bit) else {
        return Ok(None);
    };
    let mut buf = vec![0u8; format.size()];
    let mut new_entries = Vec::new();
    let mut visited_addrs = HashSet::new();
    let mut prev_entry_addr = 0u64;
    let mut current_entry_addr = descriptor.first_entry_addr;
    for _ in 0..read_entry_limit {
        if current_entry_addr == 0 {
            break;
        }
        if !visited_addrs.insert(current_entry_addr) {
            // A cycle means we are looking at a broken list.
            return Ok(None);
        }
        mem.read_exact_at(current_entry_addr, &mut buf)?;
        let Some(entry) = format.parse(&buf) else {
            return Ok(None);
        };
        if entry.prev_addr != prev_entry_addr || !entry.valid() {
            return Ok(None);
        }
        if entry.register_timestamp <= last_action_timestamp {
            // The list is ordered by decreasing registration time, so the
            // remainder was already seen by an earlier pass.
            break;
        }
        if entry.symfile_size > 0 {
            new_entries.push(CodeEntry {
                addr: current_entry_addr,
                symfile_addr: entry.symfile_addr,
                symfile_size: entry.symfile_size,
                register_timestamp: entry.register_timestamp,
            });
        }
        prev_entry_addr = current_entry_addr;
        current_entry_addr = entry.next_addr;
    }
    Ok(Some(new_entries))
}
