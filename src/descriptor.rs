use std::io::{self, Read};

use byteorder::{ByteOrder, NativeEndian, ReadBytesExt};

use crate::code_entry::CodeEntryFormat;

/// Size of the raw descriptor in a 32-bit target.
pub(crate) const DESCRIPTOR_SIZE_32: usize = 48;
/// Size of the raw descriptor in a 64-bit target.
pub(crate) const DESCRIPTOR_SIZE_64: usize = 56;

pub(crate) fn descriptor_size(is_64bit: bool) -> usize {
    if is_64bit {
        DESCRIPTOR_SIZE_64
    } else {
        DESCRIPTOR_SIZE_32
    }
}

/// Which of the two well-known descriptors a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DescriptorKind {
    Jit,
    Dex,
}

/// A word-size-independent snapshot of a descriptor in the target's data
/// segment.
///
/// The raw wire form is, in order: `version: u32`, `action_flag: u32`,
/// `relevant_entry_addr: word`, `first_entry_addr: word`, `magic: [u8; 8]`,
/// `flags: u32`, `sizeof_descriptor: u32`, `sizeof_entry: u32`,
/// `action_seqlock: u32`, `action_timestamp: u64`. Only the fields the
/// reader acts on survive normalization.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Descriptor {
    pub kind: DescriptorKind,
    /// Logical format version, taken from the last magic byte: 1 or 2.
    pub version: u32,
    /// Address of the most recently registered entry; 0 if the list is
    /// empty.
    pub first_entry_addr: u64,
    /// Incremented before and after any list modification, so it is odd
    /// while a write is in progress.
    pub action_seqlock: u32,
    /// CLOCK_MONOTONIC time of the last completed modification.
    pub action_timestamp: u64,
}

impl Descriptor {
    pub(crate) fn empty(kind: DescriptorKind) -> Self {
        Self {
            kind,
            version: 0,
            first_entry_addr: 0,
            action_seqlock: 0,
            action_timestamp: 0,
        }
    }

    /// Decodes and validates a raw descriptor read from the target.
    ///
    /// Returns `None` for short buffers and for descriptors whose version,
    /// magic or declared struct sizes don't match what this reader
    /// understands; the caller retries on the next tick.
    pub(crate) fn parse(kind: DescriptorKind, data: &[u8], is_64bit: bool) -> Option<Self> {
        Self::parse_impl::<NativeEndian>(kind, data, is_64bit)
    }

    fn parse_impl<O: ByteOrder>(kind: DescriptorKind, data: &[u8], is_64bit: bool) -> Option<Self> {
        if data.len() < descriptor_size(is_64bit) {
            return None;
        }
        let mut cur = data;
        let version = cur.read_u32::<O>().ok()?;
        let _action_flag = cur.read_u32::<O>().ok()?;
        let _relevant_entry_addr = read_target_word::<O>(&mut cur, is_64bit).ok()?;
        let first_entry_addr = read_target_word::<O>(&mut cur, is_64bit).ok()?;
        let mut magic = [0u8; 8];
        cur.read_exact(&mut magic).ok()?;
        let _flags = cur.read_u32::<O>().ok()?;
        let sizeof_descriptor = cur.read_u32::<O>().ok()?;
        let sizeof_entry = cur.read_u32::<O>().ok()?;
        let action_seqlock = cur.read_u32::<O>().ok()?;
        let action_timestamp = cur.read_u64::<O>().ok()?;

        let android_version = match &magic {
            b"Android1" => 1,
            b"Android2" => 2,
            _ => return None,
        };
        if version != 1 || sizeof_descriptor as usize != descriptor_size(is_64bit) {
            return None;
        }
        let format = CodeEntryFormat::new(android_version, is_64bit)?;
        if sizeof_entry as usize != format.size() {
            return None;
        }

        Some(Self {
            kind,
            version: android_version,
            first_entry_addr,
            action_seqlock,
            action_timestamp,
        })
    }
}

/// Reads one target-sized word, widened to u64 for 32-bit targets.
pub(crate) fn read_target_word<O: ByteOrder>(
    reader: &mut impl Read,
    is_64bit: bool,
) -> io::Result<u64> {
    if is_64bit {
        reader.read_u64::<O>()
    } else {
        reader.read_u32::<O>().map(u64::from)
    }
}
