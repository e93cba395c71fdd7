use std::fs::File;
use std::io::{self, BufRead, BufReader};

use log::trace;

/// One mapping of a process, as read from `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMmap {
    pub start_addr: u64,
    pub len: u64,
    /// File offset of the mapping, in bytes.
    pub pgoff: u64,
    pub executable: bool,
    /// The backing path, or a bracketed pseudo name, or empty for
    /// anonymous mappings.
    pub name: String,
}

/// Reads the memory maps of `pid`. The kernel reports them in ascending
/// start-address order, which the dex resolver's binary search relies on.
pub fn get_thread_mmaps_in_process(pid: u32) -> io::Result<Vec<ThreadMmap>> {
    let path = format!("/proc/{pid}/maps");
    trace!("reading process maps from {path}");
    let reader = BufReader::new(File::open(path)?);
    let mut maps = Vec::new();
    for line in reader.lines() {
        if let Some(map) = parse_maps_line(&line?) {
            maps.push(map);
        }
    }
    Ok(maps)
}

/// Parses one line of `/proc/<pid>/maps`, e.g.
/// `7f0100000000-7f0100004000 r-xp 00002000 fd:01 1234  /system/lib64/libart.so`.
///
/// The name is the tail of the line and may contain spaces (dex files
/// extracted into memory use names like
/// `"/dev/ashmem/dalvik-classes.dex extracted in memory from ..."`).
fn parse_maps_line(line: &str) -> Option<ThreadMmap> {
    let mut fields = line.splitn(6, ' ');
    let mut addrs = fields.next()?.splitn(2, '-');
    let start_addr = u64::from_str_radix(addrs.next()?, 16).ok()?;
    let end_addr = u64::from_str_radix(addrs.next()?, 16).ok()?;
    let prot = fields.next()?;
    let pgoff = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let name = fields.next().unwrap_or("").trim_start();
    Some(ThreadMmap {
        start_addr,
        len: end_addr.checked_sub(start_addr)?,
        pgoff,
        executable: prot.contains('x'),
        name: name.to_string(),
    })
}
