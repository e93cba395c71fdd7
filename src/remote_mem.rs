use std::io;

use libc::{c_void, iovec, pid_t, process_vm_readv};

/// Read-only access to another process's address space.
///
/// The descriptor snapshot and the list walker are generic over this trait
/// so they can be driven against scripted memory in tests.
pub trait RemoteMemoryRead {
    /// Reads exactly `buf.len()` bytes at `addr`. Short reads are errors.
    fn read_exact_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Reads several disjoint regions, preferably with a single syscall.
    fn read_scatter(&self, reads: &mut [(u64, &mut [u8])]) -> io::Result<()> {
        for (addr, buf) in reads.iter_mut() {
            self.read_exact_at(*addr, buf)?;
        }
        Ok(())
    }
}

/// Reads target memory with `process_vm_readv`, without stopping the
/// target.
pub struct ProcessVmReader {
    pid: pid_t,
}

impl ProcessVmReader {
    pub fn new(pid: u32) -> Self {
        Self { pid: pid as pid_t }
    }
}

impl RemoteMemoryRead for ProcessVmReader {
    fn read_exact_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let local_iov = iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let remote_iov = iovec {
            iov_base: addr as *mut c_void,
            iov_len: buf.len(),
        };
        // SAFETY: the local iovec points into `buf`, which stays exclusively
        // borrowed for the duration of the call; the remote side is only
        // described to the kernel, never dereferenced here.
        let result = unsafe { process_vm_readv(self.pid, &local_iov, 1, &remote_iov, 1, 0) };
        check_read_result(self.pid, addr, result, buf.len())
    }

    fn read_scatter(&self, reads: &mut [(u64, &mut [u8])]) -> io::Result<()> {
        if reads.is_empty() {
            return Ok(());
        }
        let total_len: usize = reads.iter().map(|(_, buf)| buf.len()).sum();
        let mut local_iovs = Vec::with_capacity(reads.len());
        let mut remote_iovs = Vec::with_capacity(reads.len());
        for (addr, buf) in reads.iter_mut() {
            local_iovs.push(iovec {
                iov_base: buf.as_mut_ptr() as *mut c_void,
                iov_len: buf.len(),
            });
            remote_iovs.push(iovec {
                iov_base: *addr as *mut c_void,
                iov_len: buf.len(),
            });
        }
        // SAFETY: every local iovec points into a distinct caller-owned
        // buffer that outlives the call.
        let result = unsafe {
            process_vm_readv(
                self.pid,
                local_iovs.as_ptr(),
                local_iovs.len() as _,
                remote_iovs.as_ptr(),
                remote_iovs.len() as _,
                0,
            )
        };
        check_read_result(self.pid, reads[0].0, result, total_len)
    }
}

fn check_read_result(pid: pid_t, addr: u64, result: isize, expected: usize) -> io::Result<()> {
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    if result as usize != expected {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "short read from pid {pid} at {addr:#x}: got {result} of {expected} bytes"
            ),
        ));
    }
    Ok(())
}
