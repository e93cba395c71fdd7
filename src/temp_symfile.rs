use std::fs::{self, File};
use std::io::{self, BufWriter, Write};

/// An append-only scratch file holding extracted JIT symfiles.
///
/// Consumers locate individual symfiles by byte range, so the offsets
/// handed out by [`offset`](Self::offset) stay valid for the lifetime of
/// the file. Writes are buffered; the reader flushes at the end of each
/// extraction pass.
#[derive(Debug)]
pub struct TempSymFile {
    path: String,
    writer: BufWriter<File>,
    offset: u64,
    remove_on_drop: bool,
}

impl TempSymFile {
    /// Creates the scratch file, truncating any previous file at `path`.
    /// With `remove_on_drop`, the file is unlinked when the value goes
    /// away.
    pub fn create(path: String, remove_on_drop: bool) -> io::Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            offset: 0,
            remove_on_drop,
        })
    }

    /// Appends one symfile.
    pub fn write_entry(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.offset += data.len() as u64;
        Ok(())
    }

    /// The offset at which the next entry will be written.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl Drop for TempSymFile {
    fn drop(&mut self) {
        if self.remove_on_drop {
            let _ = self.writer.flush();
            let _ = fs::remove_file(&self.path);
        }
    }
}
