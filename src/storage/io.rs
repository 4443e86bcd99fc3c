use std::fs::{File, OpenOptions};
use std::io::{self, Result};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Positional access to the backing file.
///
/// Reads and writes never move a shared cursor, so callers address the file
/// purely by offset.
#[derive(Debug)]
pub struct Disk {
    file: File,
    path: PathBuf,
}

impl Disk {
    /// Open or create the file at `path` for reading and writing
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(Disk {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Open an existing file without write access
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;
        Ok(Disk {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Fill `buf` from `offset`; a short file is an `UnexpectedEof` error
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Zeroed scratch buffer for a read
pub(crate) fn alloc_buffer(len: u64) -> io::Result<Vec<u8>> {
    let len = usize::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "buffer too large"))?;
    Ok(vec![0u8; len])
}
