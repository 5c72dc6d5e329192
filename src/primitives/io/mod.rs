#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::types::{PstError, Result};

/// Positioned access to the container's backing bytes.
///
/// The node directory and property codec depend only on this trait, never on
/// the container header or higher-level mail semantics.
pub trait BackingStore {
    /// Reads exactly `len` bytes starting at `offset`.
    fn read_range(&self, offset: u64, len: u32) -> Result<Vec<u8>>;
    /// Writes `bytes` at `offset`, extending the store if needed.
    fn write_range(&self, offset: u64, bytes: &[u8]) -> Result<()>;
    /// Current length of the store in bytes.
    fn file_length(&self) -> Result<u64>;
    /// Truncates or extends the store to `len` bytes.
    fn set_file_length(&self, len: u64) -> Result<()>;
    /// Whether mutations are refused.
    fn is_read_only(&self) -> bool;
    /// Flushes pending writes to durable storage.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
mod positioned {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod positioned {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod positioned {
    use std::{fs::File, io};

    pub fn read_exact(_file: &File, _off: u64, _dst: &mut [u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "FileStore unsupported on this platform",
        ))
    }

    pub fn write_all(_file: &File, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "FileStore unsupported on this platform",
        ))
    }
}

/// Backing store over a container file on disk.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<File>,
    read_only: bool,
}

impl FileStore {
    /// Opens or creates `path` for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file, false))
    }

    /// Opens an existing `path` for reading only.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self::new(file, true))
    }

    /// Wraps an already opened file handle.
    pub fn new(file: File, read_only: bool) -> Self {
        Self {
            inner: Arc::new(file),
            read_only,
        }
    }

    fn file(&self) -> &File {
        &self.inner
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(PstError::AccessDenied("write"));
        }
        Ok(())
    }
}

impl BackingStore for FileStore {
    fn read_range(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let end = offset.checked_add(len as u64).ok_or_else(eof)?;
        if end > self.file_length()? {
            return Err(eof().into());
        }
        let mut buf = vec![0u8; len as usize];
        positioned::read_exact(self.file(), offset, &mut buf)?;
        Ok(buf)
    }

    fn write_range(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        positioned::write_all(self.file(), offset, bytes)?;
        Ok(())
    }

    fn file_length(&self) -> Result<u64> {
        Ok(self.file().metadata()?.len())
    }

    fn set_file_length(&self, len: u64) -> Result<()> {
        self.ensure_writable()?;
        self.file().set_len(len)?;
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file().sync_all()?;
        Ok(())
    }
}

/// In-memory backing store, shared between clones.
#[derive(Clone, Default)]
pub struct MemStore {
    bytes: Arc<Mutex<Vec<u8>>>,
    read_only: bool,
}

impl MemStore {
    /// Creates an empty writable store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
            read_only: false,
        }
    }

    /// Returns a read-only view sharing the same bytes.
    pub fn read_only_view(&self) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
            read_only: true,
        }
    }

    /// Copies the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Applies `f` to the raw bytes, bypassing the read-only flag.
    ///
    /// Intended for fault injection in tests and tooling.
    pub fn with_bytes_mut<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> T) -> T {
        f(&mut self.bytes.lock())
    }
}

impl BackingStore for MemStore {
    fn read_range(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let bytes = self.bytes.lock();
        let start = usize::try_from(offset).map_err(|_| eof())?;
        let end = start.checked_add(len as usize).ok_or_else(eof)?;
        if end > bytes.len() {
            return Err(eof().into());
        }
        Ok(bytes[start..end].to_vec())
    }

    fn write_range(&self, offset: u64, src: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(PstError::AccessDenied("write"));
        }
        let mut bytes = self.bytes.lock();
        let start = usize::try_from(offset)
            .map_err(|_| PstError::Invalid("write offset exceeds address space"))?;
        let end = start
            .checked_add(src.len())
            .ok_or(PstError::Invalid("write range exceeds address space"))?;
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    fn file_length(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn set_file_length(&self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(PstError::AccessDenied("set_file_length"));
        }
        let len = usize::try_from(len)
            .map_err(|_| PstError::Invalid("file length exceeds address space"))?;
        self.bytes.lock().resize(len, 0);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

fn eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of store")
}
