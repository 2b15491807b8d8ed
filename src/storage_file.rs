use std::fs::File as StdFile;
#[cfg(unix)]
use std::os::unix::fs::FileExt as StdFileExt;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt as StdFileExt;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use fs2::FileExt;
use log::{debug, warn};
use tokio::fs;

use crate::{StorageError, StorageResult};

pub(crate) fn write_at_once(file: &StdFile, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    #[cfg(unix)]
    {
        StdFileExt::write_at(file, buf, offset)
    }
    #[cfg(windows)]
    {
        StdFileExt::seek_write(file, buf, offset)
    }
}

pub(crate) fn write_at_all(file: &StdFile, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = write_at_once(file, buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_at returned zero",
            ));
        }
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

pub(crate) fn read_at_once(file: &StdFile, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    #[cfg(unix)]
    {
        StdFileExt::read_at(file, buf, offset)
    }
    #[cfg(windows)]
    {
        StdFileExt::seek_read(file, buf, offset)
    }
}

/// Open `path` read+write, creating it if absent, owner rw / group+other
/// read, and take an exclusive lock for the lifetime of the handle.
pub(crate) fn open_rw(path: &Path) -> std::io::Result<StdFile> {
    let mut opts = std::fs::OpenOptions::new();
    opts.read(true).write(true).create(true);
    #[cfg(unix)]
    opts.mode(0o644);
    let file = opts.open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Err(std::io::Error::new(
            err.kind(),
            "backing file already locked",
        )),
        Err(err) => Err(err),
    }
}

/// One open backing file mapped to the contiguous `[start, end]` interval of
/// the logical swarm content. Entry files of a multi-file swarm get their
/// missing parent directories created at construction.
#[derive(Debug)]
pub struct StorageFile {
    spec_path: String,
    os_path: PathBuf,
    start: u64,
    size: u64,
    file: StdFile,
}

impl StorageFile {
    pub async fn new(
        spec_path: &str,
        start: u64,
        size: u64,
        os_path: PathBuf,
    ) -> StorageResult<StorageFile> {
        let sep = MAIN_SEPARATOR;
        let doubled: String = [sep, sep].iter().collect();
        let mut norm = os_path.to_string_lossy().to_string();
        while norm.contains(&doubled) {
            norm = norm.replace(&doubled, &sep.to_string());
        }

        // The spec file itself lives at its configured location; every other
        // entry may name subdirectories that do not exist yet.
        if start != 0 && norm.contains(sep) {
            Self::make_parent_dirs(&norm).await?;
        }

        let os_path = PathBuf::from(norm);
        let file = open_rw(&os_path).map_err(|e| {
            warn!(
                "StorageFile: cannot open {}: {}",
                os_path.to_string_lossy(),
                e
            );
            StorageError::IoError(format!("cannot open {}: {}", os_path.to_string_lossy(), e))
        })?;

        Ok(StorageFile {
            spec_path: spec_path.to_string(),
            os_path,
            start,
            size,
            file,
        })
    }

    /// Walk every path prefix ending at a separator, creating missing
    /// directories. A prefix that exists but is not a directory is a hard
    /// failure, not something to silently write through.
    async fn make_parent_dirs(norm: &str) -> StorageResult<()> {
        let sep_byte = MAIN_SEPARATOR as u8;
        let bytes = norm.as_bytes();
        for pos in 1..bytes.len() {
            if bytes[pos] != sep_byte {
                continue;
            }
            let prefix = &norm[..pos];
            #[cfg(windows)]
            if prefix.len() == 2 && prefix.ends_with(':') {
                // Drive spec such as "C:", nothing to create.
                continue;
            }
            match fs::metadata(prefix).await {
                Ok(meta) => {
                    if !meta.is_dir() {
                        warn!("StorageFile: {} exists but is not a directory", prefix);
                        return Err(StorageError::IoError(format!(
                            "{} exists but is not a directory",
                            prefix
                        )));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("StorageFile: mkdir {}", prefix);
                    fs::create_dir(prefix).await.map_err(|e| {
                        StorageError::IoError(format!("mkdir {} failed: {}", prefix, e))
                    })?;
                }
                Err(e) => {
                    return Err(StorageError::IoError(format!(
                        "stat {} failed: {}",
                        prefix, e
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn spec_path(&self) -> &str {
        &self.spec_path
    }

    pub fn os_path(&self) -> &Path {
        &self.os_path
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Inclusive end of the mapped interval. Only meaningful for entries of
    /// nonzero size.
    pub fn end(&self) -> u64 {
        self.start + self.size - 1
    }

    /// One past the last mapped logical offset.
    pub fn limit(&self) -> u64 {
        self.start + self.size
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.limit()
    }

    /// Positional write at a file-local offset. Short writes are retried
    /// until the whole buffer is on disk.
    pub fn write_at(&self, buf: &[u8], local_offset: u64) -> StorageResult<usize> {
        write_at_all(&self.file, local_offset, buf).map_err(|e| {
            StorageError::IoError(format!(
                "write {} bytes at {} in {} failed: {}",
                buf.len(),
                local_offset,
                self.os_path.to_string_lossy(),
                e
            ))
        })?;
        Ok(buf.len())
    }

    /// Positional read at a file-local offset. Returns the number of bytes
    /// read; short at end-of-file.
    pub fn read_at(&self, buf: &mut [u8], local_offset: u64) -> StorageResult<usize> {
        read_at_once(&self.file, buf, local_offset).map_err(|e| {
            StorageError::IoError(format!(
                "read at {} in {} failed: {}",
                local_offset,
                self.os_path.to_string_lossy(),
                e
            ))
        })
    }

    /// Extend (or truncate) the backing file to the full declared entry
    /// size, so positional I/O succeeds at any mapped offset.
    pub fn resize_reserved(&self) -> StorageResult<()> {
        self.file.set_len(self.size).map_err(|e| {
            StorageError::IoError(format!(
                "resize {} to {} failed: {}",
                self.os_path.to_string_lossy(),
                self.size,
                e
            ))
        })
    }

    /// Actual on-disk size, which may lag the declared size until the entry
    /// has been reserved.
    pub async fn on_disk_size(&self) -> StorageResult<u64> {
        let meta = fs::metadata(&self.os_path).await.map_err(|e| {
            StorageError::IoError(format!(
                "stat {} failed: {}",
                self.os_path.to_string_lossy(),
                e
            ))
        })?;
        Ok(meta.len())
    }
}
