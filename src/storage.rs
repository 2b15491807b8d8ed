use std::fs::File as StdFile;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::manifest::{self, MULTIFILE_PATHNAME};
use crate::storage_file::{open_rw, read_at_once, write_at_all, StorageFile};
use crate::{AllocCallback, HashTree, StorageError, StorageResult};

/// Sentinel for an unbounded live discard window: live content is kept in
/// full, not wrapped.
pub const LIVE_WINDOW_ALL: u64 = u64::MAX;

/// Where a swarm's storage is in discovering its own shape. The state only
/// ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    /// Nothing known yet; awaiting chunk 0.
    Init,
    /// The logical stream is one on-disk file.
    SingleFile,
    /// The logical stream is a cyclic window on one file of fixed size.
    SingleLiveWrap,
    /// The multi-file spec's length is known but the spec is still arriving.
    SpecSizeKnown,
    /// The spec is fully written and parsed; the file set is known.
    SpecComplete,
}

/// Construction parameters for a swarm's storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Destination path for single-file content, or the spec file's path
    /// for a multi-file swarm.
    pub os_path: PathBuf,
    /// Directory under which multi-file entries are created.
    pub dest_dir: PathBuf,
    /// Transfer descriptor of the owning swarm, carried for diagnostics and
    /// callbacks.
    #[serde(default)]
    pub transfer_id: i32,
    /// `0` or [`LIVE_WINDOW_ALL`] for normal swarms, otherwise the byte
    /// size of the live wrapping window.
    #[serde(default)]
    pub live_window_bytes: u64,
    /// Alternate location where the multi-file spec may already live
    /// (seeding with checkpointed metadata).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub meta_spec_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn new(os_path: impl Into<PathBuf>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            os_path: os_path.into(),
            dest_dir: dest_dir.into(),
            transfer_id: 0,
            live_window_bytes: 0,
            meta_spec_path: None,
        }
    }

    pub fn from_json_str(json_str: &str) -> StorageResult<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| StorageError::InvalidData(format!("storage config invalid: {}", e)))
    }
}

/// Storage backing one swarm's content: a single logical byte stream that
/// absorbs chunk writes in arbitrary order and serves reads to hashers and
/// uploaders.
///
/// The caller serializes all operations; there is no internal locking.
pub struct Storage {
    state: StorageState,
    os_path: PathBuf,
    dest_dir: PathBuf,
    transfer_id: i32,
    live_window_bytes: u64,
    meta_spec_path: Option<PathBuf>,
    spec_size: u64,
    total_size_from_spec: Option<u64>,
    deferred_resize: Option<u64>,
    single_file: Option<StdFile>,
    files: Vec<StorageFile>,
    last_file: Option<usize>,
    hash_tree: Option<Box<dyn HashTree>>,
    alloc_cb: Option<AllocCallback>,
    operational: bool,
}

impl Storage {
    /// Open storage for a swarm.
    ///
    /// When neither `os_path` nor the alternate spec location exists this is
    /// a client swarm: the storage stays in [`StorageState::Init`] and the
    /// first arriving chunk decides single- versus multi-file. I/O failures
    /// after a file is known to exist latch the sticky broken flag rather
    /// than failing construction; see [`Storage::is_operational`].
    pub async fn open(config: StorageConfig) -> Storage {
        let mut storage = Storage {
            state: StorageState::Init,
            os_path: config.os_path,
            dest_dir: config.dest_dir,
            transfer_id: config.transfer_id,
            live_window_bytes: config.live_window_bytes,
            meta_spec_path: config.meta_spec_path,
            spec_size: 0,
            total_size_from_spec: None,
            deferred_resize: None,
            single_file: None,
            files: Vec::new(),
            last_file: None,
            hash_tree: None,
            alloc_cb: None,
            operational: true,
        };

        if storage.live_window_bytes > 0 && storage.live_window_bytes != LIVE_WINDOW_ALL {
            storage.state = StorageState::SingleLiveWrap;
            if storage.open_single_file().await.is_ok() {
                // Reserve the whole window up front so any in-window offset
                // is immediately readable.
                let wnd = storage.live_window_bytes;
                if let Some(file) = &storage.single_file {
                    if let Err(e) = file.set_len(wnd) {
                        warn!(
                            "Storage[{}]: cannot reserve live window of {} bytes: {}",
                            storage.transfer_id, wnd, e
                        );
                        storage.set_broken();
                    }
                }
            }
            return storage;
        }

        let mut found = storage.os_path.clone();
        let fsize = match fs::metadata(&found).await {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match storage.meta_spec_path.clone() {
                    Some(alt) => match fs::metadata(&alt).await {
                        Ok(meta) => {
                            found = alt;
                            Some(meta.len())
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                        Err(e) => {
                            warn!(
                                "Storage[{}]: cannot stat {}: {}",
                                storage.transfer_id,
                                alt.to_string_lossy(),
                                e
                            );
                            storage.set_broken();
                            return storage;
                        }
                    },
                    None => None,
                }
            }
            Err(e) => {
                warn!(
                    "Storage[{}]: cannot stat {}: {}",
                    storage.transfer_id,
                    found.to_string_lossy(),
                    e
                );
                storage.set_broken();
                return storage;
            }
        };

        let Some(fsize) = fsize else {
            // Client swarm: all will be revealed when chunks come in.
            debug!(
                "Storage[{}]: no local content yet, awaiting chunks",
                storage.transfer_id
            );
            return storage;
        };

        match Self::sniff_marker(&found).await {
            Ok(true) => {
                info!(
                    "Storage[{}]: found multifile spec at {}, seeding",
                    storage.transfer_id,
                    found.to_string_lossy()
                );
                storage.state = StorageState::SpecComplete;
                match StorageFile::new(MULTIFILE_PATHNAME, 0, fsize, found).await {
                    Ok(sf) => {
                        storage.spec_size = fsize;
                        storage.files.push(sf);
                        if let Err(e) = storage.parse_spec().await {
                            warn!(
                                "Storage[{}]: error parsing multifile spec: {}",
                                storage.transfer_id, e
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Storage[{}]: multifile spec file not usable: {}",
                            storage.transfer_id, e
                        );
                        storage.set_broken();
                    }
                }
            }
            Ok(false) => {
                debug!(
                    "Storage[{}]: found single file, will check it",
                    storage.transfer_id
                );
                storage.state = StorageState::SingleFile;
                let _ = storage.open_single_file().await;
            }
            Err(e) => {
                warn!(
                    "Storage[{}]: existing file {} cannot be read: {}",
                    storage.transfer_id,
                    found.to_string_lossy(),
                    e
                );
                storage.set_broken();
            }
        }

        storage
    }

    async fn sniff_marker(path: &Path) -> std::io::Result<bool> {
        use tokio::io::AsyncReadExt;
        let mut file = fs::File::open(path).await?;
        let mut head = vec![0u8; MULTIFILE_PATHNAME.len()];
        let mut got = 0usize;
        while got < head.len() {
            let n = file.read(&mut head[got..]).await?;
            if n == 0 {
                break;
            }
            got += n;
        }
        Ok(got == head.len() && manifest::starts_with_marker(&head))
    }

    /// Absorb one chunk of swarm content at a logical offset. Returns the
    /// number of bytes written. A buffer spanning any number of file
    /// boundaries is partitioned byte-exactly at each boundary.
    pub async fn write(&mut self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        self.check_operational()?;
        debug!(
            "Storage[{}]: write {} bytes at {} state {:?}",
            self.transfer_id,
            buf.len(),
            offset,
            self.state
        );
        match self.state {
            StorageState::SingleFile => self.write_single(buf, offset),
            StorageState::SingleLiveWrap => self.write_live(buf, offset),
            StorageState::Init => self.write_first_chunk(buf, offset).await,
            StorageState::SpecSizeKnown => self.write_spec_part(buf, offset).await,
            StorageState::SpecComplete => self.write_multi(buf, offset).await,
        }
    }

    /// Serve a read at a logical offset. Returns the number of bytes read,
    /// short when the end of the content is reached.
    ///
    /// In live-wrap mode the read lands at `offset % window` and does NOT
    /// split at the ring boundary: readers are expected to honor the window
    /// and never span it.
    pub async fn read(&mut self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        self.check_operational()?;
        match self.state {
            StorageState::SingleFile => {
                let file = self.single_fd()?;
                read_at_once(file, buf, offset)
                    .map_err(|e| StorageError::IoError(format!("read at {} failed: {}", offset, e)))
            }
            StorageState::SingleLiveWrap => {
                let wrapped = offset % self.live_window_bytes;
                debug!(
                    "Storage[{}]: live read disk offset {} window {}",
                    self.transfer_id, wrapped, self.live_window_bytes
                );
                let file = self.single_fd()?;
                read_at_once(file, buf, wrapped).map_err(|e| {
                    StorageError::IoError(format!("live read at {} failed: {}", wrapped, e))
                })
            }
            StorageState::Init => Err(StorageError::InvalidState(
                "read before any chunk arrived".to_string(),
            )),
            StorageState::SpecSizeKnown | StorageState::SpecComplete => {
                self.read_multi(buf, offset)
            }
        }
    }

    fn write_single(&mut self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        let file = self.single_fd()?;
        write_at_all(file, offset, buf)
            .map_err(|e| StorageError::IoError(format!("write at {} failed: {}", offset, e)))?;
        Ok(buf.len())
    }

    /// Live wrapping window: the caller's virtual offset grows without
    /// bound while the on-disk offset cycles through `[0, window)`. Writes
    /// crossing the ring boundary split and wrap to offset 0.
    fn write_live(&mut self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        let wnd = self.live_window_bytes;
        let file = self.single_fd()?;
        let mut written = 0usize;
        let mut off = offset;
        let mut rest = buf;
        while !rest.is_empty() {
            let wrapped = off % wnd;
            debug!(
                "Storage[{}]: live write disk offset {} window {}",
                self.transfer_id, wrapped, wnd
            );
            let room = (wnd - wrapped) as usize;
            let n = rest.len().min(room);
            write_at_all(file, wrapped, &rest[..n]).map_err(|e| {
                StorageError::IoError(format!("live write at {} failed: {}", wrapped, e))
            })?;
            written += n;
            off += n as u64;
            rest = &rest[n..];
        }
        Ok(written)
    }

    /// The first chunk decides what this swarm is: a multi-file spec marker
    /// makes it multi-file, anything else single-file.
    async fn write_first_chunk(&mut self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        if offset != 0 {
            // Tolerated: a live swarm tuned into mid-stream.
            warn!(
                "Storage[{}]: first write at offset {}, assuming live prelude",
                self.transfer_id, offset
            );
        }

        if manifest::starts_with_marker(buf) {
            debug!("Storage[{}]: chunk 0 carries a multifile spec", self.transfer_id);
            let spec_size = manifest::parse_header(buf)?;
            let sf = StorageFile::new(MULTIFILE_PATHNAME, 0, spec_size, self.os_path.clone())
                .await
                .map_err(|e| {
                    self.set_broken();
                    e
                })?;
            self.spec_size = spec_size;
            self.files.push(sf);
            self.write_spec_part(buf, offset).await
        } else {
            self.state = StorageState::SingleFile;
            self.open_single_file().await?;
            self.write_single(buf, offset)
        }
    }

    /// Write a portion of the spec into entry 0. Completing the spec
    /// triggers the parse, informs the hash tree of the now-known total
    /// size, reserves every entry file, and flushes the remaining buffer
    /// into the newly known files.
    async fn write_spec_part(&mut self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        let spec_limit = {
            let sf = self
                .files
                .first()
                .ok_or_else(|| StorageError::InvalidState("spec file missing".to_string()))?;
            if !sf.contains(offset) {
                return Err(StorageError::InvalidParam(format!(
                    "offset {} outside the spec file",
                    offset
                )));
            }
            sf.limit()
        };

        let (head, tail) = Self::write_buffer(&self.files[0], buf, offset)?;

        if offset + head as u64 == spec_limit {
            // Wrote the last part of the spec.
            self.state = StorageState::SpecComplete;
            self.parse_spec().await?;

            let total = self.total_size_from_spec.unwrap_or(0);
            // The hash tree cannot know the size until the last chunk is
            // in; the spec tells us now.
            if let Some(ht) = self.hash_tree.as_mut() {
                ht.set_size(total);
            }
            self.resize_reserved(total).await?;

            if tail == 0 {
                return Ok(head);
            }
            let written = self.write_multi(&buf[head..], offset + head as u64).await?;
            Ok(head + written)
        } else {
            self.state = StorageState::SpecSizeKnown;
            Ok(head)
        }
    }

    /// Write as much of `buf` as fits into `sf`. Returns `(head, tail)`:
    /// bytes written into this file and bytes left for the next one(s).
    fn write_buffer(sf: &StorageFile, buf: &[u8], offset: u64) -> StorageResult<(usize, usize)> {
        if !sf.contains(offset) {
            return Err(StorageError::InvalidParam(format!(
                "offset {} not mapped by {}",
                offset,
                sf.spec_path()
            )));
        }
        let local = offset - sf.start();
        if offset + buf.len() as u64 <= sf.limit() {
            sf.write_at(buf, local)?;
            Ok((buf.len(), 0))
        } else {
            let head = (sf.limit() - offset) as usize;
            sf.write_at(&buf[..head], local)?;
            Ok((head, buf.len() - head))
        }
    }

    /// Multi-file write: dispatch to consecutive storage files, splitting
    /// byte-exactly at each file boundary.
    async fn write_multi(&mut self, buf: &[u8], offset: u64) -> StorageResult<usize> {
        let mut written = 0usize;
        let mut off = offset;
        let mut rest = buf;
        while !rest.is_empty() {
            let idx = self.locate_file(off).ok_or_else(|| {
                warn!(
                    "Storage[{}]: write: no file for offset {}",
                    self.transfer_id, off
                );
                StorageError::InvalidParam(format!("offset {} not mapped by any file", off))
            })?;
            let (head, _tail) = Self::write_buffer(&self.files[idx], rest, off)?;
            written += head;
            off += head as u64;
            rest = &rest[head..];
        }
        Ok(written)
    }

    fn read_multi(&mut self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        let total = self.content_size();
        let mut got = 0usize;
        let mut off = offset;
        while got < buf.len() {
            let idx = self.locate_file(off).ok_or_else(|| {
                StorageError::InvalidParam(format!("offset {} not mapped by any file", off))
            })?;
            let n = self.files[idx].read_at(&mut buf[got..], off - self.files[idx].start())?;
            got += n;
            off += n as u64;
            if n == 0 {
                // End of physical data; nothing more to serve.
                break;
            }
            if let Some(total) = total {
                if off == total {
                    break;
                }
            }
        }
        Ok(got)
    }

    /// Locate the storage file containing a logical offset: last-file
    /// fast path first, binary search otherwise.
    fn locate_file(&mut self, offset: u64) -> Option<usize> {
        if let Some(idx) = self.last_file {
            if self.files[idx].contains(offset) {
                return Some(idx);
            }
        }
        let idx = self.find_file(offset)?;
        self.last_file = Some(idx);
        Some(idx)
    }

    fn find_file(&self, offset: u64) -> Option<usize> {
        let mut lo = 0isize;
        let mut hi = self.files.len() as isize - 1;
        while hi >= lo {
            let mid = (lo + hi) / 2;
            let sf = &self.files[mid as usize];
            if offset >= sf.limit() {
                lo = mid + 1;
            } else if offset < sf.start() {
                hi = mid - 1;
            } else {
                return Some(mid as usize);
            }
        }
        None
    }

    /// Parse the completed spec file and populate the file set. The whole
    /// spec is validated before any entry file is created, so a malformed
    /// or unsafe line leaves nothing behind under `dest_dir`.
    async fn parse_spec(&mut self) -> StorageResult<()> {
        let spec_os_path = self.files[0].os_path().to_path_buf();
        let data = fs::read(&spec_os_path).await.map_err(|e| {
            self.set_broken();
            StorageError::IoError(format!(
                "cannot open multifile spec {}: {}",
                spec_os_path.to_string_lossy(),
                e
            ))
        })?;

        let entries = manifest::parse_entries(&data).map_err(|e| {
            self.set_broken();
            e
        })?;

        let mut offset: u64 = 0;
        for entry in &entries {
            if offset == 0 {
                // Entry 0 is the spec itself; its storage file already
                // exists from construction or from the first chunk.
                offset += self.files[0].size();
            } else {
                let os_path = self.dest_dir.join(manifest::spec_to_os_path(&entry.spec_path));
                let sf = StorageFile::new(&entry.spec_path, offset, entry.size, os_path)
                    .await
                    .map_err(|e| {
                        self.set_broken();
                        e
                    })?;
                self.files.push(sf);
                offset += entry.size;
            }
        }

        for sf in &self.files {
            debug!(
                "Storage[{}]: parse spec: {} start {} size {}",
                self.transfer_id,
                sf.spec_path(),
                sf.start(),
                sf.size()
            );
        }
        self.total_size_from_spec = Some(offset);
        Ok(())
    }

    async fn open_single_file(&mut self) -> StorageResult<()> {
        debug!(
            "Storage[{}]: opening single file {}",
            self.transfer_id,
            self.os_path.to_string_lossy()
        );
        let file = open_rw(&self.os_path).map_err(|e| {
            warn!(
                "Storage[{}]: cannot open single file {}: {}",
                self.transfer_id,
                self.os_path.to_string_lossy(),
                e
            );
            self.set_broken();
            StorageError::IoError(format!(
                "cannot open {}: {}",
                self.os_path.to_string_lossy(),
                e
            ))
        })?;
        self.single_file = Some(file);

        // Apply a reservation postponed while nothing was open yet.
        if let Some(size) = self.deferred_resize.take() {
            if let Err(e) = self.resize_reserved(size).await {
                self.single_file = None;
                self.set_broken();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Reserve on-disk space so that random-offset I/O succeeds up to
    /// `size`. Deferred while nothing is open yet; grow-only in multi-file
    /// mode. The one-shot allocation callback fires before the first
    /// reservation ever attempted.
    pub async fn resize_reserved(&mut self, size: u64) -> StorageResult<()> {
        self.check_operational()?;

        if let Some(mut cb) = self.alloc_cb.take() {
            cb(self.transfer_id);
        }

        match self.state {
            StorageState::SingleFile => {
                debug!(
                    "Storage[{}]: resizing single file to {}",
                    self.transfer_id, size
                );
                let file = self.single_fd()?;
                file.set_len(size).map_err(|e| {
                    StorageError::IoError(format!("resize to {} failed: {}", size, e))
                })
            }
            StorageState::Init => {
                debug!(
                    "Storage[{}]: postponing resize to {}",
                    self.transfer_id, size
                );
                self.deferred_resize = Some(size);
                Ok(())
            }
            StorageState::SpecComplete => {
                if size > self.reserved_size().await? {
                    debug!(
                        "Storage[{}]: resizing multi file to {}",
                        self.transfer_id, size
                    );
                    for sf in &self.files {
                        sf.resize_reserved()?;
                    }
                } else {
                    debug!(
                        "Storage[{}]: resize to <= reserved size, ignored",
                        self.transfer_id
                    );
                }
                Ok(())
            }
            _ => Err(StorageError::InvalidState(format!(
                "cannot reserve space in state {:?}",
                self.state
            ))),
        }
    }

    /// Total content size declared by the spec; `None` unless the spec is
    /// complete.
    pub fn size_from_spec(&self) -> Option<u64> {
        match self.state {
            StorageState::SpecComplete => self.total_size_from_spec,
            _ => None,
        }
    }

    /// Space currently committed on disk: the single file's size, or the
    /// sum of entry-file sizes once the spec is complete.
    pub async fn reserved_size(&self) -> StorageResult<u64> {
        match self.state {
            StorageState::SingleFile => {
                let file = self.single_fd()?;
                let meta = file
                    .metadata()
                    .map_err(|e| StorageError::IoError(format!("stat failed: {}", e)))?;
                Ok(meta.len())
            }
            StorageState::SpecComplete => {
                let mut total = 0u64;
                for sf in &self.files {
                    total += sf.on_disk_size().await?;
                }
                debug!(
                    "Storage[{}]: total already reserved is {}",
                    self.transfer_id, total
                );
                Ok(total)
            }
            _ => Err(StorageError::InvalidState(
                "reserved size not determinable yet".to_string(),
            )),
        }
    }

    /// Smallest reservation that must exist before anything else can be
    /// stored: the spec file's size in multi-file mode, nothing in single
    /// mode, unknown otherwise.
    pub fn minimal_reserved_size(&self) -> Option<u64> {
        match self.state {
            StorageState::SingleFile => Some(0),
            StorageState::SpecComplete => self.files.first().map(|sf| sf.size()),
            _ => None,
        }
    }

    pub fn set_alloc_callback(&mut self, cb: AllocCallback) {
        self.alloc_cb = Some(cb);
    }

    pub fn set_hash_tree(&mut self, ht: Box<dyn HashTree>) {
        self.hash_tree = Some(ht);
    }

    pub fn is_operational(&self) -> bool {
        self.operational
    }

    /// Latch the sticky broken flag; every further operation fails.
    pub fn set_broken(&mut self) {
        if self.operational {
            warn!("Storage[{}]: marked broken", self.transfer_id);
        }
        self.operational = false;
    }

    pub fn state(&self) -> StorageState {
        self.state
    }

    pub fn os_path(&self) -> &Path {
        &self.os_path
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    pub fn transfer_id(&self) -> i32 {
        self.transfer_id
    }

    pub fn spec_size(&self) -> u64 {
        self.spec_size
    }

    pub fn live_window_bytes(&self) -> u64 {
        self.live_window_bytes
    }

    /// The mapped file set, sorted by start offset, contiguous and
    /// non-overlapping. Entry 0 is the spec file when multi-file.
    pub fn files(&self) -> &[StorageFile] {
        &self.files
    }

    fn content_size(&self) -> Option<u64> {
        self.hash_tree
            .as_ref()
            .and_then(|ht| ht.size())
            .or(self.total_size_from_spec)
    }

    fn single_fd(&self) -> StorageResult<&StdFile> {
        self.single_file
            .as_ref()
            .ok_or_else(|| StorageError::InvalidState("backing file not open".to_string()))
    }

    fn check_operational(&self) -> StorageResult<()> {
        if self.operational {
            Ok(())
        } else {
            Err(StorageError::Broken(format!(
                "storage for transfer {} is broken",
                self.transfer_id
            )))
        }
    }
}
