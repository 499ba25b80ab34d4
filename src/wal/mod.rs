//! Memory-mapped, append-only log files — one per memtable.
//!
//! Every mutation a memtable accepts is appended to its log file before it
//! becomes visible in memory, and the log is the sole source of truth for
//! crash recovery: on restart the file is replayed (see [`LogFile::iterate`])
//! and the torn tail is truncated away.
//!
//! # On-disk layout
//!
//! ```text
//! +-----------------+-------------------+---------------------------+
//! | key id (8 B BE) | base IV (12 B)    | records ...               |
//! +-----------------+-------------------+---------------------------+
//! 0                 8                   20
//! ```
//!
//! The 20-byte header is written exactly once, at bootstrap, and never
//! mutated until the file is deleted. Key id `0` marks a plaintext file.
//! The file is preallocated to **twice** the configured memtable size so
//! appends never fault past the mapping; the logical end of data is the
//! separately tracked `write_at` cursor, and everything between `write_at`
//! and the physical end is zero-filled.
//!
//! # Lock discipline
//!
//! A readers-writer lock guards the *identity* of the mapping:
//!
//! - **shared** — reading record bytes, and the single appender copying new
//!   bytes past `write_at`;
//! - **exclusive** — anything that invalidates the mapping: rotation
//!   ([`LogFile::done_writing`]), [`LogFile::delete`], [`LogFile::reset`].
//!
//! Readers may dereference the mapping only while they hold the shared
//! guard; [`LogSlice`] encodes that rule in its lifetime.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

mod replay;

pub use replay::ReplayFn;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::ops::Deref;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use memmap2::MmapRaw;
use rand::RngCore;
use thiserror::Error;
use tracing::{info, trace};

use crate::codec::{self, CodecError};
use crate::crypt::{BASE_IV_LEN, CryptError, IV_LEN, KeyRegistry, RecordCipher};
use crate::entry::Entry;

/// Size of the once-written log-file header: 8-byte key id + 12-byte base IV.
pub const LOG_HEADER_SIZE: u32 = 20;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log-file operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O failure, with the file it happened on.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A record could not be encoded, or decoding failed in a way replay
    /// cannot absorb as a torn tail.
    #[error("codec error on {path}: {source}")]
    Codec {
        path: String,
        #[source]
        source: CodecError,
    },

    /// Key resolution or cipher failure. `KeyNotFound` here means the file
    /// references a data key the registry no longer knows — fatal on open.
    #[error(transparent)]
    Crypt(#[from] CryptError),

    /// The file is shorter than its fixed header; it was never bootstrapped
    /// completely.
    #[error("log file {path} shorter than its {LOG_HEADER_SIZE}-byte header")]
    TruncatedHeader { path: String },

    /// A read past the logical end of data.
    #[error("read past end of log (offset {offset}, len {len})")]
    Eof { offset: u32, len: u32 },

    /// Internal invariant violation (e.g. operating on a deleted file).
    #[error("internal error: {0}")]
    Internal(String),
}

fn io_err(path: &Path, source: io::Error) -> WalError {
    WalError::Io {
        path: path.display().to_string(),
        source,
    }
}

// ------------------------------------------------------------------------------------------------
// Load mode
// ------------------------------------------------------------------------------------------------

/// How record bytes are served on the read path.
///
/// The file is always memory-mapped for appends and replay; the mode only
/// selects between borrowing from the mapping and positional file reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Serve reads as borrowed slices of the mapping.
    #[default]
    MemoryMap,

    /// Serve reads via `pread` into a caller-provided scratch buffer.
    FileIo,
}

// ------------------------------------------------------------------------------------------------
// Log file
// ------------------------------------------------------------------------------------------------

struct MapInner {
    file: File,
    /// `None` only transiently inside rotation, and permanently after
    /// [`LogFile::delete`].
    map: Option<MmapRaw>,
}

impl MapInner {
    fn map(&self) -> Result<&MmapRaw, WalError> {
        self.map
            .as_ref()
            .ok_or_else(|| WalError::Internal("log file mapping is gone (deleted?)".into()))
    }
}

/// One append-only log file and its live memory mapping.
pub struct LogFile {
    path: PathBuf,
    fid: u32,
    load_mode: LoadMode,
    inner: RwLock<MapInner>,
    /// Logical end of appended data. Always ≥ [`LOG_HEADER_SIZE`].
    write_at: AtomicU32,
    base_iv: [u8; BASE_IV_LEN],
    cipher: Option<RecordCipher>,
}

impl LogFile {
    /// Opens or creates the log file at `path`, preallocating new files to
    /// `2 × target_size`.
    ///
    /// On create, the 20-byte header is bootstrapped from the registry's
    /// latest data key. On reopen, the header is read back and the stamped
    /// key id resolved ([`CryptError::KeyNotFound`] is fatal — the file
    /// cannot be decoded without its key).
    ///
    /// Returns the log file and whether it was newly created, so callers
    /// know to skip replay for fresh files.
    pub fn open(
        path: impl AsRef<Path>,
        fid: u32,
        registry: &dyn KeyRegistry,
        target_size: u64,
        load_mode: LoadMode,
    ) -> Result<(Self, bool), WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        let file_len = file.metadata().map_err(|e| io_err(&path, e))?.len();

        let is_new = file_len == 0;
        if is_new {
            // Preallocate with headroom so appends never outrun the mapping.
            let prealloc = (2 * target_size).max(u64::from(LOG_HEADER_SIZE));
            file.set_len(prealloc).map_err(|e| io_err(&path, e))?;
        }
        let map = MmapRaw::map_raw(&file).map_err(|e| io_err(&path, e))?;

        let mut lf = Self {
            path,
            fid,
            load_mode,
            inner: RwLock::new(MapInner {
                file,
                map: Some(map),
            }),
            write_at: AtomicU32::new(LOG_HEADER_SIZE),
            base_iv: [0u8; BASE_IV_LEN],
            cipher: None,
        };

        if is_new {
            if let Err(e) = lf.bootstrap(registry) {
                // Never leave a half-bootstrapped file behind.
                let _ = fs::remove_file(&lf.path);
                return Err(e);
            }
            info!(fid, path = %lf.path.display(), "created log file");
        } else {
            lf.load_header(registry)?;
            trace!(fid, path = %lf.path.display(), "opened existing log file");
        }
        Ok((lf, is_new))
    }

    /// Writes the once-only header of a fresh file: the latest data key's
    /// id (or `0` for plaintext) and 12 random base-IV bytes.
    fn bootstrap(&mut self, registry: &dyn KeyRegistry) -> Result<(), WalError> {
        let data_key = registry.latest_data_key()?;

        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        let key_id = data_key.as_ref().map_or(0, |dk| dk.id);
        header[..8].copy_from_slice(&key_id.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut header[8..]);

        self.base_iv.copy_from_slice(&header[8..]);
        self.cipher = data_key.map(|dk| RecordCipher::new(dk, self.base_iv));

        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        let map = inner.map()?;
        // SAFETY: a fresh file is preallocated to 2 × target size, which is
        // never smaller than the header; &mut self rules out other holders.
        unsafe {
            ptr::copy_nonoverlapping(header.as_ptr(), map.as_mut_ptr(), header.len());
        }
        self.write_at.store(LOG_HEADER_SIZE, Ordering::Release);
        Ok(())
    }

    /// Reads the header of a pre-existing file and resolves its data key.
    fn load_header(&mut self, registry: &dyn KeyRegistry) -> Result<(), WalError> {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        let map = inner.map()?;
        if map.len() < LOG_HEADER_SIZE as usize {
            return Err(WalError::TruncatedHeader {
                path: self.path.display().to_string(),
            });
        }

        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        // SAFETY: length checked above; &mut self rules out other holders.
        unsafe {
            ptr::copy_nonoverlapping(map.as_ptr(), header.as_mut_ptr(), header.len());
        }

        let mut key_id_bytes = [0u8; 8];
        key_id_bytes.copy_from_slice(&header[..8]);
        let key_id = u64::from_be_bytes(key_id_bytes);
        self.base_iv.copy_from_slice(&header[8..]);

        if key_id != 0 {
            let dk = registry.data_key(key_id)?;
            self.cipher = Some(RecordCipher::new(dk, self.base_iv));
        }
        self.write_at.store(LOG_HEADER_SIZE, Ordering::Release);
        Ok(())
    }

    /// Encodes `entry` into `scratch` and copies it into the mapping at the
    /// current append cursor. Returns the record's starting offset — the
    /// same offset that seeds its encryption IV.
    ///
    /// Takes the shared lock: appends may overlap reads, but never a
    /// rotation. At most one thread appends to a given log file (enforced
    /// by the memtable layer).
    ///
    /// # Panics
    /// If the encoded record does not fit the remaining mapped region.
    /// Callers rotate memtables long before the 2× headroom runs out, so
    /// this is a programmer error, not a recoverable condition.
    pub fn append(&self, entry: &Entry, scratch: &mut Vec<u8>) -> Result<u32, WalError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let map = inner.map()?;

        let offset = self.write_at.load(Ordering::Acquire);
        let len = codec::encode_entry(scratch, entry, self.cipher.as_ref(), offset)
            .map_err(|e| self.codec_err(e))?;

        assert!(
            u64::from(offset) + len as u64 <= map.len() as u64,
            "record of {len} bytes does not fit log file {} at offset {offset} (mapped {})",
            self.path.display(),
            map.len(),
        );

        // SAFETY: bounds asserted above; the destination [offset,
        // offset + len) lies beyond every offset readers consider valid
        // (reads are bounded by write_at, which still points at `offset`),
        // and the shared guard pins the mapping itself.
        unsafe {
            ptr::copy_nonoverlapping(scratch.as_ptr(), map.as_mut_ptr().add(offset as usize), len);
        }
        self.write_at.store(offset + len as u32, Ordering::Release);

        trace!(fid = self.fid, offset, len, "appended record");
        Ok(offset)
    }

    /// Reads `len` bytes starting at `offset`.
    ///
    /// In [`LoadMode::MemoryMap`] the returned bytes borrow the mapping and
    /// stay valid exactly as long as the internal shared guard is held — do
    /// not stash them. In [`LoadMode::FileIo`] the bytes are read into
    /// `scratch` instead.
    ///
    /// # Errors
    /// [`WalError::Eof`] when `[offset, offset + len)` reaches past
    /// `min(mapped size, write_at)`.
    pub fn read_at<'a>(
        &'a self,
        offset: u32,
        len: u32,
        scratch: &'a mut Vec<u8>,
    ) -> Result<LogBytes<'a>, WalError> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let map = guard.map()?;

        let end = u64::from(offset) + u64::from(len);
        let limit = (map.len() as u64).min(u64::from(self.write_at.load(Ordering::Acquire)));
        if end > limit {
            return Err(WalError::Eof { offset, len });
        }

        match self.load_mode {
            LoadMode::MemoryMap => Ok(LogBytes::Mapped(LogSlice {
                guard,
                start: offset as usize,
                end: end as usize,
            })),
            LoadMode::FileIo => {
                scratch.resize(len as usize, 0);
                guard
                    .file
                    .read_exact_at(scratch, u64::from(offset))
                    .map_err(|e| io_err(&self.path, e))?;
                Ok(LogBytes::Copied(&scratch[..]))
            }
        }
    }

    /// Flushes the mapping to disk (`msync`).
    pub fn sync(&self) -> Result<(), WalError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.map()?.flush().map_err(|e| io_err(&self.path, e))
    }

    /// The rotation primitive: msync, unmap, truncate the file to exactly
    /// `offset`, and remap.
    ///
    /// Takes the exclusive lock — the mapping is invalid between unmap and
    /// remap, and no reader may hold a pointer into it. The
    /// unmap-before-truncate order is mandatory on platforms that refuse to
    /// truncate a mapped file.
    pub fn done_writing(&self, offset: u32) -> Result<(), WalError> {
        info!(fid = self.fid, offset, "rotating log file");
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let map = inner
            .map
            .take()
            .ok_or_else(|| WalError::Internal("log file mapping is gone (deleted?)".into()))?;
        map.flush().map_err(|e| io_err(&self.path, e))?;
        drop(map);

        inner
            .file
            .set_len(u64::from(offset))
            .map_err(|e| io_err(&self.path, e))?;
        inner.map = Some(MmapRaw::map_raw(&inner.file).map_err(|e| io_err(&self.path, e))?);

        self.write_at.store(offset, Ordering::Release);
        Ok(())
    }

    /// Zeroes `[header, write_at)` and rewinds the append cursor, reusing
    /// the file in place.
    pub fn reset(&self) -> Result<(), WalError> {
        let inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let map = inner.map()?;
        let write_at = self.write_at.load(Ordering::Acquire) as usize;
        let start = LOG_HEADER_SIZE as usize;
        if write_at > start {
            // SAFETY: write_at never exceeds the mapped length (append
            // asserts it), and the exclusive guard keeps readers out.
            unsafe {
                ptr::write_bytes(map.as_mut_ptr().add(start), 0, write_at - start);
            }
        }
        self.write_at.store(LOG_HEADER_SIZE, Ordering::Release);
        Ok(())
    }

    /// Unmaps and unlinks the file. The log file must not be used again.
    pub fn delete(&self) -> Result<(), WalError> {
        info!(fid = self.fid, path = %self.path.display(), "deleting log file");
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.map.take();
        fs::remove_file(&self.path).map_err(|e| io_err(&self.path, e))
    }

    /// Derives the 128-bit AES-CTR IV for a record starting at `offset`:
    /// the file's 12-byte base IV followed by the big-endian offset.
    pub fn iv(&self, offset: u32) -> [u8; IV_LEN] {
        let mut iv = [0u8; IV_LEN];
        iv[..BASE_IV_LEN].copy_from_slice(&self.base_iv);
        iv[BASE_IV_LEN..].copy_from_slice(&offset.to_be_bytes());
        iv
    }

    /// Numeric id of this file.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current logical end of data.
    pub fn write_at(&self) -> u32 {
        self.write_at.load(Ordering::Acquire)
    }

    /// Whether records in this file are encrypted.
    pub fn encryption_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Id of the data key records are encrypted with; `0` for plaintext.
    pub fn key_id(&self) -> u64 {
        self.cipher.as_ref().map_or(0, RecordCipher::key_id)
    }

    pub(crate) fn cipher(&self) -> Option<&RecordCipher> {
        self.cipher.as_ref()
    }

    pub(crate) fn codec_err(&self, source: CodecError) -> WalError {
        WalError::Codec {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("path", &self.path)
            .field("fid", &self.fid)
            .field("write_at", &self.write_at.load(Ordering::Relaxed))
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Borrowed reads
// ------------------------------------------------------------------------------------------------

/// A borrowed view into the live mapping. Holding it holds the log file's
/// shared lock, so rotation and deletion wait until it drops.
pub struct LogSlice<'a> {
    guard: RwLockReadGuard<'a, MapInner>,
    start: usize,
    end: usize,
}

impl Deref for LogSlice<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let map = self
            .guard
            .map
            .as_ref()
            .expect("mapping checked when the slice was created and pinned by the guard");
        // SAFETY: [start, end) was bounds-checked against this mapping at
        // construction, and the shared guard keeps it alive and stable.
        unsafe { slice::from_raw_parts(map.as_ptr().add(self.start), self.end - self.start) }
    }
}

/// Bytes returned by [`LogFile::read_at`] — borrowed from the mapping or
/// copied into the caller's scratch, depending on [`LoadMode`].
pub enum LogBytes<'a> {
    Mapped(LogSlice<'a>),
    Copied(&'a [u8]),
}

impl<'a> fmt::Debug for LogBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogBytes::Mapped(slice) => f.debug_tuple("Mapped").field(&&**slice).finish(),
            LogBytes::Copied(bytes) => f.debug_tuple("Copied").field(bytes).finish(),
        }
    }
}

impl Deref for LogBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            LogBytes::Mapped(s) => s,
            LogBytes::Copied(bytes) => bytes,
        }
    }
}
