//! # Memtable Module
//!
//! The mutable, in-memory write buffer of the storage engine: a concurrent
//! skiplist paired with the append-only log file that makes it durable.
//!
//! ## Design Invariants
//!
//! - Every `put` appends to the log **before** inserting into the skiplist;
//!   a crash between the two is recovered by replay, a crash before the
//!   append loses only the call in flight.
//! - At most one writer mutates a given memtable (enforced by the caller
//!   layer); readers may overlap that writer freely.
//! - The reference count starts at 1 and reaches zero exactly once. At the
//!   zero transition the log file is deleted; the skiplist's memory is
//!   released when the owning `Arc` drops. A memtable whose count reached
//!   zero must never be referenced again.
//! - `next_txn_ts` is the maximum timestamp embedded in any replayed key —
//!   the transaction manager reads it after recovery to restart its clock.
//!
//! ## Lifecycle
//!
//! Created fresh (new id, bootstrapped log header) or by opening an
//! existing log file and replaying it. While mutable, one writer appends;
//! once the caller layer rotates, the memtable is frozen — no more puts,
//! refcount still ≥ 1 until the flusher is done with it.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_skiplist::SkipMap;
use thiserror::Error;
use tracing::{info, trace};

use crate::crypt::KeyRegistry;
use crate::entry::{Entry, ValueStruct, parse_ts};
use crate::wal::{LoadMode, LogFile, WalError};

/// Extension of memtable log files.
pub const MEM_FILE_EXT: &str = ".mem";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Failure in the underlying log file.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Configuration shared by the memtables of one store.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding the memtable log files.
    pub dir: PathBuf,

    /// Target size of one memtable; its log file is preallocated to twice
    /// this to leave append headroom.
    pub mem_table_size: u64,

    /// How log-file reads are served.
    pub load_mode: LoadMode,
}

impl Options {
    /// Options rooted at `dir` with a 64 MiB memtable and memory-mapped
    /// reads.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            mem_table_size: 64 << 20,
            load_mode: LoadMode::MemoryMap,
        }
    }
}

/// Path of the log file for memtable `fid`: `<dir>/<fid, zero-padded>.mem`.
pub fn log_file_path(dir: &Path, fid: u32) -> PathBuf {
    dir.join(format!("{fid:05}{MEM_FILE_EXT}"))
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// A sorted in-memory buffer paired with its write-ahead log.
pub struct Memtable {
    sl: SkipMap<Vec<u8>, ValueStruct>,
    wal: LogFile,
    /// Shared-ownership count across the writer and the flusher.
    refs: AtomicI32,
    /// Maximum transaction timestamp observed during replay.
    next_txn_ts: AtomicU64,
    /// Reusable encode buffer for the single writer.
    buf: Mutex<Vec<u8>>,
}

impl Memtable {
    /// Opens the memtable with id `fid`, creating its log file if absent.
    ///
    /// A pre-existing log is replayed into the skiplist and its torn tail
    /// truncated. Returns the memtable (refcount 1) and whether the log
    /// was newly created.
    pub fn open(
        opts: &Options,
        registry: &dyn KeyRegistry,
        fid: u32,
    ) -> Result<(Arc<Self>, bool), MemtableError> {
        let path = log_file_path(&opts.dir, fid);
        let (wal, is_new) = LogFile::open(&path, fid, registry, opts.mem_table_size, opts.load_mode)?;

        let mt = Arc::new(Self {
            sl: SkipMap::new(),
            wal,
            refs: AtomicI32::new(1),
            next_txn_ts: AtomicU64::new(0),
            buf: Mutex::new(Vec::new()),
        });

        if is_new {
            return Ok((mt, true));
        }
        mt.update_skiplist()?;
        Ok((mt, false))
    }

    /// Appends the mutation to the log, then inserts it into the skiplist.
    ///
    /// Nothing is inserted if the append fails. There is no fsync here —
    /// durability is the caller's call, via [`Memtable::sync`].
    pub fn put(&self, key: Vec<u8>, value: ValueStruct) -> Result<(), MemtableError> {
        let entry = Entry {
            key,
            value: value.value,
            expires_at: value.expires_at,
            user_meta: value.user_meta,
            meta: value.meta,
            offset: 0,
        };

        {
            let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
            self.wal.append(&entry, &mut buf)?;
        }

        let Entry {
            key,
            value,
            expires_at,
            user_meta,
            meta,
            ..
        } = entry;
        self.sl.insert(
            key,
            ValueStruct {
                meta,
                user_meta,
                expires_at,
                value,
            },
        );
        Ok(())
    }

    /// Replays the log into the (empty) skiplist and truncates the torn
    /// tail so later appends overwrite it. Called once, from `open`.
    fn update_skiplist(&self) -> Result<(), MemtableError> {
        let mut first = true;
        let valid_end = self.wal.iterate(0, &mut |entry, _vptr| {
            if first {
                trace!(fid = self.wal.fid(), key = ?entry.key, "first replayed key");
                first = false;
            }
            self.next_txn_ts
                .fetch_max(parse_ts(&entry.key), Ordering::SeqCst);

            // The value bytes are inserted verbatim: they may be a full
            // value or a pointer into a value log — this layer is agnostic.
            let Entry {
                key,
                value,
                expires_at,
                user_meta,
                meta,
                ..
            } = entry;
            self.sl.insert(
                key,
                ValueStruct {
                    meta,
                    user_meta,
                    expires_at,
                    value,
                },
            );
            Ok(ControlFlow::Continue(()))
        })?;

        info!(
            fid = self.wal.fid(),
            valid_end,
            entries = self.sl.len(),
            next_txn_ts = self.next_txn_ts.load(Ordering::SeqCst),
            "replayed memtable log"
        );
        self.wal.done_writing(valid_end)?;
        Ok(())
    }

    /// Looks up the latest value stored under `key` (exact match).
    pub fn get(&self, key: &[u8]) -> Option<ValueStruct> {
        self.sl.get(key).map(|e| e.value().clone())
    }

    /// The underlying sorted map, for ordered iteration by collaborators
    /// (the flusher walks it to build an on-disk table).
    pub fn skiplist(&self) -> &SkipMap<Vec<u8>, ValueStruct> {
        &self.sl
    }

    /// The backing log file.
    pub fn wal(&self) -> &LogFile {
        &self.wal
    }

    /// Maximum transaction timestamp observed during replay; the
    /// transaction manager reads this after recovery.
    pub fn next_txn_ts(&self) -> u64 {
        self.next_txn_ts.load(Ordering::SeqCst)
    }

    /// Flushes the log file to disk.
    pub fn sync(&self) -> Result<(), MemtableError> {
        self.wal.sync()?;
        Ok(())
    }

    /// Takes one more reference to this memtable.
    pub fn incr_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops one reference. On the zero transition — which happens exactly
    /// once — the log file is deleted; skiplist memory follows when the
    /// `Arc` drops.
    pub fn decr_ref(&self) -> Result<(), MemtableError> {
        let refs = self.refs.fetch_sub(1, Ordering::SeqCst) - 1;
        if refs > 0 {
            return Ok(());
        }
        debug_assert_eq!(refs, 0, "memtable refcount went negative");

        info!(fid = self.wal.fid(), "memtable released");
        self.wal.delete()?;
        Ok(())
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("fid", &self.wal.fid())
            .field("entries", &self.sl.len())
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .field("next_txn_ts", &self.next_txn_ts.load(Ordering::Relaxed))
            .finish()
    }
}
