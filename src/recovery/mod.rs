//! Startup recovery: rebuild the memtable set from the log directory.
//!
//! On open, the data directory is scanned for `<decimal>.mem` files. Each
//! one is replayed into a memtable and handed over as *frozen* — recovered
//! memtables are never written again; the writable memtable is always
//! created fresh under the next file id. Ids are strictly increasing
//! across the process lifetime **and across restarts**: the counter
//! restarts at `max(existing ids) + 1`.
//!
//! A file that carries the `.mem` extension but whose stem is not a
//! decimal id is fatal — it means something unknown lives in the log
//! directory, and deleting or skipping it could silently drop data.

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tracing::info;

use crate::crypt::KeyRegistry;
use crate::memtable::{MEM_FILE_EXT, Memtable, MemtableError, Options};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while recovering the memtable set.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Directory enumeration failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A `.mem` file whose name is not a decimal id — an unknown file in
    /// the log directory.
    #[error("unrecognized file {name} in log directory")]
    InvalidLogName { name: String },

    /// Opening or replaying one of the memtables failed.
    #[error(transparent)]
    Memtable(#[from] MemtableError),
}

// ------------------------------------------------------------------------------------------------
// Memtable set
// ------------------------------------------------------------------------------------------------

/// The recovered memtables of a store plus the monotonic file-id counter.
pub struct MemtableSet {
    opts: Arc<Options>,
    registry: Arc<dyn KeyRegistry>,
    /// Memtables reconstructed from disk, ascending by id. All frozen.
    immutable: Vec<Arc<Memtable>>,
    /// Id the next fresh memtable will take.
    next_fid: AtomicU32,
}

impl MemtableSet {
    /// Scans `opts.dir`, replays every memtable log found there, and
    /// positions the id counter after the newest one.
    pub fn open(
        opts: Arc<Options>,
        registry: Arc<dyn KeyRegistry>,
    ) -> Result<Self, RecoveryError> {
        let dir = &opts.dir;
        let io_err = |source| RecoveryError::Io {
            path: dir.display().to_string(),
            source,
        };

        let mut fids = Vec::new();
        for dirent in fs::read_dir(dir).map_err(io_err)? {
            let dirent = dirent.map_err(io_err)?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.ends_with(MEM_FILE_EXT) {
                continue;
            }
            let stem = &name[..name.len() - MEM_FILE_EXT.len()];
            let fid = stem
                .parse::<u32>()
                .map_err(|_| RecoveryError::InvalidLogName {
                    name: name.to_string(),
                })?;
            fids.push(fid);
        }
        fids.sort_unstable();

        let mut immutable = Vec::with_capacity(fids.len());
        for &fid in &fids {
            let (mt, _is_new) = Memtable::open(&opts, registry.as_ref(), fid)?;
            // Recovered memtables are never written again.
            immutable.push(mt);
        }

        let next_fid = fids.last().map_or(1, |max| max + 1);
        info!(
            dir = %dir.display(),
            recovered = immutable.len(),
            next_fid,
            "memtable recovery complete"
        );

        Ok(Self {
            opts,
            registry,
            immutable,
            next_fid: AtomicU32::new(next_fid),
        })
    }

    /// Creates a fresh, writable memtable under the next file id.
    ///
    /// Ids handed out here are strictly increasing; a fresh memtable must
    /// land on a file that does not exist yet.
    pub fn new_memtable(&self) -> Result<Arc<Memtable>, RecoveryError> {
        let fid = self.next_fid.fetch_add(1, Ordering::SeqCst);
        let (mt, is_new) = Memtable::open(&self.opts, self.registry.as_ref(), fid)?;
        if !is_new {
            return Err(RecoveryError::Memtable(MemtableError::Internal(format!(
                "log file for fresh memtable {fid} already exists"
            ))));
        }
        Ok(mt)
    }

    /// The recovered (frozen) memtables, ascending by id.
    pub fn immutable(&self) -> &[Arc<Memtable>] {
        &self.immutable
    }

    /// Id the next call to [`MemtableSet::new_memtable`] will use.
    pub fn next_fid(&self) -> u32 {
        self.next_fid.load(Ordering::SeqCst)
    }

    /// Maximum transaction timestamp across every recovered memtable — what
    /// the transaction manager seeds its clock with after recovery.
    pub fn max_version(&self) -> u64 {
        self.immutable
            .iter()
            .map(|mt| mt.next_txn_ts())
            .max()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for MemtableSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemtableSet")
            .field("dir", &self.opts.dir)
            .field("immutable", &self.immutable.len())
            .field("next_fid", &self.next_fid.load(Ordering::Relaxed))
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
