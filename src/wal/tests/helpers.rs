use std::ops::ControlFlow;
use std::path::Path;

use tracing_subscriber::EnvFilter;

use crate::crypt::KeyRegistry;
use crate::entry::{BIT_FIN_TXN, BIT_TXN, Entry, ValuePointer, key_with_ts};
use crate::wal::{LoadMode, LogFile};

/// Target size for test log files; the on-disk file is twice this.
pub const TEST_FILE_SIZE: u64 = 1 << 20;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Opens (or creates) a test log file with the default mmap read path.
pub fn open_log(path: &Path, registry: &dyn KeyRegistry) -> (LogFile, bool) {
    LogFile::open(path, 1, registry, TEST_FILE_SIZE, LoadMode::MemoryMap).expect("open log")
}

/// A plain, non-transactional entry with `ts` embedded in the key.
pub fn plain_entry(key: &[u8], ts: u64, value: &[u8]) -> Entry {
    Entry::new(key_with_ts(key, ts), value.to_vec())
}

/// A transactional entry belonging to the group committing at `ts`.
pub fn txn_entry(key: &[u8], ts: u64, value: &[u8]) -> Entry {
    Entry {
        meta: BIT_TXN,
        ..Entry::new(key_with_ts(key, ts), value.to_vec())
    }
}

/// The sentinel that terminates the group committing at `ts`.
pub fn fin_entry(ts: u64) -> Entry {
    Entry {
        meta: BIT_FIN_TXN,
        ..Entry::new(key_with_ts(b"!fin", ts), ts.to_string().into_bytes())
    }
}

/// Appends every entry, returning the offset of each record.
pub fn append_all(lf: &LogFile, entries: &[Entry]) -> Vec<u32> {
    let mut scratch = Vec::new();
    entries
        .iter()
        .map(|e| lf.append(e, &mut scratch).expect("append"))
        .collect()
}

/// Replays from offset 0, collecting every committed entry.
pub fn collect_replay(lf: &LogFile) -> (Vec<(Entry, ValuePointer)>, u32) {
    let mut out = Vec::new();
    let valid_end = lf
        .iterate(0, &mut |entry, vptr| {
            out.push((entry, vptr));
            Ok(ControlFlow::Continue(()))
        })
        .expect("iterate");
    (out, valid_end)
}
