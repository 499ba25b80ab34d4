use std::sync::Arc;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::crypt::PlaintextRegistry;
use crate::entry::{BIT_FIN_TXN, BIT_TXN, ValueStruct, key_with_ts};
use crate::memtable::{Memtable, Options};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn test_opts(dir: &TempDir) -> Options {
    let mut opts = Options::new(dir.path());
    opts.mem_table_size = 1 << 20;
    opts
}

pub fn open_memtable(opts: &Options, fid: u32) -> (Arc<Memtable>, bool) {
    Memtable::open(opts, &PlaintextRegistry, fid).expect("open memtable")
}

/// A plain put: `key@ts → value`, no transaction flags.
pub fn put_plain(mt: &Memtable, key: &[u8], ts: u64, value: &[u8]) {
    mt.put(
        key_with_ts(key, ts),
        ValueStruct {
            value: value.to_vec(),
            ..Default::default()
        },
    )
    .expect("put");
}

/// A put belonging to the transaction group committing at `ts`.
pub fn put_txn(mt: &Memtable, key: &[u8], ts: u64, value: &[u8]) {
    mt.put(
        key_with_ts(key, ts),
        ValueStruct {
            meta: BIT_TXN,
            value: value.to_vec(),
            ..Default::default()
        },
    )
    .expect("put txn");
}

/// The sentinel committing the group at `ts`.
pub fn put_fin(mt: &Memtable, ts: u64) {
    mt.put(
        key_with_ts(b"!fin", ts),
        ValueStruct {
            meta: BIT_FIN_TXN,
            value: ts.to_string().into_bytes(),
            ..Default::default()
        },
    )
    .expect("put fin");
}
