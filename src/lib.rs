//! # CinderMem
//!
//! The write path of the Cinder storage engine: an in-memory write buffer
//! (memtable) paired with a crash-recovery write-ahead log. Every mutation
//! is durably appended to a per-memtable log on disk and simultaneously
//! inserted into a concurrent skiplist that serves reads. On restart the
//! logs are replayed — with transactional framing, so a crash mid-group
//! leaves no partial transaction visible — and the torn tail is truncated.
//!
//! ## Architecture
//!
//! ```text
//! put(key, value)
//!      │
//!      ▼
//! ┌────────────────────────────────────────────────────────┐
//! │ Memtable                                               │
//! │   1. codec: encode record (varint header, CRC-32C,     │
//! │      optional AES-CTR)                                 │
//! │   2. wal:   copy into the mmapped log, advance cursor  │
//! │   3. skiplist: insert key → value                      │
//! └────────────────────────────────────────────────────────┘
//!
//! restart
//!      │
//!      ▼
//! ┌────────────────────────────────────────────────────────┐
//! │ MemtableSet::open                                      │
//! │   scan dir for NNNNN.mem → replay each (txn framing)   │
//! │   → frozen memtables + next file id                    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`entry`] | Record types, meta flag bits, key-timestamp helpers |
//! | [`codec`] | Binary record codec: varint header, CRC-32C, encryption hook |
//! | [`crypt`] | Data keys, the key-registry contract, AES-CTR transform |
//! | [`wal`] | Memory-mapped append-only log files and their replay |
//! | [`memtable`] | Skiplist + log pairing, refcounted lifecycle |
//! | [`recovery`] | Startup directory scan and memtable reconstruction |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cindermem::crypt::PlaintextRegistry;
//! use cindermem::entry::ValueStruct;
//! use cindermem::memtable::Options;
//! use cindermem::recovery::MemtableSet;
//!
//! let opts = Arc::new(Options::new("/var/lib/cinder"));
//! let set = MemtableSet::open(opts, Arc::new(PlaintextRegistry)).unwrap();
//!
//! // Everything recovered from disk is frozen; writes go to a fresh table.
//! let mt = set.new_memtable().unwrap();
//! mt.put(
//!     b"hello".to_vec(),
//!     ValueStruct {
//!         value: b"world".to_vec(),
//!         ..Default::default()
//!     },
//! )
//! .unwrap();
//! mt.sync().unwrap();
//!
//! // Hand the memtable to the flusher, then drop its reference.
//! mt.decr_ref().unwrap();
//! ```
//!
//! ## Out of scope
//!
//! The flusher that turns a frozen memtable into an on-disk table, the
//! transaction manager that assigns commit timestamps, and compaction all
//! live above this crate. The key registry is a trait ([`crypt::KeyRegistry`])
//! so stores can plug in their KMS.

pub mod codec;
pub mod crypt;
pub mod entry;
pub mod memtable;
pub mod recovery;
pub mod wal;

pub use crate::entry::{Entry, ValuePointer, ValueStruct};
pub use crate::memtable::{Memtable, Options};
pub use crate::recovery::MemtableSet;
pub use crate::wal::{LoadMode, LogFile};
