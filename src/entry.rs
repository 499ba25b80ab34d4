//! Core record types shared by the codec, the log file, and the memtable.
//!
//! Keys carry their commit timestamp in the **last 8 bytes, big-endian**.
//! [`parse_ts`] extracts it; [`key_with_ts`] builds such a key. Ordering of
//! timestamped keys is the concern of the caller layer — this crate only
//! extracts timestamps during replay to restore the version counter.

// ------------------------------------------------------------------------------------------------
// Meta flag bits
// ------------------------------------------------------------------------------------------------

/// The entry belongs to a transaction group; the timestamp embedded in its
/// key is the group's commit timestamp.
pub const BIT_TXN: u8 = 1 << 6;

/// The entry is the sentinel terminating a transaction group. Its *value*
/// holds the ASCII decimal of the commit timestamp; its key is ignored.
pub const BIT_FIN_TXN: u8 = 1 << 7;

/// Number of trailing key bytes reserved for the embedded timestamp.
pub const TS_LEN: usize = 8;

// ------------------------------------------------------------------------------------------------
// Entry
// ------------------------------------------------------------------------------------------------

/// A single logical log record: one key/value mutation plus its metadata.
///
/// `meta` is bit-significant — [`BIT_TXN`] and [`BIT_FIN_TXN`] are
/// interpreted by replay, every other bit is opaque and preserved verbatim
/// through the codec.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    /// Key bytes, timestamp-suffixed by convention.
    pub key: Vec<u8>,

    /// Value bytes. May be empty (key-only records are valid), and may be a
    /// pointer into an external value log — this layer does not care.
    pub value: Vec<u8>,

    /// Expiry as seconds since the epoch; `0` means never.
    pub expires_at: u64,

    /// Single opaque byte owned by the user of the store.
    pub user_meta: u8,

    /// Bit-significant flags; see [`BIT_TXN`] / [`BIT_FIN_TXN`].
    pub meta: u8,

    /// Byte offset at which this record began in its log file.
    /// Populated by decode; ignored by encode.
    pub offset: u32,
}

impl Entry {
    /// Convenience constructor for a plain (non-transactional) entry.
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            ..Default::default()
        }
    }
}

// ------------------------------------------------------------------------------------------------
// ValueStruct
// ------------------------------------------------------------------------------------------------

/// The value side of a skiplist insertion: everything from an [`Entry`]
/// except the key and the file offset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueStruct {
    /// Bit-significant flags, carried verbatim.
    pub meta: u8,

    /// Single opaque user byte.
    pub user_meta: u8,

    /// Expiry as seconds since the epoch; `0` means never.
    pub expires_at: u64,

    /// Value bytes.
    pub value: Vec<u8>,
}

impl ValueStruct {
    /// Builds the value half of an [`Entry`].
    pub fn from_entry(e: &Entry) -> Self {
        Self {
            meta: e.meta,
            user_meta: e.user_meta,
            expires_at: e.expires_at,
            value: e.value.clone(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// ValuePointer
// ------------------------------------------------------------------------------------------------

/// Locates one encoded record inside a log file.
///
/// Replay hands a pointer to the callback alongside each entry so that
/// consumers (e.g. a value-log layer) can re-read the record later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValuePointer {
    /// Numeric id of the log file containing the record.
    pub fid: u32,

    /// Byte offset of the record's first header byte.
    pub offset: u32,

    /// Total encoded length: header + key + value + CRC trailer.
    pub len: u32,
}

// ------------------------------------------------------------------------------------------------
// Timestamp helpers
// ------------------------------------------------------------------------------------------------

/// Extracts the big-endian timestamp from the last 8 bytes of `key`.
///
/// Keys shorter than 8 bytes carry no timestamp and parse as `0`.
pub fn parse_ts(key: &[u8]) -> u64 {
    if key.len() < TS_LEN {
        return 0;
    }
    let mut buf = [0u8; TS_LEN];
    buf.copy_from_slice(&key[key.len() - TS_LEN..]);
    u64::from_be_bytes(buf)
}

/// Appends `ts` to `key` as 8 big-endian bytes, yielding a timestamped key.
pub fn key_with_ts(key: &[u8], ts: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + TS_LEN);
    out.extend_from_slice(key);
    out.extend_from_slice(&ts.to_be_bytes());
    out
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
