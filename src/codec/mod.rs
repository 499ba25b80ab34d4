//! Binary record codec for log files.
//!
//! This crate owns its wire format outright — no serialization library sits
//! between the structs and the disk, so the on-disk representation never
//! changes underneath a dependency upgrade.
//!
//! # Record layout
//!
//! ```text
//! +-----------------+-----+-------+------------------+
//! | varint header   | key | value | crc32c (4 B, BE) |
//! +-----------------+-----+-------+------------------+
//! ```
//!
//! The header encodes, in order: key length (uvarint), value length
//! (uvarint), expires-at (uvarint), meta (1 byte), user-meta (1 byte).
//! The checksum is CRC-32C (Castagnoli) over header + key + value *as
//! written* — when a [`RecordCipher`] is in play, key and value are
//! AES-CTR ciphertext and the CRC covers the ciphertext.
//!
//! An all-zero header is the **end-of-log sentinel**: log files are
//! preallocated and zero-filled, so the first zero header marks the end of
//! appended data rather than corruption.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use thiserror::Error;

use crate::crypt::{CryptError, RecordCipher};
use crate::entry::Entry;

/// Size of the CRC-32C trailer.
pub const CRC_LEN: usize = 4;

/// Upper bound of an encoded header: two uvarint u32s, one uvarint u64,
/// and the two metadata bytes.
pub const MAX_HEADER_SIZE: usize = 5 + 5 + 10 + 1 + 1;

/// Sanity bound on decoded key lengths. Memtable keys are orders of
/// magnitude smaller; anything above this is treated as a torn or
/// overwritten record rather than a real key.
pub const MAX_KEY_LEN: u32 = 1 << 16;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding a single record.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The record begins with an all-zero header — the zero-filled tail of
    /// the log. End of data, not corruption.
    #[error("zero header (end of log data)")]
    ZeroHeader,

    /// The record is cut short: the header could not be parsed, or its
    /// length fields point past the end of the available bytes.
    #[error("record truncated")]
    Truncate,

    /// The stored CRC-32C does not match the bytes on disk.
    #[error("checksum mismatch (expected {expected:08x}, actual {actual:08x})")]
    ChecksumMismatch {
        /// Checksum stored in the record trailer.
        expected: u32,
        /// Checksum computed over the record bytes.
        actual: u32,
    },

    /// A key or value too large for the wire format.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// Cipher failure while encrypting or decrypting the key/value slab.
    #[error("cipher error: {0}")]
    Crypt(#[from] CryptError),
}

// ------------------------------------------------------------------------------------------------
// Varints
// ------------------------------------------------------------------------------------------------

/// Appends `value` to `buf` as an unsigned LEB128 varint.
#[inline]
pub fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decodes an unsigned LEB128 varint from the front of `buf`.
///
/// Returns `(value, bytes_consumed)`; [`CodecError::Truncate`] if the
/// buffer ends mid-varint or the varint does not fit in 64 bits.
#[inline]
pub fn uvarint(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(CodecError::Truncate);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(CodecError::Truncate)
}

/// Number of bytes [`put_uvarint`] emits for `value`.
#[inline]
pub fn uvarint_len(value: u64) -> usize {
    if value == 0 {
        1
    } else {
        (64 - value.leading_zeros() as usize).div_ceil(7)
    }
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// The variable-length record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Key length in bytes.
    pub klen: u32,

    /// Value length in bytes.
    pub vlen: u32,

    /// Expiry as seconds since the epoch; `0` means never.
    pub expires_at: u64,

    /// Bit-significant flags, opaque to the codec.
    pub meta: u8,

    /// Single opaque user byte.
    pub user_meta: u8,
}

impl Header {
    /// Appends the encoded header to `buf`, returning the encoded length.
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        put_uvarint(buf, u64::from(self.klen));
        put_uvarint(buf, u64::from(self.vlen));
        put_uvarint(buf, self.expires_at);
        buf.push(self.meta);
        buf.push(self.user_meta);
        buf.len() - start
    }

    /// Decodes a header from the front of `buf`.
    ///
    /// Returns `(header, bytes_consumed)`; [`CodecError::Truncate`] when
    /// `buf` ends inside the header.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (klen, n0) = uvarint(buf)?;
        let (vlen, n1) = uvarint(&buf[n0..])?;
        let (expires_at, n2) = uvarint(&buf[n0 + n1..])?;
        let mut used = n0 + n1 + n2;
        if buf.len() < used + 2 {
            return Err(CodecError::Truncate);
        }
        let meta = buf[used];
        let user_meta = buf[used + 1];
        used += 2;

        let klen = u32::try_from(klen).map_err(|_| CodecError::Truncate)?;
        let vlen = u32::try_from(vlen).map_err(|_| CodecError::Truncate)?;
        Ok((
            Self {
                klen,
                vlen,
                expires_at,
                meta,
                user_meta,
            },
            used,
        ))
    }

    /// True when every field is zero — the end-of-log sentinel.
    pub fn is_zero(&self) -> bool {
        self.klen == 0
            && self.vlen == 0
            && self.expires_at == 0
            && self.meta == 0
            && self.user_meta == 0
    }
}

// ------------------------------------------------------------------------------------------------
// Record encode / decode
// ------------------------------------------------------------------------------------------------

/// Encodes `entry` into `buf` (cleared first), returning the total encoded
/// length.
///
/// When `cipher` is present, key and value are AES-CTR-encrypted with the
/// IV derived from `offset` — the record's starting offset in its file —
/// and the CRC covers the ciphertext.
///
/// # Errors
/// [`CodecError::LengthOverflow`] when the key or value exceeds `u32::MAX`
/// bytes.
pub fn encode_entry(
    buf: &mut Vec<u8>,
    entry: &Entry,
    cipher: Option<&RecordCipher>,
    offset: u32,
) -> Result<usize, CodecError> {
    let klen = u32::try_from(entry.key.len())
        .map_err(|_| CodecError::LengthOverflow(format!("key length {}", entry.key.len())))?;
    let vlen = u32::try_from(entry.value.len())
        .map_err(|_| CodecError::LengthOverflow(format!("value length {}", entry.value.len())))?;

    let header = Header {
        klen,
        vlen,
        expires_at: entry.expires_at,
        meta: entry.meta,
        user_meta: entry.user_meta,
    };

    buf.clear();
    buf.reserve(MAX_HEADER_SIZE + entry.key.len() + entry.value.len() + CRC_LEN);
    header.encode(buf);

    match cipher {
        Some(cipher) => {
            // Encrypt key and value as one slab; the keystream position of
            // the value depends on the key preceding it.
            let mut kv = Vec::with_capacity(entry.key.len() + entry.value.len());
            kv.extend_from_slice(&entry.key);
            kv.extend_from_slice(&entry.value);
            cipher.xor_stream(offset, &mut kv)?;
            buf.extend_from_slice(&kv);
        }
        None => {
            buf.extend_from_slice(&entry.key);
            buf.extend_from_slice(&entry.value);
        }
    }

    let crc = crc32c::crc32c(buf);
    buf.extend_from_slice(&crc.to_be_bytes());
    Ok(buf.len())
}

/// Decodes one record from the front of `data`.
///
/// `offset` is the record's absolute starting offset in its file; it seeds
/// IV derivation and is recorded on the returned [`Entry`]. Returns the
/// entry and the total number of bytes the record occupies.
///
/// Key and value are copied into owned buffers (decrypted when `cipher` is
/// present), so the returned entry does not borrow from `data`.
///
/// # Errors
/// - [`CodecError::ZeroHeader`] — `data` starts in the zero-filled tail.
/// - [`CodecError::Truncate`] — header unparseable, key length above the
///   sanity bound, or lengths pointing past the end of `data`.
/// - [`CodecError::ChecksumMismatch`] — CRC verification failed.
pub fn decode_entry(
    data: &[u8],
    offset: u32,
    cipher: Option<&RecordCipher>,
) -> Result<(Entry, usize), CodecError> {
    let (header, hlen) = Header::decode(data)?;
    if header.is_zero() {
        return Err(CodecError::ZeroHeader);
    }
    if header.klen > MAX_KEY_LEN {
        return Err(CodecError::Truncate);
    }

    let klen = header.klen as usize;
    let vlen = header.vlen as usize;
    let total = hlen + klen + vlen + CRC_LEN;
    if data.len() < total {
        return Err(CodecError::Truncate);
    }

    let body_end = hlen + klen + vlen;
    let actual = crc32c::crc32c(&data[..body_end]);
    let mut crc_bytes = [0u8; CRC_LEN];
    crc_bytes.copy_from_slice(&data[body_end..total]);
    let expected = u32::from_be_bytes(crc_bytes);
    if expected != actual {
        return Err(CodecError::ChecksumMismatch { expected, actual });
    }

    let mut kv = data[hlen..body_end].to_vec();
    if let Some(cipher) = cipher {
        cipher.xor_stream(offset, &mut kv)?;
    }
    let value = kv.split_off(klen);

    Ok((
        Entry {
            key: kv,
            value,
            expires_at: header.expires_at,
            user_meta: header.user_meta,
            meta: header.meta,
            offset,
        },
        total,
    ))
}
