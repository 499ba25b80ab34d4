//! Data-key plumbing and the AES-CTR stream transform used by the record
//! codec.
//!
//! Log files are encrypted (or not) per file: at bootstrap a log file asks
//! the [`KeyRegistry`] for the latest data key and stamps that key's id into
//! its header; on reopen it resolves the stamped id back to key material.
//! Key id `0` means plaintext.
//!
//! # IV construction
//!
//! Every file carries a random 12-byte base IV in its header. The CTR IV of
//! a record is the base IV concatenated with the record's 32-bit starting
//! offset:
//!
//! ```text
//! +--------------------+---------------------+
//! | base IV (12 bytes) | BE32 offset (4 B)   |  = 128-bit CTR IV
//! +--------------------+---------------------+
//! ```
//!
//! Offsets are unique within one file and base IVs are random per file, so
//! the counter space never repeats under a given key.

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use aes::{Aes128, Aes192, Aes256};
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

/// Length of the per-file base IV stored in the log-file header.
pub const BASE_IV_LEN: usize = 12;

/// Length of a full AES-CTR IV (one cipher block).
pub const IV_LEN: usize = 16;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised by key resolution or the stream transform.
#[derive(Debug, Error)]
pub enum CryptError {
    /// A log-file header referenced a key id the registry does not know.
    /// Fatal: the file cannot be decoded.
    #[error("data key {0} not found in registry")]
    KeyNotFound(u64),

    /// Key material was not 16, 24, or 32 bytes.
    #[error("invalid AES key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// Registry-internal failure (poisoned lock, backend error).
    #[error("key registry error: {0}")]
    Registry(String),
}

// ------------------------------------------------------------------------------------------------
// Data keys and the registry contract
// ------------------------------------------------------------------------------------------------

/// One data-encryption key as issued by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataKey {
    /// Registry-assigned id; never `0` (that value marks plaintext files).
    pub id: u64,

    /// Raw AES key material: 16, 24, or 32 bytes.
    pub data: Vec<u8>,
}

/// The key-issuing collaborator shared by all log files of a store.
///
/// Modelled as an explicit trait object passed into log-file construction
/// rather than ambient state; the registry serialises its own internals.
pub trait KeyRegistry: Send + Sync {
    /// Resolves previously issued key material by id.
    fn data_key(&self, id: u64) -> Result<DataKey, CryptError>;

    /// Returns the key new files should encrypt with, or `None` when the
    /// store runs in plaintext.
    fn latest_data_key(&self) -> Result<Option<DataKey>, CryptError>;
}

/// Registry for stores running without encryption. Never issues a key and
/// refuses to resolve any id.
#[derive(Debug, Default)]
pub struct PlaintextRegistry;

impl KeyRegistry for PlaintextRegistry {
    fn data_key(&self, id: u64) -> Result<DataKey, CryptError> {
        Err(CryptError::KeyNotFound(id))
    }

    fn latest_data_key(&self) -> Result<Option<DataKey>, CryptError> {
        Ok(None)
    }
}

/// Process-local registry holding keys in memory.
///
/// Suitable for tests and for embedders that manage key material
/// themselves; a production store would back this trait with its KMS.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    inner: Mutex<MemoryRegistryInner>,
}

#[derive(Debug, Default)]
struct MemoryRegistryInner {
    keys: HashMap<u64, DataKey>,
    latest: u64,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers key material under a fresh id and makes it the latest.
    ///
    /// # Errors
    /// [`CryptError::InvalidKeyLength`] unless the key is 16, 24, or 32
    /// bytes.
    pub fn add_key(&self, data: Vec<u8>) -> Result<u64, CryptError> {
        if !matches!(data.len(), 16 | 24 | 32) {
            return Err(CryptError::InvalidKeyLength(data.len()));
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.latest + 1;
        inner.keys.insert(id, DataKey { id, data });
        inner.latest = id;
        Ok(id)
    }
}

impl KeyRegistry for MemoryRegistry {
    fn data_key(&self, id: u64) -> Result<DataKey, CryptError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.keys.get(&id).cloned().ok_or(CryptError::KeyNotFound(id))
    }

    fn latest_data_key(&self) -> Result<Option<DataKey>, CryptError> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.keys.get(&inner.latest).cloned())
    }
}

// ------------------------------------------------------------------------------------------------
// Stream transform
// ------------------------------------------------------------------------------------------------

/// The cipher state a log file holds for its lifetime: the resolved data
/// key plus the file's base IV.
#[derive(Debug, Clone)]
pub struct RecordCipher {
    data_key: DataKey,
    base_iv: [u8; BASE_IV_LEN],
}

impl RecordCipher {
    pub fn new(data_key: DataKey, base_iv: [u8; BASE_IV_LEN]) -> Self {
        Self { data_key, base_iv }
    }

    /// Id of the data key this cipher encrypts with.
    pub fn key_id(&self) -> u64 {
        self.data_key.id
    }

    /// Derives the full CTR IV for a record starting at `offset`.
    pub fn iv(&self, offset: u32) -> [u8; IV_LEN] {
        let mut iv = [0u8; IV_LEN];
        iv[..BASE_IV_LEN].copy_from_slice(&self.base_iv);
        iv[BASE_IV_LEN..].copy_from_slice(&offset.to_be_bytes());
        iv
    }

    /// Applies the AES-CTR keystream to `data` in place.
    ///
    /// CTR is symmetric, so the same call encrypts and decrypts.
    pub fn xor_stream(&self, offset: u32, data: &mut [u8]) -> Result<(), CryptError> {
        let iv = self.iv(offset);
        match self.data_key.data.len() {
            16 => Ctr128BE::<Aes128>::new_from_slices(&self.data_key.data, &iv)
                .map_err(|_| CryptError::InvalidKeyLength(16))?
                .apply_keystream(data),
            24 => Ctr128BE::<Aes192>::new_from_slices(&self.data_key.data, &iv)
                .map_err(|_| CryptError::InvalidKeyLength(24))?
                .apply_keystream(data),
            32 => Ctr128BE::<Aes256>::new_from_slices(&self.data_key.data, &iv)
                .map_err(|_| CryptError::InvalidKeyLength(32))?
                .apply_keystream(data),
            n => return Err(CryptError::InvalidKeyLength(n)),
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_registry_issues_increasing_ids() {
        let reg = MemoryRegistry::new();
        let a = reg.add_key(vec![1u8; 16]).unwrap();
        let b = reg.add_key(vec![2u8; 32]).unwrap();
        assert!(b > a);
        assert_eq!(reg.latest_data_key().unwrap().unwrap().id, b);
        assert_eq!(reg.data_key(a).unwrap().data, vec![1u8; 16]);
    }

    #[test]
    fn test_memory_registry_unknown_id() {
        let reg = MemoryRegistry::new();
        assert!(matches!(reg.data_key(99), Err(CryptError::KeyNotFound(99))));
    }

    #[test]
    fn test_rejects_bad_key_length() {
        let reg = MemoryRegistry::new();
        assert!(matches!(
            reg.add_key(vec![0u8; 15]),
            Err(CryptError::InvalidKeyLength(15))
        ));
    }

    #[test]
    fn test_xor_stream_round_trip_all_key_sizes() {
        for len in [16usize, 24, 32] {
            let cipher = RecordCipher::new(
                DataKey {
                    id: 1,
                    data: vec![0xA5; len],
                },
                [7u8; BASE_IV_LEN],
            );
            let mut data = b"the quick brown fox".to_vec();
            cipher.xor_stream(20, &mut data).unwrap();
            assert_ne!(data, b"the quick brown fox");
            cipher.xor_stream(20, &mut data).unwrap();
            assert_eq!(data, b"the quick brown fox");
        }
    }

    #[test]
    fn test_iv_embeds_offset() {
        let cipher = RecordCipher::new(
            DataKey {
                id: 1,
                data: vec![0u8; 16],
            },
            [0u8; BASE_IV_LEN],
        );
        let iv = cipher.iv(0xDEAD_BEEF);
        assert_eq!(&iv[BASE_IV_LEN..], &0xDEAD_BEEFu32.to_be_bytes());
    }

    #[test]
    fn test_different_offsets_differ() {
        let cipher = RecordCipher::new(
            DataKey {
                id: 1,
                data: vec![9u8; 16],
            },
            [3u8; BASE_IV_LEN],
        );
        let mut a = vec![0u8; 32];
        let mut b = vec![0u8; 32];
        cipher.xor_stream(20, &mut a).unwrap();
        cipher.xor_stream(52, &mut b).unwrap();
        // Keystreams for distinct offsets must not match.
        assert_ne!(a, b);
    }
}
