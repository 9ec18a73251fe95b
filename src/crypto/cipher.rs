// MediaOffline - Offline content pipeline for mobile media clients
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Keyed XOR stream codec
//!
//! # Format
//! - Key: 32 bytes, one per install
//! - IV: 16 random bytes per file
//! - Keystream byte `i`: `key[i % 32] ^ iv[i % 16]`
//! - Blob: `IV || (plaintext XOR keystream)`
//!
//! The keystream repeats every 32 bytes. This is obfuscation against casual
//! file extraction, not confidentiality against an attacker who holds a
//! known plaintext.

use crate::error::{OfflineError, Result};
use rand::RngCore;
use std::fmt;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// Per-install symmetric key
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh key from the OS-seeded thread RNG
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            OfflineError::KeyUnavailable(format!(
                "stored key has {} bytes, expected {}",
                bytes.len(),
                KEY_LEN
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

// Never print key material
impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Random per-file IV
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// XOR `data` in place with the keystream starting at byte `offset`
///
/// Applying it twice with the same key, IV and offset restores the input,
/// so the same call encrypts and decrypts. The offset lets large files be
/// processed in chunks.
pub fn apply_keystream(key: &EncryptionKey, iv: &[u8; IV_LEN], offset: u64, data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        let pos = offset + i as u64;
        let k = key.0[(pos % KEY_LEN as u64) as usize];
        let v = iv[(pos % IV_LEN as u64) as usize];
        *byte ^= k ^ v;
    }
}

/// Encrypt a buffer with a fresh IV, returning `IV || ciphertext`
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Vec<u8> {
    encrypt_with_iv(key, &generate_iv(), plaintext)
}

pub fn encrypt_with_iv(key: &EncryptionKey, iv: &[u8; IV_LEN], plaintext: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(IV_LEN + plaintext.len());
    blob.extend_from_slice(iv);
    blob.extend_from_slice(plaintext);
    apply_keystream(key, iv, 0, &mut blob[IV_LEN..]);
    blob
}

/// Split a blob into its IV and ciphertext
pub fn split_blob(blob: &[u8]) -> Result<([u8; IV_LEN], &[u8])> {
    if blob.len() < IV_LEN {
        return Err(OfflineError::MalformedBlob { len: blob.len() });
    }
    let (iv, body) = blob.split_at(IV_LEN);
    let mut header = [0u8; IV_LEN];
    header.copy_from_slice(iv);
    Ok((header, body))
}

/// Decrypt an `IV || ciphertext` blob
pub fn decrypt(key: &EncryptionKey, blob: &[u8]) -> Result<Vec<u8>> {
    let (iv, body) = split_blob(blob)?;
    let mut plaintext = body.to_vec();
    apply_keystream(key, &iv, 0, &mut plaintext);
    Ok(plaintext)
}
