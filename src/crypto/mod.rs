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


//! Encryption at rest
//!
//! # Pieces
//! - [`key_store`]: one 32-byte key per install in a [`SecureStore`]
//! - [`cipher`]: keyed XOR stream codec, `IV || ciphertext` blobs
//! - [`service`]: whole-file encrypt/decrypt with atomic writes
//! - [`cache`]: plaintext copies for players and readers
//!
//! Consumers check [`is_encrypted_path`] on a resolved local path and go
//! through [`DecryptedCache::get_decrypted_uri`] before opening it.

pub mod cache;
pub mod cipher;
pub mod key_store;
pub mod service;

// Re-export commonly used types
pub use crate::file::paths::is_encrypted_path;
pub use cache::{BlobDecryptor, DecryptedCache};
pub use cipher::{EncryptionKey, IV_LEN, KEY_LEN};
pub use key_store::{FileSecureStore, KeyStore, MemorySecureStore, SecureStore, KEY_ALIAS};
pub use service::EncryptionService;
