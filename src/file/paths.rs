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


//! Path derivation for downloaded and decrypted content
//!
//! # Layout
//! - `<download_dir>/<itemId>.<ext>` - content file (plaintext)
//! - `<download_dir>/<itemId>.<ext>.enc` - content file (ciphertext)
//! - `<download_dir>/<itemId>.<ext>.download_state.json` - resume sidecar
//! - `<cache_dir>/<pathHash>_<itemId>.<ext>` - decrypted materialization

use crate::download::task::MediaItem;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Extension marking a file as ciphertext
pub const ENCRYPTED_EXTENSION: &str = "enc";

/// Suffix of the resume sidecar written next to a partial download
const RESUME_STATE_SUFFIX: &str = "download_state.json";

/// Hex characters of the source-path hash kept in cache entry names
const CACHE_HASH_LEN: usize = 16;

/// Replace characters that are invalid in file names
///
/// Item ids come from the server; anything other than `[A-Za-z0-9._-]`
/// becomes `_` so an id can never escape the download directory.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Deterministic content path for an item
pub fn download_path(download_dir: &Path, item: &MediaItem) -> PathBuf {
    download_dir.join(format!(
        "{}.{}",
        sanitize_filename(&item.id),
        item.extension()
    ))
}

/// Append another extension, keeping the existing one (`a.mp3` -> `a.mp3.enc`)
fn with_added_extension(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Ciphertext path for a plaintext content file
pub fn encrypted_path(path: &Path) -> PathBuf {
    with_added_extension(path, ENCRYPTED_EXTENSION)
}

/// Resume sidecar for a destination file
pub fn resume_state_path(path: &Path) -> PathBuf {
    with_added_extension(path, RESUME_STATE_SUFFIX)
}

/// Naming convention consumers use to decide whether to decrypt first
pub fn is_encrypted_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ENCRYPTED_EXTENSION))
        .unwrap_or(false)
}

/// File name of the decrypted cache entry for an encrypted source
///
/// Keyed by a hash of the full source path so two sources sharing a
/// basename never collide. The `.enc` marker is dropped so players still
/// see the real container extension.
pub fn cache_entry_name(encrypted: &Path) -> String {
    let digest = Sha256::digest(encrypted.to_string_lossy().as_bytes());
    let hash = hex::encode(digest);

    let plain_name = if is_encrypted_path(encrypted) {
        encrypted.file_stem()
    } else {
        encrypted.file_name()
    };
    let plain_name = plain_name
        .map(|n| sanitize_filename(&n.to_string_lossy()))
        .unwrap_or_else(|| "file".to_string());

    format!("{}_{}", &hash[..CACHE_HASH_LEN], plain_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::task::MediaKind;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("abc123"), "abc123");
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("a b:c"), "a_b_c");
        assert_eq!(sanitize_filename(".."), "file");
    }

    #[test]
    fn test_download_path_uses_item_id_and_extension() {
        let item = MediaItem::new("f00d", "Song", MediaKind::Audio);
        assert_eq!(
            download_path(Path::new("/dl"), &item),
            PathBuf::from("/dl/f00d.mp3")
        );
    }

    #[test]
    fn test_download_path_stays_in_download_dir() {
        let dir = Path::new("/data/downloads");
        let items = [
            MediaItem::new("book-1", "Book", MediaKind::Book).with_container("epub/../../../escaped"),
            MediaItem::new("../book-2", "Book", MediaKind::Book).with_container("PDF"),
            MediaItem::new("book-3", "Book", MediaKind::Book).with_container("/etc/passwd"),
        ];

        for item in &items {
            let path = download_path(dir, item);
            assert_eq!(path.parent(), Some(dir));
            assert!(!path.to_string_lossy().contains(".."));
        }
        assert_eq!(download_path(dir, &items[0]), dir.join("book-1.epub"));
        assert_eq!(download_path(dir, &items[1]), dir.join("_book-2.pdf"));
    }

    #[test]
    fn test_encrypted_and_sidecar_paths() {
        let path = Path::new("/dl/f00d.mp4");
        assert_eq!(encrypted_path(path), PathBuf::from("/dl/f00d.mp4.enc"));
        assert_eq!(
            resume_state_path(path),
            PathBuf::from("/dl/f00d.mp4.download_state.json")
        );
        assert!(is_encrypted_path(&encrypted_path(path)));
        assert!(!is_encrypted_path(path));
    }

    #[test]
    fn test_cache_entry_name_keeps_real_extension() {
        let name = cache_entry_name(Path::new("/dl/book.epub.enc"));
        assert!(name.ends_with("_book.epub"));
        assert_eq!(name.len(), CACHE_HASH_LEN + 1 + "book.epub".len());
    }

    #[test]
    fn test_cache_entry_names_differ_for_same_basename() {
        let a = cache_entry_name(Path::new("/one/book.m4b.enc"));
        let b = cache_entry_name(Path::new("/two/book.m4b.enc"));
        assert_ne!(a, b);
        assert_eq!(a, cache_entry_name(Path::new("/one/book.m4b.enc")));
    }
}
