// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Image Storage
//!
//! Binary-object store for images attached to messages. Clients send images
//! inline as `data:<mime>;base64,<payload>` URLs; the relay uploads the
//! decoded bytes here and persists only the returned durable URL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::ImageError;
use crate::message_store::StorageBackend;

/// Image types accepted for upload, with the file extension used on disk.
const ALLOWED_TYPES: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
];

/// A stored image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredImage {
    pub id: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Trait for image storage backends.
pub trait ImageStore: Send + Sync {
    /// Stores an image and returns its durable URL.
    fn upload(&self, content_type: &str, data: Vec<u8>) -> Result<String, ImageError>;

    /// Looks up an image by the ID embedded in its URL.
    fn fetch(&self, id: &str) -> Option<StoredImage>;

    /// Deletes the image behind a URL returned by [`ImageStore::upload`].
    /// Returns whether an image was removed.
    fn remove(&self, url: &str) -> bool;

    /// Returns the number of stored images.
    fn image_count(&self) -> usize;
}

/// Decodes a `data:` URL into its content type and raw bytes.
pub fn parse_data_url(data_url: &str, max_bytes: usize) -> Result<(String, Vec<u8>), ImageError> {
    let rest = data_url.strip_prefix("data:").ok_or(ImageError::NotDataUrl)?;
    let (meta, payload) = rest.split_once(',').ok_or(ImageError::NotDataUrl)?;
    let content_type = meta
        .strip_suffix(";base64")
        .ok_or(ImageError::NotDataUrl)?
        .to_ascii_lowercase();

    if extension_for(&content_type).is_none() {
        return Err(ImageError::UnsupportedType(content_type));
    }

    // Reject before decoding; base64 expands by 4/3.
    let estimated = payload.len() / 4 * 3;
    if estimated > max_bytes + 3 {
        return Err(ImageError::TooLarge {
            size: estimated,
            max: max_bytes,
        });
    }

    let data = STANDARD.decode(payload.trim())?;
    if data.len() > max_bytes {
        return Err(ImageError::TooLarge {
            size: data.len(),
            max: max_bytes,
        });
    }

    Ok((content_type, data))
}

fn extension_for(content_type: &str) -> Option<&'static str> {
    ALLOWED_TYPES
        .iter()
        .find(|(mime, _)| *mime == content_type)
        .map(|(_, ext)| *ext)
}

fn content_type_for(extension: &str) -> Option<&'static str> {
    ALLOWED_TYPES
        .iter()
        .find(|(_, ext)| *ext == extension)
        .map(|(mime, _)| *mime)
}

fn image_url(base_url: &str, id: &str) -> String {
    format!("{}/images/{}", base_url.trim_end_matches('/'), id)
}

fn image_id(url: &str) -> Option<&str> {
    url.rsplit_once("/images/").map(|(_, id)| id)
}

// ============================================================================
// In-Memory Storage
// ============================================================================

pub struct MemoryImageStore {
    base_url: String,
    images: RwLock<HashMap<String, StoredImage>>,
}

impl MemoryImageStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        MemoryImageStore {
            base_url: base_url.into(),
            images: RwLock::new(HashMap::new()),
        }
    }
}

impl ImageStore for MemoryImageStore {
    fn upload(&self, content_type: &str, data: Vec<u8>) -> Result<String, ImageError> {
        if extension_for(content_type).is_none() {
            return Err(ImageError::UnsupportedType(content_type.to_string()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let image = StoredImage {
            id: id.clone(),
            content_type: content_type.to_string(),
            data,
        };
        self.images
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), image);
        Ok(image_url(&self.base_url, &id))
    }

    fn fetch(&self, id: &str) -> Option<StoredImage> {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn remove(&self, url: &str) -> bool {
        let Some(id) = image_id(url) else {
            return false;
        };
        self.images
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    fn image_count(&self) -> usize {
        self.images
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// ============================================================================
// Filesystem Storage
// ============================================================================

/// Stores each image as `<dir>/<uuid>.<ext>`.
pub struct FsImageStore {
    base_url: String,
    dir: PathBuf,
}

impl FsImageStore {
    /// Opens (creating if needed) an image directory.
    pub fn open(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self, ImageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(FsImageStore {
            base_url: base_url.into(),
            dir,
        })
    }
}

impl ImageStore for FsImageStore {
    fn upload(&self, content_type: &str, data: Vec<u8>) -> Result<String, ImageError> {
        let ext = extension_for(content_type)
            .ok_or_else(|| ImageError::UnsupportedType(content_type.to_string()))?;
        let id = uuid::Uuid::new_v4().to_string();

        // Write then rename so a crash never leaves a partial image visible.
        let tmp = self.dir.join(format!(".{}.tmp", id));
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, self.dir.join(format!("{}.{}", id, ext)))?;

        Ok(image_url(&self.base_url, &id))
    }

    fn fetch(&self, id: &str) -> Option<StoredImage> {
        // IDs are always UUIDs; anything else could escape the directory.
        uuid::Uuid::parse_str(id).ok()?;

        ALLOWED_TYPES.iter().find_map(|(mime, ext)| {
            let path = self.dir.join(format!("{}.{}", id, ext));
            std::fs::read(path).ok().map(|data| StoredImage {
                id: id.to_string(),
                content_type: (*mime).to_string(),
                data,
            })
        })
    }

    fn remove(&self, url: &str) -> bool {
        let Some(id) = image_id(url) else {
            return false;
        };
        if uuid::Uuid::parse_str(id).is_err() {
            return false;
        }
        ALLOWED_TYPES
            .iter()
            .any(|(_, ext)| std::fs::remove_file(self.dir.join(format!("{}.{}", id, ext))).is_ok())
    }

    fn image_count(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .and_then(content_type_for)
                    .is_some()
            })
            .count()
    }
}

/// Creates an image store matching the message storage backend.
pub fn create_image_store(
    backend: StorageBackend,
    data_dir: &Path,
    base_url: &str,
) -> Result<Box<dyn ImageStore>, ImageError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryImageStore::new(base_url))),
        StorageBackend::Sqlite => Ok(Box::new(FsImageStore::open(
            data_dir.join("images"),
            base_url,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 1, 2, 3];

    fn png_data_url() -> String {
        format!("data:image/png;base64,{}", STANDARD.encode(PNG_BYTES))
    }

    #[test]
    fn test_parse_data_url() {
        let (content_type, data) = parse_data_url(&png_data_url(), 1024).unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(data, PNG_BYTES);
    }

    #[test]
    fn test_parse_data_url_rejects_plain_url() {
        let err = parse_data_url("https://example.com/cat.png", 1024).unwrap_err();
        assert!(matches!(err, ImageError::NotDataUrl));
    }

    #[test]
    fn test_parse_data_url_rejects_non_base64() {
        let err = parse_data_url("data:image/png,rawbytes", 1024).unwrap_err();
        assert!(matches!(err, ImageError::NotDataUrl));
    }

    #[test]
    fn test_parse_data_url_rejects_unsupported_type() {
        let url = format!("data:text/html;base64,{}", STANDARD.encode("<p>"));
        let err = parse_data_url(&url, 1024).unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedType(t) if t == "text/html"));
    }

    #[test]
    fn test_parse_data_url_rejects_bad_base64() {
        let err = parse_data_url("data:image/png;base64,!!!not-base64", 1024).unwrap_err();
        assert!(matches!(err, ImageError::Decode(_)));
    }

    #[test]
    fn test_parse_data_url_enforces_size() {
        let big = vec![0u8; 2048];
        let url = format!("data:image/jpeg;base64,{}", STANDARD.encode(&big));
        let err = parse_data_url(&url, 1024).unwrap_err();
        assert!(matches!(err, ImageError::TooLarge { max: 1024, .. }));

        let exact = vec![0u8; 1024];
        let url = format!("data:image/jpeg;base64,{}", STANDARD.encode(&exact));
        assert!(parse_data_url(&url, 1024).is_ok());
    }

    fn test_upload_fetch_impl(store: &dyn ImageStore) {
        let url = store.upload("image/png", PNG_BYTES.to_vec()).unwrap();
        assert!(url.starts_with("http://relay.test/images/"));

        let id = url.rsplit('/').next().unwrap();
        let image = store.fetch(id).unwrap();
        assert_eq!(image.content_type, "image/png");
        assert_eq!(image.data, PNG_BYTES);
        assert_eq!(store.image_count(), 1);

        assert!(store.fetch("00000000-0000-0000-0000-000000000000").is_none());
        assert!(store.upload("application/pdf", vec![1]).is_err());

        assert!(store.remove(&url));
        assert!(store.fetch(id).is_none());
        assert_eq!(store.image_count(), 0);
        assert!(!store.remove(&url));
        assert!(!store.remove("http://relay.test/images/../secret"));
    }

    #[test]
    fn test_memory_store() {
        test_upload_fetch_impl(&MemoryImageStore::new("http://relay.test/"));
    }

    #[test]
    fn test_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        test_upload_fetch_impl(&FsImageStore::open(dir.path(), "http://relay.test").unwrap());
    }

    #[test]
    fn test_fs_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.png"), b"x").unwrap();
        let store = FsImageStore::open(dir.path().join("images"), "http://relay.test").unwrap();
        assert!(store.fetch("../secret").is_none());
    }
}
