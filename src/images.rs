//! Image blob store: one file per image, named by a fresh 128-bit id.
//!
//! Fresh names mean there are no write/write races. Unlinking a replaced blob
//! after the row update may race a concurrent reader that still holds the old
//! id; readers treat a missing file as an absent image.

use crate::types::ImageId;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// PNG file signature.
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// JPEG SOI marker.
const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// True when the bytes start a PNG or JPEG stream.
pub fn is_valid_image(data: &[u8]) -> bool {
    data.starts_with(&PNG_MAGIC) || data.starts_with(&JPEG_MAGIC)
}

pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: &ImageId) -> PathBuf {
        self.dir.join(hex::encode(id))
    }

    /// Stage a blob to disk. Callers write before the row update that will
    /// reference the id.
    pub async fn write(&self, id: &ImageId, data: &[u8]) -> io::Result<()> {
        tokio::fs::write(self.path(id), data).await
    }

    /// Read a blob; `None` when the file is gone (possibly unlinked under a
    /// concurrent replace).
    pub async fn read(&self, id: &ImageId) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(id)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Unlink a blob. Failures are logged and swallowed; a leaked file is
    /// reclaimed by the orphan sweep.
    pub async fn remove(&self, id: &ImageId) {
        if let Err(e) = tokio::fs::remove_file(self.path(id)).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to unlink image {}: {}", hex::encode(id), e);
            }
        }
    }

    pub async fn remove_all(&self, ids: &[ImageId]) {
        for id in ids {
            self.remove(id).await;
        }
    }

    /// Delete every blob not in the referenced set. Run at startup before the
    /// listeners come up.
    pub fn sweep_orphans(&self, referenced: &HashSet<ImageId>) -> io::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(raw) = hex::decode(name) else { continue };
            let Ok(id) = <[u8; 16]>::try_from(raw.as_slice()) else {
                continue;
            };
            if !referenced.contains(&id) {
                if std::fs::remove_file(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!("orphan sweep removed {} image blobs", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_image_id;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n', 0, 0];

    #[test]
    fn test_magic_detection() {
        assert!(is_valid_image(PNG));
        assert!(is_valid_image(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]));
        assert!(!is_valid_image(b"GIF89a"));
        assert!(!is_valid_image(&[]));
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let id = random_image_id();

        store.write(&id, PNG).await.unwrap();
        assert_eq!(store.read(&id).await.unwrap().unwrap(), PNG);

        store.remove(&id).await;
        assert!(store.read(&id).await.unwrap().is_none());

        // Second unlink is a no-op, not an error.
        store.remove(&id).await;
    }

    #[tokio::test]
    async fn test_orphan_sweep_keeps_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(dir.path()).unwrap();
        let kept = random_image_id();
        let orphan = random_image_id();

        store.write(&kept, PNG).await.unwrap();
        store.write(&orphan, PNG).await.unwrap();

        let mut referenced = HashSet::new();
        referenced.insert(kept);
        let removed = store.sweep_orphans(&referenced).unwrap();

        assert_eq!(removed, 1);
        assert!(store.read(&kept).await.unwrap().is_some());
        assert!(store.read(&orphan).await.unwrap().is_none());
    }
}
