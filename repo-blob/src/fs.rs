//! Filesystem-backed `BlobStore`.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use repo_types::{BlobId, RepoError, Result};

use crate::{BlobMeta, BlobStore};

/// How aggressively to fsync after a write, mirroring `DatastoreFSyncLevel`
/// (chunk_store.rs).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FsyncLevel {
    #[default]
    None,
    File,
    Directory,
}

/// Stores each blob as a single file under `base`, named after a filesystem-
/// safe transform of the blob id. Writes go to a temp file in the same
/// directory and are renamed into place, so a reader never observes a
/// partial write: blobs are immutable after put.
pub struct FilesystemBlobStore {
    base: PathBuf,
    fsync_level: FsyncLevel,
    // Serializes the temp-file-then-rename dance per store instance; distinct
    // blob ids from distinct processes still don't interfere since each gets
    // its own temp file name.
    write_lock: Mutex<()>,
}

fn safe_name(id: &BlobId) -> String {
    // Blob ids are short ASCII strings (prefixes + hex digests); percent-encode
    // defensively against path separators so a malicious/odd id can't escape
    // `base`.
    id.0
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect()
}

impl FilesystemBlobStore {
    pub fn open<P: Into<PathBuf>>(base: P, fsync_level: FsyncLevel) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base).map_err(|e| RepoError::BackendUnavailable(e.to_string()))?;
        Ok(FilesystemBlobStore {
            base,
            fsync_level,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &BlobId) -> PathBuf {
        self.base.join(safe_name(id))
    }
}

impl BlobStore for FilesystemBlobStore {
    fn get(&self, id: &BlobId, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let path = self.path_for(id);
        let mut file = File::open(&path).map_err(|e| map_io_err(id, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| RepoError::Other(e.into()))?;
        let mut buf = match length {
            Some(len) => {
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf)
                    .map_err(|e| RepoError::Other(e.into()))?;
                buf
            }
            None => {
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)
                    .map_err(|e| RepoError::Other(e.into()))?;
                buf
            }
        };
        buf.shrink_to_fit();
        Ok(buf)
    }

    fn put(&self, id: &BlobId, data: &[u8]) -> Result<()> {
        let _lock = self.write_lock.lock().unwrap();

        let final_path = self.path_for(id);
        let tmp_path = self
            .base
            .join(format!(".{}.tmp-{}", safe_name(id), std::process::id()));

        let mut tmp = File::create(&tmp_path).map_err(|e| RepoError::Other(e.into()))?;
        tmp.write_all(data).map_err(|e| RepoError::Other(e.into()))?;
        if self.fsync_level != FsyncLevel::None {
            tmp.sync_all().map_err(|e| RepoError::Other(e.into()))?;
        }
        drop(tmp);

        fs::rename(&tmp_path, &final_path).map_err(|e| RepoError::Other(e.into()))?;

        if self.fsync_level == FsyncLevel::Directory {
            if let Ok(dir) = File::open(&self.base) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }

    fn delete(&self, id: &BlobId) -> Result<()> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()), // at-least-once
            Err(e) => Err(RepoError::Other(e.into())),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.base) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(RepoError::Other(e.into())),
        };
        for entry in entries {
            let entry = entry.map_err(|e| RepoError::Other(e.into()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }
            let meta = entry.metadata().map_err(|e| RepoError::Other(e.into()))?;
            if !meta.is_file() {
                continue;
            }
            let modified: DateTime<Utc> = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(BlobMeta {
                id: BlobId(name),
                length: meta.len(),
                modified,
            });
        }
        Ok(out)
    }
}

fn map_io_err(id: &BlobId, e: std::io::Error) -> RepoError {
    if e.kind() == std::io::ErrorKind::NotFound {
        RepoError::NotFound(id.to_string())
    } else {
        RepoError::Other(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FilesystemBlobStore) {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::open(dir.path(), FsyncLevel::None).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_roundtrips() {
        let (_dir, store) = store();
        let id = BlobId::from("p12345");
        store.put(&id, b"hello pack").unwrap();
        let got = store.get(&id, 0, None).unwrap();
        assert_eq!(got, b"hello pack");
    }

    #[test]
    fn range_read() {
        let (_dir, store) = store();
        let id = BlobId::from("p-range");
        store.put(&id, b"0123456789").unwrap();
        let got = store.get(&id, 3, Some(4)).unwrap();
        assert_eq!(got, b"3456");
    }

    #[test]
    fn missing_blob_is_not_found() {
        let (_dir, store) = store();
        let id = BlobId::from("nope");
        assert!(matches!(store.get(&id, 0, None), Err(RepoError::NotFound(_))));
    }

    #[test]
    fn delete_is_at_least_once() {
        let (_dir, store) = store();
        let id = BlobId::from("p-del");
        store.put(&id, b"x").unwrap();
        store.delete(&id).unwrap();
        store.delete(&id).unwrap(); // second delete still Ok
        assert!(matches!(store.get(&id, 0, None), Err(RepoError::NotFound(_))));
    }

    #[test]
    fn list_filters_by_prefix() {
        let (_dir, store) = store();
        store.put(&BlobId::from("pAAA"), b"1").unwrap();
        store.put(&BlobId::from("pBBB"), b"2").unwrap();
        store.put(&BlobId::from("mXXX"), b"3").unwrap();
        let listed = store.list("p").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|m| m.id.0.starts_with('p')));
    }

    #[test]
    fn put_is_atomic_no_partial_write_visible() {
        let (_dir, store) = store();
        let id = BlobId::from("p-atomic");
        store.put(&id, &vec![7u8; 1024 * 1024]).unwrap();
        let got = store.get(&id, 0, None).unwrap();
        assert_eq!(got.len(), 1024 * 1024);
        assert!(got.iter().all(|&b| b == 7));
    }
}
