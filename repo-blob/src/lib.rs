//! The untyped key -> bytes blob store contract and a filesystem backend.
//!
//! Grounded in `ChunkStore` (pbs-datastore/chunk_store.rs): atomic put via
//! write-then-rename, a configurable fsync discipline, and directory-sharded
//! storage, generalized from "one file per content-addressed chunk" to "an
//! arbitrary-id key/value store" since this layer's contract is a plain blob
//! store, not a chunk store.

pub mod fs;
pub mod retry;

use chrono::{DateTime, Utc};
use repo_types::{BlobId, Result};

/// Metadata returned by `BlobStore::list`.
#[derive(Clone, Debug)]
pub struct BlobMeta {
    pub id: BlobId,
    pub length: u64,
    pub modified: DateTime<Utc>,
}

/// The minimal operations the core consumes from an untrusted object store.
/// Implementations must be immutable-after-put, eventually consistent on
/// `list`, and tolerate at-least-once `delete`.
pub trait BlobStore: Send + Sync {
    /// Read `length` bytes at `offset` (or to EOF if `length` is `None`).
    fn get(&self, id: &BlobId, offset: u64, length: Option<u64>) -> Result<Vec<u8>>;

    /// Store `data` under `id`. Blobs are immutable once this returns `Ok`.
    fn put(&self, id: &BlobId, data: &[u8]) -> Result<()>;

    /// Remove `id`. At-least-once: callers must tolerate `NotFound` as success.
    fn delete(&self, id: &BlobId) -> Result<()>;

    /// List all blobs whose id starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>>;

    /// Release any held resources (handles, connections).
    fn close(&self) {}
}
