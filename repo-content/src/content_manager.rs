//! The public dedup API: `write_content`/`get_content`/`delete_content`,
//! pack flush, index merge and compaction.
//!
//! Owns the pack builder and the index: ownership is strictly hierarchical,
//! with a single lock protecting both. Grounded in `DataStore`/`ChunkStore`
//! (pbs-datastore/datastore.rs, chunk_store.rs) for the overall shape —
//! assemble-under-lock, release, do I/O, re-acquire, commit — generalized
//! from "one chunk per file" to "many records packed, with a separate
//! mergeable index".

use std::sync::{Arc, Mutex};

use rand::RngCore;
use repo_blob::{retry::with_backoff, BlobStore};
use repo_crypto::{cipher::EncryptionAlgorithm, hash::HashAlgorithm, CryptConfig};
use repo_types::{BlobId, ContentId, RepoError, Result};

use crate::index::{IndexEntry, IndexSet, Location};
use crate::pack;

pub const PACK_BLOB_PREFIX: &str = "p";
pub const INDEX_BLOB_PREFIX: &str = "q";

#[derive(Clone, Debug)]
pub struct ContentManagerConfig {
    pub hash: HashAlgorithm,
    pub encryption: EncryptionAlgorithm,
    pub max_pack_size: u64,
    pub max_inline_content_length: usize,
}

impl Default for ContentManagerConfig {
    fn default() -> Self {
        ContentManagerConfig {
            hash: HashAlgorithm::HmacSha256_128,
            encryption: EncryptionAlgorithm::Aes256CtrHmacSha256,
            max_pack_size: 20 * 1024 * 1024,
            max_inline_content_length: 256,
        }
    }
}

/// The pack currently being assembled. `Empty` and `Accumulating` are
/// represented by `body.is_empty()`; `Sealing`/`Written` are transient states
/// that exist only for the duration of `take_pack_to_seal`/`write_sealed_pack`
/// and are not separately recorded once those calls return.
struct PackBuilder {
    pack_id: BlobId,
    body: Vec<u8>,
    local_entries: IndexSet,
}

impl PackBuilder {
    fn new() -> Self {
        PackBuilder {
            pack_id: fresh_blob_id(PACK_BLOB_PREFIX),
            body: Vec::new(),
            local_entries: IndexSet::new(),
        }
    }
}

struct ManagerState {
    current_pack: PackBuilder,
    pending_index: IndexSet,
    committed_index: IndexSet,
    known_index_blobs: Vec<BlobId>,
    index_flush_disabled: bool,
}

pub struct ContentManager {
    blob_store: Arc<dyn BlobStore>,
    crypt: Arc<CryptConfig>,
    config: ContentManagerConfig,
    state: Mutex<ManagerState>,
}

fn fresh_blob_id(prefix: &str) -> BlobId {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    BlobId(format!("{prefix}{}", hex::encode(bytes)))
}

mod hex {
    pub fn encode(bytes: [u8; 16]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ContentManager {
    /// Opens (or creates) a content manager over `blob_store`, loading and
    /// merging every existing index blob.
    pub fn open(
        blob_store: Arc<dyn BlobStore>,
        crypt: Arc<CryptConfig>,
        config: ContentManagerConfig,
    ) -> Result<Self> {
        let (committed_index, known_index_blobs) =
            load_index_blobs(&blob_store, &crypt, config.encryption)?;
        Ok(ContentManager {
            blob_store,
            crypt,
            config,
            state: Mutex::new(ManagerState {
                current_pack: PackBuilder::new(),
                pending_index: IndexSet::new(),
                committed_index,
                known_index_blobs,
                index_flush_disabled: false,
            }),
        })
    }

    /// Pure function of `(hash(data), prefix)`: writing identical bytes twice
    /// yields the same id and, for the second call, no new pack bytes.
    pub fn write_content(&self, data: &[u8], prefix: Option<u8>) -> Result<ContentId> {
        let id = self.crypt.compute_content_id(data, prefix);
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = effective_entry(&state, &id) {
            if !existing.deleted {
                return Ok(id); // idempotent: already live, nothing to do
            }
        }

        let entry = if data.len() <= self.config.max_inline_content_length {
            IndexEntry {
                content_id: id.clone(),
                location: Location::Inline(data.to_vec()),
                timestamp: now_millis(),
                deleted: false,
                format_version: 1,
            }
        } else {
            let offset = state.current_pack.body.len() as u64;
            let (enc_key, mac_key) = self
                .crypt
                .derive_pack_keys(state.current_pack.pack_id.0.as_bytes());
            let record = pack::seal_record(
                self.config.encryption,
                &enc_key,
                &mac_key,
                offset,
                data,
            )
            .map_err(RepoError::Other)?;
            let length = record.len() as u64;
            state.current_pack.body.extend_from_slice(&record);

            let entry = IndexEntry {
                content_id: id.clone(),
                location: Location::Packed {
                    pack_id: state.current_pack.pack_id.clone(),
                    offset,
                    length,
                },
                timestamp: now_millis(),
                deleted: false,
                format_version: 1,
            };
            state.current_pack.local_entries.insert(entry.clone());
            entry
        };

        state.pending_index.insert(entry);

        let to_seal = if state.current_pack.body.len() as u64 >= self.config.max_pack_size {
            self.take_pack_to_seal(&mut state)?
        } else {
            None
        };
        drop(state);

        if let Some((pack_id, sealed)) = to_seal {
            self.write_sealed_pack(&pack_id, &sealed)?;
        }

        Ok(id)
    }

    /// Looks up the winning index entry; inline payloads return directly,
    /// packed ones are range-read from the pack blob (or, if the pack has not
    /// been flushed yet, from the in-memory pack builder — reads-own-writes).
    /// The blob-store read, when needed, happens with the state lock
    /// released.
    pub fn get_content(&self, id: &ContentId) -> Result<Vec<u8>> {
        self.get_content_retrying(id, true)
    }

    fn get_content_retrying(&self, id: &ContentId, allow_retry: bool) -> Result<Vec<u8>> {
        enum Source {
            Inline(Vec<u8>),
            InMemoryPack(BlobId, u64, Vec<u8>),
            Stored(BlobId, u64, u64),
        }

        let source = {
            let state = self.state.lock().unwrap();
            let entry = match effective_entry(&state, id) {
                Some(e) if !e.deleted => e.clone(),
                _ => return Err(RepoError::NotFound(id.to_string())),
            };
            match entry.location {
                Location::Inline(data) => Source::Inline(data),
                Location::Packed { pack_id, offset, length } => {
                    if pack_id == state.current_pack.pack_id {
                        let start = offset as usize;
                        let end = start + length as usize;
                        if end <= state.current_pack.body.len() {
                            Source::InMemoryPack(pack_id, offset, state.current_pack.body[start..end].to_vec())
                        } else {
                            Source::Stored(pack_id, offset, length)
                        }
                    } else {
                        Source::Stored(pack_id, offset, length)
                    }
                }
            }
        };

        match source {
            Source::Inline(data) => Ok(data),
            Source::InMemoryPack(pack_id, offset, bytes) => self.open_record(&pack_id, offset, &bytes),
            Source::Stored(pack_id, offset, length) => {
                match self.blob_store.get(&pack_id, offset, Some(length)) {
                    Ok(bytes) => self.open_record(&pack_id, offset, &bytes),
                    Err(RepoError::NotFound(_)) if allow_retry => {
                        // Another writer may have compacted and deleted this
                        // pack; re-read the index once and retry exactly once.
                        self.refresh_index()?;
                        self.get_content_retrying(id, false)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn open_record(&self, pack_id: &BlobId, offset: u64, record: &[u8]) -> Result<Vec<u8>> {
        let (enc_key, mac_key) = self.crypt.derive_pack_keys(pack_id.0.as_bytes());
        pack::open_record(self.config.encryption, &enc_key, &mac_key, offset, record)
            .map_err(|e| RepoError::IntegrityError(e.to_string()))
    }

    /// Records a tombstone; no immediate blob deletion.
    pub fn delete_content(&self, id: &ContentId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let location = effective_entry(&state, id)
            .map(|e| e.location.clone())
            .unwrap_or(Location::Inline(Vec::new()));
        state.pending_index.insert(IndexEntry {
            content_id: id.clone(),
            location,
            timestamp: now_millis(),
            deleted: true,
            format_version: 1,
        });
        Ok(())
    }

    /// Closes the current pack (if non-empty), writes it and an index blob,
    /// clears pending state. Assembles the pack/index bytes under the lock,
    /// releases it for the blob-store writes, then re-acquires to commit.
    pub fn flush(&self) -> Result<()> {
        let (to_seal, snapshot) = {
            let mut state = self.state.lock().unwrap();
            let to_seal = self.take_pack_to_seal(&mut state)?;
            let snapshot = if state.pending_index.is_empty() {
                None
            } else {
                Some(state.pending_index.clone())
            };
            (to_seal, snapshot)
        };

        if let Some((pack_id, sealed)) = to_seal {
            self.write_sealed_pack(&pack_id, &sealed)?;
        }

        let Some(snapshot) = snapshot else {
            return Ok(());
        };

        let index_id = fresh_blob_id(INDEX_BLOB_PREFIX);
        let bytes = crate::index::encode_index(&snapshot);
        with_backoff(|| self.blob_store.put(&index_id, &bytes))?;

        let mut state = self.state.lock().unwrap();
        state.pending_index.remove_if_unchanged(&snapshot);
        state.committed_index.merge(snapshot);
        state.known_index_blobs.push(index_id);
        Ok(())
    }

    /// Swaps the current pack for a fresh, empty one and seals the taken
    /// pack's bytes in memory. Pure (no I/O) so it can run under the state
    /// lock; the caller writes the returned bytes once the lock is released.
    fn take_pack_to_seal(&self, state: &mut ManagerState) -> Result<Option<(BlobId, Vec<u8>)>> {
        if state.current_pack.body.is_empty() {
            return Ok(None);
        }
        let pack = std::mem::replace(&mut state.current_pack, PackBuilder::new());
        let (enc_key, mac_key) = self.crypt.derive_pack_keys(pack.pack_id.0.as_bytes());
        let local_index_plain = crate::index::encode_index(&pack.local_entries);
        let sealed = pack::seal_pack(
            pack.body,
            Some(&local_index_plain),
            self.config.encryption,
            &enc_key,
            &mac_key,
        )
        .map_err(RepoError::Other)?;
        Ok(Some((pack.pack_id, sealed)))
    }

    /// Writes an already-sealed pack to the blob store. Must be called with
    /// the state lock released.
    fn write_sealed_pack(&self, pack_id: &BlobId, sealed: &[u8]) -> Result<()> {
        with_backoff(|| self.blob_store.put(pack_id, sealed))?;
        log::debug!("sealed pack {} ({} bytes)", pack_id, sealed.len());
        Ok(())
    }

    /// Reads all index blobs, merges by tie-break rule, emits a single
    /// replacement index blob, deletes the superseded ones after the
    /// replacement is durable. Assembles the snapshot under the lock,
    /// releases it for the blob-store writes/deletes, then re-acquires to
    /// commit — only removing the specific blob ids that were compacted, so
    /// a concurrent `flush`'s new index blob is never lost.
    pub fn compact_indexes(&self) -> Result<()> {
        let (committed_snapshot, superseded) = {
            let state = self.state.lock().unwrap();
            if state.index_flush_disabled {
                log::debug!("index compaction skipped: disabled by a coordinating manager");
                return Ok(());
            }
            if state.known_index_blobs.len() <= 1 {
                return Ok(());
            }
            (state.committed_index.clone(), state.known_index_blobs.clone())
        };

        let replacement_id = fresh_blob_id(INDEX_BLOB_PREFIX);
        let bytes = crate::index::encode_index(&committed_snapshot);
        with_backoff(|| self.blob_store.put(&replacement_id, &bytes))?;

        for id in &superseded {
            with_backoff(|| self.blob_store.delete(id))?;
        }

        let mut state = self.state.lock().unwrap();
        state.known_index_blobs.retain(|id| !superseded.contains(id));
        state.known_index_blobs.push(replacement_id);
        Ok(())
    }

    /// Union of live entries across all known index blobs and pending writes,
    /// filtered by `prefix`.
    pub fn list_contents(&self, prefix: &[u8]) -> Result<Vec<ContentId>> {
        let state = self.state.lock().unwrap();
        let mut view = state.committed_index.clone();
        view.merge(state.pending_index.clone());
        Ok(view
            .list_live(prefix)
            .map(|e| e.content_id.clone())
            .collect())
    }

    /// Pauses `compact_indexes`' blob deletion, used by the manifest manager
    /// to make its own compaction atomic.
    pub fn disable_index_flush(&self) {
        self.state.lock().unwrap().index_flush_disabled = true;
    }

    pub fn enable_index_flush(&self) {
        self.state.lock().unwrap().index_flush_disabled = false;
    }

    /// Re-lists and re-reads every index blob (and recovers from any
    /// orphaned pack's embedded local index) without holding the state lock,
    /// then re-acquires it only to install the result.
    fn refresh_index(&self) -> Result<()> {
        let (committed, known) = load_index_blobs(&self.blob_store, &self.crypt, self.config.encryption)?;
        let mut state = self.state.lock().unwrap();
        state.committed_index = committed;
        state.known_index_blobs = known;
        Ok(())
    }
}

fn effective_entry<'a>(state: &'a ManagerState, id: &ContentId) -> Option<&'a IndexEntry> {
    state
        .pending_index
        .get(id)
        .or_else(|| state.committed_index.get(id))
}

fn load_index_blobs(
    blob_store: &Arc<dyn BlobStore>,
    crypt: &CryptConfig,
    encryption: EncryptionAlgorithm,
) -> Result<(IndexSet, Vec<BlobId>)> {
    let blobs = blob_store.list(INDEX_BLOB_PREFIX)?;
    let mut merged = IndexSet::new();
    let mut ids = Vec::with_capacity(blobs.len());
    for meta in blobs {
        let bytes = match blob_store.get(&meta.id, 0, None) {
            Ok(b) => b,
            Err(RepoError::NotFound(_)) => continue, // raced with a concurrent compaction
            Err(e) => return Err(e),
        };
        match crate::index::decode_index(&bytes) {
            Ok(set) => merged.merge(set),
            Err(e) => {
                log::warn!("skipping unreadable index blob {}: {e}", meta.id);
                continue;
            }
        }
        ids.push(meta.id);
    }

    recover_from_orphaned_packs(blob_store, crypt, encryption, &mut merged)?;
    Ok((merged, ids))
}

/// A pack not referenced by any merged index entry may still carry a durable
/// embedded local index if its separate index blob was never written (e.g.
/// the process crashed between `seal_current_pack` and `flush`'s index
/// write). Recovering from that embedded copy means a lost index blob never
/// silently drops content that is, in fact, still on disk.
fn recover_from_orphaned_packs(
    blob_store: &Arc<dyn BlobStore>,
    crypt: &CryptConfig,
    encryption: EncryptionAlgorithm,
    merged: &mut IndexSet,
) -> Result<()> {
    let referenced: std::collections::HashSet<BlobId> = merged
        .iter()
        .filter_map(|e| match &e.location {
            Location::Packed { pack_id, .. } => Some(pack_id.clone()),
            Location::Inline(_) => None,
        })
        .collect();

    for meta in blob_store.list(PACK_BLOB_PREFIX)? {
        if referenced.contains(&meta.id) {
            continue;
        }

        let bytes = match blob_store.get(&meta.id, 0, None) {
            Ok(b) => b,
            Err(RepoError::NotFound(_)) => continue, // raced with a concurrent compaction/GC
            Err(e) => return Err(e),
        };
        let footer = match pack::read_footer(&bytes) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("skipping pack {} with unreadable footer: {e}", meta.id);
                continue;
            }
        };
        if footer.local_index_length == 0 {
            continue;
        }

        let (enc_key, mac_key) = crypt.derive_pack_keys(meta.id.0.as_bytes());
        let region = &bytes[footer.local_index_offset as usize
            ..(footer.local_index_offset + footer.local_index_length) as usize];
        let plain = match pack::open_record(encryption, &enc_key, &mac_key, footer.local_index_offset, region) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("skipping pack {} with unreadable local index: {e}", meta.id);
                continue;
            }
        };
        match crate::index::decode_index(&plain) {
            Ok(set) => {
                log::debug!("recovered {} entries from orphaned pack {}", set.len(), meta.id);
                merged.merge(set);
            }
            Err(e) => log::warn!("skipping pack {} with corrupt local index: {e}", meta.id),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_blob::fs::{FilesystemBlobStore, FsyncLevel};

    fn manager() -> (tempfile::TempDir, ContentManager) {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> =
            Arc::new(FilesystemBlobStore::open(dir.path(), FsyncLevel::None).unwrap());
        let crypt = Arc::new(CryptConfig::new(
            [42u8; 32],
            HashAlgorithm::HmacSha256_128,
            EncryptionAlgorithm::Aes256CtrHmacSha256,
        ));
        let cm = ContentManager::open(store, crypt, ContentManagerConfig::default()).unwrap();
        (dir, cm)
    }

    #[test]
    fn write_then_get_before_flush() {
        let (_d, cm) = manager();
        let data = vec![9u8; 4096]; // exceeds inline threshold
        let id = cm.write_content(&data, None).unwrap();
        assert_eq!(cm.get_content(&id).unwrap(), data);
    }

    #[test]
    fn dedup_determinism_across_calls() {
        let (_d, cm) = manager();
        let data = b"same bytes";
        let id1 = cm.write_content(data, None).unwrap();
        let id2 = cm.write_content(data, None).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn round_trip_after_flush() {
        let (_d, cm) = manager();
        let data = vec![3u8; 10_000];
        let id = cm.write_content(&data, None).unwrap();
        cm.flush().unwrap();
        assert_eq!(cm.get_content(&id).unwrap(), data);
    }

    #[test]
    fn inline_small_content_roundtrips() {
        let (_d, cm) = manager();
        let id = cm.write_content(b"tiny", None).unwrap();
        assert_eq!(cm.get_content(&id).unwrap(), b"tiny");
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let (_d, cm) = manager();
        let id = cm.write_content(b"to be deleted", None).unwrap();
        cm.delete_content(&id).unwrap();
        assert!(matches!(cm.get_content(&id), Err(RepoError::NotFound(_))));
    }

    #[test]
    fn idempotent_delete() {
        let (_d, cm) = manager();
        let id = cm.write_content(b"x", None).unwrap();
        cm.delete_content(&id).unwrap();
        cm.delete_content(&id).unwrap();
        assert!(matches!(cm.get_content(&id), Err(RepoError::NotFound(_))));
    }

    #[test]
    fn tombstone_survives_reopen_and_dominates_old_index() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> =
            Arc::new(FilesystemBlobStore::open(dir.path(), FsyncLevel::None).unwrap());
        let crypt = Arc::new(CryptConfig::new(
            [1u8; 32],
            HashAlgorithm::HmacSha256_128,
            EncryptionAlgorithm::Aes256CtrHmacSha256,
        ));
        let cm = ContentManager::open(store.clone(), crypt.clone(), ContentManagerConfig::default()).unwrap();
        let id = cm.write_content(b"gone soon", None).unwrap();
        cm.flush().unwrap();
        cm.delete_content(&id).unwrap();
        cm.flush().unwrap();
        drop(cm);

        let cm2 = ContentManager::open(store, crypt, ContentManagerConfig::default()).unwrap();
        assert!(matches!(cm2.get_content(&id), Err(RepoError::NotFound(_))));
    }

    #[test]
    fn reopen_recovers_from_orphaned_pack_when_index_blob_is_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> =
            Arc::new(FilesystemBlobStore::open(dir.path(), FsyncLevel::None).unwrap());
        let crypt = Arc::new(CryptConfig::new(
            [7u8; 32],
            HashAlgorithm::HmacSha256_128,
            EncryptionAlgorithm::Aes256CtrHmacSha256,
        ));
        let cm = ContentManager::open(store.clone(), crypt.clone(), ContentManagerConfig::default()).unwrap();
        let data = vec![6u8; 9000]; // exceeds inline threshold
        let id = cm.write_content(&data, None).unwrap();
        cm.flush().unwrap();
        drop(cm);

        // Simulate the index blob write never landing (crash between sealing
        // the pack and flush's index write): the pack itself, with its
        // embedded local index, is the only thing left on disk.
        for meta in store.list(INDEX_BLOB_PREFIX).unwrap() {
            store.delete(&meta.id).unwrap();
        }

        let cm2 = ContentManager::open(store, crypt, ContentManagerConfig::default()).unwrap();
        assert_eq!(cm2.get_content(&id).unwrap(), data);
    }

    #[test]
    fn compaction_preserves_live_set_and_reduces_blob_count() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> =
            Arc::new(FilesystemBlobStore::open(dir.path(), FsyncLevel::None).unwrap());
        let crypt = Arc::new(CryptConfig::new(
            [2u8; 32],
            HashAlgorithm::HmacSha256_128,
            EncryptionAlgorithm::Aes256CtrHmacSha256,
        ));
        let cm = ContentManager::open(store.clone(), crypt, ContentManagerConfig::default()).unwrap();

        let mut ids = Vec::new();
        for i in 0..5u8 {
            let id = cm.write_content(&vec![i; 5000], None).unwrap();
            ids.push(id);
            cm.flush().unwrap();
        }

        let before = store.list(INDEX_BLOB_PREFIX).unwrap().len();
        assert!(before >= 5);

        cm.compact_indexes().unwrap();

        let after = store.list(INDEX_BLOB_PREFIX).unwrap().len();
        assert_eq!(after, 1);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(cm.get_content(id).unwrap(), vec![i as u8; 5000]);
        }
    }

    #[test]
    fn large_object_roundtrips_across_multiple_packs() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> =
            Arc::new(FilesystemBlobStore::open(dir.path(), FsyncLevel::None).unwrap());
        let crypt = Arc::new(CryptConfig::new(
            [3u8; 32],
            HashAlgorithm::HmacSha256_128,
            EncryptionAlgorithm::Aes256CtrHmacSha256,
        ));
        let cfg = ContentManagerConfig {
            max_pack_size: 16 * 1024, // force several packs
            ..Default::default()
        };
        let cm = ContentManager::open(store.clone(), crypt.clone(), cfg.clone()).unwrap();

        let mut ids = Vec::new();
        for i in 0..20u32 {
            let mut data = vec![0u8; 4000];
            data[0..4].copy_from_slice(&i.to_le_bytes());
            ids.push((i, cm.write_content(&data, None).unwrap()));
        }
        cm.flush().unwrap();
        drop(cm);

        let cm2 = ContentManager::open(store, crypt, cfg).unwrap();
        for (i, id) in ids {
            let data = cm2.get_content(&id).unwrap();
            assert_eq!(&data[0..4], &i.to_le_bytes());
        }
    }

    #[test]
    fn corrupted_pack_surfaces_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> =
            Arc::new(FilesystemBlobStore::open(dir.path(), FsyncLevel::None).unwrap());
        let crypt = Arc::new(CryptConfig::new(
            [4u8; 32],
            HashAlgorithm::HmacSha256_128,
            EncryptionAlgorithm::Aes256CtrHmacSha256,
        ));
        let cm = ContentManager::open(store.clone(), crypt, ContentManagerConfig::default()).unwrap();
        let id = cm.write_content(&vec![5u8; 8000], None).unwrap();
        cm.flush().unwrap();

        // Flip a byte inside the pack on disk.
        let packs = store.list(PACK_BLOB_PREFIX).unwrap();
        assert_eq!(packs.len(), 1);
        let pack_id = packs[0].id.clone();
        let mut bytes = store.get(&pack_id, 0, None).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        store.put(&pack_id, &bytes).unwrap();

        assert!(matches!(cm.get_content(&id), Err(RepoError::IntegrityError(_))));
    }
}
