//! Manifest manager: small labelled JSON records (snapshots, policies,
//! anything the caller wants to find by label rather than by id), stored in
//! batches ("manifest blocks") on top of the content manager.
//!
//! Grounded in `BackupManifest` (pbs-datastore/src/manifest.rs)
//! for the record shape (JSON body plus metadata) and its gzip'd-blob storage
//! convention, generalized from "one manifest per snapshot directory" to a
//! multi-writer put/get/find/delete/flush/compact/refresh API over many
//! manifests sharing one underlying store, which unifies what used to be
//! split between a per-snapshot manifest and a separate system config store.
//! Compaction's whole-set rebuild is grounded in `CachedUserInfo::new`
//! (pbs-config/src/cached_user_info.rs): drop everything and reload from the
//! source of truth rather than patching.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write as _};
use std::sync::{Arc, Mutex};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use repo_content::ContentManager;
use repo_types::{parallel, CancellationToken, ContentId, Result};

pub const MANIFEST_BLOB_PREFIX: u8 = b'm';

/// Once a manager has written this many still-live blocks, the next `flush`
/// triggers a `compact` to bound the number of blocks `refresh`/`find` must
/// read.
const AUTO_COMPACT_THRESHOLD: usize = 16;

/// Default size of the worker pool `refresh` uses to fetch manifest blocks
/// concurrently.
const REFRESH_WORKERS: usize = 8;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(with = "id_hex")]
    pub id: ContentId,
    pub labels: BTreeMap<String, String>,
    pub content: serde_json::Value,
    /// Milliseconds since the Unix epoch; the tie-break field, same rule as
    /// the content manager's index entries.
    pub mod_time: i64,
    #[serde(default)]
    pub deleted: bool,
}

mod id_hex {
    use repo_types::ContentId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &ContentId, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&id.to_hex())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ContentId, D::Error> {
        let s = String::deserialize(d)?;
        ContentId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn fresh_manifest_id() -> ContentId {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    ContentId::new(Some(MANIFEST_BLOB_PREFIX), &bytes)
}

struct ManagerState {
    pending: BTreeMap<ContentId, Manifest>,
    committed: BTreeMap<ContentId, Manifest>,
    committed_block_ids: HashSet<ContentId>,
}

pub struct ManifestManager {
    content_manager: Arc<ContentManager>,
    state: Mutex<ManagerState>,
}

impl ManifestManager {
    /// Opens a manifest manager over an existing content manager, loading
    /// every manifest block found under the `m` prefix.
    pub fn open(content_manager: Arc<ContentManager>) -> Result<Self> {
        let mgr = ManifestManager {
            content_manager,
            state: Mutex::new(ManagerState {
                pending: BTreeMap::new(),
                committed: BTreeMap::new(),
                committed_block_ids: HashSet::new(),
            }),
        };
        mgr.refresh()?;
        Ok(mgr)
    }

    /// Stores a new manifest with the given labels and JSON content,
    /// returning its freshly generated id. Visible to `get`/`find` from this
    /// manager immediately, even before the next `flush`.
    pub fn put(&self, labels: BTreeMap<String, String>, content: serde_json::Value) -> Result<ContentId> {
        match labels.get("type") {
            Some(t) if !t.is_empty() => {}
            _ => {
                return Err(repo_types::RepoError::InvalidConfiguration(
                    "manifest labels must include a non-empty \"type\"".to_string(),
                ))
            }
        }
        let mut state = self.state.lock().unwrap();
        let id = fresh_manifest_id();
        let manifest = Manifest {
            id: id.clone(),
            labels,
            content,
            mod_time: now_millis(),
            deleted: false,
        };
        state.pending.insert(id.clone(), manifest);
        Ok(id)
    }

    pub fn get(&self, id: &ContentId) -> Option<Manifest> {
        let state = self.state.lock().unwrap();
        match state.pending.get(id).or_else(|| state.committed.get(id)) {
            Some(m) if !m.deleted => Some(m.clone()),
            _ => None,
        }
    }

    /// All live manifests whose labels are a superset of `criteria`, sorted
    /// by `mod_time` ascending.
    pub fn find(&self, criteria: &BTreeMap<String, String>) -> Vec<Manifest> {
        let state = self.state.lock().unwrap();
        let mut merged: BTreeMap<ContentId, Manifest> = state.committed.clone();
        for (id, m) in &state.pending {
            merge_one(&mut merged, id.clone(), m.clone());
        }
        let mut found: Vec<Manifest> = merged
            .into_values()
            .filter(|m| !m.deleted)
            .filter(|m| criteria.iter().all(|(k, v)| m.labels.get(k) == Some(v)))
            .collect();
        found.sort_by_key(|m| m.mod_time);
        found
    }

    /// Tombstones a manifest; it stops appearing in `get`/`find` immediately,
    /// and the tombstone is durably recorded on the next `flush`.
    pub fn delete(&self, id: &ContentId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let labels = state
            .pending
            .get(id)
            .or_else(|| state.committed.get(id))
            .map(|m| m.labels.clone())
            .unwrap_or_default();
        state.pending.insert(
            id.clone(),
            Manifest {
                id: id.clone(),
                labels,
                content: serde_json::Value::Null,
                mod_time: now_millis(),
                deleted: true,
            },
        );
        Ok(())
    }

    /// Writes every pending manifest (including tombstones) as one gzip'd
    /// JSON block via the content manager, then folds it into the committed
    /// view. No-op if nothing is pending. Auto-compacts when the number of
    /// live blocks has grown large enough to slow down `refresh`/`find`.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.pending.is_empty() {
            return Ok(());
        }

        let pending = std::mem::take(&mut state.pending);
        let block_id = self.write_block(pending.values())?;

        for (id, m) in pending {
            merge_one(&mut state.committed, id, m);
        }
        state.committed_block_ids.insert(block_id);

        let needs_compact = state.committed_block_ids.len() >= AUTO_COMPACT_THRESHOLD;
        drop(state);
        if needs_compact {
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrites every live block into a single new block, then deletes the
    /// superseded ones. `disable_index_flush`/`enable_index_flush` on the
    /// content manager make the replacement and the deletions appear
    /// atomically to a concurrent index compaction.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.committed_block_ids.len() <= 1 {
            return Ok(());
        }

        self.content_manager.disable_index_flush();
        let result = self.compact_locked(&mut state);
        self.content_manager.enable_index_flush();
        result
    }

    fn compact_locked(&self, state: &mut ManagerState) -> Result<()> {
        let new_block_id = self.write_block(state.committed.values())?;
        self.content_manager.flush()?;

        let old_blocks = std::mem::take(&mut state.committed_block_ids);
        for id in old_blocks {
            if id != new_block_id {
                self.content_manager.delete_content(&id)?;
            }
        }
        self.content_manager.flush()?;
        state.committed_block_ids.insert(new_block_id);
        Ok(())
    }

    /// Drops the in-memory committed view and rebuilds it from every
    /// manifest block currently reachable through the content manager.
    pub fn refresh(&self) -> Result<()> {
        self.refresh_cancellable(&CancellationToken::new())
    }

    /// As `refresh`, but fetches manifest blocks through a bounded pool of
    /// up to [`REFRESH_WORKERS`] concurrent workers and checks `cancel`
    /// before dispatching each one.
    ///
    /// A block that's vanished by the time it's fetched (`NotFound`) means a
    /// concurrent compactor already subsumed it into a newer block; it's
    /// silently skipped rather than treated as an error.
    pub fn refresh_cancellable(&self, cancel: &CancellationToken) -> Result<()> {
        let ids = self.content_manager.list_contents(&[MANIFEST_BLOB_PREFIX])?;
        let content_manager = &self.content_manager;

        let fetched: Vec<(ContentId, Vec<Manifest>)> =
            parallel::map_bounded(ids, REFRESH_WORKERS, cancel, |block_id| {
                let manifests = match content_manager.get_content(&block_id) {
                    Ok(bytes) => decode_block(&bytes)?,
                    Err(repo_types::RepoError::NotFound(_)) => Vec::new(),
                    Err(e) => return Err(e),
                };
                Ok((block_id, manifests))
            })?;

        let mut committed = BTreeMap::new();
        let mut block_ids = HashSet::new();
        for (block_id, manifests) in fetched {
            if manifests.is_empty() {
                continue; // vanished under our feet, or genuinely empty
            }
            for m in manifests {
                merge_one(&mut committed, m.id.clone(), m);
            }
            block_ids.insert(block_id);
        }

        let mut state = self.state.lock().unwrap();
        state.committed = committed;
        state.committed_block_ids = block_ids;
        Ok(())
    }

    fn write_block<'a>(&self, manifests: impl Iterator<Item = &'a Manifest>) -> Result<ContentId> {
        let list: Vec<&Manifest> = manifests.collect();
        let bytes = encode_block(&list)?;
        self.content_manager.write_content(&bytes, Some(MANIFEST_BLOB_PREFIX))
    }
}

/// Applies the greatest-mod_time-wins tie-break rule used throughout this
/// repository's metadata layers. On an exact tie a tombstone wins over a
/// live entry, since blocks can be merged in any order and a deletion must
/// never depend on which block happens to be folded in last.
fn merge_one(map: &mut BTreeMap<ContentId, Manifest>, id: ContentId, incoming: Manifest) {
    match map.get(&id) {
        Some(existing) if existing.mod_time > incoming.mod_time => {}
        Some(existing) if existing.mod_time == incoming.mod_time && existing.deleted && !incoming.deleted => {}
        _ => {
            map.insert(id, incoming);
        }
    }
}

fn encode_block(manifests: &[&Manifest]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(manifests).map_err(|e| repo_types::RepoError::Other(e.into()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| repo_types::RepoError::Other(e.into()))?;
    encoder.finish().map_err(|e| repo_types::RepoError::Other(e.into()))
}

fn decode_block(bytes: &[u8]) -> Result<Vec<Manifest>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| repo_types::RepoError::Other(e.into()))?;
    serde_json::from_slice(&json).map_err(|e| repo_types::RepoError::Other(e.into()))
}
