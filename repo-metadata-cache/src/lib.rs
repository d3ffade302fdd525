//! Cache over small metadata blobs stored directly against the blob store
//! (the format blob, local user config, pre-manifest policies) rather than
//! packed content.
//!
//! The cache bookkeeping is grounded in `CachedUserInfo::new`
//! (pbs-config/src/cached_user_info.rs): drop the whole index and rebuild it
//! from the source of truth on refresh rather than patching incrementally.
//! The AEAD overlay is grounded in `CryptConfig`'s per-purpose key derivation
//! (pbs-tools/crypt_config.rs), here keyed per metadata name instead of per
//! chunk.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use rand::RngCore;

use repo_blob::BlobStore;
use repo_crypto::CryptConfig;
use repo_types::{parallel, BlobId, CancellationToken, RepoError, Result};

pub const BLOB_PREFIX: &str = "VLT";
const RESERVED_NAMES: [&str; 2] = ["format", "repo"];
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Default size of the worker pool `multi_get` fans its fetches out across.
const MULTI_GET_WORKERS: usize = 5;

fn blob_id_for(name: &str) -> BlobId {
    BlobId(format!("{BLOB_PREFIX}{name}"))
}

fn check_name(name: &str) -> Result<()> {
    if RESERVED_NAMES.contains(&name) {
        return Err(RepoError::InvalidConfiguration(format!(
            "'{name}' is a reserved metadata-cache name"
        )));
    }
    Ok(())
}

struct CacheEntry {
    cache_id: String,
    plaintext: Vec<u8>,
}

struct State {
    names: BTreeSet<String>,
    cache: HashMap<String, CacheEntry>,
}

pub struct MetadataCache {
    blob_store: Arc<dyn BlobStore>,
    crypt: Arc<CryptConfig>,
    state: Mutex<State>,
}

impl MetadataCache {
    pub fn open(blob_store: Arc<dyn BlobStore>, crypt: Arc<CryptConfig>) -> Result<Self> {
        let cache = MetadataCache {
            blob_store,
            crypt,
            state: Mutex::new(State {
                names: BTreeSet::new(),
                cache: HashMap::new(),
            }),
        };
        cache.refresh()?;
        Ok(cache)
    }

    /// Names with the given prefix, excluding reserved names.
    pub fn list(&self, prefix: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .names
            .range(prefix.to_string()..)
            .take_while(|n| n.starts_with(prefix))
            .filter(|n| !RESERVED_NAMES.contains(&n.as_str()))
            .cloned()
            .collect()
    }

    /// Returns a copy of the bytes stored under `name`, serving from the
    /// in-memory cache when the underlying blob hasn't changed since it was
    /// last fetched.
    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        check_name(name)?;
        let blob_id = blob_id_for(name);
        let meta = self.lookup_meta(&blob_id)?;
        let cache_id = cache_id_for(&meta);

        {
            let state = self.state.lock().unwrap();
            if let Some(entry) = state.cache.get(name) {
                if entry.cache_id == cache_id {
                    return Ok(entry.plaintext.clone());
                }
            }
        }

        let sealed = self.blob_store.get(&blob_id, 0, None)?;
        let plaintext = self.open_sealed(name, &sealed)?;

        let mut state = self.state.lock().unwrap();
        state.names.insert(name.to_string());
        state.cache.insert(
            name.to_string(),
            CacheEntry {
                cache_id,
                plaintext: plaintext.clone(),
            },
        );
        Ok(plaintext)
    }

    /// Encrypts and stores `bytes` under `name`, updating the in-memory maps
    /// under a single lock after the blob-store write completes.
    pub fn put(&self, name: &str, bytes: &[u8]) -> Result<()> {
        check_name(name)?;
        let blob_id = blob_id_for(name);
        let sealed = self.seal(name, bytes)?;
        self.blob_store.put(&blob_id, &sealed)?;

        let meta = self.lookup_meta(&blob_id)?;
        let cache_id = cache_id_for(&meta);

        let mut state = self.state.lock().unwrap();
        state.names.insert(name.to_string());
        state.cache.insert(
            name.to_string(),
            CacheEntry {
                cache_id,
                plaintext: bytes.to_vec(),
            },
        );
        Ok(())
    }

    /// Fetches several names concurrently through a bounded pool of up to
    /// [`MULTI_GET_WORKERS`] workers, in the same order as `names`. An error
    /// on any one name short-circuits the batch result, but fetches already
    /// in flight are allowed to finish rather than being aborted.
    pub fn multi_get(&self, names: &[String], cancel: &CancellationToken) -> Result<Vec<Vec<u8>>> {
        parallel::map_bounded(names.to_vec(), MULTI_GET_WORKERS, cancel, |name| self.get(&name))
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        check_name(name)?;
        let mut state = self.state.lock().unwrap();
        state.names.remove(name);
        state.cache.remove(name);
        drop(state);
        self.blob_store.delete(&blob_id_for(name))
    }

    /// Full relist against the blob store; replaces the name index
    /// atomically and drops cache entries for names no longer present.
    pub fn refresh(&self) -> Result<()> {
        let blobs = self.blob_store.list(BLOB_PREFIX)?;
        let names: BTreeSet<String> = blobs
            .iter()
            .filter_map(|m| m.id.0.strip_prefix(BLOB_PREFIX).map(|n| n.to_string()))
            .collect();

        let mut state = self.state.lock().unwrap();
        state.cache.retain(|name, _| names.contains(name));
        state.names = names;
        Ok(())
    }

    fn lookup_meta(&self, blob_id: &BlobId) -> Result<(u64, DateTime<Utc>)> {
        let listed = self.blob_store.list(&blob_id.0)?;
        listed
            .into_iter()
            .find(|m| m.id == *blob_id)
            .map(|m| (m.length, m.modified))
            .ok_or_else(|| RepoError::NotFound(blob_id.to_string()))
    }

    fn seal(&self, name: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.crypt.expand_label("metadata-cache-aes", name.as_bytes());
        let aad = self.crypt.expand_label("metadata-cache-checksum", name.as_bytes());
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(Cipher::aes_256_gcm(), &key, Some(&nonce), &aad, plaintext, &mut tag)
            .map_err(|e| RepoError::Other(e.into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&tag);
        Ok(out)
    }

    fn open_sealed(&self, name: &str, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(RepoError::IntegrityError("metadata blob too short".into()));
        }
        let (nonce, rest) = sealed.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

        let key = self.crypt.expand_label("metadata-cache-aes", name.as_bytes());
        let aad = self.crypt.expand_label("metadata-cache-checksum", name.as_bytes());

        decrypt_aead(Cipher::aes_256_gcm(), &key, Some(nonce), &aad, ciphertext, tag)
            .map_err(|_| RepoError::IntegrityError(format!("metadata-cache entry '{name}' failed authentication")))
    }
}

fn cache_id_for(meta: &(u64, DateTime<Utc>)) -> String {
    format!("{}:{}", meta.0, meta.1.timestamp_millis())
}
