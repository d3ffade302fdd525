//! Repository handle: reads/creates the singleton format blob, derives keys
//! once, and wires the content manager, manifest manager and metadata cache
//! together over one blob store.
//!
//! Grounded in `CryptConfig::new` (pbs-tools/crypt_config.rs) for "derive
//! once, keep in memory for the handle's lifetime", and in
//! `src/config.rs`'s 0700-directory/0600-file discipline for the local
//! configuration file.

pub mod format;
pub mod local_config;

use std::sync::Arc;

use repo_blob::BlobStore;
use repo_content::{ContentManager, ContentManagerConfig};
use repo_crypto::{CryptConfig, EncryptionAlgorithm, HashAlgorithm, KeyDerivation};
use repo_manifest::ManifestManager;
use repo_metadata_cache::MetadataCache;
use repo_types::Result;

pub use format::FormatBlob;
pub use local_config::LocalConfig;

pub struct Repository {
    pub content: Arc<ContentManager>,
    pub manifests: ManifestManager,
    pub metadata: MetadataCache,
    pub crypt: Arc<CryptConfig>,
    pub unique_id: Vec<u8>,
}

impl Repository {
    /// Creates a new repository: generates a random master key and unique
    /// id, writes the format blob, then opens the three managers over an
    /// empty store.
    pub fn create(
        blob_store: Arc<dyn BlobStore>,
        password: &[u8],
        hash: HashAlgorithm,
        encryption: EncryptionAlgorithm,
        kdf: KeyDerivation,
        max_pack_size: u64,
        max_inline_content_length: usize,
    ) -> Result<Self> {
        let format = FormatBlob::create(
            password,
            hash,
            encryption,
            kdf,
            max_pack_size,
            max_inline_content_length,
        )?;
        blob_store.put(&format::format_blob_id(), &format.encode())?;
        Self::open_with(blob_store, format)
    }

    /// Reads the format blob exactly once, derives the keys from `password`,
    /// and opens the three managers.
    pub fn open(blob_store: Arc<dyn BlobStore>, password: &[u8]) -> Result<Self> {
        let bytes = blob_store.get(&format::format_blob_id(), 0, None)?;
        let format = FormatBlob::decode(&bytes, password)?;
        Self::open_with(blob_store, format)
    }

    fn open_with(blob_store: Arc<dyn BlobStore>, format: FormatBlob) -> Result<Self> {
        let crypt = Arc::new(CryptConfig::new(format.secrets.master_key, format.hash, format.encryption));
        let content_config = ContentManagerConfig {
            hash: format.hash,
            encryption: format.encryption,
            max_pack_size: format.secrets.max_pack_size,
            max_inline_content_length: format.secrets.max_inline_content_length,
        };
        let content = Arc::new(ContentManager::open(blob_store.clone(), crypt.clone(), content_config)?);
        let manifests = ManifestManager::open(content.clone())?;
        let metadata = MetadataCache::open(blob_store, crypt.clone())?;
        Ok(Repository {
            content,
            manifests,
            metadata,
            crypt,
            unique_id: format.unique_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_blob::fs::{FilesystemBlobStore, FsyncLevel};
    use repo_types::RepoError;

    fn store() -> (tempfile::TempDir, Arc<dyn BlobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> =
            Arc::new(FilesystemBlobStore::open(dir.path(), FsyncLevel::None).unwrap());
        (dir, store)
    }

    #[test]
    fn create_then_open_with_same_password() {
        let (_d, store) = store();
        Repository::create(
            store.clone(),
            b"hunter2",
            HashAlgorithm::HmacSha256_128,
            EncryptionAlgorithm::Aes256CtrHmacSha256,
            KeyDerivation::new_pbkdf2(vec![1, 2, 3, 4]),
            20 * 1024 * 1024,
            256,
        )
        .unwrap();

        let repo = Repository::open(store, b"hunter2").unwrap();
        let id = repo.content.write_content(b"hello", None).unwrap();
        assert_eq!(repo.content.get_content(&id).unwrap(), b"hello");
    }

    #[test]
    fn open_with_wrong_password_fails() {
        let (_d, store) = store();
        Repository::create(
            store.clone(),
            b"correct horse",
            HashAlgorithm::Blake2s256,
            EncryptionAlgorithm::Chacha20Poly1305,
            KeyDerivation::new_scrypt(vec![9, 9, 9, 9]),
            20 * 1024 * 1024,
            256,
        )
        .unwrap();

        let err = match Repository::open(store, b"wrong password") {
            Err(e) => e,
            Ok(_) => panic!("expected wrong-password open to fail"),
        };
        assert!(matches!(err, RepoError::IntegrityError(_)));
    }

    #[test]
    fn managers_share_one_repository() {
        let (_d, store) = store();
        Repository::create(
            store.clone(),
            b"pw",
            HashAlgorithm::HmacSha256_128,
            EncryptionAlgorithm::Aes256CtrHmacSha256,
            KeyDerivation::new_pbkdf2(vec![1]),
            20 * 1024 * 1024,
            256,
        )
        .unwrap();
        let repo = Repository::open(store, b"pw").unwrap();

        repo.metadata.put("local-user-config", b"{}").unwrap();
        let mut labels = std::collections::BTreeMap::new();
        labels.insert("type".to_string(), "snapshot".to_string());
        let manifest_id = repo
            .manifests
            .put(labels, serde_json::json!({"kind": "snapshot"}))
            .unwrap();

        assert_eq!(repo.metadata.get("local-user-config").unwrap(), b"{}");
        assert!(repo.manifests.get(&manifest_id).is_some());
    }
}
