//! The singleton repository format blob: format version, unique repository
//! id, chosen algorithms, KDF parameters, and a master-key-protected blob of
//! per-repository secrets.

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;

use repo_crypto::{EncryptionAlgorithm, HashAlgorithm, KeyDerivation};
use repo_types::{BlobId, RepoError, Result};

pub const FORMAT_VERSION: u32 = 1;

pub fn format_blob_id() -> BlobId {
    BlobId::from("kopia.repository")
}

pub struct FormatSecrets {
    pub master_key: [u8; 32],
    pub max_pack_size: u64,
    pub max_inline_content_length: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InnerSecretsWire {
    #[serde(with = "base64_bytes")]
    master_key: Vec<u8>,
    max_pack_size: u64,
    max_inline_content_length: usize,
}

pub struct FormatBlob {
    pub version: u32,
    pub unique_id: Vec<u8>,
    pub hash: HashAlgorithm,
    pub encryption: EncryptionAlgorithm,
    pub kdf: KeyDerivation,
    pub secrets: FormatSecrets,
    encrypted_format_bytes: Vec<u8>,
}

impl FormatBlob {
    /// Generates a fresh master key and unique id, then seals the inner
    /// secrets under a key-encryption-key derived from `password` via `kdf`.
    pub fn create(
        password: &[u8],
        hash: HashAlgorithm,
        encryption: EncryptionAlgorithm,
        kdf: KeyDerivation,
        max_pack_size: u64,
        max_inline_content_length: usize,
    ) -> Result<Self> {
        let mut master_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut master_key);
        let mut unique_id = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut unique_id);

        let kek = kdf.derive_key(password).map_err(RepoError::Other)?;
        let inner = json!({
            "masterKey": base64::encode(master_key),
            "maxPackSize": max_pack_size,
            "maxInlineContentLength": max_inline_content_length,
        });
        let inner_bytes = serde_json::to_vec(&inner).map_err(|e| RepoError::Other(e.into()))?;
        let encrypted_format_bytes = seal_with_kek(&kek, &inner_bytes).map_err(RepoError::Other)?;

        Ok(FormatBlob {
            version: FORMAT_VERSION,
            unique_id,
            hash,
            encryption,
            kdf,
            secrets: FormatSecrets {
                master_key,
                max_pack_size,
                max_inline_content_length,
            },
            encrypted_format_bytes,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let wire = json!({
            "version": self.version,
            "uniqueID": base64::encode(&self.unique_id),
            "hash": self.hash.as_str(),
            "encryption": self.encryption.as_str(),
            "kdf": self.kdf,
            "encryptedFormatBytes": base64::encode(&self.encrypted_format_bytes),
        });
        serde_json::to_vec(&wire).expect("format blob always serializes")
    }

    /// Parses the wire JSON and unseals the inner secrets under the
    /// key-encryption-key derived from `password`. A wrong password or a
    /// tampered blob surfaces as `IntegrityError`.
    pub fn decode(bytes: &[u8], password: &[u8]) -> Result<Self> {
        let wire: FormatBlobWire =
            serde_json::from_slice(bytes).map_err(|e| RepoError::InvalidConfiguration(e.to_string()))?;

        let hash: HashAlgorithm = wire
            .hash
            .parse()
            .map_err(|e: anyhow::Error| RepoError::InvalidConfiguration(e.to_string()))?;
        let encryption: EncryptionAlgorithm = wire
            .encryption
            .parse()
            .map_err(|e: anyhow::Error| RepoError::InvalidConfiguration(e.to_string()))?;
        let unique_id =
            base64::decode(&wire.unique_id).map_err(|e| RepoError::InvalidConfiguration(e.to_string()))?;
        let encrypted_format_bytes = base64::decode(&wire.encrypted_format_bytes)
            .map_err(|e| RepoError::InvalidConfiguration(e.to_string()))?;

        let kek = wire.kdf.derive_key(password).map_err(RepoError::Other)?;
        let inner_bytes = open_with_kek(&kek, &encrypted_format_bytes)
            .map_err(|_| RepoError::IntegrityError("format blob authentication failed (wrong password?)".into()))?;
        let inner: InnerSecretsWire = serde_json::from_slice(&inner_bytes)
            .map_err(|e| RepoError::IntegrityError(format!("corrupt format blob inner json: {e}")))?;

        let mut master_key = [0u8; 32];
        if inner.master_key.len() != 32 {
            return Err(RepoError::IntegrityError("master key has unexpected length".into()));
        }
        master_key.copy_from_slice(&inner.master_key);

        Ok(FormatBlob {
            version: wire.version,
            unique_id,
            hash,
            encryption,
            kdf: wire.kdf,
            secrets: FormatSecrets {
                master_key,
                max_pack_size: inner.max_pack_size,
                max_inline_content_length: inner.max_inline_content_length,
            },
            encrypted_format_bytes,
        })
    }
}

#[derive(Deserialize)]
struct FormatBlobWire {
    version: u32,
    #[serde(rename = "uniqueID")]
    unique_id: String,
    hash: String,
    encryption: String,
    kdf: KeyDerivation,
    #[serde(rename = "encryptedFormatBytes")]
    encrypted_format_bytes: String,
}

/// AES-256-GCM under the password-derived key-encryption-key. Independent of
/// the repository's own chosen content encryption algorithm, since it must
/// be readable before that choice is known.
fn seal_with_kek(kek: &[u8; 32], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    use openssl::symm::{encrypt_aead, Cipher};
    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let mac_key = split_kek(kek);
    let mut tag = [0u8; 16];
    let ct = encrypt_aead(Cipher::aes_256_gcm(), kek, Some(&nonce), &mac_key, plaintext, &mut tag)?;
    let mut out = Vec::with_capacity(12 + ct.len() + 16);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    out.extend_from_slice(&tag);
    Ok(out)
}

fn open_with_kek(kek: &[u8; 32], sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
    use openssl::symm::{decrypt_aead, Cipher};
    anyhow::ensure!(sealed.len() >= 12 + 16, "format blob ciphertext too short");
    let (nonce, rest) = sealed.split_at(12);
    let (ct, tag) = rest.split_at(rest.len() - 16);
    let mac_key = split_kek(kek);
    Ok(decrypt_aead(Cipher::aes_256_gcm(), kek, Some(nonce), &mac_key, ct, tag)?)
}

/// Derives an associated-data value from the KEK so the AEAD binds to it
/// without reusing the raw key bytes as AAD.
fn split_kek(kek: &[u8; 32]) -> [u8; 32] {
    let pkey = PKey::hmac(kek).expect("valid hmac key");
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey).expect("signer");
    signer.update(b"format-blob-aad").unwrap();
    let mut out = [0u8; 32];
    signer.sign(&mut out).unwrap();
    out
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use repo_crypto::EncryptionAlgorithm;

    #[test]
    fn create_decode_roundtrip() {
        let format = FormatBlob::create(
            b"pw",
            HashAlgorithm::HmacSha256_128,
            EncryptionAlgorithm::Aes256CtrHmacSha256,
            KeyDerivation::new_pbkdf2(vec![1, 2, 3]),
            1024,
            64,
        )
        .unwrap();
        let bytes = format.encode();
        let decoded = FormatBlob::decode(&bytes, b"pw").unwrap();
        assert_eq!(decoded.secrets.master_key, format.secrets.master_key);
        assert_eq!(decoded.unique_id, format.unique_id);
    }

    #[test]
    fn wrong_password_is_integrity_error() {
        let format = FormatBlob::create(
            b"right",
            HashAlgorithm::Blake2s256,
            EncryptionAlgorithm::Chacha20Poly1305,
            KeyDerivation::new_scrypt(vec![4, 5, 6]),
            2048,
            128,
        )
        .unwrap();
        let bytes = format.encode();
        assert!(matches!(
            FormatBlob::decode(&bytes, b"wrong"),
            Err(RepoError::IntegrityError(_))
        ));
    }
}
