//! Authenticated encryption.
//!
//! `AeadCipher::seal`/`open` generalize `DataBlob::encrypt_to`/
//! `decode_uncompressed_chunk` (pbs-datastore/data_blob.rs) from "one fixed
//! cipher (AES-256-GCM)" to a pair: AES-256-CTR+HMAC-SHA256 (encrypt-then-MAC,
//! since OpenSSL's CTR mode carries no tag of its own) and
//! CHACHA20-POLY1305 (a true AEAD, same `encrypt_aead`/`decrypt_aead` call
//! shape used for GCM).

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher as OsslCipher, Crypter, Mode};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EncryptionAlgorithm {
    Aes256CtrHmacSha256,
    Chacha20Poly1305,
    None,
}

impl EncryptionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes256CtrHmacSha256 => "AES-256-CTR+HMAC-SHA256",
            EncryptionAlgorithm::Chacha20Poly1305 => "CHACHA20-POLY1305",
            EncryptionAlgorithm::None => "NONE",
        }
    }

    pub fn nonce_size(&self) -> usize {
        match self {
            EncryptionAlgorithm::Aes256CtrHmacSha256 => 16,
            EncryptionAlgorithm::Chacha20Poly1305 => 12,
            EncryptionAlgorithm::None => 0,
        }
    }

    /// Bytes appended to ciphertext to carry the authentication tag.
    pub fn overhead(&self) -> usize {
        match self {
            EncryptionAlgorithm::Aes256CtrHmacSha256 => 32, // full HMAC-SHA256
            EncryptionAlgorithm::Chacha20Poly1305 => 16,
            EncryptionAlgorithm::None => 0,
        }
    }

    /// Seal `plaintext` under `(enc_key, mac_key)`, authenticating `aad`.
    /// Returns `ciphertext || tag`.
    pub fn seal(
        &self,
        enc_key: &[u8; 32],
        mac_key: &[u8; 32],
        nonce: &[u8],
        aad: &[u8],
        plaintext: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        match self {
            EncryptionAlgorithm::None => Ok(plaintext.to_vec()),
            EncryptionAlgorithm::Chacha20Poly1305 => {
                let mut tag = [0u8; 16];
                let ct = encrypt_aead(
                    OsslCipher::chacha20_poly1305(),
                    enc_key,
                    Some(nonce),
                    aad,
                    plaintext,
                    &mut tag,
                )?;
                let mut out = ct;
                out.extend_from_slice(&tag);
                Ok(out)
            }
            EncryptionAlgorithm::Aes256CtrHmacSha256 => {
                let ct = ctr_crypt(enc_key, nonce, plaintext)?;
                let tag = hmac_tag(mac_key, nonce, aad, &ct);
                let mut out = ct;
                out.extend_from_slice(&tag);
                Ok(out)
            }
        }
    }

    /// Inverse of `seal`: verify the tag, then decrypt. `sealed` is
    /// `ciphertext || tag` as produced by `seal`.
    pub fn open(
        &self,
        enc_key: &[u8; 32],
        mac_key: &[u8; 32],
        nonce: &[u8],
        aad: &[u8],
        sealed: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        let overhead = self.overhead();
        if sealed.len() < overhead {
            anyhow::bail!("sealed data shorter than authentication tag");
        }
        let (ct, tag) = sealed.split_at(sealed.len() - overhead);
        match self {
            EncryptionAlgorithm::None => Ok(ct.to_vec()),
            EncryptionAlgorithm::Chacha20Poly1305 => Ok(decrypt_aead(
                OsslCipher::chacha20_poly1305(),
                enc_key,
                Some(nonce),
                aad,
                ct,
                tag,
            )?),
            EncryptionAlgorithm::Aes256CtrHmacSha256 => {
                let expected = hmac_tag(mac_key, nonce, aad, ct);
                if !openssl::memcmp::eq(&expected, tag) {
                    anyhow::bail!("authentication tag mismatch");
                }
                ctr_crypt(enc_key, nonce, ct)
            }
        }
    }
}

impl std::str::FromStr for EncryptionAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "AES-256-CTR+HMAC-SHA256" => Ok(EncryptionAlgorithm::Aes256CtrHmacSha256),
            "CHACHA20-POLY1305" => Ok(EncryptionAlgorithm::Chacha20Poly1305),
            "NONE" => Ok(EncryptionAlgorithm::None),
            other => anyhow::bail!("unknown encryption algorithm '{other}'"),
        }
    }
}

fn ctr_crypt(key: &[u8; 32], nonce: &[u8], data: &[u8]) -> anyhow::Result<Vec<u8>> {
    // CTR mode is its own inverse; `Mode::Encrypt` decrypts too.
    let mut crypter = Crypter::new(OsslCipher::aes_256_ctr(), Mode::Encrypt, key, Some(nonce))?;
    let mut out = vec![0u8; data.len() + OsslCipher::aes_256_ctr().block_size()];
    let mut count = crypter.update(data, &mut out)?;
    count += crypter.finalize(&mut out[count..])?;
    out.truncate(count);
    Ok(out)
}

fn hmac_tag(mac_key: &[u8; 32], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> [u8; 32] {
    let pkey = PKey::hmac(mac_key).expect("valid hmac key");
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey).expect("signer");
    signer.update(nonce).unwrap();
    signer.update(aad).unwrap();
    signer.update(ciphertext).unwrap();
    let mut tag = [0u8; 32];
    signer.sign(&mut tag).unwrap();
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_ctr_hmac_roundtrip() {
        let algo = EncryptionAlgorithm::Aes256CtrHmacSha256;
        let enc_key = [7u8; 32];
        let mac_key = [9u8; 32];
        let nonce = [1u8; 16];
        let sealed = algo
            .seal(&enc_key, &mac_key, &nonce, b"aad", b"hello, pack!")
            .unwrap();
        let opened = algo.open(&enc_key, &mac_key, &nonce, b"aad", &sealed).unwrap();
        assert_eq!(opened, b"hello, pack!");
    }

    #[test]
    fn chacha_roundtrip() {
        let algo = EncryptionAlgorithm::Chacha20Poly1305;
        let enc_key = [3u8; 32];
        let mac_key = [0u8; 32]; // unused by this algorithm
        let nonce = [2u8; 12];
        let sealed = algo.seal(&enc_key, &mac_key, &nonce, b"", b"content bytes").unwrap();
        let opened = algo.open(&enc_key, &mac_key, &nonce, b"", &sealed).unwrap();
        assert_eq!(opened, b"content bytes");
    }

    #[test]
    fn tamper_detected() {
        let algo = EncryptionAlgorithm::Aes256CtrHmacSha256;
        let enc_key = [1u8; 32];
        let mac_key = [2u8; 32];
        let nonce = [3u8; 16];
        let mut sealed = algo.seal(&enc_key, &mac_key, &nonce, b"", b"data").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(algo.open(&enc_key, &mac_key, &nonce, b"", &sealed).is_err());
    }

    #[test]
    fn none_is_identity() {
        let algo = EncryptionAlgorithm::None;
        let sealed = algo.seal(&[0; 32], &[0; 32], &[], b"", b"plain").unwrap();
        assert_eq!(sealed, b"plain");
    }
}
