//! Password-based key derivation for the master key.
//!
//! Grounded in the `pbkdf2_hmac` use in `CryptConfig::new`
//! (pbs-tools/crypt_config.rs), generalized to the two algorithms the format
//! blob names: scrypt and PBKDF2-SHA256.

use openssl::hash::MessageDigest;
use openssl::pkcs5::{pbkdf2_hmac, scrypt};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum KeyDerivation {
    Scrypt {
        #[serde(with = "base64_bytes")]
        salt: Vec<u8>,
        n: u64,
        r: u64,
        p: u64,
    },
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256 {
        #[serde(with = "base64_bytes")]
        salt: Vec<u8>,
        iterations: u32,
    },
}

impl KeyDerivation {
    pub fn new_scrypt(salt: Vec<u8>) -> Self {
        KeyDerivation::Scrypt {
            salt,
            n: 65536,
            r: 8,
            p: 1,
        }
    }

    pub fn new_pbkdf2(salt: Vec<u8>) -> Self {
        KeyDerivation::Pbkdf2Sha256 {
            salt,
            iterations: 600_000,
        }
    }

    pub fn derive_key(&self, password: &[u8]) -> anyhow::Result<[u8; 32]> {
        let mut key = [0u8; 32];
        match self {
            KeyDerivation::Scrypt { salt, n, r, p } => {
                scrypt(
                    password,
                    salt,
                    *n,
                    *r,
                    *p,
                    128 * 1024 * 1024, // generous max_mem, mirrors teacher defaults
                    &mut key,
                )?;
            }
            KeyDerivation::Pbkdf2Sha256 { salt, iterations } => {
                pbkdf2_hmac(password, salt, *iterations as usize, MessageDigest::sha256(), &mut key)?;
            }
        }
        Ok(key)
    }
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pbkdf2_is_deterministic() {
        let kdf = KeyDerivation::new_pbkdf2(vec![1, 2, 3, 4]);
        let k1 = kdf.derive_key(b"hunter2").unwrap();
        let k2 = kdf.derive_key(b"hunter2").unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn different_salts_differ() {
        let kdf_a = KeyDerivation::new_pbkdf2(vec![1]);
        let kdf_b = KeyDerivation::new_pbkdf2(vec![2]);
        assert_ne!(
            kdf_a.derive_key(b"pw").unwrap(),
            kdf_b.derive_key(b"pw").unwrap()
        );
    }

    #[test]
    fn scrypt_roundtrip_serde() {
        let kdf = KeyDerivation::new_scrypt(vec![9, 9, 9]);
        let json = serde_json::to_string(&kdf).unwrap();
        let back: KeyDerivation = serde_json::from_str(&json).unwrap();
        assert_eq!(kdf, back);
    }
}
