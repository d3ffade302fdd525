//! Hash, AEAD encryption and key derivation primitives for the repository core.

pub mod cipher;
pub mod config;
pub mod hash;
pub mod kdf;

pub use cipher::EncryptionAlgorithm;
pub use config::CryptConfig;
pub use hash::HashAlgorithm;
pub use kdf::KeyDerivation;
