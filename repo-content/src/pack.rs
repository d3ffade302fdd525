//! On-disk pack blob format: many encrypted records followed by an optional
//! encrypted local index and a fixed-length footer.
//!
//! Grounded in `DataBlob` (pbs-datastore/data_blob.rs) — magic + CRC32 + IV +
//! tag framing for one encoded unit — generalized from "one `DataBlob` per
//! stored object" to "many records concatenated into one pack". Each record
//! is sealed individually (AEAD per record) with the record's offset as
//! associated data, rather than the whole pack being one AEAD stream, so a
//! single corrupt record never prevents reading its siblings.

use anyhow::{bail, Context, Result};
use repo_crypto::cipher::EncryptionAlgorithm;

pub const PACK_MAGIC: [u8; 8] = *b"RCPACK01";
pub const PACK_FORMAT_VERSION: u32 = 1;

/// Fixed-length footer appended after the record region and the (optional)
/// local index. All integers are little-endian.
pub struct PackFooter {
    pub version: u32,
    pub format: u32,
    pub total_len: u64,
    pub local_index_offset: u64,
    pub local_index_length: u64,
}

pub const FOOTER_LEN: usize = 8 // magic
    + 4 // version
    + 4 // format
    + 8 // total_len
    + 8 // local_index_offset
    + 8 // local_index_length
    + 4; // crc32

impl PackFooter {
    fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut buf = [0u8; FOOTER_LEN];
        let mut w = 0;
        buf[w..w + 8].copy_from_slice(&PACK_MAGIC);
        w += 8;
        buf[w..w + 4].copy_from_slice(&self.version.to_le_bytes());
        w += 4;
        buf[w..w + 4].copy_from_slice(&self.format.to_le_bytes());
        w += 4;
        buf[w..w + 8].copy_from_slice(&self.total_len.to_le_bytes());
        w += 8;
        buf[w..w + 8].copy_from_slice(&self.local_index_offset.to_le_bytes());
        w += 8;
        buf[w..w + 8].copy_from_slice(&self.local_index_length.to_le_bytes());
        w += 8;
        let crc = crc32fast::hash(&buf[..w]);
        buf[w..w + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_LEN {
            bail!("pack footer has wrong length ({})", buf.len());
        }
        let magic = &buf[0..8];
        if magic != PACK_MAGIC {
            bail!("pack footer has wrong magic number");
        }
        let crc_expected = u32::from_le_bytes(buf[FOOTER_LEN - 4..].try_into().unwrap());
        let crc_actual = crc32fast::hash(&buf[..FOOTER_LEN - 4]);
        if crc_expected != crc_actual {
            bail!("pack footer CRC mismatch - pack is corrupt");
        }
        let mut r = 8;
        let version = u32::from_le_bytes(buf[r..r + 4].try_into().unwrap());
        r += 4;
        let format = u32::from_le_bytes(buf[r..r + 4].try_into().unwrap());
        r += 4;
        let total_len = u64::from_le_bytes(buf[r..r + 8].try_into().unwrap());
        r += 8;
        let local_index_offset = u64::from_le_bytes(buf[r..r + 8].try_into().unwrap());
        r += 8;
        let local_index_length = u64::from_le_bytes(buf[r..r + 8].try_into().unwrap());
        Ok(PackFooter {
            version,
            format,
            total_len,
            local_index_offset,
            local_index_length,
        })
    }
}

/// Seals `plaintext` as one pack record: `[u32 record_len][nonce][ciphertext||tag]`.
/// `offset` (the record's position in the pack) is bound in as AEAD associated
/// data so a record can't be silently moved within (or between) packs.
pub fn seal_record(
    algo: EncryptionAlgorithm,
    enc_key: &[u8; 32],
    mac_key: &[u8; 32],
    offset: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let nonce = random_nonce(algo.nonce_size());
    let aad = offset.to_le_bytes();
    let sealed = algo
        .seal(enc_key, mac_key, &nonce, &aad, plaintext)
        .context("sealing pack record")?;

    let body_len = nonce.len() + sealed.len();
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&(body_len as u32).to_le_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of `seal_record`, given the byte offset of the `[u32 len]` prefix
/// within the pack (used as AAD, matching `seal_record`).
pub fn open_record(
    algo: EncryptionAlgorithm,
    enc_key: &[u8; 32],
    mac_key: &[u8; 32],
    offset: u64,
    record: &[u8],
) -> Result<Vec<u8>> {
    if record.len() < 4 {
        bail!("pack record too short to contain a length prefix");
    }
    let declared_len = u32::from_le_bytes(record[0..4].try_into().unwrap()) as usize;
    let body = &record[4..];
    if body.len() != declared_len {
        bail!("pack record length mismatch (declared {declared_len}, got {})", body.len());
    }
    let nonce_len = algo.nonce_size();
    if body.len() < nonce_len {
        bail!("pack record shorter than its nonce");
    }
    let (nonce, sealed) = body.split_at(nonce_len);
    let aad = offset.to_le_bytes();
    algo.open(enc_key, mac_key, nonce, &aad, sealed)
        .context("opening pack record (authentication failed)")
}

fn random_nonce(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut nonce = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Appends the (optional) encrypted local index and footer to a completed
/// pack body, returning the full pack bytes ready to hand to the blob store.
pub fn seal_pack(
    mut body: Vec<u8>,
    local_index_plain: Option<&[u8]>,
    algo: EncryptionAlgorithm,
    enc_key: &[u8; 32],
    mac_key: &[u8; 32],
) -> Result<Vec<u8>> {
    let (local_index_offset, local_index_length) = match local_index_plain {
        Some(plain) => {
            let offset = body.len() as u64;
            let sealed = seal_record(algo, enc_key, mac_key, offset, plain)?;
            let length = sealed.len() as u64;
            body.extend_from_slice(&sealed);
            (offset, length)
        }
        None => (0, 0),
    };

    let footer = PackFooter {
        version: PACK_FORMAT_VERSION,
        format: 1,
        total_len: body.len() as u64 + FOOTER_LEN as u64,
        local_index_offset,
        local_index_length,
    };
    body.extend_from_slice(&footer.encode());
    Ok(body)
}

/// Reads and verifies the footer at the end of a full pack blob.
pub fn read_footer(pack_bytes: &[u8]) -> Result<PackFooter> {
    if pack_bytes.len() < FOOTER_LEN {
        bail!("pack too small to contain a footer");
    }
    let footer = PackFooter::decode(&pack_bytes[pack_bytes.len() - FOOTER_LEN..])?;
    if footer.total_len != pack_bytes.len() as u64 {
        bail!(
            "pack footer declares length {} but blob is {} bytes",
            footer.total_len,
            pack_bytes.len()
        );
    }
    Ok(footer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let algo = EncryptionAlgorithm::Aes256CtrHmacSha256;
        let enc_key = [1u8; 32];
        let mac_key = [2u8; 32];
        let record = seal_record(algo, &enc_key, &mac_key, 0, b"hello content").unwrap();
        let plain = open_record(algo, &enc_key, &mac_key, 0, &record).unwrap();
        assert_eq!(plain, b"hello content");
    }

    #[test]
    fn record_offset_is_authenticated() {
        let algo = EncryptionAlgorithm::Aes256CtrHmacSha256;
        let enc_key = [1u8; 32];
        let mac_key = [2u8; 32];
        let record = seal_record(algo, &enc_key, &mac_key, 10, b"data").unwrap();
        // Moving the record to a different offset must fail authentication.
        assert!(open_record(algo, &enc_key, &mac_key, 11, &record).is_err());
    }

    #[test]
    fn footer_detects_corruption() {
        let body = vec![1, 2, 3, 4];
        let sealed = seal_pack(
            body,
            None,
            EncryptionAlgorithm::None,
            &[0; 32],
            &[0; 32],
        )
        .unwrap();
        let footer = read_footer(&sealed).unwrap();
        assert_eq!(footer.total_len as usize, sealed.len());

        let mut corrupted = sealed.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xff;
        assert!(read_footer(&corrupted).is_err());
    }

    #[test]
    fn local_index_roundtrip() {
        let algo = EncryptionAlgorithm::Chacha20Poly1305;
        let enc_key = [5u8; 32];
        let mac_key = [6u8; 32];
        let body = vec![9u8; 16];
        let sealed = seal_pack(body, Some(b"[local index json]"), algo, &enc_key, &mac_key).unwrap();
        let footer = read_footer(&sealed).unwrap();
        assert!(footer.local_index_length > 0);
        let region = &sealed[footer.local_index_offset as usize
            ..(footer.local_index_offset + footer.local_index_length) as usize];
        let plain = open_record(algo, &enc_key, &mac_key, footer.local_index_offset, region).unwrap();
        assert_eq!(plain, b"[local index json]");
    }
}
