//! Index entries and index blobs: the sorted, append-only mapping from
//! content id to pack location.
//!
//! Grounded in `fixed_index.rs`/`dynamic_index.rs` (a binary, header-plus-
//! records file format aggregating many digests), generalized from "array
//! of fixed/variable-size chunk digests for one backup archive" to
//! "content id -> location map with tombstones and a last-write-wins merge
//! rule".

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use repo_types::{BlobId, ContentId};

pub const INDEX_MAGIC: [u8; 8] = *b"RCIDX001";
pub const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// Payload stored directly in the index entry, below
    /// `max_inline_content_length`.
    Inline(Vec<u8>),
    /// Payload stored in a pack blob at `[offset, offset+length)`.
    Packed {
        pack_id: BlobId,
        offset: u64,
        length: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub content_id: ContentId,
    pub location: Location,
    /// Milliseconds since the Unix epoch; the tie-break field.
    pub timestamp: i64,
    pub deleted: bool,
    pub format_version: u8,
}

impl IndexEntry {
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }
}

/// An in-memory merged view of one or more index blobs: content id -> the
/// single winning entry, by the greatest-timestamp-wins rule.
#[derive(Default, Clone)]
pub struct IndexSet {
    entries: BTreeMap<ContentId, IndexEntry>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `entry`, applying the tie-break rule: the entry with the
    /// greatest timestamp wins. On an exact timestamp tie a tombstone wins
    /// over a live entry (deletions never get silently resurrected by merge
    /// order); if both sides agree on deleted-ness the incoming entry wins.
    pub fn insert(&mut self, entry: IndexEntry) {
        match self.entries.get(&entry.content_id) {
            Some(existing) if existing.timestamp > entry.timestamp => {}
            Some(existing) if existing.timestamp == entry.timestamp && existing.deleted && !entry.deleted => {}
            _ => {
                self.entries.insert(entry.content_id.clone(), entry);
            }
        }
    }

    pub fn get(&self, id: &ContentId) -> Option<&IndexEntry> {
        self.entries.get(id)
    }

    /// Merge `other` into `self` using the same tie-break rule, consuming it.
    pub fn merge(&mut self, other: IndexSet) {
        for (_, entry) in other.entries {
            self.insert(entry);
        }
    }

    /// Removes entries that are still present with exactly the id/timestamp/
    /// deleted-ness recorded in `snapshot`. Used to commit a flush that wrote
    /// `snapshot` durably: an entry superseded by a newer write that raced
    /// the flush no longer matches and is left in place rather than dropped.
    pub fn remove_if_unchanged(&mut self, snapshot: &IndexSet) {
        for entry in snapshot.entries.values() {
            if let Some(current) = self.entries.get(&entry.content_id) {
                if current.timestamp == entry.timestamp && current.deleted == entry.deleted {
                    self.entries.remove(&entry.content_id);
                }
            }
        }
    }

    /// Live (non-tombstone) entries whose content id starts with `prefix`.
    pub fn list_live<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = &'a IndexEntry> {
        self.entries
            .values()
            .filter(move |e| !e.deleted && e.content_id.has_prefix(prefix))
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }
}

const FLAG_DELETED: u8 = 0b01;
const FLAG_INLINE: u8 = 0b10;

/// Serializes `entries` (assumed already merged/deduplicated) as one index
/// blob: `magic || version || count || entry...`, sorted by content id since
/// `IndexSet` iterates its `BTreeMap` in key order.
pub fn encode_index(set: &IndexSet) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&INDEX_MAGIC);
    out.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(set.len() as u32).to_le_bytes());

    for entry in set.iter() {
        let id_bytes = entry.content_id.as_bytes();
        out.extend_from_slice(&(id_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(id_bytes);

        let mut flags = 0u8;
        if entry.deleted {
            flags |= FLAG_DELETED;
        }
        if matches!(entry.location, Location::Inline(_)) {
            flags |= FLAG_INLINE;
        }
        out.push(flags);
        out.extend_from_slice(&entry.timestamp.to_le_bytes());
        out.push(entry.format_version);

        match &entry.location {
            Location::Inline(data) => {
                out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                out.extend_from_slice(data);
            }
            Location::Packed {
                pack_id,
                offset,
                length,
            } => {
                let pack_bytes = pack_id.0.as_bytes();
                out.extend_from_slice(&(pack_bytes.len() as u16).to_le_bytes());
                out.extend_from_slice(pack_bytes);
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&length.to_le_bytes());
            }
        }
    }

    out
}

/// Parses a single index blob written by `encode_index`.
pub fn decode_index(data: &[u8]) -> Result<IndexSet> {
    if data.len() < 16 {
        bail!("index blob too small");
    }
    if data[0..8] != INDEX_MAGIC {
        bail!("index blob has wrong magic number");
    }
    let version = u32::from_le_bytes(data[8..12].try_into().unwrap());
    if version != INDEX_FORMAT_VERSION {
        bail!("unsupported index format version {version}");
    }
    let count = u32::from_le_bytes(data[12..16].try_into().unwrap()) as usize;

    let mut cursor = 16;
    let mut set = IndexSet::new();

    for _ in 0..count {
        let id_len = read_u16(data, &mut cursor)? as usize;
        let id_bytes = read_bytes(data, &mut cursor, id_len)?;
        let content_id = ContentId::from_bytes(id_bytes);

        let flags = read_u8(data, &mut cursor)?;
        let timestamp = read_i64(data, &mut cursor)?;
        let format_version = read_u8(data, &mut cursor)?;

        let location = if flags & FLAG_INLINE != 0 {
            let len = read_u32(data, &mut cursor)? as usize;
            let bytes = read_bytes(data, &mut cursor, len)?;
            Location::Inline(bytes)
        } else {
            let pack_id_len = read_u16(data, &mut cursor)? as usize;
            let pack_id_bytes = read_bytes(data, &mut cursor, pack_id_len)?;
            let pack_id = BlobId(String::from_utf8(pack_id_bytes)?);
            let offset = read_u64(data, &mut cursor)?;
            let length = read_u64(data, &mut cursor)?;
            Location::Packed {
                pack_id,
                offset,
                length,
            }
        };

        set.insert(IndexEntry {
            content_id,
            location,
            timestamp,
            deleted: flags & FLAG_DELETED != 0,
            format_version,
        });
    }

    Ok(set)
}

fn read_bytes(data: &[u8], cursor: &mut usize, len: usize) -> Result<Vec<u8>> {
    if data.len() < *cursor + len {
        bail!("index blob truncated");
    }
    let out = data[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(out)
}

fn read_u8(data: &[u8], cursor: &mut usize) -> Result<u8> {
    Ok(read_bytes(data, cursor, 1)?[0])
}

fn read_u16(data: &[u8], cursor: &mut usize) -> Result<u16> {
    Ok(u16::from_le_bytes(read_bytes(data, cursor, 2)?.try_into().unwrap()))
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(read_bytes(data, cursor, 4)?.try_into().unwrap()))
}

fn read_u64(data: &[u8], cursor: &mut usize) -> Result<u64> {
    Ok(u64::from_le_bytes(read_bytes(data, cursor, 8)?.try_into().unwrap()))
}

fn read_i64(data: &[u8], cursor: &mut usize) -> Result<i64> {
    Ok(i64::from_le_bytes(read_bytes(data, cursor, 8)?.try_into().unwrap()))
}
