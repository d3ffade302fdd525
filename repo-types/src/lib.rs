//! Error taxonomy and identifier types shared by the repository core crates.

use std::fmt;

/// The error kinds exposed at the public interface.
///
/// Variants are stable, caller-facing categories rather than any particular
/// backend's error type, since callers across crates need to match on them.
#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("retriable error: {0}")]
    Retriable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("policy error: {0}")]
    PolicyError(String),

    #[error("write limit exceeded: {0}")]
    WriteLimitExceeded(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RepoError>;

/// A content identifier: an optional single-letter namespace prefix followed
/// by a truncated cryptographic hash of the content.
///
/// Equal bytes mean equal content under the collision-resistance assumption
/// of the configured hash function.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentId(Vec<u8>);

impl ContentId {
    pub fn new(prefix: Option<u8>, hash: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(hash.len() + 1);
        if let Some(p) = prefix {
            bytes.push(p);
        }
        bytes.extend_from_slice(hash);
        ContentId(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ContentId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        Ok(ContentId(hex::decode(s)?))
    }

    /// True if the id starts with the given namespace/raw byte prefix.
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A plain blob identifier (opaque string handed to the blob store).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlobId(pub String);

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BlobId {
    fn from(s: String) -> Self {
        BlobId(s)
    }
}

impl From<&str> for BlobId {
    fn from(s: &str) -> Self {
        BlobId(s.to_owned())
    }
}

/// Cooperative cancellation token threaded through long-running operations.
///
/// Mirrors the `WorkerTaskContext::check_abort` pattern (`chunk_store.rs`),
/// generalized into a standalone, runtime-agnostic type:
/// workers check it at loop iteration boundaries and blob-store calls
/// propagate it down to I/O.
#[derive(Clone, Default)]
pub struct CancellationToken(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RepoError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A bounded worker pool for fan-out blob fetches, shared by the manifest
/// manager's `refresh` (8 workers) and the metadata cache's parallel
/// multi-get (5 workers).
///
/// Grounded in `ParallelHandler` (`tools/parallel_handler.rs`): a fixed pool
/// of threads draining a bounded channel. That type is send-only (fire work,
/// check for errors at the end); callers here need each item's result back,
/// so work items carry their original index and results are re-assembled in
/// order once every worker has drained the channel.
pub mod parallel {
    use super::{CancellationToken, RepoError, Result};

    /// Runs `f` over `items` using up to `workers` threads, preserving input
    /// order in the returned `Vec`. On cancellation or a worker error, all
    /// in-flight work is allowed to finish (workers keep draining the
    /// channel) but the first error (or `Cancelled`) is what's returned.
    pub fn map_bounded<T, R, F>(
        items: Vec<T>,
        workers: usize,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Result<R> + Send + Sync,
    {
        let total = items.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        cancel.check()?;
        let workers = workers.clamp(1, total);

        let (work_tx, work_rx) = crossbeam_channel::bounded::<(usize, T)>(workers);
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<(usize, Result<R>)>();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let f = &f;
                scope.spawn(move || {
                    while let Ok((idx, item)) = work_rx.recv() {
                        if cancel.is_cancelled() {
                            let _ = result_tx.send((idx, Err(RepoError::Cancelled)));
                            continue;
                        }
                        let _ = result_tx.send((idx, f(item)));
                    }
                });
            }
            drop(result_tx);

            scope.spawn(move || {
                for (idx, item) in items.into_iter().enumerate() {
                    if cancel.is_cancelled() || work_tx.send((idx, item)).is_err() {
                        break;
                    }
                }
            });

            let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
            let mut first_err: Option<RepoError> = None;
            for (idx, result) in result_rx {
                match result {
                    Ok(r) => slots[idx] = Some(r),
                    Err(e) if first_err.is_none() => first_err = Some(e),
                    Err(_) => {}
                }
            }

            if let Some(e) = first_err {
                return Err(e);
            }
            Ok(slots.into_iter().map(|s| s.expect("every dispatched index receives a result")).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_id_roundtrip_hex() {
        let id = ContentId::new(Some(b'p'), &[1, 2, 3, 4]);
        let hex = id.to_hex();
        let back = ContentId::from_hex(&hex).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn content_id_prefix() {
        let id = ContentId::new(Some(b'm'), &[0xaa; 4]);
        assert!(id.has_prefix(b"m"));
        assert!(!id.has_prefix(b"p"));
    }

    #[test]
    fn cancellation_token_propagates() {
        let tok = CancellationToken::new();
        assert!(tok.check().is_ok());
        tok.cancel();
        assert!(tok.check().is_err());
    }

    #[test]
    fn parallel_map_preserves_order() {
        let items: Vec<u32> = (0..50).collect();
        let tok = CancellationToken::new();
        let out = parallel::map_bounded(items.clone(), 5, &tok, |n| Ok(n * 2)).unwrap();
        let expected: Vec<u32> = items.iter().map(|n| n * 2).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn parallel_map_surfaces_first_error() {
        let items = vec![1, 2, 3, 4];
        let tok = CancellationToken::new();
        let err = parallel::map_bounded(items, 2, &tok, |n| {
            if n == 3 {
                Err(RepoError::IntegrityError("boom".into()))
            } else {
                Ok(n)
            }
        })
        .unwrap_err();
        assert!(matches!(err, RepoError::IntegrityError(_)));
    }

    #[test]
    fn parallel_map_respects_cancellation() {
        let items: Vec<u32> = (0..10).collect();
        let tok = CancellationToken::new();
        tok.cancel();
        let err = parallel::map_bounded(items, 4, &tok, Ok).unwrap_err();
        assert!(matches!(err, RepoError::Cancelled));
    }
}
