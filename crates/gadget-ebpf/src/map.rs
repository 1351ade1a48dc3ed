//! Handle to a kernel-resident hash map shared with a probe.
//!
//! The probe inserts an entry when it sees a request and deletes it when the
//! response arrives. Userspace only scans and deletes, and must tolerate the
//! probe mutating the map at the same time.

use std::fmt;

use thiserror::Error;

/// Errors reported by a kernel map handle.
#[derive(Debug, Error)]
pub enum MapError {
    /// Iteration stopped early because the map changed underneath it.
    #[error("iteration aborted: {0}")]
    IterationAborted(String),

    /// The key is no longer in the map.
    #[error("key does not exist")]
    KeyNotFound,

    /// Any other failure of the underlying syscall.
    #[error("{0}")]
    Other(String),
}

/// Result of scanning a kernel map.
///
/// Iteration may stop early. `entries` then holds what was read before the
/// failure and `error` says why it stopped.
#[derive(Debug)]
pub struct MapScan<K> {
    /// `(key, creation timestamp in boot-time nanoseconds)` pairs.
    pub entries: Vec<(K, u64)>,
    /// Why iteration ended early, if it did.
    pub error: Option<MapError>,
}

impl<K> MapScan<K> {
    /// A scan that visited every entry.
    #[must_use]
    pub const fn complete(entries: Vec<(K, u64)>) -> Self {
        Self {
            entries,
            error: None,
        }
    }

    /// A scan that stopped early with `error`.
    #[must_use]
    pub const fn partial(entries: Vec<(K, u64)>, error: MapError) -> Self {
        Self {
            entries,
            error: Some(error),
        }
    }
}

/// Iteration and deletion over a kernel map whose values are creation
/// timestamps.
pub trait KernelMap: Send + Sync {
    /// Key layout of the map.
    type Key: fmt::Debug + Send;

    /// Reads every entry currently visible.
    fn scan(&self) -> MapScan<Self::Key>;

    /// Deletes one entry.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::KeyNotFound`] if the entry is already gone, or
    /// [`MapError::Other`] for any other failure.
    fn delete(&self, key: &Self::Key) -> Result<(), MapError>;

    /// Name used in log messages.
    fn name(&self) -> &str;
}
