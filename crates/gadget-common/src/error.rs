//! Unified error types for the gadget workspace.
//!
//! Each higher-level crate defines its own domain-specific error enum that wraps
//! these common variants when appropriate.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum GadgetError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A permission or capability error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Entering or running inside a network namespace failed.
    #[error("network namespace of pid {pid}: {message}")]
    Namespace {
        /// Process whose namespace was targeted.
        pid: u32,
        /// Description of the failure.
        message: String,
    },

    /// The packet-filter engine rejected a rule mutation.
    #[error("packet filter rule {rule}: {message}")]
    PacketFilter {
        /// Human-readable description of the rule.
        rule: String,
        /// Output of the failed command or syscall.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl GadgetError {
    /// Returns `true` when the error reports a resource that no longer exists.
    ///
    /// Callers use this to tell a vanished container namespace apart from a
    /// real failure during teardown.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, GadgetError>;
