//! Engine error types.
//!
//! Every public API in this crate surfaces failures through [`EngineError`].
//! The taxonomy matters more than usual here:
//!
//! - Wrong credentials and insufficient rights both map to
//!   [`EngineError::AuthDenied`] so an unprivileged caller cannot tell the
//!   difference (no oracle leakage). Internally these paths are booleans;
//!   the typed denial is produced only at the caller-facing boundary.
//! - Structurally bad persisted data (truncated blob, unknown version tag)
//!   is a hard error, never coerced into a denial.
//! - External collaborator failures (secure key-store unreachable, agent
//!   gone) get their own retryable variants.

/// Unified error type for the Coffer engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Authentication or authorization failed. Deliberately carries no
    /// detail about which of the two it was.
    #[error("access denied")]
    AuthDenied,

    /// The operation needs the container's operational secret but the
    /// container is locked.
    #[error("container is locked: {container}")]
    Locked { container: String },

    /// A persisted blob is structurally invalid (truncated, bad magic,
    /// inconsistent lengths).
    #[error("malformed blob: {reason}")]
    MalformedBlob { reason: String },

    /// A persisted blob or ACL subject carries a version tag this build
    /// does not understand.
    #[error("unsupported binary version {found}")]
    UnsupportedVersion { found: u32 },

    /// The external secure key-store rejected or failed an operation.
    /// Retryable by the caller.
    #[error("secure key-store failure: {reason}")]
    KeyStoreFailed { reason: String },

    /// The interactive agent could not be reached or did not answer before
    /// the configured deadline. Retryable by the caller.
    #[error("interactive agent unavailable: {reason}")]
    AgentUnavailable { reason: String },

    /// A cryptographic primitive failed for a structural reason (wrong key
    /// length, CSPRNG failure). Never used for wrong-secret outcomes.
    #[error("crypto failure: {reason}")]
    Crypto { reason: String },

    /// I/O error from the filesystem (system key files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Catch-all for violated internal invariants. Prefer a typed variant
    /// whenever possible.
    #[error("internal engine error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;
