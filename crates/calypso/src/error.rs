//! Error types for Calypso operations.
//!
//! Errors are categorized into two main groups:
//!
//! - Input problems (bad requests, missing workspaces, malformed manifests)
//!   that map to 4xx-equivalent responses.
//! - Internal problems (store failures, write contention, extractor crashes)
//!   that map to 5xx-equivalent responses.
//!
//! ## Error Philosophy
//!
//! Queries follow a "best effort" approach: a single file that fails to parse
//! never aborts the query. Per-file failures are folded into the confidence
//! envelope as `unparsed_files` plus warnings; only infrastructure failures
//! (store corruption, invalid input) surface as `Err`.

use thiserror::Error;

/// Result type for Calypso operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Calypso operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Request body or parameters failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// A workspace, context, repo, or job was not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Workspace manifest is missing, malformed, or inconsistent
    #[error("manifest error: {0}")]
    Manifest(String),

    /// The extractor binary is missing or could not be spawned
    #[error("extractor unavailable: {0}")]
    ExtractorUnavailable(String),

    /// The extractor exceeded its per-file timeout
    #[error("extractor timed out after {timeout_s}s for {file_key}")]
    ExtractorTimeout { file_key: String, timeout_s: u64 },

    /// The extractor ran but produced no usable facts
    #[error("parse failed for {file_key}: {message}")]
    ParseFailed { file_key: String, message: String },

    /// No compile flags could be resolved for a file
    #[error("missing compile flags for {0}")]
    MissingFlags(String),

    /// A sparse overlay breached its file or row cap
    #[error("overlay cap exceeded for context {0}")]
    OverlayCapExceeded(String),

    /// The per-query parse budget was exhausted
    #[error("parse budget exceeded: {0} files left unverified")]
    BudgetExceeded(usize),

    /// A write op failed with busy/locked after exhausting retries
    #[error("write contention: {0}")]
    WriteContention(String),

    /// The store rejected an operation in a way that indicates corruption
    #[error("store corrupt: {0}")]
    StoreCorrupt(String),

    /// Repo sync could not authenticate against the remote
    #[error("sync auth failed: {0}")]
    SyncAuthFailed(String),

    /// Repo sync failed to produce a detached checkout at the requested SHA
    #[error("sync checkout failed: {0}")]
    SyncCheckoutFailed(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Anything else that indicates a bug in Calypso itself
    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire-level error code, closed set.
///
/// Every [`Error`] variant maps to exactly one code; the HTTP layer uses the
/// code both as the response `code` field and to choose a status class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Manifest,
    ExtractorUnavailable,
    ExtractorTimeout,
    ParseFailed,
    MissingFlags,
    OverlayCapExceeded,
    BudgetExceeded,
    WriteContention,
    StoreCorrupt,
    SyncAuthFailed,
    SyncCheckoutFailed,
    Internal,
}

impl ErrorKind {
    /// Stable wire representation of this error kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::NotFound => "not_found",
            Self::Manifest => "manifest_error",
            Self::ExtractorUnavailable => "extractor_unavailable",
            Self::ExtractorTimeout => "extractor_timeout",
            Self::ParseFailed => "parse_failed",
            Self::MissingFlags => "missing_flags",
            Self::OverlayCapExceeded => "overlay_cap_exceeded",
            Self::BudgetExceeded => "budget_exceeded",
            Self::WriteContention => "write_contention",
            Self::StoreCorrupt => "store_corrupt",
            Self::SyncAuthFailed => "sync_auth_failed",
            Self::SyncCheckoutFailed => "sync_checkout_failed",
            Self::Internal => "internal_error",
        }
    }

    /// Returns `true` if this is an input problem (4xx-style).
    #[must_use]
    pub fn is_input_error(self) -> bool {
        matches!(
            self,
            Self::Validation
                | Self::NotFound
                | Self::Manifest
                | Self::MissingFlags
                | Self::OverlayCapExceeded
        )
    }

    /// Returns `true` if this is an internal problem (5xx-style).
    #[must_use]
    pub fn is_internal_error(self) -> bool {
        !self.is_input_error()
    }
}

impl Error {
    /// Classify this error into its wire-level kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Manifest(_) | Self::Yaml(_) => ErrorKind::Manifest,
            Self::ExtractorUnavailable(_) => ErrorKind::ExtractorUnavailable,
            Self::ExtractorTimeout { .. } => ErrorKind::ExtractorTimeout,
            Self::ParseFailed { .. } | Self::Json(_) => ErrorKind::ParseFailed,
            Self::MissingFlags(_) => ErrorKind::MissingFlags,
            Self::OverlayCapExceeded(_) => ErrorKind::OverlayCapExceeded,
            Self::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            Self::WriteContention(_) => ErrorKind::WriteContention,
            Self::StoreCorrupt(_) => ErrorKind::StoreCorrupt,
            Self::SyncAuthFailed(_) => ErrorKind::SyncAuthFailed,
            Self::SyncCheckoutFailed(_) => ErrorKind::SyncCheckoutFailed,
            Self::Database(_) | Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the underlying `SQLite` error is transient contention
    /// (`SQLITE_BUSY` / `SQLITE_LOCKED`) and the op is worth retrying.
    #[must_use]
    pub fn is_retryable_contention(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_categorization() {
        assert!(ErrorKind::Validation.is_input_error());
        assert!(ErrorKind::NotFound.is_input_error());
        assert!(ErrorKind::Manifest.is_input_error());
        assert!(!ErrorKind::Validation.is_internal_error());

        assert!(ErrorKind::StoreCorrupt.is_internal_error());
        assert!(ErrorKind::WriteContention.is_internal_error());
        assert!(!ErrorKind::Internal.is_input_error());
    }

    #[test]
    fn every_variant_has_a_wire_code() {
        let err = Error::Validation("bad".into());
        assert_eq!(err.kind().as_str(), "validation_error");

        let err = Error::ExtractorTimeout {
            file_key: "a:b.cpp".into(),
            timeout_s: 120,
        };
        assert_eq!(err.kind().as_str(), "extractor_timeout");
        assert!(err.to_string().contains("a:b.cpp"));
    }

    #[test]
    fn busy_is_retryable_contention() {
        let inner = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY);
        let err = Error::Database(rusqlite::Error::SqliteFailure(inner, None));
        assert!(err.is_retryable_contention());

        let err = Error::Internal("nope".into());
        assert!(!err.is_retryable_contention());
    }
}
