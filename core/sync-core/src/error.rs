//! Error types for fleetdeck-core operations.

use std::path::PathBuf;

use fleetdeck_protocol::DecodeError;

// ═══════════════════════════════════════════════════════════════════════════════
// Store Error (returned by Store implementations)
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure reported by the data-access layer.
///
/// Carries the HTTP status where one exists so callers can tell
/// authentication failures from ordinary misses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    #[error("Request rejected with status {status}")]
    Unauthorized { status: u16 },

    #[error("Request failed with status {status}: {message}")]
    Http { status: u16, message: String },
}

impl StoreError {
    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::NotFound { .. } => Some(404),
            StoreError::Unauthorized { status } | StoreError::Http { status, .. } => {
                Some(*status)
            }
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync Error (for Rust-only use)
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can surface from fleetdeck-core.
///
/// Reconciliation never returns these; per-id failures stay local and are
/// only logged. What does surface is decoding (to the caller that dropped
/// the frame), authentication, and project-selection exhaustion.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ─────────────────────────────────────────────────────────────────────
    // Feed Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Malformed frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("Resource no longer cached: {kind} {id}")]
    LookupMiss { kind: String, id: String },

    // ─────────────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Authentication required (status {status})")]
    Auth { status: u16 },

    #[error("Not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("Store request failed: {0}")]
    Store(StoreError),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => SyncError::NotFound { kind, id },
            StoreError::Unauthorized { status } => SyncError::Auth { status },
            StoreError::Http { status, .. } if status == 401 || status == 403 => {
                SyncError::Auth { status }
            }
            other => SyncError::Store(other),
        }
    }
}

/// Convenience type alias for Results using SyncError.
pub type Result<T> = std::result::Result<T, SyncError>;
