use std::path::PathBuf;

use crate::manifest::ContentHash;

/// Convenient result alias for update operations.
pub type Result<T> = std::result::Result<T, UpdatesError>;

/// Errors that can occur while resolving, downloading or launching an update.
#[derive(thiserror::Error, Debug)]
pub enum UpdatesError {
    /// Network or transport failure while fetching a manifest or asset.
    #[error("manifest fetch failed: {0}")]
    ManifestFetch(String),
    /// The manifest payload violated the expected schema.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),
    /// The manifest targets a different runtime than the one compiled in.
    #[error("runtime version mismatch (client {expected}, manifest {actual})")]
    RuntimeVersionMismatch {
        /// Runtime version compiled into the client.
        expected: String,
        /// Runtime version carried by the manifest.
        actual: String,
    },
    /// One or more required assets could not be resolved.
    #[error("{} required asset(s) missing", missing.len())]
    AssetIntegrity {
        /// Hashes of the unresolved assets.
        missing: Vec<ContentHash>,
    },
    /// Downloaded bytes did not hash to the digest the manifest promised.
    #[error("asset integrity check failed (expected {expected}, got {actual})")]
    HashMismatch {
        /// Digest recorded in the manifest.
        expected: ContentHash,
        /// Digest recomputed from the received bytes.
        actual: ContentHash,
    },
    /// The requested operation is not legal in the current state.
    #[error("cannot {operation} while {from}")]
    InvalidTransition {
        /// State the machine was in when the call arrived.
        from: String,
        /// Name of the rejected operation.
        operation: &'static str,
    },
    /// A subscriber callback failed; reported per listener only.
    #[error("subscription callback failed: {0}")]
    SubscriptionCallback(String),
    /// The operation was cancelled before it finished.
    #[error("operation cancelled")]
    Cancelled,
    /// The launch asset of the update being booted is not available.
    #[error("launch asset {hash} of update {update_id} is missing")]
    LaunchAssetMissing {
        /// Update that could not be launched.
        update_id: String,
        /// Hash of the missing launch asset.
        hash: ContentHash,
    },
    /// Failed to perform an I/O operation.
    #[error("filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
    /// A JSON document could not be decoded.
    #[error("json decoding failed: {0}")]
    Json(#[from] serde_json::Error),
    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A path that must exist was not found.
    #[error("path not found: {0}")]
    NotFound(PathBuf),
}

impl UpdatesError {
    /// Helper for wrapping manifest validation failures.
    pub fn malformed(msg: impl Into<String>) -> Self {
        UpdatesError::MalformedManifest(msg.into())
    }

    /// Stable short name of the error kind, used in state snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdatesError::ManifestFetch(_) => "manifest_fetch",
            UpdatesError::MalformedManifest(_) => "malformed_manifest",
            UpdatesError::RuntimeVersionMismatch { .. } => "runtime_version_mismatch",
            UpdatesError::AssetIntegrity { .. } => "asset_integrity",
            UpdatesError::HashMismatch { .. } => "hash_mismatch",
            UpdatesError::InvalidTransition { .. } => "invalid_transition",
            UpdatesError::SubscriptionCallback(_) => "subscription_callback",
            UpdatesError::Cancelled => "cancelled",
            UpdatesError::LaunchAssetMissing { .. } => "launch_asset_missing",
            UpdatesError::Io(_) => "io",
            UpdatesError::Json(_) => "json",
            UpdatesError::Config(_) => "config",
            UpdatesError::NotFound(_) => "not_found",
        }
    }

    /// Whether the running application can carry on after this error.
    ///
    /// Errors tied to a candidate update are recoverable. A missing launch
    /// asset at boot and state machine misuse are not.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            UpdatesError::LaunchAssetMissing { .. } | UpdatesError::InvalidTransition { .. }
        )
    }
}

impl From<reqwest::Error> for UpdatesError {
    fn from(err: reqwest::Error) -> Self {
        UpdatesError::ManifestFetch(err.to_string())
    }
}
