//! Client and per-transfer options.
//!
//! Per-transfer options are snapshotted onto the [`crate::TransferRecord`]
//! at creation time and never re-derived afterwards: resumption after a
//! crash must honor the caller's original request, not whatever the current
//! client configuration happens to be.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::transfer::planner::DEFAULT_CHUNK_SIZE;

/// Service API version sent with every request.
pub const DEFAULT_API_VERSION: &str = "2019-02-02";

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Options configuring a [`crate::BlobClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Service API version to invoke.
    pub api_version: String,
    /// Default chunk size for managed transfers, overridable per transfer.
    pub chunk_size: u64,
    /// Per-HTTP-call timeout. The engine imposes no transfer-wide deadline.
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Conditional-access parameters attached to transfer requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConditions {
    /// Only proceed if the remote ETag matches.
    pub if_match: Option<String>,
    /// Only proceed if the remote ETag does not match.
    pub if_none_match: Option<String>,
    /// Active lease id on the blob, sent as `x-ms-lease-id`.
    pub lease_id: Option<String>,
}

impl AccessConditions {
    /// Returns true if no condition is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.if_match.is_none() && self.if_none_match.is_none() && self.lease_id.is_none()
    }
}

/// Options for a managed or raw download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Partial range to download: start offset plus optional length.
    /// `None` downloads the whole blob.
    pub range: Option<RangeOptions>,
    /// Chunk size override; falls back to the client default.
    pub chunk_size: Option<u64>,
    /// Conditional-access parameters captured at creation time.
    #[serde(default)]
    pub access_conditions: AccessConditions,
}

/// A caller-requested partial range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeOptions {
    /// Byte offset the download starts at.
    pub offset: u64,
    /// Number of bytes to download; `None` means through the end of the blob.
    pub length: Option<u64>,
}

/// Options for a managed or raw upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOptions {
    /// Chunk (block) size override; falls back to the client default.
    pub chunk_size: Option<u64>,
    /// Content type set on the committed blob.
    pub content_type: Option<String>,
    /// Conditional-access parameters captured at creation time.
    #[serde(default)]
    pub access_conditions: AccessConditions,
}

/// The immutable options snapshot persisted with a transfer record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptionsSnapshot {
    /// Snapshot of [`DownloadOptions`].
    Download(DownloadOptions),
    /// Snapshot of [`UploadOptions`].
    Upload(UploadOptions),
}

impl OptionsSnapshot {
    /// The access conditions common to both kinds.
    #[must_use]
    pub fn access_conditions(&self) -> &AccessConditions {
        match self {
            Self::Download(o) => &o.access_conditions,
            Self::Upload(o) => &o.access_conditions,
        }
    }
}
