//! Transfer records and the components that execute them.
//!
//! This module groups the durable representation of a transfer
//! ([`TransferRecord`]) with the pure chunk [`planner`], the completed-range
//! bookkeeping in [`range_set`], and the block [`downloader`] and
//! [`uploader`] that drive a single transfer's chunk sequence over HTTP.

pub mod downloader;
pub mod planner;
pub mod range_set;
pub mod uploader;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::options::OptionsSnapshot;
use crate::transfer::range_set::RangeSet;

/// Identifier of a transfer record (SQLite rowid).
pub type TransferId = i64;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Local file staged to the remote service as blocks.
    Upload,
    /// Remote blob streamed to a local file as ranges.
    Download,
}

impl TransferKind {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransferKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            _ => Err(format!("invalid transfer kind: {s}")),
        }
    }
}

/// Lifecycle state of a transfer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Created, no chunk work item scheduled yet.
    Pending,
    /// At least one chunk work item has been scheduled.
    InProgress,
    /// Chunk dispatch stopped; completed ranges preserved; resumable.
    Paused,
    /// Every planned chunk acknowledged (and, for uploads, committed).
    Complete,
    /// A non-retryable error stopped the transfer.
    Failed,
    /// Cancelled by the caller; plan discarded; not resumable.
    Cancelled,
}

impl TransferState {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal records perform no further I/O and are never re-enqueued.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransferState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid transfer state: {s}")),
        }
    }
}

/// The durable unit of state for one upload or download.
#[derive(Debug, Clone)]
pub struct TransferRecord {
    /// Unique identifier.
    pub id: TransferId,
    /// Binds the record to the client instance that may resume it.
    /// Set at creation time and never mutated.
    pub client_restoration_id: String,
    /// Direction of the transfer.
    pub kind: TransferKind,
    /// Local file endpoint.
    pub local_path: PathBuf,
    /// Remote object URL.
    pub remote_url: String,
    /// First byte offset of the transfer within the remote object.
    pub start_offset: u64,
    /// One past the last byte offset; `None` until discovered by probing.
    pub end_offset: Option<u64>,
    /// Bytes transferred so far; monotonically non-decreasing while
    /// `in_progress`.
    pub bytes_transferred: u64,
    /// Ordered set of completed chunk ranges; resumption skips these.
    pub completed: RangeSet,
    /// ETag captured during probing; attached to every subsequent range
    /// request to detect concurrent modification.
    pub etag: Option<String>,
    /// Current lifecycle state.
    pub state: TransferState,
    /// Parent record id for multi-part trees; flat id reference, not an
    /// owning pointer.
    pub parent_id: Option<TransferId>,
    /// Chunk size fixed at creation time.
    pub chunk_size: u64,
    /// Immutable options snapshot captured at creation time.
    pub options: OptionsSnapshot,
    /// Last error message if the transfer failed.
    pub last_error: Option<String>,
}

impl TransferRecord {
    /// Total number of bytes this transfer covers, when known.
    #[must_use]
    pub fn total_len(&self) -> Option<u64> {
        self.end_offset.map(|end| end - self.start_offset)
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransferRecord {{ id: {}, kind: {}, state: {} }}",
            self.id, self.kind, self.state
        )
    }
}

/// How a driven transfer ended.
#[derive(Debug)]
pub enum TransferOutcome {
    /// Every planned chunk is durably complete.
    Complete,
    /// Dispatch stopped on the pause flag; in-flight chunks were persisted.
    Paused,
    /// Dispatch stopped on the cancel flag.
    Cancelled,
    /// A non-retryable error stopped the transfer.
    Failed(crate::error::TransferError),
}

/// Parameters for creating a new transfer record.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    /// Restoration id of the creating client.
    pub client_restoration_id: String,
    /// Direction of the transfer.
    pub kind: TransferKind,
    /// Local file endpoint.
    pub local_path: PathBuf,
    /// Remote object URL.
    pub remote_url: String,
    /// First byte offset within the remote object.
    pub start_offset: u64,
    /// One past the last byte offset when known at creation (uploads, and
    /// downloads with an explicit length).
    pub end_offset: Option<u64>,
    /// Parent record id for multi-part trees.
    pub parent_id: Option<TransferId>,
    /// Chunk size for this transfer.
    pub chunk_size: u64,
    /// Options snapshot to persist.
    pub options: OptionsSnapshot,
}
