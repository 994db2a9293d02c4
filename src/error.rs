//! Error types for transfer operations.
//!
//! This module defines the structured error taxonomy used across the engine:
//! transport-level failures, service error responses, precondition conflicts,
//! input validation, and persistence failures. Retryability is decided
//! separately by [`crate::manager::classify_error`]; the variants here carry
//! the context that classification and callers need.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur while executing a transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("transport error for {url}: {source}")]
    Transport {
        /// The request URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout for {url}")]
    Timeout {
        /// The request URL that timed out.
        url: String,
    },

    /// HTTP error response from the storage service (4xx/5xx).
    #[error("service returned HTTP {status} for {url}")]
    Service {
        /// The request URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429/503 responses).
        retry_after: Option<String>,
    },

    /// ETag or lease precondition failed (HTTP 412, or an ETag observed to
    /// change mid-transfer). Terminal: the remote object is not the object
    /// the transfer started against.
    #[error("precondition failed for {url}: {detail}")]
    PreconditionFailed {
        /// The request URL.
        url: String,
        /// What condition was violated (e.g. the expected vs observed ETag).
        detail: String,
    },

    /// Malformed input detected before any network I/O.
    #[error("validation error: {reason}")]
    Validation {
        /// Why the input was rejected.
        reason: String,
    },

    /// The durable store failed. A chunk whose persisted write failed is
    /// never reported complete; the whole transfer fails instead.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// File system error reading or writing the local endpoint.
    #[error("IO error for {path}: {source}")]
    Io {
        /// The local file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The auth/signing collaborator could not authorize a request.
    #[error("authentication error: {0}")]
    Auth(#[from] crate::pipeline::AuthError),
}

impl TransferError {
    /// Creates a transport error from a reqwest error.
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a service error without a Retry-After value.
    pub fn service(url: impl Into<String>, status: u16) -> Self {
        Self::Service {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates a service error carrying the Retry-After header value.
    pub fn service_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::Service {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a precondition-failed error.
    pub fn precondition(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Creates an IO error with file path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// Note on From trait implementations:
// We intentionally do NOT implement `From<reqwest::Error>` or
// `From<std::io::Error>` because the variants require context (url, path)
// that the source errors don't provide. The helper constructors are the
// pattern callers use instead.
