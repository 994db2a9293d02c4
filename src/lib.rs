//! Blobport
//!
//! A managed, resumable transfer engine for block blob storage. Uploads
//! and downloads are split into chunks, executed under a global
//! concurrency limit, and persisted chunk by chunk so a crashed or killed
//! process can resume from its last durable byte.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`client`] - Caller-facing blob client bound to one account
//! - [`db`] - Database connection and schema management
//! - [`error`] - The transfer error taxonomy
//! - [`manager`] - Scheduling, lifecycle control, retry, and events
//! - [`options`] - Client and per-transfer options snapshots
//! - [`pipeline`] - HTTP request pipeline and credential policies
//! - [`store`] - Durable transfer records in SQLite
//! - [`transfer`] - Chunk planning and the download/upload drivers

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod db;
pub mod error;
pub mod manager;
pub mod options;
pub mod pipeline;
pub mod store;
pub mod transfer;

// Re-export commonly used types
pub use client::{
    BlobClient, BlobClientBuilder, custom_endpoint_for_account, endpoint_for_account,
};
pub use db::{Database, DbError};
pub use error::TransferError;
pub use manager::{
    Concurrency, DEFAULT_CONCURRENCY, EventBus, FailureType, ManagerError, RetryDecision,
    RetryPolicy, TransferEvent, TransferManager, classify_error,
};
pub use options::{
    AccessConditions, ClientOptions, DownloadOptions, OptionsSnapshot, RangeOptions, UploadOptions,
};
pub use pipeline::{
    AnonymousPolicy, AuthError, AuthPolicy, BearerTokenPolicy, Pipeline, SasCredential,
};
pub use store::{SqliteTransferStore, StoreError, TransferStore};
pub use transfer::{
    NewTransfer, TransferId, TransferKind, TransferRecord, TransferState,
    planner::DEFAULT_CHUNK_SIZE,
    range_set::{ByteRange, RangeSet},
};
