//! Durable transfer store backed by SQLite.
//!
//! Every mutation here commits before the engine reports the corresponding
//! progress to callers, so a crash at any point leaves the database
//! describing work that genuinely finished. Chunk completion is a single
//! `UPDATE` carrying both the merged range set and the byte counter, which
//! keeps the two in lockstep.

use async_trait::async_trait;
use sqlx::sqlite::SqliteQueryResult;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::db::Database;
use crate::options::OptionsSnapshot;
use crate::transfer::range_set::RangeSet;
use crate::transfer::{NewTransfer, TransferId, TransferRecord, TransferState};

/// Store-related errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No record with the given id exists.
    #[error("transfer record not found: {0}")]
    RecordNotFound(TransferId),

    /// A persisted column could not be decoded.
    #[error("corrupt transfer record {id}: {reason}")]
    Corrupt {
        /// Record id.
        id: TransferId,
        /// What failed to decode.
        reason: String,
    },

    /// A value does not fit the database's signed 64-bit columns.
    #[error("transfer record {id}: {field} value {value} exceeds the storable range")]
    ValueOutOfRange {
        /// Record id; 0 for records not yet inserted.
        id: TransferId,
        /// Column being written.
        field: &'static str,
        /// Rejected value.
        value: u64,
    },
}

/// Persistence seam for transfer records.
///
/// The manager holds this as `Arc<dyn TransferStore>` so tests can swap in
/// instrumented implementations.
#[async_trait]
pub trait TransferStore: Send + Sync + std::fmt::Debug {
    /// Inserts a new `pending` record and returns its id.
    async fn insert(&self, new: &NewTransfer) -> Result<TransferId, StoreError>;

    /// Loads a single record by id.
    async fn load(&self, id: TransferId) -> Result<Option<TransferRecord>, StoreError>;

    /// Lists every non-terminal record, for restoration at startup.
    ///
    /// Records whose completed-range column fails to decode are reset to
    /// zero progress and returned; records whose options column fails to
    /// decode cannot be executed faithfully and are marked `failed` and
    /// skipped.
    async fn list_incomplete(&self) -> Result<Vec<TransferRecord>, StoreError>;

    /// Deletes a record.
    async fn delete(&self, id: TransferId) -> Result<(), StoreError>;

    /// Sets the lifecycle state, replacing the stored error message.
    async fn set_state(
        &self,
        id: TransferId,
        state: TransferState,
        last_error: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Records the probe result: the object's ETag and exclusive end offset.
    async fn set_probe_result(
        &self,
        id: TransferId,
        etag: &str,
        end_offset: u64,
    ) -> Result<(), StoreError>;

    /// Persists chunk completion: the merged range set and the byte counter
    /// commit in one statement.
    async fn record_progress(
        &self,
        id: TransferId,
        completed: &RangeSet,
        bytes_transferred: u64,
    ) -> Result<(), StoreError>;

    /// Discards all progress, returning the record to `pending` with no
    /// completed ranges and no captured ETag.
    async fn reset_progress(&self, id: TransferId) -> Result<(), StoreError>;

    /// Deletes every terminal record and returns how many were removed.
    async fn purge_terminal(&self) -> Result<u64, StoreError>;
}

/// Raw database row for a transfer record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct TransferRow {
    id: i64,
    client_restoration_id: String,
    kind: String,
    local_path: String,
    remote_url: String,
    start_offset: i64,
    end_offset: Option<i64>,
    bytes_transferred: i64,
    completed_ranges: String,
    etag: Option<String>,
    status: String,
    parent_id: Option<i64>,
    chunk_size: i64,
    options: String,
    last_error: Option<String>,
}

impl TransferRow {
    /// Decodes the row into a domain record, failing on any corrupt column.
    fn into_record(self) -> Result<TransferRecord, StoreError> {
        let id = self.id;
        let corrupt = |reason: String| StoreError::Corrupt { id, reason };

        let kind = self.kind.parse().map_err(&corrupt)?;
        let state = self.status.parse().map_err(&corrupt)?;
        let completed = RangeSet::from_json(&self.completed_ranges)
            .map_err(|e| corrupt(format!("completed_ranges: {e}")))?;
        let options: OptionsSnapshot = serde_json::from_str(&self.options)
            .map_err(|e| corrupt(format!("options: {e}")))?;

        let start_offset =
            u64::try_from(self.start_offset).map_err(|_| corrupt("negative start_offset".into()))?;
        let end_offset = self
            .end_offset
            .map(u64::try_from)
            .transpose()
            .map_err(|_| corrupt("negative end_offset".into()))?;
        let bytes_transferred = u64::try_from(self.bytes_transferred)
            .map_err(|_| corrupt("negative bytes_transferred".into()))?;
        let chunk_size =
            u64::try_from(self.chunk_size).map_err(|_| corrupt("negative chunk_size".into()))?;

        Ok(TransferRecord {
            id,
            client_restoration_id: self.client_restoration_id,
            kind,
            local_path: self.local_path.into(),
            remote_url: self.remote_url,
            start_offset,
            end_offset,
            bytes_transferred,
            completed,
            etag: self.etag,
            state,
            parent_id: self.parent_id,
            chunk_size,
            options,
            last_error: self.last_error,
        })
    }
}

/// SQLite implementation of [`TransferStore`].
#[derive(Debug, Clone)]
pub struct SqliteTransferStore {
    db: Database,
}

impl SqliteTransferStore {
    /// Wraps an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Converts a query result into an error when no row matched `id`.
    fn check_affected(result: &SqliteQueryResult, id: TransferId) -> Result<(), StoreError> {
        if result.rows_affected() == 0 {
            return Err(StoreError::RecordNotFound(id));
        }
        Ok(())
    }

    /// Narrows a value to the signed column type, refusing anything that
    /// would round-trip wrong.
    fn to_column(id: TransferId, field: &'static str, value: u64) -> Result<i64, StoreError> {
        i64::try_from(value).map_err(|_| StoreError::ValueOutOfRange { id, field, value })
    }
}

#[async_trait]
impl TransferStore for SqliteTransferStore {
    #[instrument(skip(self, new), fields(kind = %new.kind, url = %new.remote_url))]
    async fn insert(&self, new: &NewTransfer) -> Result<TransferId, StoreError> {
        let options = serde_json::to_string(&new.options).map_err(|e| StoreError::Corrupt {
            id: 0,
            reason: format!("options encode: {e}"),
        })?;

        let row: (i64,) = sqlx::query_as(
            r"
            INSERT INTO transfers
                (client_restoration_id, kind, local_path, remote_url,
                 start_offset, end_offset, parent_id, chunk_size, options)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            RETURNING id
            ",
        )
        .bind(&new.client_restoration_id)
        .bind(new.kind.as_str())
        .bind(new.local_path.to_string_lossy().as_ref())
        .bind(&new.remote_url)
        .bind(Self::to_column(0, "start_offset", new.start_offset)?)
        .bind(
            new.end_offset
                .map(|v| Self::to_column(0, "end_offset", v))
                .transpose()?,
        )
        .bind(new.parent_id)
        .bind(Self::to_column(0, "chunk_size", new.chunk_size)?)
        .bind(&options)
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.0)
    }

    #[instrument(skip(self))]
    async fn load(&self, id: TransferId) -> Result<Option<TransferRecord>, StoreError> {
        let row: Option<TransferRow> = sqlx::query_as("SELECT * FROM transfers WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        row.map(TransferRow::into_record).transpose()
    }

    #[instrument(skip(self))]
    async fn list_incomplete(&self) -> Result<Vec<TransferRecord>, StoreError> {
        let rows: Vec<TransferRow> = sqlx::query_as(
            "SELECT * FROM transfers
             WHERE status IN ('pending', 'in_progress', 'paused')
             ORDER BY id",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for mut row in rows {
            if RangeSet::from_json(&row.completed_ranges).is_err() {
                warn!(
                    id = row.id,
                    "completed ranges corrupt, resetting transfer progress to zero"
                );
                self.reset_progress(row.id).await?;
                row.completed_ranges = "[]".to_string();
                row.bytes_transferred = 0;
                row.etag = None;
                row.status = "pending".to_string();
            }

            match row.into_record() {
                Ok(record) => records.push(record),
                Err(StoreError::Corrupt { id, reason }) => {
                    warn!(id, %reason, "transfer record corrupt, marking failed");
                    self.set_state(id, TransferState::Failed, Some(&reason))
                        .await?;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: TransferId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM transfers WHERE id = ?1")
            .bind(id)
            .execute(self.db.pool())
            .await?;

        Self::check_affected(&result, id)
    }

    #[instrument(skip(self, last_error))]
    async fn set_state(
        &self,
        id: TransferId,
        state: TransferState,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE transfers
             SET status = ?1, last_error = ?2, updated_at = datetime('now')
             WHERE id = ?3",
        )
        .bind(state.as_str())
        .bind(last_error)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Self::check_affected(&result, id)
    }

    #[instrument(skip(self, etag))]
    async fn set_probe_result(
        &self,
        id: TransferId,
        etag: &str,
        end_offset: u64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE transfers
             SET etag = ?1, end_offset = ?2, updated_at = datetime('now')
             WHERE id = ?3",
        )
        .bind(etag)
        .bind(Self::to_column(id, "end_offset", end_offset)?)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Self::check_affected(&result, id)
    }

    #[instrument(skip(self, completed))]
    async fn record_progress(
        &self,
        id: TransferId,
        completed: &RangeSet,
        bytes_transferred: u64,
    ) -> Result<(), StoreError> {
        let ranges = completed.to_json().map_err(|e| StoreError::Corrupt {
            id,
            reason: format!("completed_ranges encode: {e}"),
        })?;

        let result = sqlx::query(
            "UPDATE transfers
             SET completed_ranges = ?1, bytes_transferred = ?2,
                 updated_at = datetime('now')
             WHERE id = ?3",
        )
        .bind(&ranges)
        .bind(Self::to_column(id, "bytes_transferred", bytes_transferred)?)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Self::check_affected(&result, id)
    }

    #[instrument(skip(self))]
    async fn reset_progress(&self, id: TransferId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE transfers
             SET completed_ranges = '[]', bytes_transferred = 0, etag = NULL,
                 status = 'pending', last_error = NULL,
                 updated_at = datetime('now')
             WHERE id = ?1",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Self::check_affected(&result, id)
    }

    #[instrument(skip(self))]
    async fn purge_terminal(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM transfers WHERE status IN ('complete', 'failed', 'cancelled')",
        )
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
