//! Transfer manager: scheduling, lifecycle control, and restoration.
//!
//! The manager owns the global concurrency limit (one semaphore shared by
//! every chunk of every transfer), the durable store, the event bus, and
//! the registry of client pipelines keyed by restoration id. Transfers run
//! as spawned driver tasks; pause and cancel are cooperative flags the
//! drivers observe at chunk boundaries.

pub mod events;
pub mod retry;

pub use events::{EventBus, TransferEvent};
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after, retry_after_hint,
};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};

use crate::db::Database;
use crate::pipeline::Pipeline;
use crate::store::{SqliteTransferStore, StoreError, TransferStore};
use crate::transfer::{
    NewTransfer, TransferId, TransferKind, TransferOutcome, TransferRecord, TransferState,
    downloader, planner, uploader,
};

/// Default number of concurrent chunk requests.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Largest allowed fixed concurrency.
pub const MAX_CONCURRENCY: usize = 64;

/// Manager-level errors.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// The fixed concurrency value is out of bounds.
    #[error("invalid concurrency {value}: must be between 1 and {MAX_CONCURRENCY}")]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },

    /// No record with the given id exists.
    #[error("unknown transfer: {0}")]
    UnknownTransfer(TransferId),

    /// No client with the given restoration id has registered.
    #[error("no client registered for restoration id {0:?}")]
    ClientNotRegistered(String),

    /// The transfer is terminal and cannot be paused or resumed.
    #[error("transfer {0} is terminal and cannot be resumed")]
    NotResumable(TransferId),

    /// The new transfer failed validation.
    #[error("invalid transfer: {0}")]
    Invalid(String),

    /// The durable store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How many chunk requests may run at once, across all transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// Exactly this many permits (1 to [`MAX_CONCURRENCY`]).
    Fixed(usize),
    /// Sized from the host's available parallelism, capped at
    /// [`MAX_CONCURRENCY`].
    Dynamic,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::Fixed(DEFAULT_CONCURRENCY)
    }
}

impl Concurrency {
    /// Resolves to a permit count, rejecting out-of-range fixed values.
    fn permits(self) -> Result<usize, ManagerError> {
        match self {
            Self::Fixed(value) => {
                if (1..=MAX_CONCURRENCY).contains(&value) {
                    Ok(value)
                } else {
                    Err(ManagerError::InvalidConcurrency { value })
                }
            }
            Self::Dynamic => Ok(std::thread::available_parallelism()
                .map_or(DEFAULT_CONCURRENCY, std::num::NonZeroUsize::get)
                .min(MAX_CONCURRENCY)),
        }
    }
}

/// Cooperative pause/cancel flags shared between the manager and one
/// transfer's driver and workers.
#[derive(Debug, Default)]
pub struct TransferControls {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl TransferControls {
    /// Requests a pause; chunks past dispatch still finish and persist.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once a pause was requested.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Everything a transfer driver needs, cloned out of the manager.
#[derive(Debug, Clone)]
pub struct TransferContext {
    /// Durable record store.
    pub store: Arc<dyn TransferStore>,
    /// HTTP pipeline of the owning client.
    pub pipeline: Pipeline,
    /// Global chunk concurrency limit.
    pub semaphore: Arc<Semaphore>,
    /// Chunk retry policy.
    pub retry_policy: RetryPolicy,
    /// Event fan-out.
    pub events: EventBus,
    /// This transfer's pause/cancel flags.
    pub controls: Arc<TransferControls>,
}

#[derive(Debug)]
struct ManagerInner {
    store: Arc<dyn TransferStore>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    retry_policy: RetryPolicy,
    events: EventBus,
    /// Registered client pipelines by restoration id.
    clients: DashMap<String, Pipeline>,
    /// Controls for transfers with a live driver task.
    active: DashMap<TransferId, Arc<TransferControls>>,
    /// Restored records waiting for their client to register, by
    /// restoration id.
    dormant: DashMap<TransferId, String>,
}

/// The shared transfer engine. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

impl TransferManager {
    /// Creates a manager over a SQLite-backed store.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::InvalidConcurrency`] for an out-of-range
    /// fixed concurrency.
    pub fn new(db: Database, concurrency: Concurrency) -> Result<Self, ManagerError> {
        Self::with_store(
            Arc::new(SqliteTransferStore::new(db)),
            concurrency,
            RetryPolicy::default(),
        )
    }

    /// Creates a manager over any store implementation.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::InvalidConcurrency`] for an out-of-range
    /// fixed concurrency.
    pub fn with_store(
        store: Arc<dyn TransferStore>,
        concurrency: Concurrency,
        retry_policy: RetryPolicy,
    ) -> Result<Self, ManagerError> {
        let max_concurrent = concurrency.permits()?;
        info!(max_concurrent, "transfer manager starting");

        Ok(Self {
            inner: Arc::new(ManagerInner {
                store,
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                retry_policy,
                events: EventBus::new(),
                clients: DashMap::new(),
                active: DashMap::new(),
                dormant: DashMap::new(),
            }),
        })
    }

    /// The resolved global concurrency limit.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Subscribes to lifecycle and progress events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::mpsc::UnboundedReceiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    /// Registers a client pipeline under its restoration id and wakes any
    /// dormant transfers waiting for it.
    #[instrument(skip(self, pipeline))]
    pub async fn register_client(&self, restoration_id: &str, pipeline: Pipeline) {
        self.inner
            .clients
            .insert(restoration_id.to_string(), pipeline.clone());

        let waiting: Vec<TransferId> = self
            .inner
            .dormant
            .iter()
            .filter(|entry| entry.value() == restoration_id)
            .map(|entry| *entry.key())
            .collect();

        for id in waiting {
            self.inner.dormant.remove(&id);
            match self.inner.store.load(id).await {
                Ok(Some(record)) if !record.state.is_terminal() => {
                    info!(id, "waking dormant transfer for newly registered client");
                    self.spawn_driver(record, pipeline.clone());
                }
                Ok(_) => {}
                Err(e) => warn!(id, error = %e, "failed to load dormant transfer"),
            }
        }
    }

    /// Creates a transfer and schedules it immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Invalid`] for a bad chunk size,
    /// [`ManagerError::ClientNotRegistered`] when no pipeline exists for the
    /// record's restoration id, and store errors on insert.
    #[instrument(skip(self, new), fields(kind = %new.kind, url = %new.remote_url))]
    pub async fn add(&self, new: NewTransfer) -> Result<TransferId, ManagerError> {
        planner::validate_chunk_size(new.chunk_size)
            .map_err(|e| ManagerError::Invalid(e.to_string()))?;

        let pipeline = self
            .inner
            .clients
            .get(&new.client_restoration_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ManagerError::ClientNotRegistered(new.client_restoration_id.clone()))?;

        let id = self.inner.store.insert(&new).await?;
        self.inner.events.emit(&TransferEvent::StateChanged {
            id,
            state: TransferState::Pending,
        });

        let record = self
            .inner
            .store
            .load(id)
            .await?
            .ok_or(ManagerError::UnknownTransfer(id))?;
        self.spawn_driver(record, pipeline);
        Ok(id)
    }

    /// Loads the current record for a transfer.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::UnknownTransfer`] when no record exists.
    pub async fn status(&self, id: TransferId) -> Result<TransferRecord, ManagerError> {
        self.inner
            .store
            .load(id)
            .await?
            .ok_or(ManagerError::UnknownTransfer(id))
    }

    /// Restores every non-terminal record from the store.
    ///
    /// Paused records stay paused. Pending and in-progress records are
    /// re-scheduled if their client has registered; otherwise they go
    /// dormant until [`TransferManager::register_client`] names their
    /// restoration id.
    ///
    /// # Errors
    ///
    /// Returns store errors from the scan.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize, ManagerError> {
        let records = self.inner.store.list_incomplete().await?;
        let mut scheduled = 0;

        for record in records {
            if self.inner.active.contains_key(&record.id) {
                continue;
            }
            match record.state {
                TransferState::Paused => {}
                TransferState::Pending | TransferState::InProgress => {
                    let pipeline = self
                        .inner
                        .clients
                        .get(&record.client_restoration_id)
                        .map(|entry| entry.value().clone());
                    if let Some(pipeline) = pipeline {
                        self.spawn_driver(record, pipeline);
                        scheduled += 1;
                    } else {
                        info!(
                            id = record.id,
                            restoration_id = %record.client_restoration_id,
                            "transfer dormant until its client registers"
                        );
                        self.inner
                            .dormant
                            .insert(record.id, record.client_restoration_id);
                    }
                }
                // list_incomplete never returns terminal states.
                _ => {}
            }
        }
        Ok(scheduled)
    }

    /// Requests a pause. Chunks already past dispatch finish and persist;
    /// the record lands in `paused` once the driver drains.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotResumable`] for terminal transfers and
    /// [`ManagerError::UnknownTransfer`] for ids with no record.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: TransferId) -> Result<(), ManagerError> {
        if let Some(controls) = self.inner.active.get(&id) {
            controls.pause();
            return Ok(());
        }

        let record = self.status(id).await?;
        match record.state {
            TransferState::Paused => Ok(()),
            TransferState::Pending | TransferState::InProgress => {
                self.inner.dormant.remove(&id);
                self.inner
                    .store
                    .set_state(id, TransferState::Paused, None)
                    .await?;
                self.inner.events.emit(&TransferEvent::StateChanged {
                    id,
                    state: TransferState::Paused,
                });
                Ok(())
            }
            _ => Err(ManagerError::NotResumable(id)),
        }
    }

    /// Resumes a paused or pending transfer. Without a registered client
    /// the record goes dormant and starts when the client registers.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotResumable`] for terminal transfers and
    /// [`ManagerError::UnknownTransfer`] for ids with no record.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: TransferId) -> Result<(), ManagerError> {
        if self.inner.active.contains_key(&id) {
            return Ok(());
        }

        let record = self.status(id).await?;
        if record.state.is_terminal() {
            return Err(ManagerError::NotResumable(id));
        }

        let pipeline = self
            .inner
            .clients
            .get(&record.client_restoration_id)
            .map(|entry| entry.value().clone());

        match pipeline {
            Some(pipeline) => {
                self.spawn_driver(record, pipeline);
                Ok(())
            }
            None => {
                info!(id, "resume deferred until the owning client registers");
                self.inner
                    .dormant
                    .insert(id, record.client_restoration_id);
                Ok(())
            }
        }
    }

    /// Cancels a transfer. Terminal records are left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::UnknownTransfer`] for ids with no record.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: TransferId) -> Result<(), ManagerError> {
        if let Some(controls) = self.inner.active.get(&id) {
            controls.cancel();
            return Ok(());
        }

        let record = self.status(id).await?;
        if record.state.is_terminal() {
            return Ok(());
        }

        self.inner.dormant.remove(&id);
        self.inner
            .store
            .set_state(id, TransferState::Cancelled, None)
            .await?;
        self.inner.events.emit(&TransferEvent::StateChanged {
            id,
            state: TransferState::Cancelled,
        });
        Ok(())
    }

    /// Deletes every terminal record.
    ///
    /// # Errors
    ///
    /// Returns store errors from the delete.
    pub async fn purge_terminal(&self) -> Result<u64, ManagerError> {
        Ok(self.inner.store.purge_terminal().await?)
    }

    /// Spawns the driver task for one transfer. No-op if one is already
    /// running.
    fn spawn_driver(&self, record: TransferRecord, pipeline: Pipeline) {
        let controls = Arc::new(TransferControls::default());
        match self.inner.active.entry(record.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&controls));
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            drive(inner, pipeline, record, controls).await;
        });
    }
}

/// Runs one transfer start to finish and persists its final state.
async fn drive(
    inner: Arc<ManagerInner>,
    pipeline: Pipeline,
    mut record: TransferRecord,
    controls: Arc<TransferControls>,
) {
    let id = record.id;

    if let Err(e) = inner
        .store
        .set_state(id, TransferState::InProgress, None)
        .await
    {
        error!(id, error = %e, "failed to mark transfer in progress");
        inner.active.remove(&id);
        return;
    }
    record.state = TransferState::InProgress;
    inner.events.emit(&TransferEvent::StateChanged {
        id,
        state: TransferState::InProgress,
    });

    let ctx = TransferContext {
        store: Arc::clone(&inner.store),
        pipeline,
        semaphore: Arc::clone(&inner.semaphore),
        retry_policy: inner.retry_policy.clone(),
        events: inner.events.clone(),
        controls,
    };

    let outcome = match record.kind {
        TransferKind::Download => downloader::run(&ctx, &mut record).await,
        TransferKind::Upload => uploader::run(&ctx, &mut record).await,
    };

    let (state, last_error) = match outcome {
        TransferOutcome::Complete => (TransferState::Complete, None),
        TransferOutcome::Paused => (TransferState::Paused, None),
        TransferOutcome::Cancelled => (TransferState::Cancelled, None),
        TransferOutcome::Failed(e) => {
            warn!(id, error = %e, "transfer failed");
            (TransferState::Failed, Some(e.to_string()))
        }
    };

    match inner.store.set_state(id, state, last_error.as_deref()).await {
        Ok(()) => inner.events.emit(&TransferEvent::StateChanged { id, state }),
        Err(e) => error!(id, error = %e, "failed to persist final transfer state"),
    }
    inner.active.remove(&id);
}
