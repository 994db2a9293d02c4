//! Lifecycle and progress events.
//!
//! Events are emitted by the driver task of each transfer after the
//! corresponding store write commits, so an observer never sees progress
//! the database does not yet contain. Per transfer, events arrive in
//! order; across transfers there is no ordering guarantee.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::warn;

use crate::transfer::{TransferId, TransferState};

/// A transfer lifecycle or progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// The transfer entered a new lifecycle state.
    StateChanged {
        /// Transfer record id.
        id: TransferId,
        /// The state just entered.
        state: TransferState,
    },

    /// Committed progress advanced.
    Progress {
        /// Transfer record id.
        id: TransferId,
        /// Total bytes durably transferred so far.
        bytes_transferred: u64,
        /// Total size of the transfer, once known.
        total_bytes: Option<u64>,
    },
}

/// Fan-out of [`TransferEvent`]s to any number of subscribers.
///
/// Cloning shares the subscriber list. Dropped receivers are pruned on the
/// next emit.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<TransferEvent>>>>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber. Events emitted before subscription are
    /// not replayed.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    /// Delivers an event to every live subscriber.
    pub fn emit(&self, event: &TransferEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("event bus lock poisoned, continuing");
                poisoned.into_inner()
            }
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
