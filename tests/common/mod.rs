//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use blobport::{
    Concurrency, Database, RetryPolicy, SqliteTransferStore, TransferEvent, TransferId,
    TransferManager, TransferState,
};
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::{Request, Respond, ResponseTemplate};

/// A fake block blob served over ranged GETs.
///
/// Honors `Range` and `If-Match`, stamps `ETag` and `Content-Range`, and
/// records when each request arrived so tests can check the concurrency
/// ceiling. The ETag can be swapped mid-test to simulate a concurrent
/// writer.
#[derive(Clone)]
pub struct RangeBlob {
    data: Arc<Vec<u8>>,
    etag: Arc<RwLock<String>>,
    delay: Duration,
    starts: Arc<Mutex<Vec<Instant>>>,
}

impl RangeBlob {
    pub fn new(data: Vec<u8>, etag: &str) -> Self {
        Self {
            data: Arc::new(data),
            etag: Arc::new(RwLock::new(etag.to_string())),
            delay: Duration::ZERO,
            starts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Simulates another writer replacing the blob.
    pub fn set_etag(&self, etag: &str) {
        *self.etag.write().unwrap() = etag.to_string();
    }

    /// Largest number of requests whose response windows overlapped,
    /// assuming each occupied `self.delay` from its recorded start.
    pub fn max_overlap(&self) -> usize {
        let starts = self.starts.lock().unwrap();
        starts
            .iter()
            .map(|t| {
                starts
                    .iter()
                    .filter(|other| **other <= *t && *t < **other + self.delay)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    pub fn request_count(&self) -> usize {
        self.starts.lock().unwrap().len()
    }
}

impl Respond for RangeBlob {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.starts.lock().unwrap().push(Instant::now());
        let etag = self.etag.read().unwrap().clone();

        if let Some(expected) = header(request, "if-match") {
            if expected != etag {
                return ResponseTemplate::new(412).set_delay(self.delay);
            }
        }

        let total = self.data.len() as u64;
        let Some((start, end_inclusive)) = header(request, "range").and_then(parse_range) else {
            // No Range header: the whole blob.
            return ResponseTemplate::new(200)
                .insert_header("etag", etag.as_str())
                .set_body_bytes(self.data.as_slice().to_vec())
                .set_delay(self.delay);
        };

        if total == 0 || start >= total {
            return ResponseTemplate::new(416)
                .insert_header("etag", etag.as_str())
                .insert_header("content-range", format!("bytes */{total}").as_str())
                .set_delay(self.delay);
        }

        let end_inclusive = end_inclusive.min(total - 1);
        let body = self.data[start as usize..=end_inclusive as usize].to_vec();
        ResponseTemplate::new(206)
            .insert_header("etag", etag.as_str())
            .insert_header(
                "content-range",
                format!("bytes {start}-{end_inclusive}/{total}").as_str(),
            )
            .set_body_bytes(body)
            .set_delay(self.delay)
    }
}

fn header(request: &Request, name: &str) -> Option<String> {
    request
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

/// Parses `bytes=a-b` into `(a, b)`.
fn parse_range(value: String) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// A manager over an in-memory database with a fast retry policy.
pub async fn fast_manager(concurrency: Concurrency) -> TransferManager {
    let db = Database::new_in_memory().await.unwrap();
    manager_over(db, concurrency)
}

/// A manager over an existing database with a fast retry policy.
pub fn manager_over(db: Database, concurrency: Concurrency) -> TransferManager {
    TransferManager::with_store(
        Arc::new(SqliteTransferStore::new(db)),
        concurrency,
        RetryPolicy::new(
            3,
            Duration::from_millis(10),
            Duration::from_millis(100),
            2.0,
        ),
    )
    .unwrap()
}

/// Waits for the transfer to reach a terminal state, draining events.
pub async fn wait_for_terminal(
    events: &mut UnboundedReceiver<TransferEvent>,
    id: TransferId,
) -> TransferState {
    wait_for(events, id, TransferState::is_terminal).await
}

/// Waits for the transfer to reach a specific state.
pub async fn wait_for_state(
    events: &mut UnboundedReceiver<TransferEvent>,
    id: TransferId,
    wanted: TransferState,
) -> TransferState {
    wait_for(events, id, move |state| *state == wanted).await
}

async fn wait_for(
    events: &mut UnboundedReceiver<TransferEvent>,
    id: TransferId,
    predicate: impl Fn(&TransferState) -> bool,
) -> TransferState {
    let deadline = Duration::from_secs(15);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Some(TransferEvent::StateChanged {
                    id: event_id,
                    state,
                }) if event_id == id && predicate(&state) => return state,
                Some(_) => {}
                None => panic!("event bus closed while waiting for transfer {id}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for transfer {id}"))
}

/// Waits for the first progress event of a transfer.
pub async fn wait_for_progress(events: &mut UnboundedReceiver<TransferEvent>, id: TransferId) {
    let deadline = Duration::from_secs(15);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Some(TransferEvent::Progress { id: event_id, .. }) if event_id == id => return,
                Some(_) => {}
                None => panic!("event bus closed while waiting for progress on {id}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for progress on {id}"));
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
