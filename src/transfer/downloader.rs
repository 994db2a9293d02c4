//! Chunked, resumable blob download.
//!
//! A download starts with a probe: a ranged GET for the first outstanding
//! chunk that doubles as size and ETag discovery. Every later chunk request
//! carries `If-Match` with the probed ETag, so a blob that changes
//! mid-transfer surfaces as a precondition conflict instead of a silently
//! corrupt file. Chunk workers run under the manager's global concurrency
//! permit and report to a single driver, which is the only writer of the
//! local file and the durable record.

use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, ETAG, IF_MATCH, RANGE};
use reqwest::{Method, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::TransferError;
use crate::manager::retry::{RetryDecision, classify_error, retry_after_hint};
use crate::manager::{TransferContext, TransferEvent};
use crate::options::AccessConditions;
use crate::pipeline::{Pipeline, PipelineRequest};
use crate::transfer::range_set::ByteRange;
use crate::transfer::{TransferOutcome, TransferRecord, planner};

/// What the probe learned about the remote blob.
enum ProbeResult {
    /// Ranged response: the blob's ETag, its discovered end offset for this
    /// transfer, and the first chunk's body.
    Partial {
        etag: String,
        end_offset: u64,
        range: ByteRange,
        body: Bytes,
    },
    /// The service returned the whole blob in one response.
    Whole { etag: String, body: Bytes },
    /// The blob is zero-length (416 against `bytes=0-`).
    Empty { etag: Option<String> },
}

/// One chunk worker's report to the driver.
enum ChunkMessage {
    Fetched(ByteRange, Bytes),
    Skipped,
    Failed(TransferError),
}

/// Runs a download to completion, pause, cancellation, or failure.
///
/// `record` must be `in_progress`; its probe fields and completed ranges
/// are updated in place as the transfer advances.
#[instrument(skip(ctx, record), fields(id = record.id, url = %record.remote_url))]
pub async fn run(ctx: &TransferContext, record: &mut TransferRecord) -> TransferOutcome {
    let url = match Url::parse(&record.remote_url) {
        Ok(url) => url,
        Err(e) => {
            return TransferOutcome::Failed(TransferError::validation(format!(
                "invalid remote url {}: {e}",
                record.remote_url
            )));
        }
    };

    // Explicit zero-length request: nothing to probe or fetch.
    if record.end_offset == Some(record.start_offset) {
        if let Err(e) = write_empty_file(record).await {
            return TransferOutcome::Failed(e);
        }
        return TransferOutcome::Complete;
    }

    if record.etag.is_none() {
        match probe(ctx, record, &url).await {
            Ok(ProbeResult::Partial {
                etag,
                end_offset,
                range,
                body,
            }) => {
                if let Err(e) = ctx.store.set_probe_result(record.id, &etag, end_offset).await {
                    return TransferOutcome::Failed(e.into());
                }
                record.etag = Some(etag);
                record.end_offset = Some(end_offset);

                if let Err(e) = persist_chunk(ctx, record, range, &body).await {
                    return TransferOutcome::Failed(e);
                }
            }
            Ok(ProbeResult::Whole { etag, body }) => {
                let end_offset = record.start_offset + body.len() as u64;
                if let Err(e) = ctx.store.set_probe_result(record.id, &etag, end_offset).await {
                    return TransferOutcome::Failed(e.into());
                }
                record.etag = Some(etag);
                record.end_offset = Some(end_offset);

                let range = ByteRange::new(record.start_offset, end_offset);
                if let Err(e) = persist_chunk(ctx, record, range, &body).await {
                    return TransferOutcome::Failed(e);
                }
                return TransferOutcome::Complete;
            }
            Ok(ProbeResult::Empty { etag }) => {
                if let Some(etag) = etag {
                    if let Err(e) = ctx
                        .store
                        .set_probe_result(record.id, &etag, record.start_offset)
                        .await
                    {
                        return TransferOutcome::Failed(e.into());
                    }
                }
                record.end_offset = Some(record.start_offset);
                if let Err(e) = write_empty_file(record).await {
                    return TransferOutcome::Failed(e);
                }
                return TransferOutcome::Complete;
            }
            Err(e) => return TransferOutcome::Failed(e),
        }
    }

    stream_chunks(ctx, record, &url).await
}

/// Ranged GET for the first chunk, retried per policy. Discovers the blob's
/// size and ETag and delivers the first chunk's bytes in the same request.
async fn probe(
    ctx: &TransferContext,
    record: &TransferRecord,
    url: &Url,
) -> Result<ProbeResult, TransferError> {
    let probe_len = record
        .end_offset
        .map_or(record.chunk_size, |end| {
            (end - record.start_offset).min(record.chunk_size)
        });
    let range = ByteRange::new(record.start_offset, record.start_offset + probe_len);
    let conditions = record.options.access_conditions().clone();

    let mut attempt = 1;
    loop {
        let _permit = acquire(&ctx.semaphore).await?;
        if ctx.controls.is_cancelled() {
            return Err(TransferError::validation("transfer cancelled during probe"));
        }

        match probe_once(&ctx.pipeline, record, url, range, &conditions).await {
            Ok(result) => return Ok(result),
            Err(e) => match ctx.retry_policy.should_retry(classify_error(&e), attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    let delay = retry_after_hint(&e).map_or(delay, |hint| delay.max(hint));
                    debug!(error = %e, attempt, "probe failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(error = %e, %reason, "probe failed");
                    return Err(e);
                }
            },
        }
    }
}

async fn probe_once(
    pipeline: &Pipeline,
    record: &TransferRecord,
    url: &Url,
    range: ByteRange,
    conditions: &AccessConditions,
) -> Result<ProbeResult, TransferError> {
    let mut request = PipelineRequest::new(Method::GET, url.clone());
    request.set_header(RANGE, &format!("bytes={}-{}", range.start, range.end - 1));
    request.apply_access_conditions(conditions);

    let response = pipeline.send(request).await?;
    match response.status() {
        StatusCode::PARTIAL_CONTENT => {
            let etag = required_etag(url, &response)?;
            let total = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .ok_or_else(|| {
                    TransferError::validation("ranged response missing Content-Range total")
                })?;

            let end_offset = record.end_offset.map_or(total, |end| end.min(total));
            let body = read_body(url, response).await?;
            let range = ByteRange::new(range.start, range.start + body.len() as u64);
            Ok(ProbeResult::Partial {
                etag,
                end_offset,
                range,
                body,
            })
        }
        StatusCode::OK if record.start_offset == 0 => {
            // Server ignored the Range header and sent the whole blob.
            let etag = required_etag(url, &response)?;
            let body = read_body(url, response).await?;
            Ok(ProbeResult::Whole { etag, body })
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            Ok(ProbeResult::Empty { etag })
        }
        _ => Err(Pipeline::fail_status(url.as_str(), &response)),
    }
}

/// Dispatches all outstanding chunks and drives their results into the
/// local file and the durable record.
async fn stream_chunks(
    ctx: &TransferContext,
    record: &mut TransferRecord,
    url: &Url,
) -> TransferOutcome {
    let Some(end_offset) = record.end_offset else {
        return TransferOutcome::Failed(TransferError::validation(
            "download has no end offset after probe",
        ));
    };
    let Some(etag) = record.etag.clone() else {
        return TransferOutcome::Failed(TransferError::validation(
            "download has no etag after probe",
        ));
    };
    let total_len = end_offset - record.start_offset;

    let mut file = match open_output(record, total_len).await {
        Ok(file) => file,
        Err(e) => return TransferOutcome::Failed(e),
    };

    let ranges: Vec<ByteRange> = planner::remaining(
        record.start_offset,
        total_len,
        record.chunk_size,
        &record.completed,
    )
    .collect();

    let (tx, mut rx) = mpsc::unbounded_channel::<ChunkMessage>();
    let lease_id = record.options.access_conditions().lease_id.clone();

    for range in &ranges {
        spawn_chunk_worker(ctx, url.clone(), *range, etag.clone(), lease_id.clone(), tx.clone());
    }
    drop(tx);

    let mut failure: Option<TransferError> = None;
    while let Some(message) = rx.recv().await {
        match message {
            ChunkMessage::Fetched(range, body) => {
                if failure.is_some() {
                    continue;
                }
                if let Err(e) = write_chunk(&mut file, record, range, &body).await {
                    failure = Some(e);
                    ctx.controls.cancel();
                    continue;
                }
                if let Err(e) = commit_progress(ctx, record, range, body.len() as u64).await {
                    failure = Some(e);
                    ctx.controls.cancel();
                }
            }
            ChunkMessage::Skipped => {}
            ChunkMessage::Failed(e) => {
                if failure.is_none() {
                    warn!(id = record.id, error = %e, "chunk failed, stopping dispatch");
                    failure = Some(e);
                    // Undispatched workers observe the flag and skip.
                    ctx.controls.cancel();
                }
            }
        }
    }

    if let Some(e) = failure {
        return TransferOutcome::Failed(e);
    }

    let fully_done = planner::remaining(
        record.start_offset,
        total_len,
        record.chunk_size,
        &record.completed,
    )
    .next()
    .is_none();

    if fully_done {
        if let Err(e) = file.flush().await {
            return TransferOutcome::Failed(TransferError::io(record.local_path.clone(), e));
        }
        return TransferOutcome::Complete;
    }
    if ctx.controls.is_cancelled() {
        return TransferOutcome::Cancelled;
    }
    TransferOutcome::Paused
}

/// Spawns one worker: acquire a permit, fetch with retries, report once.
fn spawn_chunk_worker(
    ctx: &TransferContext,
    url: Url,
    range: ByteRange,
    etag: String,
    lease_id: Option<String>,
    tx: mpsc::UnboundedSender<ChunkMessage>,
) {
    let pipeline = ctx.pipeline.clone();
    let semaphore = Arc::clone(&ctx.semaphore);
    let controls = Arc::clone(&ctx.controls);
    let policy = ctx.retry_policy.clone();

    tokio::spawn(async move {
        let _permit = match acquire(&semaphore).await {
            Ok(permit) => permit,
            Err(e) => {
                let _ = tx.send(ChunkMessage::Failed(e));
                return;
            }
        };
        if controls.is_cancelled() || controls.is_paused() {
            let _ = tx.send(ChunkMessage::Skipped);
            return;
        }

        let mut attempt = 1;
        loop {
            match fetch_range(&pipeline, &url, range, &etag, lease_id.as_deref()).await {
                Ok(body) => {
                    let _ = tx.send(ChunkMessage::Fetched(range, body));
                    return;
                }
                Err(e) => match policy.should_retry(classify_error(&e), attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next,
                    } => {
                        let delay = retry_after_hint(&e).map_or(delay, |hint| delay.max(hint));
                        debug!(error = %e, attempt, start = range.start, "chunk retry");
                        tokio::time::sleep(delay).await;
                        if controls.is_cancelled() {
                            let _ = tx.send(ChunkMessage::Skipped);
                            return;
                        }
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { .. } => {
                        let _ = tx.send(ChunkMessage::Failed(e));
                        return;
                    }
                },
            }
        }
    });
}

/// One ranged GET carrying `If-Match` with the probed ETag.
async fn fetch_range(
    pipeline: &Pipeline,
    url: &Url,
    range: ByteRange,
    etag: &str,
    lease_id: Option<&str>,
) -> Result<Bytes, TransferError> {
    let mut request = PipelineRequest::new(Method::GET, url.clone());
    request.set_header(RANGE, &format!("bytes={}-{}", range.start, range.end - 1));
    request.set_header(IF_MATCH, etag);
    if let Some(lease) = lease_id {
        request.set_header(
            reqwest::header::HeaderName::from_static("x-ms-lease-id"),
            lease,
        );
    }

    let response = pipeline.send(request).await?;
    if !matches!(
        response.status(),
        StatusCode::PARTIAL_CONTENT | StatusCode::OK
    ) {
        return Err(Pipeline::fail_status(url.as_str(), &response));
    }

    // The If-Match header should make drift impossible, but a response ETag
    // that disagrees with the probe means the object changed anyway.
    if let Some(observed) = response.headers().get(ETAG).and_then(|v| v.to_str().ok()) {
        if observed != etag {
            return Err(TransferError::precondition(
                url.as_str(),
                format!("expected ETag {etag}, observed {observed}"),
            ));
        }
    }

    read_body(url, response).await
}

async fn read_body(url: &Url, response: reqwest::Response) -> Result<Bytes, TransferError> {
    response
        .bytes()
        .await
        .map_err(|e| TransferError::transport(url.as_str(), e))
}

/// Writes the chunk at its offset within the local file.
async fn write_chunk(
    file: &mut tokio::fs::File,
    record: &TransferRecord,
    range: ByteRange,
    body: &Bytes,
) -> Result<(), TransferError> {
    let offset = range.start - record.start_offset;
    file.seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| TransferError::io(record.local_path.clone(), e))?;
    file.write_all(body)
        .await
        .map_err(|e| TransferError::io(record.local_path.clone(), e))?;
    Ok(())
}

/// Probe-path variant of chunk persistence: writes the chunk, then commits
/// progress. Used before the streaming file handle exists.
async fn persist_chunk(
    ctx: &TransferContext,
    record: &mut TransferRecord,
    range: ByteRange,
    body: &Bytes,
) -> Result<(), TransferError> {
    let total_len = record
        .end_offset
        .map_or(0, |end| end - record.start_offset);
    let mut file = open_output(record, total_len).await?;
    write_chunk(&mut file, record, range, body).await?;
    file.flush()
        .await
        .map_err(|e| TransferError::io(record.local_path.clone(), e))?;
    commit_progress(ctx, record, range, body.len() as u64).await
}

/// Merges the range, commits the store row, then emits progress. The event
/// follows the commit so observers never see unpersisted progress.
async fn commit_progress(
    ctx: &TransferContext,
    record: &mut TransferRecord,
    range: ByteRange,
    len: u64,
) -> Result<(), TransferError> {
    record.completed.insert(range);
    record.bytes_transferred += len;
    ctx.store
        .record_progress(record.id, &record.completed, record.bytes_transferred)
        .await?;
    ctx.events.emit(&TransferEvent::Progress {
        id: record.id,
        bytes_transferred: record.bytes_transferred,
        total_bytes: record.total_len(),
    });
    Ok(())
}

async fn open_output(
    record: &TransferRecord,
    total_len: u64,
) -> Result<tokio::fs::File, TransferError> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&record.local_path)
        .await
        .map_err(|e| TransferError::io(record.local_path.clone(), e))?;

    let current = file
        .metadata()
        .await
        .map_err(|e| TransferError::io(record.local_path.clone(), e))?
        .len();
    // With no durable progress the transfer owns the destination outright:
    // size it to the blob so a larger pre-existing file cannot leave stale
    // bytes past the end. A resumed transfer only grows, keeping already
    // written chunks intact.
    let fresh = record.completed.is_empty();
    if current < total_len || (fresh && current > total_len) {
        file.set_len(total_len)
            .await
            .map_err(|e| TransferError::io(record.local_path.clone(), e))?;
    }
    Ok(file)
}

async fn write_empty_file(record: &TransferRecord) -> Result<(), TransferError> {
    tokio::fs::write(&record.local_path, b"")
        .await
        .map_err(|e| TransferError::io(record.local_path.clone(), e))
}

async fn acquire(
    semaphore: &Arc<Semaphore>,
) -> Result<tokio::sync::OwnedSemaphorePermit, TransferError> {
    Arc::clone(semaphore)
        .acquire_owned()
        .await
        .map_err(|_| TransferError::validation("transfer manager shut down"))
}

/// Extracts the total length from a `Content-Range` value like
/// `bytes 0-4194303/10485760`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

fn required_etag(url: &Url, response: &reqwest::Response) -> Result<String, TransferError> {
    response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
        .ok_or_else(|| {
            TransferError::validation(format!("response from {url} is missing an ETag"))
        })
}
