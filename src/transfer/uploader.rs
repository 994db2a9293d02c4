//! Chunked, resumable blob upload.
//!
//! Uploads stage each chunk as an uncommitted block, then commit the full
//! block list in ascending offset order once every block is durably staged.
//! The service keeps staged blocks invisible until the commit, which is
//! what lets a crashed upload resume: already-staged blocks are recorded in
//! the completed-range set and are not re-sent.

use std::io::SeekFrom;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use reqwest::{Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::TransferError;
use crate::manager::retry::{RetryDecision, classify_error, retry_after_hint};
use crate::manager::{TransferContext, TransferEvent};
use crate::options::{OptionsSnapshot, UploadOptions};
use crate::pipeline::{Pipeline, PipelineRequest};
use crate::transfer::range_set::ByteRange;
use crate::transfer::{TransferOutcome, TransferRecord, planner};

/// One block worker's report to the driver.
enum BlockMessage {
    Staged(ByteRange),
    Skipped,
    Failed(TransferError),
}

/// Runs an upload to completion, pause, cancellation, or failure.
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

    let options = match &record.options {
        OptionsSnapshot::Upload(options) => options.clone(),
        OptionsSnapshot::Download(_) => {
            return TransferOutcome::Failed(TransferError::validation(
                "upload record carries download options",
            ));
        }
    };

    let Some(end_offset) = record.end_offset else {
        return TransferOutcome::Failed(TransferError::validation(
            "upload record has no end offset",
        ));
    };
    let total_len = end_offset - record.start_offset;

    // The source must still be the file the transfer was created against.
    match tokio::fs::metadata(&record.local_path).await {
        Ok(metadata) if metadata.len() == total_len => {}
        Ok(metadata) => {
            return TransferOutcome::Failed(TransferError::validation(format!(
                "local file {} is {} bytes, transfer was created against {} bytes",
                record.local_path.display(),
                metadata.len(),
                total_len
            )));
        }
        Err(e) => {
            return TransferOutcome::Failed(TransferError::io(record.local_path.clone(), e));
        }
    }

    if total_len > 0 {
        if let Some(outcome) = stage_blocks(ctx, record, &url, &options, total_len).await {
            return outcome;
        }
    }

    commit_block_list(ctx, record, &url, &options, total_len).await
}

/// Dispatches every outstanding block. Returns `Some` when the transfer
/// stopped short of fully staged (pause, cancel, or failure).
async fn stage_blocks(
    ctx: &TransferContext,
    record: &mut TransferRecord,
    url: &Url,
    options: &UploadOptions,
    total_len: u64,
) -> Option<TransferOutcome> {
    let ranges: Vec<ByteRange> = planner::remaining(
        record.start_offset,
        total_len,
        record.chunk_size,
        &record.completed,
    )
    .filter(|range| !range.is_empty())
    .collect();

    let (tx, mut rx) = mpsc::unbounded_channel::<BlockMessage>();
    for range in &ranges {
        spawn_block_worker(ctx, record, url.clone(), *range, options, tx.clone());
    }
    drop(tx);

    let mut failure: Option<TransferError> = None;
    while let Some(message) = rx.recv().await {
        match message {
            BlockMessage::Staged(range) => {
                if failure.is_some() {
                    continue;
                }
                record.completed.insert(range);
                record.bytes_transferred += range.len();
                if let Err(e) = ctx
                    .store
                    .record_progress(record.id, &record.completed, record.bytes_transferred)
                    .await
                {
                    // A block whose persisted write failed is never reported
                    // complete; the whole transfer fails instead.
                    failure = Some(e.into());
                    ctx.controls.cancel();
                    continue;
                }
                ctx.events.emit(&TransferEvent::Progress {
                    id: record.id,
                    bytes_transferred: record.bytes_transferred,
                    total_bytes: record.total_len(),
                });
            }
            BlockMessage::Skipped => {}
            BlockMessage::Failed(e) => {
                if failure.is_none() {
                    warn!(id = record.id, error = %e, "block failed, stopping dispatch");
                    failure = Some(e);
                    ctx.controls.cancel();
                }
            }
        }
    }

    if let Some(e) = failure {
        return Some(TransferOutcome::Failed(e));
    }

    let fully_staged = planner::remaining(
        record.start_offset,
        total_len,
        record.chunk_size,
        &record.completed,
    )
    .next()
    .is_none();

    if fully_staged {
        None
    } else if ctx.controls.is_cancelled() {
        Some(TransferOutcome::Cancelled)
    } else {
        Some(TransferOutcome::Paused)
    }
}

/// Spawns one worker: acquire a permit, read the range, stage it with
/// retries, report once.
fn spawn_block_worker(
    ctx: &TransferContext,
    record: &TransferRecord,
    url: Url,
    range: ByteRange,
    options: &UploadOptions,
    tx: mpsc::UnboundedSender<BlockMessage>,
) {
    let pipeline = ctx.pipeline.clone();
    let semaphore = Arc::clone(&ctx.semaphore);
    let controls = Arc::clone(&ctx.controls);
    let policy = ctx.retry_policy.clone();
    let local_path = record.local_path.clone();
    let block_id = block_id(record.start_offset, record.chunk_size, range);
    let lease_id = options.access_conditions.lease_id.clone();

    tokio::spawn(async move {
        let _permit = match acquire(&semaphore).await {
            Ok(permit) => permit,
            Err(e) => {
                let _ = tx.send(BlockMessage::Failed(e));
                return;
            }
        };
        if controls.is_cancelled() || controls.is_paused() {
            let _ = tx.send(BlockMessage::Skipped);
            return;
        }

        let body = match read_range(&local_path, range).await {
            Ok(body) => body,
            Err(e) => {
                let _ = tx.send(BlockMessage::Failed(e));
                return;
            }
        };

        let mut attempt = 1;
        loop {
            match put_block(&pipeline, &url, &block_id, body.clone(), lease_id.as_deref()).await {
                Ok(()) => {
                    let _ = tx.send(BlockMessage::Staged(range));
                    return;
                }
                Err(e) => match policy.should_retry(classify_error(&e), attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next,
                    } => {
                        let delay = retry_after_hint(&e).map_or(delay, |hint| delay.max(hint));
                        debug!(error = %e, attempt, start = range.start, "block retry");
                        tokio::time::sleep(delay).await;
                        if controls.is_cancelled() {
                            let _ = tx.send(BlockMessage::Skipped);
                            return;
                        }
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { .. } => {
                        let _ = tx.send(BlockMessage::Failed(e));
                        return;
                    }
                },
            }
        }
    });
}

/// Stages one block.
async fn put_block(
    pipeline: &Pipeline,
    url: &Url,
    block_id: &str,
    body: Bytes,
    lease_id: Option<&str>,
) -> Result<(), TransferError> {
    let mut block_url = url.clone();
    block_url
        .query_pairs_mut()
        .append_pair("comp", "block")
        .append_pair("blockid", block_id);

    let mut request = PipelineRequest::new(Method::PUT, block_url).with_body(body);
    if let Some(lease) = lease_id {
        request.set_header(
            reqwest::header::HeaderName::from_static("x-ms-lease-id"),
            lease,
        );
    }

    let response = pipeline.send(request).await?;
    if response.status() != StatusCode::CREATED {
        return Err(Pipeline::fail_status(url.as_str(), &response));
    }
    Ok(())
}

/// Commits the full block list in ascending offset order, retried per
/// policy. For a zero-length upload this is the only request.
async fn commit_block_list(
    ctx: &TransferContext,
    record: &TransferRecord,
    url: &Url,
    options: &UploadOptions,
    total_len: u64,
) -> TransferOutcome {
    let body = block_list_body(record.start_offset, record.chunk_size, total_len);

    let mut attempt = 1;
    loop {
        let _permit = match acquire(&ctx.semaphore).await {
            Ok(permit) => permit,
            Err(e) => return TransferOutcome::Failed(e),
        };
        if ctx.controls.is_cancelled() {
            return TransferOutcome::Cancelled;
        }

        match commit_once(&ctx.pipeline, url, options, &body).await {
            Ok(()) => return TransferOutcome::Complete,
            Err(e) => match ctx.retry_policy.should_retry(classify_error(&e), attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    let delay = retry_after_hint(&e).map_or(delay, |hint| delay.max(hint));
                    debug!(error = %e, attempt, "block list commit retry");
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(error = %e, %reason, "block list commit failed");
                    return TransferOutcome::Failed(e);
                }
            },
        }
    }
}

async fn commit_once(
    pipeline: &Pipeline,
    url: &Url,
    options: &UploadOptions,
    body: &str,
) -> Result<(), TransferError> {
    let mut commit_url = url.clone();
    commit_url.query_pairs_mut().append_pair("comp", "blocklist");

    let mut request =
        PipelineRequest::new(Method::PUT, commit_url).with_body(Bytes::from(body.to_string()));
    request.apply_access_conditions(&options.access_conditions);
    if let Some(content_type) = &options.content_type {
        request.set_header(
            reqwest::header::HeaderName::from_static("x-ms-blob-content-type"),
            content_type,
        );
    }

    let response = pipeline.send(request).await?;
    if response.status() != StatusCode::CREATED {
        return Err(Pipeline::fail_status(url.as_str(), &response));
    }
    Ok(())
}

/// Base64 block id derived from the chunk index, fixed-width so ids sort
/// and compare consistently regardless of block count.
fn block_id(start_offset: u64, chunk_size: u64, range: ByteRange) -> String {
    let index = (range.start - start_offset) / chunk_size;
    BASE64.encode(format!("{index:032}"))
}

/// The commit body: every block id, ascending by offset.
fn block_list_body(start_offset: u64, chunk_size: u64, total_len: u64) -> String {
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    if total_len > 0 {
        for range in planner::plan(start_offset, total_len, chunk_size) {
            body.push_str("<Latest>");
            body.push_str(&block_id(start_offset, chunk_size, range));
            body.push_str("</Latest>");
        }
    }
    body.push_str("</BlockList>");
    body
}

/// Reads one block's bytes from the local file.
async fn read_range(path: &std::path::Path, range: ByteRange) -> Result<Bytes, TransferError> {
    let io_err = |e| TransferError::io(path.to_path_buf(), e);

    let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
    file.seek(SeekFrom::Start(range.start)).await.map_err(io_err)?;

    #[allow(clippy::cast_possible_truncation)]
    let mut buffer = vec![0u8; range.len() as usize];
    file.read_exact(&mut buffer).await.map_err(io_err)?;
    Ok(Bytes::from(buffer))
}

async fn acquire(
    semaphore: &Arc<Semaphore>,
) -> Result<tokio::sync::OwnedSemaphorePermit, TransferError> {
    Arc::clone(semaphore)
        .acquire_owned()
        .await
        .map_err(|_| TransferError::validation("transfer manager shut down"))
}
