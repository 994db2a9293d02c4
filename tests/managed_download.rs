//! Integration tests for managed downloads against a mock blob service.

mod common;

use std::sync::Arc;
use std::time::Duration;

use blobport::{
    AnonymousPolicy, BlobClient, Concurrency, DownloadOptions, RangeOptions, TransferManager,
    TransferState,
};
use common::{RangeBlob, fast_manager, payload, wait_for_progress, wait_for_terminal};
use url::Url;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn client_for(server: &MockServer, manager: &TransferManager) -> BlobClient {
    BlobClient::builder(
        Url::parse(&server.uri()).unwrap(),
        Arc::new(AnonymousPolicy),
        "app-1",
        manager.clone(),
    )
    .build()
    .await
    .unwrap()
}

fn chunked(chunk_size: u64) -> DownloadOptions {
    DownloadOptions {
        chunk_size: Some(chunk_size),
        ..DownloadOptions::default()
    }
}

#[tokio::test]
async fn test_download_chunks_and_reassembles() {
    let data = payload(1024);
    let blob = RangeBlob::new(data.clone(), "\"v1\"");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(blob.clone())
        .mount(&server)
        .await;

    let manager = fast_manager(Concurrency::Fixed(2)).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob.bin");
    let id = client
        .download("c", "blob.bin", &dest, chunked(256))
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);

    assert_eq!(std::fs::read(&dest).unwrap(), data);
    // One probe request covering the first chunk, then one per remaining chunk.
    assert_eq!(blob.request_count(), 4);

    let record = manager.status(id).await.unwrap();
    assert_eq!(record.bytes_transferred, 1024);
    assert_eq!(record.etag.as_deref(), Some("\"v1\""));
    assert_eq!(record.end_offset, Some(1024));
}

#[tokio::test]
async fn test_download_respects_concurrency_limit() {
    let blob =
        RangeBlob::new(payload(2048), "\"v1\"").with_delay(Duration::from_millis(150));
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(blob.clone())
        .mount(&server)
        .await;

    let manager = fast_manager(Concurrency::Fixed(2)).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let id = client
        .download("c", "blob.bin", dir.path().join("blob.bin"), chunked(256))
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);
    assert!(
        blob.max_overlap() <= 2,
        "observed {} concurrent requests with a limit of 2",
        blob.max_overlap()
    );
}

#[tokio::test]
async fn test_download_truncates_larger_stale_file() {
    let data = payload(512);
    let blob = RangeBlob::new(data.clone(), "\"v1\"");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(blob.clone())
        .mount(&server)
        .await;

    let manager = fast_manager(Concurrency::Fixed(2)).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob.bin");
    // A previous occupant of the path, larger than the blob being fetched.
    std::fs::write(&dest, payload(2048)).unwrap();

    let id = client
        .download("c", "blob.bin", &dest, chunked(256))
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);

    let file = std::fs::read(&dest).unwrap();
    assert_eq!(file.len(), 512, "stale bytes past the blob length survived");
    assert_eq!(file, data);
}

#[tokio::test]
async fn test_download_whole_body_when_server_ignores_range() {
    let data = payload(512);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"v1\"")
                .set_body_bytes(data.clone()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = fast_manager(Concurrency::default()).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob.bin");
    let id = client
        .download("c", "blob.bin", &dest, chunked(128))
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn test_download_zero_length_blob() {
    let blob = RangeBlob::new(Vec::new(), "\"v1\"");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(blob.clone())
        .mount(&server)
        .await;

    let manager = fast_manager(Concurrency::default()).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("empty.bin");
    let id = client
        .download("c", "empty.bin", &dest, chunked(256))
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);
    assert_eq!(std::fs::read(&dest).unwrap().len(), 0);
}

#[tokio::test]
async fn test_download_fails_when_etag_changes_mid_transfer() {
    let blob = RangeBlob::new(payload(1024), "\"v1\"").with_delay(Duration::from_millis(50));
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(blob.clone())
        .mount(&server)
        .await;

    let manager = fast_manager(Concurrency::Fixed(1)).await;
    let mut events = manager.subscribe();
    let mut progress = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let id = client
        .download("c", "blob.bin", dir.path().join("blob.bin"), chunked(64))
        .await
        .unwrap();

    // Another writer replaces the blob after the first chunk lands.
    wait_for_progress(&mut progress, id).await;
    blob.set_etag("\"v2\"");

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Failed);

    let record = manager.status(id).await.unwrap();
    let last_error = record.last_error.unwrap();
    assert!(
        last_error.contains("precondition"),
        "unexpected error: {last_error}"
    );
}

#[tokio::test]
async fn test_download_retries_transient_503() {
    let blob = RangeBlob::new(payload(1024), "\"v1\"");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(blob.clone())
        .mount(&server)
        .await;

    let manager = fast_manager(Concurrency::Fixed(2)).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("blob.bin");
    let id = client
        .download("c", "blob.bin", &dest, chunked(256))
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);
    assert_eq!(std::fs::read(&dest).unwrap(), payload(1024));
}

#[tokio::test]
async fn test_download_explicit_range() {
    let data = payload(1024);
    let blob = RangeBlob::new(data.clone(), "\"v1\"");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(blob.clone())
        .mount(&server)
        .await;

    let manager = fast_manager(Concurrency::default()).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("slice.bin");
    let options = DownloadOptions {
        range: Some(RangeOptions {
            offset: 256,
            length: Some(512),
        }),
        chunk_size: Some(256),
        ..DownloadOptions::default()
    };
    let id = client
        .download("c", "blob.bin", &dest, options)
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);
    assert_eq!(std::fs::read(&dest).unwrap(), data[256..768].to_vec());
    assert_eq!(blob.request_count(), 2);
}

#[tokio::test]
async fn test_download_404_is_terminal_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let manager = fast_manager(Concurrency::default()).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let id = client
        .download(
            "c",
            "missing.bin",
            dir.path().join("missing.bin"),
            chunked(256),
        )
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Failed);

    let record = manager.status(id).await.unwrap();
    assert!(record.last_error.unwrap().contains("404"));
    // A permanent failure is not retried.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
