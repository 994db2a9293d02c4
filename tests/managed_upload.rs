//! Integration tests for managed uploads against a mock blob service.

mod common;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use blobport::{
    AnonymousPolicy, BlobClient, Concurrency, ManagerError, TransferManager, TransferState,
    UploadOptions,
};
use common::{fast_manager, payload, wait_for_terminal};
use url::Url;
use wiremock::matchers::{method, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

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

async fn mount_block_service(server: &MockServer) {
    Mock::given(method("PUT"))
        .and(query_param("comp", "block"))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(query_param("comp", "blocklist"))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
}

fn chunked(chunk_size: u64) -> UploadOptions {
    UploadOptions {
        chunk_size: Some(chunk_size),
        ..UploadOptions::default()
    }
}

/// The block index a staging request carries, decoded from its `blockid`.
fn block_index(request: &Request) -> Option<u64> {
    let block_id = request
        .url
        .query_pairs()
        .find(|(key, _)| key == "blockid")
        .map(|(_, value)| value.to_string())?;
    let decoded = BASE64.decode(block_id).ok()?;
    String::from_utf8(decoded).ok()?.parse().ok()
}

fn is_block_put(request: &Request) -> bool {
    request.method.as_str() == "PUT" && block_index(request).is_some()
}

fn is_commit(request: &Request) -> bool {
    request.method.as_str() == "PUT"
        && request
            .url
            .query_pairs()
            .any(|(key, value)| key == "comp" && value == "blocklist")
}

#[tokio::test]
async fn test_upload_stages_blocks_and_commits() {
    let data = payload(1000);
    let server = MockServer::start().await;
    mount_block_service(&server).await;

    let manager = fast_manager(Concurrency::Fixed(2)).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    std::fs::write(&source, &data).unwrap();

    let id = client
        .upload(&source, "c", "blob.bin", chunked(256))
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);

    let requests = server.received_requests().await.unwrap();
    let blocks: Vec<&Request> = requests.iter().filter(|r| is_block_put(r)).collect();
    let commits: Vec<&Request> = requests.iter().filter(|r| is_commit(r)).collect();
    assert_eq!(blocks.len(), 4);
    assert_eq!(commits.len(), 1);

    // Reassemble the staged blocks by index and compare to the source.
    let mut reassembled = vec![0u8; data.len()];
    for request in &blocks {
        let index = block_index(request).unwrap() as usize;
        let offset = index * 256;
        reassembled[offset..offset + request.body.len()].copy_from_slice(&request.body);
    }
    assert_eq!(reassembled, data);

    // The commit lists every block in ascending offset order.
    let commit_body = String::from_utf8(commits[0].body.clone()).unwrap();
    let ids: Vec<String> = (0..4)
        .map(|i| BASE64.encode(format!("{i:032}")))
        .collect();
    let positions: Vec<usize> = ids
        .iter()
        .map(|id| commit_body.find(id.as_str()).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(commit_body.matches("<Latest>").count(), 4);

    let record = manager.status(id).await.unwrap();
    assert_eq!(record.bytes_transferred, 1000);
}

#[tokio::test]
async fn test_upload_zero_length_commits_empty_block_list() {
    let server = MockServer::start().await;
    mount_block_service(&server).await;

    let manager = fast_manager(Concurrency::default()).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("empty.bin");
    std::fs::write(&source, b"").unwrap();

    let id = client
        .upload(&source, "c", "empty.bin", chunked(256))
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1, "zero-length upload is a single commit");
    assert!(is_commit(&requests[0]));
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    assert!(!body.contains("<Latest>"));
}

#[tokio::test]
async fn test_upload_retries_transient_503_block() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(query_param("comp", "block"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_block_service(&server).await;

    let manager = fast_manager(Concurrency::Fixed(2)).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let data = payload(1000);
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    std::fs::write(&source, &data).unwrap();

    let id = client
        .upload(&source, "c", "blob.bin", chunked(256))
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);

    // Four blocks, one of which was sent twice, plus the commit.
    let requests = server.received_requests().await.unwrap();
    let block_puts = requests.iter().filter(|r| is_block_put(r)).count();
    assert_eq!(block_puts, 5);
}

#[tokio::test]
async fn test_upload_sets_content_type_on_commit() {
    let server = MockServer::start().await;
    mount_block_service(&server).await;

    let manager = fast_manager(Concurrency::default()).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("doc.pdf");
    std::fs::write(&source, payload(100)).unwrap();

    let options = UploadOptions {
        chunk_size: Some(256),
        content_type: Some("application/pdf".to_string()),
        ..UploadOptions::default()
    };
    let id = client.upload(&source, "c", "doc.pdf", options).await.unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Complete);

    let requests = server.received_requests().await.unwrap();
    let commit = requests.iter().find(|r| is_commit(r)).unwrap();
    assert_eq!(
        commit
            .headers
            .get("x-ms-blob-content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        "application/pdf"
    );
}

#[tokio::test]
async fn test_upload_missing_source_rejected() {
    let server = MockServer::start().await;
    let manager = fast_manager(Concurrency::default()).await;
    let client = client_for(&server, &manager).await;

    let result = client
        .upload("/nonexistent/source.bin", "c", "blob.bin", chunked(256))
        .await;
    assert!(matches!(result, Err(ManagerError::Invalid(_))));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_permanent_failure_marks_failed() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let manager = fast_manager(Concurrency::Fixed(1)).await;
    let mut events = manager.subscribe();
    let client = client_for(&server, &manager).await;

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    std::fs::write(&source, payload(512)).unwrap();

    let id = client
        .upload(&source, "c", "blob.bin", chunked(256))
        .await
        .unwrap();

    let state = wait_for_terminal(&mut events, id).await;
    assert_eq!(state, TransferState::Failed);
    let record = manager.status(id).await.unwrap();
    assert!(record.last_error.unwrap().contains("403"));
}
