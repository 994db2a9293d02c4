//! Blob client: the caller-facing surface over one storage account.
//!
//! A client binds an endpoint, a credential, and a restoration id, and
//! hands managed transfers to the shared [`TransferManager`]. The
//! restoration id is the client's stable identity across process runs;
//! registering it wakes any of the client's transfers that were restored
//! before it existed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::{Method, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};
use url::Url;

use crate::error::TransferError;
use crate::manager::{ManagerError, TransferManager};
use crate::options::{ClientOptions, DownloadOptions, OptionsSnapshot, UploadOptions};
use crate::pipeline::{AuthPolicy, Pipeline, PipelineRequest};
use crate::transfer::{NewTransfer, TransferId, TransferKind};

/// Default scheme for account endpoints.
pub const DEFAULT_ENDPOINT_PROTOCOL: &str = "https";

/// Default host suffix for account endpoints.
pub const DEFAULT_ENDPOINT_SUFFIX: &str = "blob.core.windows.net";

/// The endpoint for a storage account name, under the default protocol and
/// host suffix.
#[must_use]
pub fn endpoint_for_account(account: &str) -> String {
    custom_endpoint_for_account(account, DEFAULT_ENDPOINT_PROTOCOL, DEFAULT_ENDPOINT_SUFFIX)
}

/// The endpoint for a storage account name under an explicit protocol and
/// host suffix, for sovereign clouds and emulators.
#[must_use]
pub fn custom_endpoint_for_account(account: &str, protocol: &str, suffix: &str) -> String {
    format!("{protocol}://{account}.{suffix}")
}

/// Builder for [`BlobClient`].
#[derive(Debug)]
pub struct BlobClientBuilder {
    endpoint: Url,
    credential: Arc<dyn AuthPolicy>,
    restoration_id: String,
    manager: TransferManager,
    options: ClientOptions,
}

impl BlobClientBuilder {
    /// Overrides the default client options.
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the client and registers it with the manager, waking any
    /// dormant transfers that carry this restoration id.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Transport`] if the HTTP client cannot be
    /// constructed.
    pub async fn build(self) -> Result<BlobClient, TransferError> {
        let pipeline = Pipeline::new(
            self.credential,
            self.options.api_version.clone(),
            self.options.timeout,
        )?;

        self.manager
            .register_client(&self.restoration_id, pipeline.clone())
            .await;
        info!(restoration_id = %self.restoration_id, "blob client registered");

        Ok(BlobClient {
            endpoint: self.endpoint,
            restoration_id: self.restoration_id,
            manager: self.manager,
            pipeline,
            options: self.options,
        })
    }
}

/// A client for one storage account.
#[derive(Debug, Clone)]
pub struct BlobClient {
    endpoint: Url,
    restoration_id: String,
    manager: TransferManager,
    pipeline: Pipeline,
    options: ClientOptions,
}

impl BlobClient {
    /// Starts building a client.
    #[must_use]
    pub fn builder(
        endpoint: Url,
        credential: Arc<dyn AuthPolicy>,
        restoration_id: impl Into<String>,
        manager: TransferManager,
    ) -> BlobClientBuilder {
        BlobClientBuilder {
            endpoint,
            credential,
            restoration_id: restoration_id.into(),
            manager,
            options: ClientOptions::default(),
        }
    }

    /// This client's restoration id.
    #[must_use]
    pub fn restoration_id(&self) -> &str {
        &self.restoration_id
    }

    /// The shared manager, for lifecycle control and event subscription.
    #[must_use]
    pub fn manager(&self) -> &TransferManager {
        &self.manager
    }

    /// The URL of a blob within this account.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Validation`] if the endpoint cannot carry
    /// path segments.
    pub fn blob_url(&self, container: &str, blob: &str) -> Result<Url, TransferError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| TransferError::validation("endpoint cannot be a base url"))?
            .push(container)
            .push(blob);
        Ok(url)
    }

    /// Starts a managed, resumable download to `destination`.
    ///
    /// Returns the transfer id immediately; completion is observed through
    /// manager events or [`TransferManager::status`].
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Invalid`] for bad inputs and store errors
    /// from record creation.
    #[instrument(skip(self, options, destination))]
    pub async fn download(
        &self,
        container: &str,
        blob: &str,
        destination: impl Into<PathBuf> + std::fmt::Debug,
        options: DownloadOptions,
    ) -> Result<TransferId, ManagerError> {
        let url = self
            .blob_url(container, blob)
            .map_err(|e| ManagerError::Invalid(e.to_string()))?;

        let start_offset = options.range.map_or(0, |r| r.offset);
        let end_offset = options
            .range
            .and_then(|r| r.length)
            .map(|length| start_offset + length);
        let chunk_size = options.chunk_size.unwrap_or(self.options.chunk_size);

        self.manager
            .add(NewTransfer {
                client_restoration_id: self.restoration_id.clone(),
                kind: TransferKind::Download,
                local_path: destination.into(),
                remote_url: url.to_string(),
                start_offset,
                end_offset,
                parent_id: None,
                chunk_size,
                options: OptionsSnapshot::Download(options),
            })
            .await
    }

    /// Starts a managed, resumable upload of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Invalid`] when the source file cannot be
    /// read, plus store errors from record creation.
    #[instrument(skip(self, options, source))]
    pub async fn upload(
        &self,
        source: impl Into<PathBuf> + std::fmt::Debug,
        container: &str,
        blob: &str,
        options: UploadOptions,
    ) -> Result<TransferId, ManagerError> {
        let source = source.into();
        let url = self
            .blob_url(container, blob)
            .map_err(|e| ManagerError::Invalid(e.to_string()))?;

        let metadata = tokio::fs::metadata(&source).await.map_err(|e| {
            ManagerError::Invalid(format!("cannot read source {}: {e}", source.display()))
        })?;
        let chunk_size = options.chunk_size.unwrap_or(self.options.chunk_size);

        self.manager
            .add(NewTransfer {
                client_restoration_id: self.restoration_id.clone(),
                kind: TransferKind::Upload,
                local_path: source,
                remote_url: url.to_string(),
                start_offset: 0,
                end_offset: Some(metadata.len()),
                parent_id: None,
                chunk_size,
                options: OptionsSnapshot::Upload(options),
            })
            .await
    }

    /// Downloads a blob in a single unmanaged request, streaming the body
    /// to `destination`. No record is created and nothing is resumable.
    ///
    /// # Errors
    ///
    /// Returns transport, service, and IO errors directly.
    #[instrument(skip(self, options, destination))]
    pub async fn raw_download(
        &self,
        container: &str,
        blob: &str,
        destination: impl AsRef<Path> + std::fmt::Debug,
        options: DownloadOptions,
    ) -> Result<u64, TransferError> {
        let url = self.blob_url(container, blob)?;
        let destination = destination.as_ref();

        let mut request = PipelineRequest::new(Method::GET, url.clone());
        if let Some(range) = options.range {
            let header = match range.length {
                Some(length) => format!("bytes={}-{}", range.offset, range.offset + length - 1),
                None => format!("bytes={}-", range.offset),
            };
            request.set_header(reqwest::header::RANGE, &header);
        }
        request.apply_access_conditions(&options.access_conditions);

        let response = self.pipeline.send(request).await?;
        if !matches!(
            response.status(),
            StatusCode::OK | StatusCode::PARTIAL_CONTENT
        ) {
            return Err(Pipeline::fail_status(url.as_str(), &response));
        }

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| TransferError::io(destination, e))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransferError::transport(url.as_str(), e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(destination, e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| TransferError::io(destination, e))?;
        Ok(written)
    }

    /// Uploads a file as a single unmanaged request. No record is created
    /// and nothing is resumable; suitable for small blobs only.
    ///
    /// # Errors
    ///
    /// Returns transport, service, and IO errors directly.
    #[instrument(skip(self, options, source))]
    pub async fn raw_upload(
        &self,
        source: impl AsRef<Path> + std::fmt::Debug,
        container: &str,
        blob: &str,
        options: UploadOptions,
    ) -> Result<(), TransferError> {
        let url = self.blob_url(container, blob)?;
        let source = source.as_ref();

        let body = tokio::fs::read(source)
            .await
            .map_err(|e| TransferError::io(source, e))?;

        let mut request = PipelineRequest::new(Method::PUT, url.clone()).with_body(body.into());
        request.set_header(
            reqwest::header::HeaderName::from_static("x-ms-blob-type"),
            "BlockBlob",
        );
        if let Some(content_type) = &options.content_type {
            request.set_header(
                reqwest::header::HeaderName::from_static("x-ms-blob-content-type"),
                content_type,
            );
        }
        request.apply_access_conditions(&options.access_conditions);

        let response = self.pipeline.send(request).await?;
        if response.status() != StatusCode::CREATED {
            return Err(Pipeline::fail_status(url.as_str(), &response));
        }
        Ok(())
    }
}
