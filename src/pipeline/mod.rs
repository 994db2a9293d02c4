//! HTTP request pipeline.
//!
//! Every request to the remote service flows through [`Pipeline::send`],
//! which stamps the protocol headers (API version, request date, a fresh
//! client request id), applies the configured [`AuthPolicy`], and maps
//! transport failures into the crate error taxonomy. Status-code handling
//! stays with the callers because range requests treat 206 and 416
//! specially.

pub mod auth;

pub use auth::{AnonymousPolicy, AuthError, AuthPolicy, BearerTokenPolicy, SasCredential};

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use crate::error::TransferError;

/// A request under construction, mutable by auth policies.
#[derive(Debug)]
pub struct PipelineRequest {
    /// HTTP method.
    pub method: Method,
    /// Target URL; SAS credentials extend its query string.
    pub url: Url,
    /// Headers accumulated so far.
    pub headers: HeaderMap,
    /// Optional request body.
    pub body: Option<Bytes>,
}

impl PipelineRequest {
    /// Creates a request with no headers and no body.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Attaches a body.
    #[must_use]
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets a header, ignoring values reqwest cannot represent. Header
    /// values here come from validated options and the service's own
    /// responses, so an unrepresentable value is a caller bug.
    pub fn set_header(&mut self, name: reqwest::header::HeaderName, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
    }

    /// Stamps conditional-access headers from the persisted options.
    pub fn apply_access_conditions(&mut self, conditions: &crate::options::AccessConditions) {
        if let Some(etag) = &conditions.if_match {
            self.set_header(reqwest::header::IF_MATCH, etag);
        }
        if let Some(etag) = &conditions.if_none_match {
            self.set_header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(lease) = &conditions.lease_id {
            self.set_header(
                reqwest::header::HeaderName::from_static("x-ms-lease-id"),
                lease,
            );
        }
    }
}

/// Shared HTTP machinery for one storage account.
#[derive(Debug, Clone)]
pub struct Pipeline {
    http: reqwest::Client,
    auth: Arc<dyn AuthPolicy>,
    api_version: String,
}

impl Pipeline {
    /// Builds a pipeline with the given credential, API version, and
    /// per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Transport`] if the HTTP client cannot be
    /// constructed.
    pub fn new(
        auth: Arc<dyn AuthPolicy>,
        api_version: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransferError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::transport("<client construction>", e))?;

        Ok(Self {
            http,
            auth,
            api_version: api_version.into(),
        })
    }

    /// Sends a request through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Timeout`] when the per-request timeout
    /// elapses, [`TransferError::Transport`] for other connection failures,
    /// and [`TransferError::Auth`] when the credential cannot be applied.
    /// HTTP error statuses are NOT mapped here; use
    /// [`Pipeline::fail_status`] after inspecting the response.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn send(&self, mut request: PipelineRequest) -> Result<Response, TransferError> {
        request.set_header(
            reqwest::header::HeaderName::from_static("x-ms-version"),
            &self.api_version,
        );
        request.set_header(
            reqwest::header::HeaderName::from_static("x-ms-date"),
            &httpdate::fmt_http_date(SystemTime::now()),
        );
        request.set_header(
            reqwest::header::HeaderName::from_static("x-ms-client-request-id"),
            &format!("{:032x}", rand::random::<u128>()),
        );

        self.auth.authorize(&mut request).await?;

        let url = request.url.to_string();
        let mut builder = self
            .http
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransferError::timeout(&url)
            } else {
                TransferError::transport(&url, e)
            }
        })?;

        debug!(status = %response.status(), "response received");
        Ok(response)
    }

    /// Converts an unexpected response status into the matching error.
    ///
    /// 412 becomes [`TransferError::PreconditionFailed`]; everything else
    /// becomes [`TransferError::Service`] carrying the status and any
    /// `Retry-After` header.
    #[must_use]
    pub fn fail_status(url: &str, response: &Response) -> TransferError {
        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return TransferError::precondition(url, "remote object changed or condition not met");
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        TransferError::service_with_retry_after(url, status.as_u16(), retry_after)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Arc::new(AnonymousPolicy),
            "2019-02-02",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_stamps_protocol_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("x-ms-version"))
            .and(header_exists("x-ms-date"))
            .and(header_exists("x-ms-client-request-id"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/c/b", server.uri())).unwrap();
        let response = pipeline()
            .send(PipelineRequest::new(Method::GET, url))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_connection_refused_maps_to_transport() {
        let url = Url::parse("http://127.0.0.1:9/unreachable").unwrap();
        let err = pipeline()
            .send(PipelineRequest::new(Method::GET, url))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Transport { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_fail_status_maps_precondition() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/c/b", server.uri())).unwrap();
        let response = pipeline()
            .send(PipelineRequest::new(Method::GET, url.clone()))
            .await
            .unwrap();
        let err = Pipeline::fail_status(url.as_str(), &response);
        assert!(matches!(err, TransferError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_fail_status_captures_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/c/b", server.uri())).unwrap();
        let response = pipeline()
            .send(PipelineRequest::new(Method::GET, url.clone()))
            .await
            .unwrap();
        match Pipeline::fail_status(url.as_str(), &response) {
            TransferError::Service {
                status,
                retry_after,
                ..
            } => {
                assert_eq!(status, 429);
                assert_eq!(retry_after.as_deref(), Some("7"));
            }
            other => panic!("expected service error, got {other}"),
        }
    }
}
