//! Credential policies applied to outgoing requests.

use std::fmt;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderValue, InvalidHeaderValue};
use thiserror::Error;

use crate::pipeline::PipelineRequest;

/// Authentication errors.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The SAS token is not usable as a query string.
    #[error("invalid SAS token: {0}")]
    InvalidSas(String),

    /// The credential produced a header value reqwest rejects.
    #[error("credential produced an invalid header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

/// Applied to every request just before it is sent.
#[async_trait]
pub trait AuthPolicy: Send + Sync + fmt::Debug {
    /// Attaches the credential to `request`.
    async fn authorize(&self, request: &mut PipelineRequest) -> Result<(), AuthError>;
}

/// Shared access signature credential, appended to the request query string.
#[derive(Clone)]
pub struct SasCredential {
    token: String,
}

impl SasCredential {
    /// Wraps a SAS token. A leading `?` is stripped; the token must carry a
    /// `sig=` component or the service would reject every request.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidSas`] for a token without a signature.
    pub fn new(token: impl Into<String>) -> Result<Self, AuthError> {
        let token = token.into();
        let token = token.strip_prefix('?').unwrap_or(&token).to_string();
        if !token.contains("sig=") {
            return Err(AuthError::InvalidSas(
                "token has no sig= component".to_string(),
            ));
        }
        Ok(Self { token })
    }
}

impl fmt::Debug for SasCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the signature.
        f.debug_struct("SasCredential").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthPolicy for SasCredential {
    async fn authorize(&self, request: &mut PipelineRequest) -> Result<(), AuthError> {
        let merged = match request.url.query() {
            Some(existing) if !existing.is_empty() => format!("{existing}&{}", self.token),
            _ => self.token.clone(),
        };
        request.url.set_query(Some(&merged));
        Ok(())
    }
}

/// OAuth bearer token credential, sent as an `Authorization` header.
#[derive(Clone)]
pub struct BearerTokenPolicy {
    token: String,
}

impl BearerTokenPolicy {
    /// Wraps a bearer token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for BearerTokenPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerTokenPolicy").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthPolicy for BearerTokenPolicy {
    async fn authorize(&self, request: &mut PipelineRequest) -> Result<(), AuthError> {
        let value = HeaderValue::from_str(&format!("Bearer {}", self.token))?;
        request.headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}

/// No credential. Only useful against public containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousPolicy;

#[async_trait]
impl AuthPolicy for AnonymousPolicy {
    async fn authorize(&self, _request: &mut PipelineRequest) -> Result<(), AuthError> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use reqwest::Method;
    use url::Url;

    fn request(url: &str) -> PipelineRequest {
        PipelineRequest::new(Method::GET, Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_sas_appends_to_bare_url() {
        let cred = SasCredential::new("sv=2019-02-02&sig=abc").unwrap();
        let mut req = request("https://acct.blob.example/c/b");
        cred.authorize(&mut req).await.unwrap();
        assert_eq!(req.url.query(), Some("sv=2019-02-02&sig=abc"));
    }

    #[tokio::test]
    async fn test_sas_merges_with_existing_query() {
        let cred = SasCredential::new("?sig=abc").unwrap();
        let mut req = request("https://acct.blob.example/c/b?comp=block&blockid=AAA");
        cred.authorize(&mut req).await.unwrap();
        assert_eq!(req.url.query(), Some("comp=block&blockid=AAA&sig=abc"));
    }

    #[test]
    fn test_sas_without_signature_rejected() {
        assert!(SasCredential::new("sv=2019-02-02").is_err());
    }

    #[test]
    fn test_sas_debug_hides_token() {
        let cred = SasCredential::new("sig=supersecret").unwrap();
        let debug = format!("{cred:?}");
        assert!(!debug.contains("supersecret"));
    }

    #[tokio::test]
    async fn test_bearer_sets_authorization_header() {
        let policy = BearerTokenPolicy::new("tok-1");
        let mut req = request("https://acct.blob.example/c/b");
        policy.authorize(&mut req).await.unwrap();
        assert_eq!(
            req.headers.get(AUTHORIZATION).unwrap().to_str().unwrap(),
            "Bearer tok-1"
        );
    }
}
