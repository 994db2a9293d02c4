//! Retry logic with exponential backoff for transient chunk failures.
//!
//! Each chunk worker classifies its [`TransferError`] into a [`FailureType`]
//! and asks the [`RetryPolicy`] whether to try again. Retries happen inside
//! the worker while it holds its concurrency permit, so a flaky chunk never
//! releases its slot to another transfer between attempts.

use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, instrument};

use crate::error::TransferError;

/// Default maximum attempts per chunk, including the initial attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of chunk failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx responses, connection refused.
    Transient,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: 404, 400, precondition conflicts, local IO errors,
    /// persistence failures.
    Permanent,

    /// The credential was rejected (401/403). Retrying with the same
    /// credential would not help.
    NeedsAuth,

    /// Server rate limiting (HTTP 429). Retries with backoff, honoring
    /// the `Retry-After` hint when the service provides one.
    RateLimited,
}

/// Decision on whether to retry a failed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the chunk after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is
        /// attempt 2).
        attempt: u32,
    },

    /// Do not retry the chunk.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^attempt, max_delay) + jitter
/// ```
///
/// With defaults, delays are approximately 1s, 2s before attempts run out.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt.
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a retry policy with custom settings. `max_attempts` is
    /// clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Creates a policy with a custom `max_attempts`, defaults elsewhere.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry after the failure of `attempt`
    /// (1-indexed).
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "credential rejected - retry with the same credential would not help"
                        .to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay for a retry attempt with backoff and jitter.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        // attempt is 0-indexed for the exponent (attempt 1 = 2^0 = 1x base)
        let exponent = f64::from(attempt - 1);
        let delay_ms = base_ms * multiplier.powf(exponent);

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + Self::calculate_jitter()
    }

    /// Random jitter between 0 and [`MAX_JITTER`]. Prevents thundering herd
    /// when many chunks fail at once.
    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter() -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Classifies a transfer error into a failure type for retry decisions.
///
/// Transport and timeout errors are transient except TLS failures, which a
/// retry cannot fix. Service statuses: 429 is rate limited, 5xx and 408 are
/// transient, 401/403 need auth, remaining 4xx are permanent. Precondition
/// conflicts, validation errors, local IO, and persistence failures never
/// retry.
#[instrument]
pub fn classify_error(error: &TransferError) -> FailureType {
    match error {
        TransferError::Service { status, .. } => classify_http_status(*status),

        TransferError::Timeout { .. } => FailureType::Transient,

        TransferError::Transport { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }

        TransferError::Auth(_) => FailureType::NeedsAuth,

        TransferError::PreconditionFailed { .. }
        | TransferError::Validation { .. }
        | TransferError::Io { .. }
        | TransferError::Persistence(_) => FailureType::Permanent,
    }
}

/// Classifies an HTTP status code into a failure type.
#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        400 => FailureType::Permanent,   // Bad Request
        401 => FailureType::NeedsAuth,   // Unauthorized
        403 => FailureType::NeedsAuth,   // Forbidden
        404 => FailureType::Permanent,   // Not Found
        408 => FailureType::Transient,   // Request Timeout
        409 => FailureType::Permanent,   // Conflict (lease mismatch)
        412 => FailureType::Permanent,   // Precondition Failed
        429 => FailureType::RateLimited, // Too Many Requests

        500 => FailureType::Transient, // Internal Server Error
        502 => FailureType::Transient, // Bad Gateway
        503 => FailureType::Transient, // Service Unavailable
        504 => FailureType::Transient, // Gateway Timeout

        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,

        _ => FailureType::Permanent,
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

/// Parses a `Retry-After` header value: either delta-seconds or an
/// HTTP-date. Returns `None` for values that parse to nothing useful.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value).ok()?;
    when.duration_since(SystemTime::now()).ok()
}

/// The delay the service asked for, if the error carries one.
#[must_use]
pub fn retry_after_hint(error: &TransferError) -> Option<Duration> {
    match error {
        TransferError::Service {
            retry_after: Some(value),
            ..
        } => parse_retry_after(value),
        _ => None,
    }
}
