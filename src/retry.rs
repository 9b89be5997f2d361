//! Transport-level retry with multiplicative backoff and jitter.
//!
//! [`RetryPolicy`] decides which failures are worth another attempt and how
//! long to wait between attempts. Streaming requests never retry (a restarted
//! stream would replay tokens); the HTTP executor enforces that by using
//! [`RetryPolicy::none`] for stream calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{LlmError, Result};
use crate::telemetry::{Telemetry, TelemetryEvent};

/// Body fragments that mark a 401 as a disguised rate limit.
///
/// Some providers return 401 instead of 429 when a key is throttled; those
/// responses are retriable (and count against the circuit breaker) while
/// genuine auth failures are not.
pub const RATE_LIMIT_HINTS: &[&str] = &[
    "rate limit",
    "too many requests",
    "quota exceeded",
    "retry after",
    "throttle",
];

/// Whether a 401 body matches a rate-limit hint (case-insensitive).
pub fn is_rate_limited_401(body: &str) -> bool {
    let body = body.to_lowercase();
    RATE_LIMIT_HINTS.iter().any(|hint| body.contains(hint))
}

/// HTTP statuses that always warrant a retry.
const RETRIABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Retry configuration.
///
/// The delay for attempt N is `base_delay * multiplier^N`, capped at
/// `max_delay`, then scaled by a uniform random factor in
/// `[1 - jitter_factor, 1 + jitter_factor]`.
///
/// # Example
///
/// ```
/// use llm_conduit::retry::RetryPolicy;
///
/// let none = RetryPolicy::none();
/// assert_eq!(none.max_retries, 0);
///
/// let standard = RetryPolicy::default();
/// assert_eq!(standard.max_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Uniform jitter as a fraction of the computed delay.
    pub jitter_factor: f64,
    /// Honor `Retry-After` response headers over the computed delay.
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// No retries. Used for streaming requests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether the error warrants another attempt.
    pub fn is_retriable(&self, error: &LlmError) -> bool {
        match error {
            LlmError::Request(_) | LlmError::Timeout(_) => true,
            LlmError::Http { status, body, .. } => {
                RETRIABLE_STATUSES.contains(status)
                    || (*status == 401 && is_rate_limited_401(body))
            }
            _ => false,
        }
    }

    /// Jittered delay for attempt N (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let factor = 1.0 - jitter + fastrand::f64() * 2.0 * jitter;
        Duration::from_secs_f64(capped * factor)
    }
}

/// Execute `op` with retry per `policy`.
///
/// Returns the first success, or the last error once retries are exhausted
/// or a non-retriable error occurs. A `Retry-After` header on the failed
/// response overrides the computed delay when the policy honors it. The
/// cancellation flag is checked before every attempt and after every sleep.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    telemetry: Option<&Telemetry>,
    cancel: Option<&AtomicBool>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error: Option<LlmError> = None;

    for attempt in 0..=policy.max_retries {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(LlmError::Cancelled);
            }
        }

        if attempt > 0 {
            let delay = match &last_error {
                Some(LlmError::Http {
                    retry_after: Some(ra),
                    ..
                }) if policy.respect_retry_after => *ra,
                _ => policy.delay_for_attempt(attempt - 1),
            };
            let reason = last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            crate::telemetry::emit_opt(
                telemetry,
                TelemetryEvent::RetryAttempt {
                    attempt,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason,
                },
            );
            tokio::time::sleep(delay).await;

            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(LlmError::Cancelled);
                }
            }
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt < policy.max_retries && policy.is_retriable(&err) {
                    tracing::debug!(attempt, error = %err, "retriable failure");
                    last_error = Some(err);
                    continue;
                }
                return Err(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| LlmError::Other("retry loop exited unexpectedly".into())))
}
