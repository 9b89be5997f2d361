//! Per-provider circuit breaking.
//!
//! Each provider gets a named scope (`<provider>_circuit`) with the classic
//! three-state machine: `Closed` passes all calls, `Open` fails fast with a
//! `retry_after` hint, `HalfOpen` admits exactly one probe whose outcome
//! decides the next state. Failure classification is shared with the retry
//! layer: transport errors, 5xx, 429, and 401s whose body looks like a rate
//! limit; genuine auth failures and 2xx never count.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{LlmError, Result};
use crate::retry::is_rate_limited_401;
use crate::telemetry::{Telemetry, TelemetryEvent};

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive classified failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit waits before admitting a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Observable breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerStatus {
    /// All calls pass.
    Closed,
    /// Calls short-circuit until the cooldown elapses.
    Open,
    /// One probe call is in flight (or permitted).
    HalfOpen,
}

/// How one call outcome ages the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Resets the failure count and closes the circuit.
    Success,
    /// Increments the failure count; may open the circuit.
    Failure,
    /// Leaves the breaker untouched (e.g. a genuine 401, a validation error).
    Neutral,
}

/// Classify a call result for breaker purposes.
pub fn classify<T>(result: &Result<T>) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(err) => match err {
            LlmError::Request(_) | LlmError::Timeout(_) => Outcome::Failure,
            LlmError::Http { status, body, .. } => {
                if *status >= 500 || *status == 429 {
                    Outcome::Failure
                } else if *status == 401 && is_rate_limited_401(body) {
                    // A throttle disguised as an auth failure.
                    Outcome::Failure
                } else {
                    Outcome::Neutral
                }
            }
            _ => Outcome::Neutral,
        },
    }
}

#[derive(Debug)]
struct BreakerState {
    status: BreakerStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probing: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probing: false,
        }
    }
}

/// Process-wide registry of named circuit breakers.
pub struct BreakerRegistry {
    states: Mutex<HashMap<String, BreakerState>>,
    config: BreakerConfig,
    telemetry: Telemetry,
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("scopes", &self.states.lock().len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default(), Telemetry::disabled())
    }
}

impl BreakerRegistry {
    /// Registry with the given tuning.
    pub fn new(config: BreakerConfig, telemetry: Telemetry) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            config: BreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            telemetry,
        }
    }

    fn scope(provider: &str) -> String {
        format!("{provider}_circuit")
    }

    /// Admission check. `Ok` means the call may proceed; an open circuit
    /// yields [`LlmError::CircuitOpen`] with the remaining cooldown as the
    /// `retry_after` hint. The first check after the cooldown flips the
    /// breaker half-open and admits a single probe; concurrent calls during
    /// the probe short-circuit as if open.
    pub fn check(&self, provider: &str) -> Result<()> {
        let mut states = self.states.lock();
        let state = states.entry(Self::scope(provider)).or_default();

        match state.status {
            BreakerStatus::Closed => Ok(()),
            BreakerStatus::Open => {
                let elapsed = state.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    state.status = BreakerStatus::HalfOpen;
                    state.probing = true;
                    Ok(())
                } else {
                    Err(LlmError::CircuitOpen {
                        provider: provider.to_string(),
                        retry_after: self.config.cooldown - elapsed,
                    })
                }
            }
            BreakerStatus::HalfOpen => {
                if state.probing {
                    Err(LlmError::CircuitOpen {
                        provider: provider.to_string(),
                        retry_after: self.config.cooldown,
                    })
                } else {
                    state.probing = true;
                    Ok(())
                }
            }
        }
    }

    /// Record one classified outcome for the provider's scope.
    pub fn record(&self, provider: &str, outcome: Outcome) {
        let scope = Self::scope(provider);
        let mut states = self.states.lock();
        let state = states.entry(scope.clone()).or_default();

        match outcome {
            Outcome::Neutral => {
                state.probing = false;
            }
            Outcome::Success => {
                let was_unhealthy = state.status != BreakerStatus::Closed;
                state.status = BreakerStatus::Closed;
                state.consecutive_failures = 0;
                state.opened_at = None;
                state.probing = false;
                if was_unhealthy {
                    drop(states);
                    self.telemetry.emit(TelemetryEvent::CircuitClosed { name: scope });
                }
            }
            Outcome::Failure => {
                state.consecutive_failures += 1;
                state.probing = false;
                let should_open = state.status == BreakerStatus::HalfOpen
                    || state.consecutive_failures >= self.config.failure_threshold;
                if should_open && state.status != BreakerStatus::Open {
                    state.status = BreakerStatus::Open;
                    state.opened_at = Some(Instant::now());
                    drop(states);
                    tracing::warn!(scope = %scope, "circuit opened");
                    self.telemetry.emit(TelemetryEvent::CircuitOpened { name: scope });
                } else if should_open {
                    state.opened_at = Some(Instant::now());
                }
            }
        }
    }

    /// Run `f` guarded by the provider's breaker: admission check, call,
    /// classify, record.
    pub async fn call<T, F, Fut>(&self, provider: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.check(provider)?;
        let result = f().await;
        self.record(provider, classify(&result));
        result
    }

    /// Current status of the provider's scope.
    pub fn status(&self, provider: &str) -> BreakerStatus {
        self.states
            .lock()
            .get(&Self::scope(provider))
            .map_or(BreakerStatus::Closed, |s| s.status)
    }

    /// Consecutive classified failures for the provider's scope.
    pub fn consecutive_failures(&self, provider: &str) -> u32 {
        self.states
            .lock()
            .get(&Self::scope(provider))
            .map_or(0, |s| s.consecutive_failures)
    }

    /// Force a scope back to closed (tests, manual intervention).
    pub fn reset(&self, provider: &str) {
        self.states.lock().remove(&Self::scope(provider));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn http_error(status: u16, body: &str) -> LlmError {
        LlmError::Http {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    fn registry() -> BreakerRegistry {
        BreakerRegistry::default()
    }

    fn quick_registry(cooldown: Duration) -> BreakerRegistry {
        BreakerRegistry::new(
            BreakerConfig {
                failure_threshold: 3,
                cooldown,
            },
            Telemetry::disabled(),
        )
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&Ok(())), Outcome::Success);
        assert_eq!(
            classify::<()>(&Err(http_error(503, ""))),
            Outcome::Failure
        );
        assert_eq!(
            classify::<()>(&Err(http_error(429, ""))),
            Outcome::Failure
        );
        assert_eq!(
            classify::<()>(&Err(http_error(401, "rate limit exceeded"))),
            Outcome::Failure
        );
        // Genuine auth failure does not age the breaker.
        assert_eq!(
            classify::<()>(&Err(http_error(401, "invalid api key"))),
            Outcome::Neutral
        );
        assert_eq!(
            classify::<()>(&Err(http_error(404, ""))),
            Outcome::Neutral
        );
        assert_eq!(
            classify::<()>(&Err(LlmError::Timeout(Duration::from_secs(1)))),
            Outcome::Failure
        );
        assert_eq!(
            classify::<()>(&Err(LlmError::Validation("x".into()))),
            Outcome::Neutral
        );
    }

    #[test]
    fn test_opens_after_exactly_threshold_failures() {
        let registry = registry();
        for n in 1..5 {
            registry.record("openai", Outcome::Failure);
            assert_eq!(registry.status("openai"), BreakerStatus::Closed, "after {n}");
        }
        registry.record("openai", Outcome::Failure);
        assert_eq!(registry.status("openai"), BreakerStatus::Open);
    }

    #[test]
    fn test_open_circuit_short_circuits_with_hint() {
        let registry = registry();
        for _ in 0..5 {
            registry.record("openai", Outcome::Failure);
        }
        let err = registry.check("openai").unwrap_err();
        match err {
            LlmError::CircuitOpen {
                provider,
                retry_after,
            } => {
                assert_eq!(provider, "openai");
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(55));
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_success_resets_failure_count() {
        let registry = registry();
        for _ in 0..4 {
            registry.record("openai", Outcome::Failure);
        }
        registry.record("openai", Outcome::Success);
        assert_eq!(registry.consecutive_failures("openai"), 0);
        registry.record("openai", Outcome::Failure);
        assert_eq!(registry.status("openai"), BreakerStatus::Closed);
    }

    #[test]
    fn test_neutral_leaves_count_untouched() {
        let registry = registry();
        for _ in 0..4 {
            registry.record("openai", Outcome::Failure);
        }
        registry.record("openai", Outcome::Neutral);
        assert_eq!(registry.consecutive_failures("openai"), 4);
    }

    #[test]
    fn test_half_open_after_cooldown_single_probe() {
        let registry = quick_registry(Duration::ZERO);
        for _ in 0..3 {
            registry.record("openai", Outcome::Failure);
        }
        assert_eq!(registry.status("openai"), BreakerStatus::Open);

        // Cooldown elapsed: first check admits a probe...
        assert!(registry.check("openai").is_ok());
        assert_eq!(registry.status("openai"), BreakerStatus::HalfOpen);
        // ...and a concurrent call is refused while the probe is pending.
        assert!(registry.check("openai").is_err());
    }

    #[test]
    fn test_probe_success_closes() {
        let registry = quick_registry(Duration::ZERO);
        for _ in 0..3 {
            registry.record("openai", Outcome::Failure);
        }
        registry.check("openai").unwrap();
        registry.record("openai", Outcome::Success);
        assert_eq!(registry.status("openai"), BreakerStatus::Closed);
        assert!(registry.check("openai").is_ok());
    }

    #[test]
    fn test_probe_failure_reopens() {
        let registry = quick_registry(Duration::ZERO);
        for _ in 0..3 {
            registry.record("openai", Outcome::Failure);
        }
        registry.check("openai").unwrap();
        registry.record("openai", Outcome::Failure);
        // Half-open failure reopens immediately regardless of count.
        assert_eq!(registry.status("openai"), BreakerStatus::Open);
    }

    #[tokio::test]
    async fn test_call_does_not_invoke_inner_when_open() {
        let registry = registry();
        for _ in 0..5 {
            registry.record("openai", Outcome::Failure);
        }
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result: Result<()> = registry
            .call("openai", move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(matches!(result, Err(LlmError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_call_records_outcomes() {
        let registry = BreakerRegistry::new(
            BreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(60),
            },
            Telemetry::disabled(),
        );
        for _ in 0..2 {
            let _: Result<()> = registry
                .call("groq", || async { Err(http_error(503, "down")) })
                .await;
        }
        assert_eq!(registry.status("groq"), BreakerStatus::Open);
    }

    #[test]
    fn test_scopes_are_independent() {
        let registry = registry();
        for _ in 0..5 {
            registry.record("openai", Outcome::Failure);
        }
        assert_eq!(registry.status("openai"), BreakerStatus::Open);
        assert_eq!(registry.status("anthropic"), BreakerStatus::Closed);
        assert!(registry.check("anthropic").is_ok());
    }
}
