//! Response caching.
//!
//! Two strategies behind one call shape:
//!
//! - **Production** ([`ResponseCache`]): a hot in-memory store with TTL
//!   expiry and at-most-once population per key; concurrent misses on the
//!   same fingerprint coalesce onto a single loader run (single-flight via
//!   moka's `try_get_with`).
//! - **Test/replay** ([`replay::ReplayStore`]): when the replay flag is
//!   active, the execute plug consults a cold on-disk store keyed by the
//!   same fingerprint *below* the HTTP layer, so recorded provider bodies
//!   replay without any network.
//!
//! Event accounting: every lookup that finds a stored value emits
//! `cache.hit`; every lookup that does not emits `cache.miss` (so M
//! concurrent misses on one key emit M miss events); the one loader that
//! runs emits a single `cache.put`.

pub mod replay;

use std::time::{Duration, Instant};

use moka::Expiry;
use sha2::{Digest, Sha256};

use crate::error::{LlmError, Result};
use crate::options::ChatOptions;
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::types::{ChatResponse, Message};
use std::sync::Arc;

/// Deterministic fingerprint over the request identity.
///
/// SHA-256 of the canonical JSON of `{provider, model, messages,
/// salient_options}`, hex-encoded. Delivery options (streaming, callbacks,
/// buffer sizes) do not participate, so a cached answer is shared across
/// delivery modes.
pub fn fingerprint(
    provider: &str,
    model: &str,
    messages: &[Message],
    options: &ChatOptions,
) -> String {
    let canonical = serde_json::json!({
        "provider": provider,
        "model": model,
        "messages": messages,
        "options": options.salient(),
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

/// Hot-cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries.
    pub max_capacity: u64,
    /// TTL applied when the caller does not override it.
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1000,
            default_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl CacheConfig {
    /// Apply `LLM_CONDUIT_CACHE_TTL` (seconds) and
    /// `LLM_CONDUIT_CACHE_MAX_SIZE` overrides from the environment.
    pub fn overridden_from_env(mut self, env: &dyn crate::config::EnvSource) -> Self {
        if let Some(ttl) = env
            .get("LLM_CONDUIT_CACHE_TTL")
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.default_ttl = Duration::from_secs(ttl);
        }
        if let Some(max) = env
            .get("LLM_CONDUIT_CACHE_MAX_SIZE")
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.max_capacity = max;
        }
        self
    }
}

#[derive(Clone)]
struct CachedEntry {
    value: Arc<ChatResponse>,
    ttl: Option<Duration>,
}

struct PerEntryTtl {
    default_ttl: Duration,
}

impl Expiry<String, CachedEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl.unwrap_or(self.default_ttl))
    }
}

/// Hot in-memory response cache with TTL and single-flight population.
pub struct ResponseCache {
    hot: moka::future::Cache<String, CachedEntry>,
    telemetry: Telemetry,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("entries", &self.hot.entry_count())
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Cache with the given tuning.
    pub fn new(config: CacheConfig, telemetry: Telemetry) -> Self {
        let hot = moka::future::Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(PerEntryTtl {
                default_ttl: config.default_ttl,
            })
            .build();
        Self { hot, telemetry }
    }

    /// Look up `key`, or populate it with `loader` on a miss.
    ///
    /// At most one loader runs per key at a time: concurrent missing
    /// callers wait for the in-flight population and all observe the same
    /// value. Loader errors propagate to every waiting caller and nothing
    /// is stored. `ttl` overrides the configured default for this entry.
    pub async fn with_cache<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<Arc<ChatResponse>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<ChatResponse>>,
    {
        if let Some(entry) = self.hot.get(key).await {
            self.telemetry.emit(TelemetryEvent::CacheHit {
                key: key.to_string(),
                size_bytes: entry.value.size_bytes(),
            });
            return Ok(entry.value);
        }
        self.telemetry.emit(TelemetryEvent::CacheMiss {
            key: key.to_string(),
        });

        let telemetry = self.telemetry.clone();
        let key_owned = key.to_string();
        let result = self
            .hot
            .try_get_with(key_owned.clone(), async move {
                let value = Arc::new(loader().await?);
                telemetry.emit(TelemetryEvent::CachePut {
                    key: key_owned,
                    size_bytes: value.size_bytes(),
                });
                Ok::<_, LlmError>(CachedEntry { value, ttl })
            })
            .await;

        match result {
            Ok(entry) => Ok(entry.value),
            Err(shared) => Err(clone_error(&shared)),
        }
    }

    /// Direct lookup without populating.
    pub async fn get(&self, key: &str) -> Option<Arc<ChatResponse>> {
        self.hot.get(key).await.map(|e| e.value)
    }

    /// Remove one entry.
    pub async fn invalidate(&self, key: &str) {
        self.hot.invalidate(key).await;
    }

    /// Flush internal maintenance so `entry_count` is exact (tests).
    pub async fn sync(&self) {
        self.hot.run_pending_tasks().await;
    }

    /// Approximate entry count.
    pub fn entry_count(&self) -> u64 {
        self.hot.entry_count()
    }
}

/// Rebuild an equivalent error from a shared loader failure.
///
/// Single-flight shares one `LlmError` across all waiting callers; the
/// non-clonable source variants (`reqwest`, `serde_json`) degrade to their
/// message, everything else keeps its exact shape.
fn clone_error(err: &LlmError) -> LlmError {
    match err {
        LlmError::Validation(m) => LlmError::Validation(m.clone()),
        LlmError::Configuration(m) => LlmError::Configuration(m.clone()),
        LlmError::Http {
            status,
            body,
            retry_after,
        } => LlmError::Http {
            status: *status,
            body: body.clone(),
            retry_after: *retry_after,
        },
        LlmError::Protocol(m) => LlmError::Protocol(m.clone()),
        LlmError::Provider { provider, payload } => LlmError::Provider {
            provider: provider.clone(),
            payload: payload.clone(),
        },
        LlmError::CircuitOpen {
            provider,
            retry_after,
        } => LlmError::CircuitOpen {
            provider: provider.clone(),
            retry_after: *retry_after,
        },
        LlmError::Backpressure => LlmError::Backpressure,
        LlmError::Cancelled => LlmError::Cancelled,
        LlmError::NotFound(m) => LlmError::NotFound(m.clone()),
        LlmError::Timeout(d) => LlmError::Timeout(*d),
        LlmError::Request(_) | LlmError::Json(_) | LlmError::Other(_) => {
            LlmError::Other(err.to_string())
        }
    }
}
