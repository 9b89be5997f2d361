//! Provider configuration resolution.
//!
//! Every request resolves its API key, base URL, default model, and timeout
//! before any provider code runs. Precedence, highest first:
//!
//! 1. explicit request option
//! 2. static configuration installed on the client
//! 3. environment variable (`<PREFIX>_API_KEY`, `<PREFIX>_BASE_URL` /
//!    `<PREFIX>_API_BASE`, `<PREFIX>_MODEL`, plus provider aliases)
//! 4. the provider's built-in default

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{LlmError, Result};
use crate::options::ChatOptions;
use crate::streaming::ChunkCallback;

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Source of environment variables. Process env in production; a map in tests.
pub trait EnvSource: Send + Sync {
    /// Look up one variable.
    fn get(&self, key: &str) -> Option<String>;
}

/// [`EnvSource`] backed by the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// [`EnvSource`] backed by a fixed map. For tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MapEnv(pub HashMap<String, String>);

impl MapEnv {
    /// Build from `(key, value)` pairs.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl EnvSource for MapEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Built-in defaults a provider adapter declares about itself.
///
/// The resolver combines these with options, static config, and env vars.
#[derive(Debug, Clone)]
pub struct ProviderDefaults {
    /// Env-var prefix (`OPENAI`, `ANTHROPIC`, ...).
    pub env_prefix: &'static str,
    /// Additional API-key env vars honored after `<PREFIX>_API_KEY`
    /// (e.g. `GOOGLE_API_KEY` for Gemini).
    pub api_key_aliases: &'static [&'static str],
    /// Default base URL when none is configured.
    pub default_base_url: &'static str,
    /// Default model when none is configured.
    pub default_model: &'static str,
    /// Whether a missing API key is a configuration error.
    pub requires_api_key: bool,
}

/// Static per-provider overrides installed on the client.
#[derive(Debug, Clone, Default)]
pub struct ProviderOverrides {
    /// API key override.
    pub api_key: Option<String>,
    /// Base URL override.
    pub base_url: Option<String>,
    /// Default model override.
    pub model: Option<String>,
    /// Request timeout override.
    pub timeout: Option<Duration>,
}

/// AWS credentials and region for SigV4-signed providers.
#[derive(Clone, Default)]
pub struct AwsCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Optional session token.
    pub session_token: Option<String>,
    /// Region (e.g. `us-east-1`).
    pub region: String,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &redact(&self.access_key_id))
            .field("region", &self.region)
            .field("has_session_token", &self.session_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Configuration a request carries after the fetch-configuration plug ran.
#[derive(Clone, Default)]
pub struct ResolvedConfig {
    /// API key, if resolved.
    pub api_key: Option<String>,
    /// Base URL for the provider's HTTP API.
    pub base_url: String,
    /// Model id for this request.
    pub model: String,
    /// Per-request deadline.
    pub timeout: Duration,
    /// AWS credentials for SigV4 providers.
    pub aws: Option<AwsCredentials>,
    /// OpenRouter attribution: `HTTP-Referer` header value.
    pub app_referer: Option<String>,
    /// OpenRouter attribution: `X-Title` header value.
    pub app_title: Option<String>,
    /// Whether the disk replay store is consulted before HTTP.
    pub replay_enabled: bool,
    /// Chunk callback moved out of the options by the streaming-preparation plug.
    pub stream_callback: Option<ChunkCallback>,
}

impl std::fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("api_key", &self.api_key.as_deref().map(redact))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .field("has_aws", &self.aws.is_some())
            .field("replay_enabled", &self.replay_enabled)
            .field("has_stream_callback", &self.stream_callback.is_some())
            .finish_non_exhaustive()
    }
}

fn redact(key: impl AsRef<str>) -> String {
    let key = key.as_ref();
    if key.len() > 6 {
        format!("{}***", &key[..6])
    } else {
        "***".to_string()
    }
}

/// Resolves request configuration from options, static config, and env.
#[derive(Clone)]
pub struct ConfigResolver {
    overrides: HashMap<String, ProviderOverrides>,
    env: Arc<dyn EnvSource>,
}

impl std::fmt::Debug for ConfigResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigResolver")
            .field("override_count", &self.overrides.len())
            .finish_non_exhaustive()
    }
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new(HashMap::new(), Arc::new(ProcessEnv))
    }
}

impl ConfigResolver {
    /// Resolver with static overrides and an env source.
    pub fn new(overrides: HashMap<String, ProviderOverrides>, env: Arc<dyn EnvSource>) -> Self {
        Self { overrides, env }
    }

    /// Resolver reading only the given env source (tests).
    pub fn from_env(env: Arc<dyn EnvSource>) -> Self {
        Self::new(HashMap::new(), env)
    }

    fn overrides_for(&self, provider: &str) -> Option<&ProviderOverrides> {
        self.overrides.get(provider)
    }

    fn env_first(&self, keys: &[String]) -> Option<String> {
        keys.iter()
            .find_map(|k| self.env.get(k).filter(|v| !v.is_empty()))
    }

    /// Resolve the configuration for one request.
    ///
    /// `provider` is the provider tag used for static-override lookup;
    /// `defaults` come from the adapter. Fails with
    /// [`LlmError::Configuration`] when a required API key is missing.
    pub fn resolve(
        &self,
        provider: &str,
        defaults: &ProviderDefaults,
        options: &ChatOptions,
    ) -> Result<ResolvedConfig> {
        let overrides = self.overrides_for(provider);
        let prefix = defaults.env_prefix;

        let mut key_vars = vec![format!("{prefix}_API_KEY")];
        key_vars.extend(defaults.api_key_aliases.iter().map(|a| (*a).to_string()));
        let api_key = overrides
            .and_then(|o| o.api_key.clone())
            .or_else(|| self.env_first(&key_vars));

        if api_key.is_none() && defaults.requires_api_key {
            return Err(LlmError::Configuration(format!(
                "missing API key for '{provider}': set {prefix}_API_KEY or configure it on the client"
            )));
        }

        let base_url = overrides
            .and_then(|o| o.base_url.clone())
            .or_else(|| {
                self.env_first(&[format!("{prefix}_BASE_URL"), format!("{prefix}_API_BASE")])
            })
            .unwrap_or_else(|| defaults.default_base_url.to_string());

        let model = options
            .model
            .clone()
            .or_else(|| overrides.and_then(|o| o.model.clone()))
            .or_else(|| self.env_first(&[format!("{prefix}_MODEL")]))
            .unwrap_or_else(|| defaults.default_model.to_string());

        let timeout = options
            .timeout
            .or_else(|| overrides.and_then(|o| o.timeout))
            .unwrap_or(DEFAULT_TIMEOUT);

        let aws = self.resolve_aws(options);

        let replay_enabled = self
            .env
            .get("LLM_CONDUIT_TEST_CACHE")
            .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));

        Ok(ResolvedConfig {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            timeout,
            aws,
            app_referer: self.env.get("OPENROUTER_APP_URL"),
            app_title: self.env.get("OPENROUTER_APP_NAME"),
            replay_enabled,
            stream_callback: None,
        })
    }

    /// AWS credential chain: explicit region option, then env vars.
    fn resolve_aws(&self, options: &ChatOptions) -> Option<AwsCredentials> {
        let access_key_id = self.env.get("AWS_ACCESS_KEY_ID")?;
        let secret_access_key = self.env.get("AWS_SECRET_ACCESS_KEY")?;
        let region = options
            .region
            .clone()
            .or_else(|| self.env.get("AWS_REGION"))
            .unwrap_or_else(|| "us-east-1".to_string());
        Some(AwsCredentials {
            access_key_id,
            secret_access_key,
            session_token: self.env.get("AWS_SESSION_TOKEN"),
            region,
        })
    }
}
