//! Static provider capability catalog.
//!
//! One [`CapabilityRecord`] per supported provider: which endpoints it
//! serves, how it authenticates, which features it supports, and its known
//! limitations. Used for feature gating before a request is built and for
//! provider routing (`find`, `compare`, `recommend`).

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use serde_json::{json, Value};

/// API surface a provider exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endpoint {
    Chat,
    Embeddings,
    Images,
    Audio,
    Completions,
    FineTuning,
    Files,
}

/// How a provider authenticates requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    ApiKey,
    Oauth,
    AwsSignature,
    ServiceAccount,
    BearerToken,
}

/// A capability a provider may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Feature {
    Streaming,
    FunctionCalling,
    CostTracking,
    UsageTracking,
    DynamicModelListing,
    BatchOperations,
    FileUploads,
    RateLimitingHeaders,
    SystemMessages,
    JsonMode,
    ContextCaching,
    Vision,
    AudioInput,
    AudioOutput,
    WebSearch,
    ToolUse,
    ComputerUse,
}

/// Everything the registry knows about one provider.
#[derive(Debug, Clone)]
pub struct CapabilityRecord {
    /// Provider tag (registry key).
    pub id: &'static str,
    /// Human-readable name.
    pub name: &'static str,
    /// Endpoints the provider serves.
    pub endpoints: Vec<Endpoint>,
    /// Accepted authentication methods.
    pub authentication: Vec<AuthMethod>,
    /// Supported features.
    pub features: Vec<Feature>,
    /// Free-form limitations (`max_context_tokens`, `no_cost_tracking`, ...).
    pub limitations: HashMap<&'static str, Value>,
}

impl CapabilityRecord {
    /// Whether the provider supports the feature.
    pub fn supports_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    /// Whether the provider serves the endpoint.
    pub fn supports_endpoint(&self, endpoint: Endpoint) -> bool {
        self.endpoints.contains(&endpoint)
    }
}

fn limitations(pairs: &[(&'static str, Value)]) -> HashMap<&'static str, Value> {
    pairs.iter().cloned().collect()
}

static REGISTRY: Lazy<BTreeMap<&'static str, CapabilityRecord>> = Lazy::new(|| {
    use AuthMethod::*;
    use Endpoint::*;
    use Feature::*;

    let records = vec![
        CapabilityRecord {
            id: "openai",
            name: "OpenAI",
            endpoints: vec![Chat, Embeddings, Images, Audio, Completions, FineTuning, Files],
            authentication: vec![ApiKey, BearerToken],
            features: vec![
                Streaming, FunctionCalling, CostTracking, UsageTracking, DynamicModelListing,
                BatchOperations, FileUploads, RateLimitingHeaders, SystemMessages, JsonMode,
                Vision, AudioInput, AudioOutput, ToolUse,
            ],
            limitations: limitations(&[("max_context_tokens", json!(1_047_576))]),
        },
        CapabilityRecord {
            id: "anthropic",
            name: "Anthropic",
            endpoints: vec![Chat],
            authentication: vec![ApiKey],
            features: vec![
                Streaming, FunctionCalling, CostTracking, UsageTracking, SystemMessages,
                ContextCaching, Vision, ToolUse, ComputerUse,
            ],
            limitations: limitations(&[
                ("max_context_tokens", json!(200_000)),
                ("beta_features", json!(["computer-use", "prompt-caching"])),
            ]),
        },
        CapabilityRecord {
            id: "gemini",
            name: "Google Gemini",
            endpoints: vec![Chat, Embeddings],
            authentication: vec![ApiKey, ServiceAccount, Oauth],
            features: vec![
                Streaming, FunctionCalling, UsageTracking, DynamicModelListing, SystemMessages,
                JsonMode, ContextCaching, Vision, AudioInput, ToolUse,
            ],
            limitations: limitations(&[("max_context_tokens", json!(1_048_576))]),
        },
        CapabilityRecord {
            id: "bedrock",
            name: "AWS Bedrock",
            endpoints: vec![Chat, Embeddings],
            authentication: vec![AwsSignature],
            features: vec![
                Streaming, FunctionCalling, UsageTracking, SystemMessages, Vision, ToolUse,
            ],
            limitations: limitations(&[
                ("no_cost_tracking", json!(true)),
                ("regional_model_availability", json!(true)),
            ]),
        },
        CapabilityRecord {
            id: "ollama",
            name: "Ollama",
            endpoints: vec![Chat, Embeddings, Completions],
            authentication: vec![],
            features: vec![
                Streaming, UsageTracking, DynamicModelListing, SystemMessages, JsonMode, Vision,
            ],
            limitations: limitations(&[
                ("no_cost_tracking", json!(true)),
                ("local_only", json!(true)),
            ]),
        },
        CapabilityRecord {
            id: "groq",
            name: "Groq",
            endpoints: vec![Chat],
            authentication: vec![ApiKey, BearerToken],
            features: vec![
                Streaming, FunctionCalling, UsageTracking, DynamicModelListing,
                RateLimitingHeaders, SystemMessages, JsonMode, ToolUse,
            ],
            limitations: limitations(&[("max_context_tokens", json!(131_072))]),
        },
        CapabilityRecord {
            id: "mistral",
            name: "Mistral",
            endpoints: vec![Chat, Embeddings, FineTuning],
            authentication: vec![ApiKey, BearerToken],
            features: vec![
                Streaming, FunctionCalling, UsageTracking, DynamicModelListing, SystemMessages,
                JsonMode, ToolUse,
            ],
            limitations: limitations(&[("max_context_tokens", json!(131_072))]),
        },
        CapabilityRecord {
            id: "openrouter",
            name: "OpenRouter",
            endpoints: vec![Chat, Completions],
            authentication: vec![ApiKey, BearerToken],
            features: vec![
                Streaming, FunctionCalling, CostTracking, UsageTracking, DynamicModelListing,
                RateLimitingHeaders, SystemMessages, JsonMode, Vision, ToolUse, WebSearch,
            ],
            limitations: limitations(&[("model_routing_fees", json!(true))]),
        },
        CapabilityRecord {
            id: "perplexity",
            name: "Perplexity",
            endpoints: vec![Chat],
            authentication: vec![ApiKey, BearerToken],
            features: vec![Streaming, UsageTracking, SystemMessages, WebSearch],
            limitations: limitations(&[("no_function_calling", json!(true))]),
        },
        CapabilityRecord {
            id: "xai",
            name: "xAI",
            endpoints: vec![Chat],
            authentication: vec![ApiKey, BearerToken],
            features: vec![
                Streaming, FunctionCalling, UsageTracking, SystemMessages, JsonMode, Vision,
                ToolUse, WebSearch,
            ],
            limitations: limitations(&[("max_context_tokens", json!(131_072))]),
        },
        CapabilityRecord {
            id: "local",
            name: "Local runner",
            endpoints: vec![Chat, Completions],
            authentication: vec![],
            features: vec![Streaming, SystemMessages],
            limitations: limitations(&[
                ("no_cost_tracking", json!(true)),
                ("local_only", json!(true)),
            ]),
        },
    ];

    records.into_iter().map(|r| (r.id, r)).collect()
});

/// The record for a provider tag, if registered.
pub fn get(provider: &str) -> Option<&'static CapabilityRecord> {
    REGISTRY.get(provider)
}

/// Whether the provider tag is registered at all.
pub fn is_registered(provider: &str) -> bool {
    REGISTRY.contains_key(provider)
}

/// All registered provider tags, sorted.
pub fn list_providers() -> Vec<&'static str> {
    REGISTRY.keys().copied().collect()
}

/// Whether the provider supports the feature.
pub fn supports_feature(provider: &str, feature: Feature) -> bool {
    get(provider).is_some_and(|r| r.supports_feature(feature))
}

/// Whether the provider serves the endpoint.
pub fn supports_endpoint(provider: &str, endpoint: Endpoint) -> bool {
    get(provider).is_some_and(|r| r.supports_endpoint(endpoint))
}

/// Providers supporting *all* of the given features, sorted by tag.
pub fn find_providers_with_features(features: &[Feature]) -> Vec<&'static str> {
    REGISTRY
        .values()
        .filter(|r| features.iter().all(|f| r.supports_feature(*f)))
        .map(|r| r.id)
        .collect()
}

/// Authentication methods for a provider.
pub fn get_auth_methods(provider: &str) -> Vec<AuthMethod> {
    get(provider).map(|r| r.authentication.clone()).unwrap_or_default()
}

/// Endpoints for a provider.
pub fn get_endpoints(provider: &str) -> Vec<Endpoint> {
    get(provider).map(|r| r.endpoints.clone()).unwrap_or_default()
}

/// Limitations map for a provider.
pub fn get_limitations(provider: &str) -> HashMap<&'static str, Value> {
    get(provider).map(|r| r.limitations.clone()).unwrap_or_default()
}

/// Side-by-side comparison of several providers.
#[derive(Debug, Clone)]
pub struct ProviderComparison {
    /// The providers compared (unknown tags are skipped).
    pub providers: Vec<&'static str>,
    /// Union of all features, sorted.
    pub all_features: Vec<Feature>,
    /// Union of all endpoints, sorted.
    pub all_endpoints: Vec<Endpoint>,
    /// Per-provider feature presence, keyed by tag.
    pub feature_matrix: BTreeMap<&'static str, Vec<Feature>>,
}

/// Compare the given providers' capability surfaces.
pub fn compare_providers(providers: &[&str]) -> ProviderComparison {
    let records: Vec<_> = providers.iter().filter_map(|p| get(p)).collect();

    let mut all_features: Vec<Feature> = records
        .iter()
        .flat_map(|r| r.features.iter().copied())
        .collect();
    all_features.sort();
    all_features.dedup();

    let mut all_endpoints: Vec<Endpoint> = records
        .iter()
        .flat_map(|r| r.endpoints.iter().copied())
        .collect();
    all_endpoints.sort();
    all_endpoints.dedup();

    ProviderComparison {
        providers: records.iter().map(|r| r.id).collect(),
        all_features,
        all_endpoints,
        feature_matrix: records
            .iter()
            .map(|r| {
                let mut features = r.features.clone();
                features.sort();
                (r.id, features)
            })
            .collect(),
    }
}

/// Constraints for [`recommend_providers`].
#[derive(Debug, Clone, Default)]
pub struct Recommendation {
    /// Features every candidate must have (candidates missing any are dropped).
    pub required_features: Vec<Feature>,
    /// Features that improve a candidate's score.
    pub preferred_features: Vec<Feature>,
    /// Tags to exclude outright.
    pub exclude_providers: Vec<String>,
    /// Boost providers that run locally.
    pub prefer_local: bool,
}

/// One scored candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderScore {
    /// Provider tag.
    pub provider: &'static str,
    /// 1.0 per required feature, 0.5 per preferred, +0.25 local boost.
    pub score: f64,
    /// Preferred features the provider actually has.
    pub matched_preferred: Vec<Feature>,
}

/// Rank providers against the constraints, best first.
///
/// Providers missing any required feature are filtered out. The sort is
/// stable: equal scores keep registry (alphabetical) order.
pub fn recommend_providers(request: &Recommendation) -> Vec<ProviderScore> {
    let mut scored: Vec<ProviderScore> = REGISTRY
        .values()
        .filter(|r| !request.exclude_providers.iter().any(|e| e == r.id))
        .filter(|r| {
            request
                .required_features
                .iter()
                .all(|f| r.supports_feature(*f))
        })
        .map(|r| {
            let matched_preferred: Vec<Feature> = request
                .preferred_features
                .iter()
                .copied()
                .filter(|f| r.supports_feature(*f))
                .collect();
            let is_local = r
                .limitations
                .get("local_only")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let mut score = request.required_features.len() as f64
                + 0.5 * matched_preferred.len() as f64;
            if request.prefer_local && is_local {
                score += 0.25;
            }
            ProviderScore {
                provider: r.id,
                score,
                matched_preferred,
            }
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}
