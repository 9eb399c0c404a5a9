//! Configuration types

use crate::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-node and overall timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TimeoutConfig {
    /// Understanding + enrichment each get this budget, in nanoseconds
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub preprocessing: Duration,
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub agent: Duration,
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub expert: Duration,
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub synthesizer: Duration,
    /// Overall request deadline; clamped to [1s, 120s] at validation
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub request: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            preprocessing: Duration::from_secs(3),
            agent: Duration::from_secs(3),
            expert: Duration::from_secs(10),
            synthesizer: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Stopping-criteria thresholds for the iteration controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct IterationConfig {
    /// Hard ceiling on iterations per request
    pub max_iterations: i32,
    /// How many trailing iterations the convergence check inspects
    pub convergence_window: usize,
    /// Stop when confidence reaches this and consensus reaches its threshold
    pub stop_confidence: f32,
    pub stop_consensus: f32,
    /// Stop when the community evaluation reaches this score
    pub stop_quality: f32,
    /// Stop when the user rating reaches this value (1..=5 scale)
    pub stop_user_rating: f32,
    /// Stop when the mean confidence/consensus delta falls below this
    pub improvement_delta: f32,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            convergence_window: 2,
            stop_confidence: 0.85,
            stop_consensus: 0.80,
            stop_quality: 0.80,
            stop_user_rating: 4.0,
            improvement_delta: 0.05,
        }
    }
}

/// Retrieval-agent defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AgentConfig {
    /// top-k applied when the plan omits one
    pub topk_default: i32,
    /// Retries for the HTTP agent on 5xx / network errors
    pub retries: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            topk_default: 10,
            retries: 2,
        }
    }
}

/// LLM gateway knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct LlmConfig {
    pub temperature_router: f32,
    pub temperature_expert: f32,
    /// Attempts for the JSON-output contract (parse + schema failures)
    pub json_max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            temperature_router: 0.2,
            temperature_expert: 0.3,
            json_max_retries: 3,
        }
    }
}

/// Per-tier quota overrides for the sliding window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TierQuotas {
    pub unlimited: u32,
    pub premium: u32,
    pub standard: u32,
    pub limited: u32,
}

impl Default for TierQuotas {
    fn default() -> Self {
        Self {
            unlimited: u32::MAX,
            premium: RateLimitTier::Premium.quota(),
            standard: RateLimitTier::Standard.quota(),
            limited: RateLimitTier::Limited.quota(),
        }
    }
}

impl TierQuotas {
    /// Quota for a tier under this configuration.
    pub fn for_tier(&self, tier: RateLimitTier) -> u32 {
        match tier {
            RateLimitTier::Unlimited => self.unlimited,
            RateLimitTier::Premium => self.premium,
            RateLimitTier::Standard => self.standard,
            RateLimitTier::Limited => self.limited,
        }
    }
}

/// Sliding-window rate-limit configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Window length in seconds
    pub window_secs: i64,
    pub quotas: TierQuotas,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 3600,
            quotas: TierQuotas::default(),
        }
    }
}

/// Cache TTLs per freshness class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CacheTtlConfig {
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub norm: Duration,
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub case_law: Duration,
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub doctrine: Duration,
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub community: Duration,
    #[cfg_attr(feature = "openapi", schema(value_type = u64))]
    pub consensus: Duration,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            norm: EntityClass::Norm.default_ttl(),
            case_law: EntityClass::CaseLaw.default_ttl(),
            doctrine: EntityClass::Doctrine.default_ttl(),
            community: EntityClass::Community.default_ttl(),
            consensus: EntityClass::Consensus.default_ttl(),
        }
    }
}

impl CacheTtlConfig {
    /// TTL for payloads of a freshness class.
    pub fn for_class(&self, class: EntityClass) -> Duration {
        match class {
            EntityClass::Norm => self.norm,
            EntityClass::CaseLaw => self.case_law,
            EntityClass::Doctrine => self.doctrine,
            EntityClass::Community => self.community,
            EntityClass::Consensus => self.consensus,
        }
    }
}

/// Master engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EngineConfig {
    pub timeouts: TimeoutConfig,
    pub iteration: IterationConfig,
    pub agents: AgentConfig,
    pub llm: LlmConfig,
    pub rate_limit: RateLimitConfig,
    pub cache_ttl: CacheTtlConfig,
    pub enrichment_enabled: bool,
    pub cache_enabled: bool,
}

impl EngineConfig {
    /// Build the default configuration with enrichment and caching on.
    pub fn standard() -> Self {
        Self {
            enrichment_enabled: true,
            cache_enabled: true,
            ..Self::default()
        }
    }

    /// Load from environment variables, falling back to `standard()` values.
    ///
    /// Recognized variables (all optional):
    /// - `LEXFLOW_TIMEOUT_PREPROCESSING_MS`, `LEXFLOW_TIMEOUT_AGENT_MS`,
    ///   `LEXFLOW_TIMEOUT_EXPERT_MS`, `LEXFLOW_TIMEOUT_SYNTHESIZER_MS`,
    ///   `LEXFLOW_TIMEOUT_REQUEST_MS`
    /// - `LEXFLOW_ITERATION_MAX`, `LEXFLOW_ITERATION_STOP_CONFIDENCE`,
    ///   `LEXFLOW_ITERATION_STOP_CONSENSUS`, `LEXFLOW_ITERATION_STOP_QUALITY`,
    ///   `LEXFLOW_ITERATION_STOP_USER_RATING`,
    ///   `LEXFLOW_ITERATION_IMPROVEMENT_DELTA`
    /// - `LEXFLOW_AGENT_TOPK_DEFAULT`, `LEXFLOW_AGENT_RETRIES`
    /// - `LEXFLOW_LLM_TEMPERATURE_ROUTER`, `LEXFLOW_LLM_TEMPERATURE_EXPERT`,
    ///   `LEXFLOW_LLM_JSON_MAX_RETRIES`
    /// - `LEXFLOW_RATELIMIT_ENABLED`, `LEXFLOW_RATELIMIT_WINDOW_SECS`
    /// - `LEXFLOW_ENRICHMENT_ENABLED`, `LEXFLOW_CACHE_ENABLED`
    pub fn from_env() -> Self {
        fn env_ms(name: &str, default: Duration) -> Duration {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        }
        fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        }
        fn env_flag(name: &str, default: bool) -> bool {
            std::env::var(name)
                .ok()
                .map(|s| s.to_lowercase() != "false")
                .unwrap_or(default)
        }

        let defaults = Self::standard();
        Self {
            timeouts: TimeoutConfig {
                preprocessing: env_ms(
                    "LEXFLOW_TIMEOUT_PREPROCESSING_MS",
                    defaults.timeouts.preprocessing,
                ),
                agent: env_ms("LEXFLOW_TIMEOUT_AGENT_MS", defaults.timeouts.agent),
                expert: env_ms("LEXFLOW_TIMEOUT_EXPERT_MS", defaults.timeouts.expert),
                synthesizer: env_ms(
                    "LEXFLOW_TIMEOUT_SYNTHESIZER_MS",
                    defaults.timeouts.synthesizer,
                ),
                request: env_ms("LEXFLOW_TIMEOUT_REQUEST_MS", defaults.timeouts.request),
            },
            iteration: IterationConfig {
                max_iterations: env_parse(
                    "LEXFLOW_ITERATION_MAX",
                    defaults.iteration.max_iterations,
                ),
                convergence_window: env_parse(
                    "LEXFLOW_ITERATION_CONVERGENCE_WINDOW",
                    defaults.iteration.convergence_window,
                ),
                stop_confidence: env_parse(
                    "LEXFLOW_ITERATION_STOP_CONFIDENCE",
                    defaults.iteration.stop_confidence,
                ),
                stop_consensus: env_parse(
                    "LEXFLOW_ITERATION_STOP_CONSENSUS",
                    defaults.iteration.stop_consensus,
                ),
                stop_quality: env_parse(
                    "LEXFLOW_ITERATION_STOP_QUALITY",
                    defaults.iteration.stop_quality,
                ),
                stop_user_rating: env_parse(
                    "LEXFLOW_ITERATION_STOP_USER_RATING",
                    defaults.iteration.stop_user_rating,
                ),
                improvement_delta: env_parse(
                    "LEXFLOW_ITERATION_IMPROVEMENT_DELTA",
                    defaults.iteration.improvement_delta,
                ),
            },
            agents: AgentConfig {
                topk_default: env_parse("LEXFLOW_AGENT_TOPK_DEFAULT", defaults.agents.topk_default),
                retries: env_parse("LEXFLOW_AGENT_RETRIES", defaults.agents.retries),
            },
            llm: LlmConfig {
                temperature_router: env_parse(
                    "LEXFLOW_LLM_TEMPERATURE_ROUTER",
                    defaults.llm.temperature_router,
                ),
                temperature_expert: env_parse(
                    "LEXFLOW_LLM_TEMPERATURE_EXPERT",
                    defaults.llm.temperature_expert,
                ),
                json_max_retries: env_parse(
                    "LEXFLOW_LLM_JSON_MAX_RETRIES",
                    defaults.llm.json_max_retries,
                ),
            },
            rate_limit: RateLimitConfig {
                enabled: env_flag("LEXFLOW_RATELIMIT_ENABLED", defaults.rate_limit.enabled),
                window_secs: env_parse(
                    "LEXFLOW_RATELIMIT_WINDOW_SECS",
                    defaults.rate_limit.window_secs,
                ),
                quotas: TierQuotas::default(),
            },
            cache_ttl: CacheTtlConfig::default(),
            enrichment_enabled: env_flag("LEXFLOW_ENRICHMENT_ENABLED", defaults.enrichment_enabled),
            cache_enabled: env_flag("LEXFLOW_CACHE_ENABLED", defaults.cache_enabled),
        }
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(LexflowError::Config) if invalid.
    pub fn validate(&self) -> LexflowResult<()> {
        if self.timeouts.request < Duration::from_secs(1)
            || self.timeouts.request > Duration::from_secs(120)
        {
            return Err(ConfigError::InvalidValue {
                field: "timeouts.request".to_string(),
                value: format!("{:?}", self.timeouts.request),
                reason: "request timeout must be between 1s and 120s".to_string(),
            }
            .into());
        }

        if self.iteration.max_iterations < 1 || self.iteration.max_iterations > 10 {
            return Err(ConfigError::InvalidValue {
                field: "iteration.max_iterations".to_string(),
                value: self.iteration.max_iterations.to_string(),
                reason: "max_iterations must be between 1 and 10".to_string(),
            }
            .into());
        }

        for (field, value) in [
            ("iteration.stop_confidence", self.iteration.stop_confidence),
            ("iteration.stop_consensus", self.iteration.stop_consensus),
            ("iteration.stop_quality", self.iteration.stop_quality),
            (
                "iteration.improvement_delta",
                self.iteration.improvement_delta,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "threshold must be between 0.0 and 1.0".to_string(),
                }
                .into());
            }
        }

        if !(1.0..=5.0).contains(&self.iteration.stop_user_rating) {
            return Err(ConfigError::InvalidValue {
                field: "iteration.stop_user_rating".to_string(),
                value: self.iteration.stop_user_rating.to_string(),
                reason: "user-rating threshold must be between 1.0 and 5.0".to_string(),
            }
            .into());
        }

        if self.agents.topk_default <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "agents.topk_default".to_string(),
                value: self.agents.topk_default.to_string(),
                reason: "top-k must be greater than 0".to_string(),
            }
            .into());
        }

        if self.rate_limit.window_secs <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "rate_limit.window_secs".to_string(),
                value: self.rate_limit.window_secs.to_string(),
                reason: "window must be positive".to_string(),
            }
            .into());
        }

        for (field, temp) in [
            ("llm.temperature_router", self.llm.temperature_router),
            ("llm.temperature_expert", self.llm.temperature_expert),
        ] {
            if !(0.0..=2.0).contains(&temp) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: temp.to_string(),
                    reason: "temperature must be between 0.0 and 2.0".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}
