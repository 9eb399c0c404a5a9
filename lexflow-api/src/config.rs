//! API Configuration Module
//!
//! Transport-level settings: bind address, CORS, backend endpoints, and the
//! LLM provider selection. Loaded from environment variables with sensible
//! defaults for development. The engine's own knobs live in
//! `lexflow_core::EngineConfig`.

// ============================================================================
// API CONFIGURATION
// ============================================================================

/// Which chat vendor fronts the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmVendor {
    #[default]
    OpenAi,
    Anthropic,
}

impl std::str::FromStr for LlmVendor {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "anthropic" => LlmVendor::Anthropic,
            _ => LlmVendor::OpenAi,
        })
    }
}

/// Transport and wiring configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    // ========================================================================
    // Bind & CORS
    // ========================================================================
    pub bind_host: String,
    pub bind_port: u16,

    /// Allowed CORS origins (comma-separated in env var).
    /// Empty means allow all origins (dev mode).
    pub cors_origins: Vec<String>,

    // ========================================================================
    // Backends
    // ========================================================================
    /// Redis URL for cache + rate-limit counter; None = in-memory backends
    pub redis_url: Option<String>,

    /// Neo4j bolt URI for the knowledge graph; None = enrichment degraded
    pub graph_uri: Option<String>,
    pub graph_user: String,
    pub graph_password: String,

    /// Qdrant URL for the vector store; None = vector agent unavailable
    pub qdrant_url: Option<String>,
    pub qdrant_collection: String,

    /// Base URL of the normative-text service; None = http agent unavailable
    pub normative_service_url: Option<String>,

    /// Use Postgres for the durable store; false = in-memory
    pub postgres_enabled: bool,

    // ========================================================================
    // LLM
    // ========================================================================
    pub llm_vendor: LlmVendor,
    pub llm_api_key: String,
    pub llm_chat_model: String,
    pub llm_embedding_model: String,
    pub llm_embedding_dimensions: i32,

    // ========================================================================
    // Bootstrap
    // ========================================================================
    /// When set, an admin credential with this secret is ensured at startup
    pub bootstrap_admin_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 3000,
            cors_origins: Vec::new(),
            redis_url: None,
            graph_uri: None,
            graph_user: "neo4j".to_string(),
            graph_password: String::new(),
            qdrant_url: None,
            qdrant_collection: "legal_sources".to_string(),
            normative_service_url: None,
            postgres_enabled: false,
            llm_vendor: LlmVendor::default(),
            llm_api_key: String::new(),
            llm_chat_model: "gpt-4o-mini".to_string(),
            llm_embedding_model: "text-embedding-3-large".to_string(),
            llm_embedding_dimensions: 1024,
            bootstrap_admin_key: None,
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `LEXFLOW_API_BIND`, `PORT` / `LEXFLOW_API_PORT`
    /// - `LEXFLOW_CORS_ORIGINS`: comma-separated (empty = allow all)
    /// - `LEXFLOW_REDIS_URL`, `LEXFLOW_GRAPH_URI`, `LEXFLOW_GRAPH_USER`,
    ///   `LEXFLOW_GRAPH_PASSWORD`, `LEXFLOW_QDRANT_URL`,
    ///   `LEXFLOW_QDRANT_COLLECTION`, `LEXFLOW_NORMATIVE_URL`,
    ///   `LEXFLOW_POSTGRES_ENABLED`
    /// - `LEXFLOW_LLM_VENDOR` ("openai" | "anthropic"),
    ///   `LEXFLOW_LLM_API_KEY`, `LEXFLOW_LLM_CHAT_MODEL`,
    ///   `LEXFLOW_LLM_EMBEDDING_MODEL`, `LEXFLOW_LLM_EMBEDDING_DIMENSIONS`
    /// - `LEXFLOW_BOOTSTRAP_ADMIN_KEY`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_origins = std::env::var("LEXFLOW_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bind_host: std::env::var("LEXFLOW_API_BIND").unwrap_or(defaults.bind_host),
            bind_port: std::env::var("PORT")
                .ok()
                .or_else(|| std::env::var("LEXFLOW_API_PORT").ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.bind_port),
            cors_origins,
            redis_url: std::env::var("LEXFLOW_REDIS_URL").ok(),
            graph_uri: std::env::var("LEXFLOW_GRAPH_URI").ok(),
            graph_user: std::env::var("LEXFLOW_GRAPH_USER").unwrap_or(defaults.graph_user),
            graph_password: std::env::var("LEXFLOW_GRAPH_PASSWORD")
                .unwrap_or(defaults.graph_password),
            qdrant_url: std::env::var("LEXFLOW_QDRANT_URL").ok(),
            qdrant_collection: std::env::var("LEXFLOW_QDRANT_COLLECTION")
                .unwrap_or(defaults.qdrant_collection),
            normative_service_url: std::env::var("LEXFLOW_NORMATIVE_URL").ok(),
            postgres_enabled: std::env::var("LEXFLOW_POSTGRES_ENABLED")
                .ok()
                .map(|s| s.to_lowercase() == "true")
                .unwrap_or(defaults.postgres_enabled),
            llm_vendor: std::env::var("LEXFLOW_LLM_VENDOR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            llm_api_key: std::env::var("LEXFLOW_LLM_API_KEY").unwrap_or(defaults.llm_api_key),
            llm_chat_model: std::env::var("LEXFLOW_LLM_CHAT_MODEL")
                .unwrap_or(defaults.llm_chat_model),
            llm_embedding_model: std::env::var("LEXFLOW_LLM_EMBEDDING_MODEL")
                .unwrap_or(defaults.llm_embedding_model),
            llm_embedding_dimensions: std::env::var("LEXFLOW_LLM_EMBEDDING_DIMENSIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.llm_embedding_dimensions),
            bootstrap_admin_key: std::env::var("LEXFLOW_BOOTSTRAP_ADMIN_KEY").ok(),
        }
    }

    /// Check if a given origin is allowed.
    pub fn is_origin_allowed(&self, origin: &str) -> bool {
        if self.cors_origins.is_empty() {
            // Dev mode: allow all
            return true;
        }
        self.cors_origins.iter().any(|allowed| allowed == origin)
    }
}
