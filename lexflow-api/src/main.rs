//! Lexflow API Server Entry Point
//!
//! Bootstraps configuration, wires the backends (durable store, cache,
//! counter, graph, vector, LLM), builds the workflow runtime, and starts
//! the Axum HTTP server with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use lexflow_api::{
    create_api_router, ApiConfig, ApiError, ApiResult, AppState, LlmVendor,
};
use lexflow_core::{CredentialRecord, EngineConfig, PrincipalRole, RateLimitTier};
use lexflow_engine::WorkflowRuntime;
use lexflow_llm::providers::{AnthropicChatProvider, OpenAiChatProvider, OpenAiEmbeddingProvider};
use lexflow_llm::{ChatProvider, EmbeddingProvider};
use lexflow_retrieval::{
    AgentRegistry, GraphAgent, GraphClient, HttpAgent, NormativeTextClient, RetrievalAgent,
    VectorAgent,
};
use lexflow_storage::{
    CacheBackend, CounterStore, DurableStore, MemoryCache, MemoryCounter, MemoryStore, PgConfig,
    PgStore, RedisCache, RedisCounter,
};

#[tokio::main]
async fn main() -> ApiResult<()> {
    lexflow_api::telemetry::init_tracing();

    let api_config = ApiConfig::from_env();
    let engine_config = EngineConfig::from_env();
    engine_config
        .validate()
        .map_err(|e| ApiError::internal_error(format!("Invalid engine configuration: {}", e)))?;

    // ------------------------------------------------------------------
    // Durable store
    // ------------------------------------------------------------------
    let durable: Arc<dyn DurableStore> = if api_config.postgres_enabled {
        let pg = PgStore::connect(&PgConfig::from_env())
            .await
            .map_err(|e| ApiError::internal_error(format!("Postgres unavailable: {}", e)))?;
        tracing::info!("durable store: postgres");
        Arc::new(pg)
    } else {
        tracing::warn!("durable store: in-memory (set LEXFLOW_POSTGRES_ENABLED=true for persistence)");
        Arc::new(MemoryStore::new())
    };

    // ------------------------------------------------------------------
    // Cache + rate-limit counter
    // ------------------------------------------------------------------
    let (cache, counter): (Option<Arc<dyn CacheBackend>>, Arc<dyn CounterStore>) =
        match &api_config.redis_url {
            Some(url) => {
                let cache = RedisCache::connect(url)
                    .await
                    .map_err(|e| ApiError::internal_error(format!("Redis unavailable: {}", e)))?;
                let counter = RedisCounter::connect(url)
                    .await
                    .map_err(|e| ApiError::internal_error(format!("Redis unavailable: {}", e)))?;
                tracing::info!("cache and counter: redis");
                (Some(Arc::new(cache) as Arc<dyn CacheBackend>), Arc::new(counter))
            }
            None => {
                tracing::warn!("cache and counter: in-memory (set LEXFLOW_REDIS_URL for shared state)");
                (
                    Some(Arc::new(MemoryCache::new()) as Arc<dyn CacheBackend>),
                    Arc::new(MemoryCounter::new()),
                )
            }
        };

    // ------------------------------------------------------------------
    // Graph store (optional: enrichment degrades without it)
    // ------------------------------------------------------------------
    let graph = match &api_config.graph_uri {
        Some(uri) => {
            match GraphClient::connect(uri, &api_config.graph_user, &api_config.graph_password)
                .await
            {
                Ok(client) => {
                    tracing::info!(%uri, "graph store connected");
                    Some(client)
                }
                Err(e) => {
                    tracing::warn!(%uri, error = %e, "graph store unavailable, enrichment will degrade");
                    None
                }
            }
        }
        None => {
            tracing::warn!("no graph store configured, enrichment will degrade");
            None
        }
    };

    // ------------------------------------------------------------------
    // LLM providers
    // ------------------------------------------------------------------
    let chat: Arc<dyn ChatProvider> = match api_config.llm_vendor {
        LlmVendor::Anthropic => Arc::new(AnthropicChatProvider::new(
            api_config.llm_api_key.clone(),
            api_config.llm_chat_model.clone(),
            50,
        )),
        LlmVendor::OpenAi => Arc::new(OpenAiChatProvider::new(
            api_config.llm_api_key.clone(),
            api_config.llm_chat_model.clone(),
        )),
    };
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(OpenAiEmbeddingProvider::new(
        api_config.llm_api_key.clone(),
        api_config.llm_embedding_model.clone(),
        api_config.llm_embedding_dimensions,
    ));

    // ------------------------------------------------------------------
    // Retrieval agents
    // ------------------------------------------------------------------
    let mut agents = AgentRegistry::new();
    if let Some(client) = &graph {
        agents.insert(
            lexflow_core::AgentKind::Graph,
            Arc::new(GraphAgent::new(client.clone(), engine_config.timeouts.agent))
                as Arc<dyn RetrievalAgent>,
        );
    }
    if let Some(url) = &api_config.normative_service_url {
        agents.insert(
            lexflow_core::AgentKind::Http,
            Arc::new(HttpAgent::new(
                NormativeTextClient::new(url.clone(), engine_config.agents.retries),
                engine_config.timeouts.agent,
            )) as Arc<dyn RetrievalAgent>,
        );
    }
    if let Some(url) = &api_config.qdrant_url {
        match qdrant_client::Qdrant::from_url(url).build() {
            Ok(client) => {
                agents.insert(
                    lexflow_core::AgentKind::Vector,
                    Arc::new(VectorAgent::new(
                        Arc::new(client),
                        embedder.clone(),
                        api_config.qdrant_collection.clone(),
                        engine_config.timeouts.agent,
                    )) as Arc<dyn RetrievalAgent>,
                );
            }
            Err(e) => {
                tracing::warn!(%url, error = %e, "vector store unavailable, vector agent disabled");
            }
        }
    }
    if agents.is_empty() {
        tracing::warn!("no retrieval agents configured, every plan will degrade");
    }

    // ------------------------------------------------------------------
    // Runtime, bootstrap credential, router
    // ------------------------------------------------------------------
    let runtime = WorkflowRuntime::new(
        engine_config.clone(),
        chat,
        graph.clone(),
        cache.clone(),
        agents,
        durable.clone(),
    )
    .map_err(|e| ApiError::internal_error(format!("Failed to build runtime: {}", e)))?;

    if let Some(secret) = &api_config.bootstrap_admin_key {
        ensure_bootstrap_credential(durable.as_ref(), secret).await?;
    }

    let state = AppState::new(
        Arc::new(runtime),
        durable,
        counter,
        cache,
        graph,
        engine_config,
        api_config.clone(),
    );
    let app = create_api_router(state);

    let addr: SocketAddr = format!("{}:{}", api_config.bind_host, api_config.bind_port)
        .parse()
        .map_err(|e| ApiError::internal_error(format!("Invalid bind address: {}", e)))?;
    tracing::info!(%addr, "Starting Lexflow API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}

/// Ensure the bootstrap admin credential exists. Idempotent across restarts:
/// the credential is looked up by hash before inserting.
async fn ensure_bootstrap_credential(durable: &dyn DurableStore, secret: &str) -> ApiResult<()> {
    let hash = lexflow_core::CredentialHash::digest(secret);
    let existing = durable
        .credential_by_hash(&hash)
        .await
        .map_err(|e| ApiError::internal_error(format!("Credential lookup failed: {}", e)))?;

    if existing.is_none() {
        let mut record =
            CredentialRecord::new(secret, PrincipalRole::Admin, RateLimitTier::Unlimited);
        record.description = Some("bootstrap admin credential".to_string());
        durable
            .insert_credential(&record)
            .await
            .map_err(|e| ApiError::internal_error(format!("Credential insert failed: {}", e)))?;
        tracing::info!(credential_id = %record.credential_id, "bootstrap admin credential created");
    }

    Ok(())
}
