//! Shared application state for the API layer

use crate::auth::CredentialVerifier;
use crate::config::ApiConfig;
use lexflow_core::EngineConfig;
use lexflow_engine::WorkflowRuntime;
use lexflow_retrieval::GraphClient;
use lexflow_storage::{CacheBackend, CounterStore, DurableStore};
use std::sync::Arc;
use std::time::Instant;

/// Everything the routes and middleware need. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<WorkflowRuntime>,
    pub durable: Arc<dyn DurableStore>,
    pub counter: Arc<dyn CounterStore>,
    pub cache: Option<Arc<dyn CacheBackend>>,
    pub graph: Option<GraphClient>,
    pub verifier: CredentialVerifier,
    pub engine_config: Arc<EngineConfig>,
    pub api_config: Arc<ApiConfig>,
    pub started_at: Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<WorkflowRuntime>,
        durable: Arc<dyn DurableStore>,
        counter: Arc<dyn CounterStore>,
        cache: Option<Arc<dyn CacheBackend>>,
        graph: Option<GraphClient>,
        engine_config: EngineConfig,
        api_config: ApiConfig,
    ) -> Self {
        Self {
            verifier: CredentialVerifier::new(durable.clone()),
            runtime,
            durable,
            counter,
            cache,
            graph,
            engine_config: Arc::new(engine_config),
            api_config: Arc::new(api_config),
            started_at: Instant::now(),
        }
    }
}
