//! PostgreSQL durable store
//!
//! Records are stored as JSONB payloads with keyed columns for the lookups
//! the engine performs: credential hash, trace id, and a (credential, at)
//! index on usage supporting sliding-window audits. Connections come from a
//! deadpool pool, acquired per operation and returned on completion.

use crate::durable::{DurableStore, StoreStats};
use async_trait::async_trait;
use deadpool_postgres::{Config as DeadpoolConfig, Pool, Runtime};
use lexflow_core::{
    BackendError, CredentialHash, CredentialId, CredentialRecord, EntityIdType,
    EntitySpanCorrection, ExpertCorrection, IterationRecord, LexflowError, LexflowResult,
    ProvisionalAnswer, Timestamp, TraceId, TraceRecord, UsageRecord, UserFeedback,
};
use tokio_postgres::NoTls;

fn durable_err(e: impl std::fmt::Display) -> LexflowError {
    LexflowError::Backend(BackendError::DurableUnavailable {
        reason: e.to_string(),
    })
}

/// Connection settings for the durable store.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub pool_size: usize,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "lexflow".to_string(),
            password: String::new(),
            dbname: "lexflow".to_string(),
            pool_size: 50,
        }
    }
}

impl PgConfig {
    /// Load from environment variables:
    /// `LEXFLOW_PG_HOST`, `LEXFLOW_PG_PORT`, `LEXFLOW_PG_USER`,
    /// `LEXFLOW_PG_PASSWORD`, `LEXFLOW_PG_DBNAME`, `LEXFLOW_PG_POOL_SIZE`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("LEXFLOW_PG_HOST").unwrap_or(defaults.host),
            port: std::env::var("LEXFLOW_PG_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            user: std::env::var("LEXFLOW_PG_USER").unwrap_or(defaults.user),
            password: std::env::var("LEXFLOW_PG_PASSWORD").unwrap_or(defaults.password),
            dbname: std::env::var("LEXFLOW_PG_DBNAME").unwrap_or(defaults.dbname),
            pool_size: std::env::var("LEXFLOW_PG_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.pool_size),
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS lexflow_traces (
    trace_id UUID PRIMARY KEY,
    status TEXT NOT NULL,
    payload JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS lexflow_iterations (
    trace_id UUID NOT NULL,
    iteration INT NOT NULL,
    payload JSONB NOT NULL,
    PRIMARY KEY (trace_id, iteration)
);
CREATE TABLE IF NOT EXISTS lexflow_answers (
    trace_id UUID NOT NULL,
    iteration INT NOT NULL,
    payload JSONB NOT NULL,
    PRIMARY KEY (trace_id, iteration)
);
CREATE TABLE IF NOT EXISTS lexflow_user_feedback (
    feedback_id UUID PRIMARY KEY,
    trace_id UUID NOT NULL,
    payload JSONB NOT NULL,
    at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS lexflow_user_feedback_trace
    ON lexflow_user_feedback (trace_id);
CREATE TABLE IF NOT EXISTS lexflow_expert_feedback (
    feedback_id UUID PRIMARY KEY,
    trace_id UUID NOT NULL,
    payload JSONB NOT NULL,
    at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS lexflow_expert_feedback_trace
    ON lexflow_expert_feedback (trace_id);
CREATE TABLE IF NOT EXISTS lexflow_entity_feedback (
    feedback_id UUID PRIMARY KEY,
    trace_id UUID NOT NULL,
    payload JSONB NOT NULL,
    at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS lexflow_credentials (
    credential_id UUID PRIMARY KEY,
    hash TEXT NOT NULL UNIQUE,
    active BOOLEAN NOT NULL,
    payload JSONB NOT NULL,
    last_used_at TIMESTAMPTZ
);
CREATE TABLE IF NOT EXISTS lexflow_usage (
    usage_id UUID PRIMARY KEY,
    credential_id UUID NOT NULL,
    at TIMESTAMPTZ NOT NULL,
    payload JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS lexflow_usage_credential_at
    ON lexflow_usage (credential_id, at);
"#;

/// Postgres-backed durable store.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Build the pool and ensure the schema exists.
    pub async fn connect(config: &PgConfig) -> LexflowResult<Self> {
        let mut pool_config = DeadpoolConfig::new();
        pool_config.host = Some(config.host.clone());
        pool_config.port = Some(config.port);
        pool_config.user = Some(config.user.clone());
        pool_config.password = Some(config.password.clone());
        pool_config.dbname = Some(config.dbname.clone());
        pool_config.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(durable_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> LexflowResult<()> {
        let conn = self.pool.get().await.map_err(durable_err)?;
        conn.batch_execute(SCHEMA).await.map_err(durable_err)?;
        Ok(())
    }

    async fn conn(&self) -> LexflowResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(|e| {
            LexflowError::Backend(BackendError::PoolExhausted {
                backend: format!("postgres: {}", e),
            })
        })
    }

    fn to_json<T: serde::Serialize>(value: &T) -> LexflowResult<serde_json::Value> {
        serde_json::to_value(value).map_err(durable_err)
    }

    fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> LexflowResult<T> {
        serde_json::from_value(value).map_err(durable_err)
    }

    async fn count(&self, table: &str) -> LexflowResult<u64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(&format!("SELECT COUNT(*) FROM {}", table), &[])
            .await
            .map_err(durable_err)?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }
}

#[async_trait]
impl DurableStore for PgStore {
    async fn record_trace(&self, trace: &TraceRecord) -> LexflowResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO lexflow_traces (trace_id, status, payload, created_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (trace_id)
             DO UPDATE SET status = EXCLUDED.status, payload = EXCLUDED.payload",
            &[
                &trace.trace_id.as_uuid(),
                &trace.status.as_db_str(),
                &Self::to_json(trace)?,
                &trace.created_at,
            ],
        )
        .await
        .map_err(durable_err)?;
        Ok(())
    }

    async fn fetch_trace(&self, trace_id: TraceId) -> LexflowResult<Option<TraceRecord>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT payload FROM lexflow_traces WHERE trace_id = $1",
                &[&trace_id.as_uuid()],
            )
            .await
            .map_err(durable_err)?;
        row.map(|r| Self::from_json(r.get(0))).transpose()
    }

    async fn append_iteration(
        &self,
        trace_id: TraceId,
        record: &IterationRecord,
    ) -> LexflowResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO lexflow_iterations (trace_id, iteration, payload)
             VALUES ($1, $2, $3)
             ON CONFLICT (trace_id, iteration) DO NOTHING",
            &[
                &trace_id.as_uuid(),
                &record.index,
                &Self::to_json(record)?,
            ],
        )
        .await
        .map_err(durable_err)?;
        Ok(())
    }

    async fn record_answer(
        &self,
        trace_id: TraceId,
        iteration: i32,
        answer: &ProvisionalAnswer,
    ) -> LexflowResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO lexflow_answers (trace_id, iteration, payload)
             VALUES ($1, $2, $3)
             ON CONFLICT (trace_id, iteration) DO NOTHING",
            &[&trace_id.as_uuid(), &iteration, &Self::to_json(answer)?],
        )
        .await
        .map_err(durable_err)?;
        Ok(())
    }

    async fn record_user_feedback(&self, feedback: &UserFeedback) -> LexflowResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO lexflow_user_feedback (feedback_id, trace_id, payload, at)
             VALUES ($1, $2, $3, $4)",
            &[
                &feedback.feedback_id.as_uuid(),
                &feedback.trace_id.as_uuid(),
                &Self::to_json(feedback)?,
                &feedback.at,
            ],
        )
        .await
        .map_err(durable_err)?;
        Ok(())
    }

    async fn record_expert_feedback(&self, correction: &ExpertCorrection) -> LexflowResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO lexflow_expert_feedback (feedback_id, trace_id, payload, at)
             VALUES ($1, $2, $3, $4)",
            &[
                &correction.feedback_id.as_uuid(),
                &correction.trace_id.as_uuid(),
                &Self::to_json(correction)?,
                &correction.at,
            ],
        )
        .await
        .map_err(durable_err)?;
        Ok(())
    }

    async fn record_entity_feedback(
        &self,
        correction: &EntitySpanCorrection,
    ) -> LexflowResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO lexflow_entity_feedback (feedback_id, trace_id, payload, at)
             VALUES ($1, $2, $3, $4)",
            &[
                &correction.feedback_id.as_uuid(),
                &correction.trace_id.as_uuid(),
                &Self::to_json(correction)?,
                &correction.at,
            ],
        )
        .await
        .map_err(durable_err)?;
        Ok(())
    }

    async fn user_feedback_for_trace(
        &self,
        trace_id: TraceId,
    ) -> LexflowResult<Vec<UserFeedback>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT payload FROM lexflow_user_feedback WHERE trace_id = $1 ORDER BY at",
                &[&trace_id.as_uuid()],
            )
            .await
            .map_err(durable_err)?;
        rows.into_iter()
            .map(|r| Self::from_json(r.get(0)))
            .collect()
    }

    async fn expert_feedback_for_trace(
        &self,
        trace_id: TraceId,
    ) -> LexflowResult<Vec<ExpertCorrection>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT payload FROM lexflow_expert_feedback WHERE trace_id = $1 ORDER BY at",
                &[&trace_id.as_uuid()],
            )
            .await
            .map_err(durable_err)?;
        rows.into_iter()
            .map(|r| Self::from_json(r.get(0)))
            .collect()
    }

    async fn insert_credential(&self, record: &CredentialRecord) -> LexflowResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO lexflow_credentials (credential_id, hash, active, payload, last_used_at)
             VALUES ($1, $2, $3, $4, $5)",
            &[
                &record.credential_id.as_uuid(),
                &record.hash.to_hex(),
                &record.active,
                &Self::to_json(record)?,
                &record.last_used_at,
            ],
        )
        .await
        .map_err(durable_err)?;
        Ok(())
    }

    async fn credential_by_hash(
        &self,
        hash: &CredentialHash,
    ) -> LexflowResult<Option<CredentialRecord>> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT payload, active, last_used_at FROM lexflow_credentials WHERE hash = $1",
                &[&hash.to_hex()],
            )
            .await
            .map_err(durable_err)?;

        row.map(|r| {
            let mut record: CredentialRecord = Self::from_json(r.get(0))?;
            // Keyed columns win over the payload snapshot
            record.active = r.get(1);
            record.last_used_at = r.get(2);
            Ok(record)
        })
        .transpose()
    }

    async fn list_credentials(&self) -> LexflowResult<Vec<CredentialRecord>> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT payload, active, last_used_at FROM lexflow_credentials
                 ORDER BY credential_id",
                &[],
            )
            .await
            .map_err(durable_err)?;
        rows.into_iter()
            .map(|r| {
                let mut record: CredentialRecord = Self::from_json(r.get(0))?;
                record.active = r.get(1);
                record.last_used_at = r.get(2);
                Ok(record)
            })
            .collect()
    }

    async fn set_credential_active(
        &self,
        credential_id: CredentialId,
        active: bool,
    ) -> LexflowResult<bool> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE lexflow_credentials SET active = $2 WHERE credential_id = $1",
                &[&credential_id.as_uuid(), &active],
            )
            .await
            .map_err(durable_err)?;
        Ok(updated > 0)
    }

    async fn touch_credential(
        &self,
        credential_id: CredentialId,
        at: Timestamp,
    ) -> LexflowResult<()> {
        let conn = self.conn().await?;
        // GREATEST keeps the timestamp monotone under concurrent touches
        conn.execute(
            "UPDATE lexflow_credentials
             SET last_used_at = GREATEST(COALESCE(last_used_at, $2), $2)
             WHERE credential_id = $1",
            &[&credential_id.as_uuid(), &at],
        )
        .await
        .map_err(durable_err)?;
        Ok(())
    }

    async fn append_usage(&self, record: &UsageRecord) -> LexflowResult<()> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO lexflow_usage (usage_id, credential_id, at, payload)
             VALUES ($1, $2, $3, $4)",
            &[
                &record.usage_id.as_uuid(),
                &record.credential_id.as_uuid(),
                &record.at,
                &Self::to_json(record)?,
            ],
        )
        .await
        .map_err(durable_err)?;
        Ok(())
    }

    async fn usage_count_since(
        &self,
        credential_id: CredentialId,
        since: Timestamp,
    ) -> LexflowResult<u64> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM lexflow_usage WHERE credential_id = $1 AND at > $2",
                &[&credential_id.as_uuid(), &since],
            )
            .await
            .map_err(durable_err)?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    async fn stats(&self) -> LexflowResult<StoreStats> {
        Ok(StoreStats {
            traces: self.count("lexflow_traces").await?,
            iterations: self.count("lexflow_iterations").await?,
            answers: self.count("lexflow_answers").await?,
            user_feedback: self.count("lexflow_user_feedback").await?,
            expert_feedback: self.count("lexflow_expert_feedback").await?,
            entity_feedback: self.count("lexflow_entity_feedback").await?,
            credentials: self.count("lexflow_credentials").await?,
            usage: self.count("lexflow_usage").await?,
        })
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("pool_status", &self.pool.status())
            .finish()
    }
}
