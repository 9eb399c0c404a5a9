//! In-memory durable store
//!
//! Backs tests and single-node development. Same visibility semantics as the
//! Postgres store: per-record isolation, no cross-record transactions.

use crate::durable::{DurableStore, StoreStats};
use async_trait::async_trait;
use dashmap::DashMap;
use lexflow_core::{
    CredentialHash, CredentialId, CredentialRecord, EntitySpanCorrection, ExpertCorrection,
    IterationRecord, LexflowResult, ProvisionalAnswer, Timestamp, TraceId, TraceRecord,
    UsageRecord, UserFeedback,
};
use std::sync::Mutex;

/// Process-local durable store.
pub struct MemoryStore {
    traces: DashMap<TraceId, TraceRecord>,
    iterations: DashMap<TraceId, Vec<IterationRecord>>,
    answers: DashMap<TraceId, Vec<(i32, ProvisionalAnswer)>>,
    user_feedback: Mutex<Vec<UserFeedback>>,
    expert_feedback: Mutex<Vec<ExpertCorrection>>,
    entity_feedback: Mutex<Vec<EntitySpanCorrection>>,
    credentials: DashMap<CredentialId, CredentialRecord>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            traces: DashMap::new(),
            iterations: DashMap::new(),
            answers: DashMap::new(),
            user_feedback: Mutex::new(Vec::new()),
            expert_feedback: Mutex::new(Vec::new()),
            entity_feedback: Mutex::new(Vec::new()),
            credentials: DashMap::new(),
            usage: Mutex::new(Vec::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn record_trace(&self, trace: &TraceRecord) -> LexflowResult<()> {
        self.traces.insert(trace.trace_id, trace.clone());
        Ok(())
    }

    async fn fetch_trace(&self, trace_id: TraceId) -> LexflowResult<Option<TraceRecord>> {
        Ok(self.traces.get(&trace_id).map(|r| r.clone()))
    }

    async fn append_iteration(
        &self,
        trace_id: TraceId,
        record: &IterationRecord,
    ) -> LexflowResult<()> {
        self.iterations
            .entry(trace_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn record_answer(
        &self,
        trace_id: TraceId,
        iteration: i32,
        answer: &ProvisionalAnswer,
    ) -> LexflowResult<()> {
        self.answers
            .entry(trace_id)
            .or_default()
            .push((iteration, answer.clone()));
        Ok(())
    }

    async fn record_user_feedback(&self, feedback: &UserFeedback) -> LexflowResult<()> {
        self.user_feedback
            .lock()
            .expect("user feedback lock")
            .push(feedback.clone());
        Ok(())
    }

    async fn record_expert_feedback(&self, correction: &ExpertCorrection) -> LexflowResult<()> {
        self.expert_feedback
            .lock()
            .expect("expert feedback lock")
            .push(correction.clone());
        Ok(())
    }

    async fn record_entity_feedback(
        &self,
        correction: &EntitySpanCorrection,
    ) -> LexflowResult<()> {
        self.entity_feedback
            .lock()
            .expect("entity feedback lock")
            .push(correction.clone());
        Ok(())
    }

    async fn user_feedback_for_trace(
        &self,
        trace_id: TraceId,
    ) -> LexflowResult<Vec<UserFeedback>> {
        Ok(self
            .user_feedback
            .lock()
            .expect("user feedback lock")
            .iter()
            .filter(|f| f.trace_id == trace_id)
            .cloned()
            .collect())
    }

    async fn expert_feedback_for_trace(
        &self,
        trace_id: TraceId,
    ) -> LexflowResult<Vec<ExpertCorrection>> {
        Ok(self
            .expert_feedback
            .lock()
            .expect("expert feedback lock")
            .iter()
            .filter(|f| f.trace_id == trace_id)
            .cloned()
            .collect())
    }

    async fn insert_credential(&self, record: &CredentialRecord) -> LexflowResult<()> {
        self.credentials.insert(record.credential_id, record.clone());
        Ok(())
    }

    async fn credential_by_hash(
        &self,
        hash: &CredentialHash,
    ) -> LexflowResult<Option<CredentialRecord>> {
        Ok(self
            .credentials
            .iter()
            .find(|entry| entry.hash == *hash)
            .map(|entry| entry.clone()))
    }

    async fn list_credentials(&self) -> LexflowResult<Vec<CredentialRecord>> {
        let mut records: Vec<CredentialRecord> =
            self.credentials.iter().map(|e| e.clone()).collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn set_credential_active(
        &self,
        credential_id: CredentialId,
        active: bool,
    ) -> LexflowResult<bool> {
        match self.credentials.get_mut(&credential_id) {
            Some(mut record) => {
                record.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_credential(
        &self,
        credential_id: CredentialId,
        at: Timestamp,
    ) -> LexflowResult<()> {
        if let Some(mut record) = self.credentials.get_mut(&credential_id) {
            // Monotone: concurrent touches never move the timestamp backwards
            if record.last_used_at.map_or(true, |prev| prev <= at) {
                record.last_used_at = Some(at);
            }
        }
        Ok(())
    }

    async fn append_usage(&self, record: &UsageRecord) -> LexflowResult<()> {
        self.usage.lock().expect("usage lock").push(record.clone());
        Ok(())
    }

    async fn usage_count_since(
        &self,
        credential_id: CredentialId,
        since: Timestamp,
    ) -> LexflowResult<u64> {
        Ok(self
            .usage
            .lock()
            .expect("usage lock")
            .iter()
            .filter(|u| u.credential_id == credential_id && u.at > since)
            .count() as u64)
    }

    async fn stats(&self) -> LexflowResult<StoreStats> {
        Ok(StoreStats {
            traces: self.traces.len() as u64,
            iterations: self.iterations.iter().map(|e| e.len() as u64).sum(),
            answers: self.answers.iter().map(|e| e.len() as u64).sum(),
            user_feedback: self.user_feedback.lock().expect("lock").len() as u64,
            expert_feedback: self.expert_feedback.lock().expect("lock").len() as u64,
            entity_feedback: self.entity_feedback.lock().expect("lock").len() as u64,
            credentials: self.credentials.len() as u64,
            usage: self.usage.lock().expect("lock").len() as u64,
        })
    }
}
