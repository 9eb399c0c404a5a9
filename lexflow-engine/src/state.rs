//! Workflow state
//!
//! The state is an append-only log of immutable iteration frames plus a
//! mutable warnings vector, owned exclusively by the runtime for the lifetime
//! of a request. Nodes consume snapshots and return values; only the runtime
//! writes. The write-once and append-only invariants are enforced here, not
//! by convention.

use lexflow_core::{
    AgentResult, EnrichedContext, EntityIdType, ExpertOpinion, IterationMetrics, IterationRecord,
    LexflowResult, LogicError, ProvisionalAnswer, QueryContext, QueryRequest, RequestStatus,
    SourceId, StopReason, Timestamp, TraceId, TraceRecord, Warning, WarningKind,
};

/// Everything produced by one iteration, immutable once pushed.
#[derive(Debug, Clone)]
pub struct IterationFrame {
    /// 1-based, contiguous
    pub index: i32,
    pub plan: lexflow_core::ExecutionPlan,
    pub agent_results: Vec<AgentResult>,
    pub opinions: Vec<ExpertOpinion>,
    pub answer: ProvisionalAnswer,
    pub metrics: IterationMetrics,
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
}

impl IterationFrame {
    fn to_record(&self) -> IterationRecord {
        IterationRecord {
            index: self.index,
            plan: self.plan.clone(),
            answer: self.answer.clone(),
            metrics: self.metrics.clone(),
            feedback: None,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Single-writer workflow state.
pub struct WorkflowState {
    trace_id: TraceId,
    query: QueryRequest,
    created_at: Timestamp,
    query_context: Option<QueryContext>,
    enriched_context: Option<EnrichedContext>,
    frames: Vec<IterationFrame>,
    warnings: Vec<Warning>,
}

impl WorkflowState {
    /// Admit a request: assigns the trace id, freezes the query.
    pub fn admit(query: QueryRequest) -> Self {
        Self {
            trace_id: TraceId::now_v7(),
            query,
            created_at: chrono::Utc::now(),
            query_context: None,
            enriched_context: None,
            frames: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn query(&self) -> &QueryRequest {
        &self.query
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// The read-only understanding, once preprocessing has run.
    pub fn query_context(&self) -> Option<&QueryContext> {
        self.query_context.as_ref()
    }

    pub fn enriched_context(&self) -> Option<&EnrichedContext> {
        self.enriched_context.as_ref()
    }

    pub fn frames(&self) -> &[IterationFrame] {
        &self.frames
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Next iteration index (1-based).
    pub fn next_iteration(&self) -> i32 {
        self.frames.len() as i32 + 1
    }

    /// Write the query context. Exactly once per request.
    pub fn set_query_context(&mut self, context: QueryContext) -> LexflowResult<()> {
        if self.query_context.is_some() {
            return Err(LogicError::InvariantBroken {
                reason: "query context written twice".to_string(),
            }
            .into());
        }
        self.query_context = Some(context);
        Ok(())
    }

    /// Write the enriched context. Exactly once per request.
    pub fn set_enriched_context(&mut self, context: EnrichedContext) -> LexflowResult<()> {
        if self.enriched_context.is_some() {
            return Err(LogicError::InvariantBroken {
                reason: "enriched context written twice".to_string(),
            }
            .into());
        }
        self.enriched_context = Some(context);
        Ok(())
    }

    /// Append one completed iteration frame. Indices must be contiguous.
    pub fn push_frame(&mut self, frame: IterationFrame) -> LexflowResult<()> {
        let expected = self.next_iteration();
        if frame.index != expected {
            return Err(LogicError::InvariantBroken {
                reason: format!(
                    "iteration index {} out of order, expected {}",
                    frame.index, expected
                ),
            }
            .into());
        }
        if frame.plan.iteration_budget < frame.index {
            return Err(LogicError::PlanInvalid {
                reason: format!(
                    "iteration budget {} below iteration {}",
                    frame.plan.iteration_budget, frame.index
                ),
            }
            .into());
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Record a non-fatal condition.
    pub fn warn(&mut self, kind: WarningKind, detail: impl Into<String>) {
        let warning = Warning::new(kind, detail);
        tracing::warn!(trace_id = %self.trace_id, kind = ?warning.kind, detail = %warning.detail, "workflow warning");
        self.warnings.push(warning);
    }

    /// The current answer: the frame with the highest index.
    pub fn current_answer(&self) -> Option<&ProvisionalAnswer> {
        self.frames.last().map(|f| &f.answer)
    }

    /// The best-seen answer by confidence, for deadline short-circuits.
    pub fn best_answer(&self) -> Option<&ProvisionalAnswer> {
        self.frames
            .iter()
            .map(|f| &f.answer)
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    /// All source ids retrieved up to and including the current iteration.
    /// Provenance entries must reference this set.
    pub fn collected_source_ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self
            .frames
            .iter()
            .flat_map(|f| f.agent_results.iter())
            .flat_map(|r| r.hits.iter())
            .map(|h| h.source_id.clone())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Whether any warning implies degraded output.
    pub fn is_degraded(&self) -> bool {
        self.warnings.iter().any(|w| {
            matches!(
                w.kind,
                WarningKind::UnderstandingDegraded
                    | WarningKind::EnrichmentDegraded
                    | WarningKind::AgentDegraded
                    | WarningKind::ExpertDegraded
                    | WarningKind::SynthesisDegraded
                    | WarningKind::Timeout
            )
        })
    }

    /// Resolve the final request status.
    pub fn status(&self) -> RequestStatus {
        if self.frames.is_empty() {
            RequestStatus::Failed
        } else if self.is_degraded() {
            RequestStatus::Partial
        } else {
            RequestStatus::Success
        }
    }

    /// Snapshot the full state as the persisted trace record.
    pub fn snapshot(&self, stop_reason: Option<StopReason>) -> TraceRecord {
        let now = chrono::Utc::now();
        TraceRecord {
            trace_id: self.trace_id,
            query: self.query.clone(),
            status: self.status(),
            stop_reason,
            query_context: self.query_context.clone(),
            enriched_context: self.enriched_context.clone(),
            iterations: self.frames.iter().map(IterationFrame::to_record).collect(),
            warnings: self.warnings.clone(),
            total_duration_ms: (now - self.created_at).num_milliseconds(),
            created_at: self.created_at,
            completed_at: Some(now),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
