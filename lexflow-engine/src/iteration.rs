//! Iteration controller
//!
//! After each synthesis the controller evaluates six stopping criteria in
//! priority order; the first match wins. When none match it emits a
//! refinement directive for the next router pass. On a tripped request
//! deadline the runtime bypasses the controller entirely and returns the
//! best-seen answer.

use crate::state::IterationFrame;
use lexflow_core::{IterationConfig, RefinementDirective, StopReason, UserFeedback};

/// Controller verdict for one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum StopDecision {
    Stop(StopReason),
    Continue(RefinementDirective),
}

impl StopDecision {
    pub fn reason(&self) -> Option<StopReason> {
        match self {
            StopDecision::Stop(reason) => Some(*reason),
            StopDecision::Continue(_) => None,
        }
    }
}

/// The six ordered stopping criteria.
pub struct IterationController {
    config: IterationConfig,
}

impl IterationController {
    pub fn new(config: IterationConfig) -> Self {
        Self { config }
    }

    /// Evaluate the criteria against the recorded frames.
    ///
    /// `effective_max` is the request's iteration ceiling (already clamped
    /// against the engine-wide maximum). `feedback` is the latest user
    /// feedback on the current answer, if any; `quality_concerns` come from
    /// the external quality evaluation.
    pub fn evaluate(
        &self,
        frames: &[IterationFrame],
        effective_max: i32,
        feedback: Option<&UserFeedback>,
        quality_concerns: &[String],
    ) -> StopDecision {
        let Some(current) = frames.last() else {
            // Nothing produced: iterating cannot help
            return StopDecision::Stop(StopReason::MaxIterations);
        };

        // 1. Iteration budget exhausted
        if current.index >= effective_max {
            return StopDecision::Stop(StopReason::MaxIterations);
        }

        // 2. High confidence and consensus
        if current.metrics.confidence >= self.config.stop_confidence
            && current.metrics.consensus >= self.config.stop_consensus
        {
            return StopDecision::Stop(StopReason::HighConfidenceAndConsensus);
        }

        // 3. External quality approved
        if let Some(rlcf) = current.metrics.rlcf_score {
            if rlcf >= self.config.stop_quality {
                return StopDecision::Stop(StopReason::RlcfApproved);
            }
        }

        // 4. User satisfied
        if let Some(rating) = current.metrics.user_rating {
            if rating >= self.config.stop_user_rating {
                return StopDecision::Stop(StopReason::UserSatisfied);
            }
        }

        if frames.len() >= 2 {
            let previous = &frames[frames.len() - 2];

            // 5. No significant improvement: mean of the two deltas
            let confidence_delta = current.metrics.confidence - previous.metrics.confidence;
            let consensus_delta = current.metrics.consensus - previous.metrics.consensus;
            let mean_delta = (confidence_delta + consensus_delta) / 2.0;
            if mean_delta < self.config.improvement_delta {
                return StopDecision::Stop(StopReason::NoImprovement);
            }

            // 6. Metrics converged: max − min over the trailing window
            let window = self.config.convergence_window.max(2);
            let tail = &frames[frames.len().saturating_sub(window)..];
            let spread = |metric: fn(&IterationFrame) -> f32| {
                let values: Vec<f32> = tail.iter().map(metric).collect();
                let max = values.iter().cloned().fold(f32::MIN, f32::max);
                let min = values.iter().cloned().fold(f32::MAX, f32::min);
                max - min
            };
            if spread(|f| f.metrics.confidence) < self.config.improvement_delta
                && spread(|f| f.metrics.consensus) < self.config.improvement_delta
            {
                return StopDecision::Stop(StopReason::Converged);
            }
        }

        StopDecision::Continue(build_directive(current, feedback, quality_concerns))
    }
}

/// Assemble the refinement directive from the current frame, user feedback,
/// and external quality concerns.
fn build_directive(
    frame: &IterationFrame,
    feedback: Option<&UserFeedback>,
    quality_concerns: &[String],
) -> RefinementDirective {
    let mut gaps: Vec<String> = frame
        .opinions
        .iter()
        .map(|o| o.limitations.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    gaps.sort_unstable();
    gaps.dedup();

    let missing_information = feedback
        .map(|f| f.missing_information.clone())
        .unwrap_or_default();

    RefinementDirective {
        answer_summary: summarize(&frame.answer.text, 400),
        gaps,
        missing_information,
        quality_concerns: quality_concerns.to_vec(),
    }
}

fn summarize(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use lexflow_core::{
        AgentInvocation, AgentKind, ConfidenceBreakdown, ExecutionPlan, ExpertKind,
        ExpertOpinion, IterationMetrics, ProvisionalAnswer, SynthesisMode,
    };

    fn frame(index: i32, confidence: f32, consensus: f32) -> IterationFrame {
        let now = chrono::Utc::now();
        IterationFrame {
            index,
            plan: ExecutionPlan {
                agents: vec![AgentInvocation::new(AgentKind::Graph, "q")],
                experts: vec![ExpertKind::Literal],
                synthesis: SynthesisMode::Auto,
                iteration_budget: index + 5,
                rationale: String::new(),
            },
            agent_results: Vec::new(),
            opinions: vec![ExpertOpinion {
                expert: ExpertKind::Literal,
                interpretation: "analisi".to_string(),
                conclusion_label: "valido".to_string(),
                legal_bases: Vec::new(),
                reasoning_steps: Vec::new(),
                confidence,
                breakdown: ConfidenceBreakdown::default(),
                limitations: "Non considera la giurisprudenza più recente.".to_string(),
                tokens_used: 0,
                latency_ms: 0,
                model_id: "mock".to_string(),
                seed: None,
                error_annotations: Vec::new(),
            }],
            answer: ProvisionalAnswer {
                text: "risposta".to_string(),
                synthesis_mode: SynthesisMode::Convergent,
                consensus,
                confidence,
                provenance: Vec::new(),
                experts_consulted: vec![ExpertKind::Literal],
                uncertainty_preserved: false,
                alternatives: Vec::new(),
            },
            metrics: IterationMetrics {
                confidence,
                consensus,
                user_rating: None,
                rlcf_score: None,
            },
            started_at: now,
            completed_at: now,
        }
    }

    fn controller() -> IterationController {
        IterationController::new(IterationConfig::default())
    }

    #[test]
    fn test_max_iterations_wins_first() {
        // Even with perfect metrics, budget exhaustion is criterion 1
        let frames = vec![frame(3, 0.99, 0.99)];
        let decision = controller().evaluate(&frames, 3, None, &[]);
        assert_eq!(decision, StopDecision::Stop(StopReason::MaxIterations));
    }

    #[test]
    fn test_high_confidence_and_consensus() {
        let frames = vec![frame(1, 0.9, 0.85)];
        let decision = controller().evaluate(&frames, 3, None, &[]);
        assert_eq!(
            decision,
            StopDecision::Stop(StopReason::HighConfidenceAndConsensus)
        );
    }

    #[test]
    fn test_confidence_alone_does_not_stop() {
        let frames = vec![frame(1, 0.9, 0.5)];
        let decision = controller().evaluate(&frames, 3, None, &[]);
        assert!(matches!(decision, StopDecision::Continue(_)));
    }

    #[test]
    fn test_rlcf_approval() {
        let mut f = frame(1, 0.6, 0.6);
        f.metrics.rlcf_score = Some(0.85);
        let decision = controller().evaluate(&[f], 3, None, &[]);
        assert_eq!(decision, StopDecision::Stop(StopReason::RlcfApproved));
    }

    #[test]
    fn test_user_satisfied() {
        let mut f = frame(1, 0.6, 0.6);
        f.metrics.user_rating = Some(4.5);
        let decision = controller().evaluate(&[f], 3, None, &[]);
        assert_eq!(decision, StopDecision::Stop(StopReason::UserSatisfied));
    }

    #[test]
    fn test_user_rating_below_threshold_continues() {
        let mut f = frame(1, 0.6, 0.6);
        f.metrics.user_rating = Some(3.0);
        let decision = controller().evaluate(&[f], 3, None, &[]);
        assert!(matches!(decision, StopDecision::Continue(_)));
    }

    #[test]
    fn test_no_improvement() {
        let frames = vec![frame(1, 0.60, 0.60), frame(2, 0.62, 0.61)];
        let decision = controller().evaluate(&frames, 5, None, &[]);
        assert_eq!(decision, StopDecision::Stop(StopReason::NoImprovement));
    }

    #[test]
    fn test_improvement_continues() {
        let frames = vec![frame(1, 0.50, 0.50), frame(2, 0.62, 0.60)];
        let decision = controller().evaluate(&frames, 5, None, &[]);
        assert!(matches!(decision, StopDecision::Continue(_)));
    }

    #[test]
    fn test_refinement_scenario() {
        // Iteration 1 at 0.70/0.65: no criterion fires, controller continues
        let frames = vec![frame(1, 0.70, 0.65)];
        let decision = controller().evaluate(&frames, 3, None, &[]);
        assert!(matches!(decision, StopDecision::Continue(_)));

        // Iteration 2 reaches 0.90/0.85: high-confidence-and-consensus
        let frames = vec![frame(1, 0.70, 0.65), frame(2, 0.90, 0.85)];
        let decision = controller().evaluate(&frames, 3, None, &[]);
        assert_eq!(
            decision,
            StopDecision::Stop(StopReason::HighConfidenceAndConsensus)
        );
    }

    #[test]
    fn test_directive_contents() {
        let frames = vec![frame(1, 0.6, 0.6)];
        let feedback = UserFeedback {
            feedback_id: lexflow_core::EntityIdType::now_v7(),
            trace_id: lexflow_core::EntityIdType::now_v7(),
            rating: 3,
            text: None,
            category_ratings: Default::default(),
            missing_information: vec!["recent case law".to_string()],
            at: chrono::Utc::now(),
        };

        let decision = controller().evaluate(
            &frames,
            3,
            Some(&feedback),
            &["citations are thin".to_string()],
        );
        match decision {
            StopDecision::Continue(directive) => {
                assert_eq!(directive.missing_information, vec!["recent case law"]);
                assert_eq!(directive.quality_concerns, vec!["citations are thin"]);
                assert!(!directive.gaps.is_empty());
                assert!(!directive.answer_summary.is_empty());
            }
            other => panic!("expected Continue, got {:?}", other),
        }
    }
}
