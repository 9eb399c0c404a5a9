//! Lexflow Engine - Workflow Runtime
//!
//! The multi-stage orchestration core: preprocessing, LLM-driven planning,
//! parallel retrieval, multi-perspective reasoning, synthesis, and the
//! bounded refinement loop, over a single-writer append-only state.
//!
//! Node order is fixed: preprocessing → router → retrieval → experts →
//! synthesizer → iteration controller; refinement loops back to the router
//! only. Every external call degrades rather than aborting: the engine
//! answers with whatever survived, and says so in the warnings.

pub mod experts;
pub mod iteration;
pub mod preprocess;
pub mod router;
pub mod runtime;
pub mod state;
pub mod synthesizer;

pub use iteration::{IterationController, StopDecision};
pub use preprocess::{PreprocessOutcome, Preprocessor};
pub use router::{Router, RoutingInput, RoutingOutcome};
pub use runtime::{WorkflowOutcome, WorkflowRuntime};
pub use state::{IterationFrame, WorkflowState};
pub use synthesizer::{SynthesisOutcome, Synthesizer};
