//! Model selection: candidate evaluation, the cost-aware bandit engine,
//! regret analysis, and carbon-aware routing weights.

pub mod carbon;
pub mod engine;
pub mod evaluator;
pub mod regret;

pub use carbon::CarbonTracker;
pub use engine::{CandidateScore, SelectionEngine, SelectionMetadata};
pub use evaluator::{
    is_local_model, CandidateEvaluator, PerformanceTracker, PreferenceWeights,
    LOCAL_MODEL_INDICATORS,
};
pub use regret::{RegretAnalysis, RegretCalculator, RegretSummary};
