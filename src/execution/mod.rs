// Stop evaluation: decision rules, gateway retry and the per-position cycle
pub mod decider;
pub mod evaluator;
pub mod indicator_cache;
pub mod retry;

pub use decider::{Decision, ManualOverridePolicy, SkipReason, StopDecider};
pub use evaluator::Evaluator;
pub use indicator_cache::IndicatorCache;
pub use retry::RetryPolicy;
