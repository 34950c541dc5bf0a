//! Split/experiment management for funnel A/B steps: weighted permanent
//! variant assignment, per-variant counters, and two-proportion winner
//! statistics.

pub mod manager;
pub mod statistics;
pub mod types;

pub use manager::{SplitManager, WinnerDecision};
pub use types::{SplitExperiment, Variant, VariantAssignment, VariantSpec, WinningMetric};
