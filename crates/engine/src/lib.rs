//! Funnel automation engine: step graphs, enrollments, and the periodic
//! pass that advances every due journey one or more steps.

pub mod engine;
pub mod enrollment;
pub mod evaluator;
pub mod goals;
pub mod graph;
pub mod interpreter;
pub mod retry;
pub mod schedule;
pub mod scheduler;

pub use engine::{FunnelEngine, FunnelStats, PassSummary, TriggerEvent};
pub use enrollment::{Enrollment, EnrollmentStatus, EnrollmentStore, StatusCounts};
pub use graph::{ActionKind, Funnel, FunnelGraph, FunnelStatus, FunnelStep, FunnelTrigger, GoalKind, StepKind};
pub use interpreter::{Collaborators, Interpreter};
pub use scheduler::TickDriver;
