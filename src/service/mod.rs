pub mod evaluator;
pub mod orchestrator;
pub mod payment;
pub mod workflow;

pub use evaluator::{evaluate, Evaluation};
pub use orchestrator::MatchOrchestrator;
pub use payment::{decide, PaymentDecision, PaymentGate};
pub use workflow::{
    adjusted_sla_hours, classify_priority, ExceptionWorkflow, OwnerSelector, RoundRobinSelector,
};
