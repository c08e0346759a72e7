pub mod api;
pub mod breakers;
pub mod orchestrator;
pub mod queue;

pub use breakers::DependencyBreakers;
pub use orchestrator::{OrchestratorConfig, ReconciliationOrchestrator, ReconciliationResult};
pub use queue::{DefaultEventMapper, EventMapper, EventQueue, OverflowPolicy, QueueConfig, QueueMetrics};
