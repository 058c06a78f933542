pub mod cli;
pub mod notifier;
pub mod orchestrator;
pub mod scheduler;

// Re-export the main types for convenience
pub use cli::WorkerArgs;
pub use notifier::{build_notification, OutcomeNotifier};
pub use orchestrator::{RecordOutcome, TokenizationOrchestrator, INTERRUPTED_REASON};
pub use scheduler::{BatchSummary, FiringReport, Scheduler, SchedulerHandle};
