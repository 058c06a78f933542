pub mod config;
pub mod context;
pub mod error;
pub mod id;
pub mod objects;

// Re-export the main types for convenience
pub use config::{
    LedgerNetwork, LedgerSettings, OperatorKey, RawSettings, RetryPolicy, SchedulerSettings,
    WorkerConfig,
};
pub use context::WorkerContext;
pub use error::{ConfigError, ConfigProblem, LedgerError, StoreError, WorkerError};
pub use id::{
    AccountId, ContractId, EntityId, EvaluationId, RequestId, TokenId, TransactionId, UserId,
};
pub use objects::{
    CropEvaluation, EvaluationLookup, NotificationKind, NotificationRecord, RequestStatus,
    TokenizationRequest, Transition,
};
