use crate::id::TransactionId;
use std::fmt;
use thiserror::Error;

/// Errors raised by the ledger client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The transaction executed but its receipt status is not success
    #[error("ledger rejected transaction {transaction_id}: {status}")]
    Rejected {
        transaction_id: TransactionId,
        status: String,
    },

    /// Network failure or timeout talking to the ledger gateway
    #[error("ledger unreachable: {0}")]
    Unreachable(String),

    /// Bad contract id, credential or gateway; no record can succeed until an operator fixes it
    #[error("ledger misconfigured: {0}")]
    Misconfigured(String),

    /// Ledger state contradicts what was just written (token id recovery failed)
    #[error("ledger state inconsistent: {0}")]
    Inconsistent(String),
}

impl LedgerError {
    /// Whether the same call could succeed later without operator review
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unreachable(_))
    }

    /// Whether the error must stop the whole worker rather than a single record
    pub fn halts_worker(&self) -> bool {
        matches!(self, LedgerError::Misconfigured(_))
    }
}

/// Represents all possible errors that can occur when interacting with the record store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Errors that occur with the underlying database
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization errors of stored columns
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored row violates a queue invariant
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Errors related to missing data
    #[error("Not found: {0}")]
    NotFound(String),

    /// Anyhow error wrapper for error context
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Row not found".to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// One problem found while validating worker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigProblem {
    Missing(&'static str),
    Malformed { key: &'static str, reason: String },
}

impl ConfigProblem {
    pub fn key(&self) -> &'static str {
        match self {
            ConfigProblem::Missing(key) => key,
            ConfigProblem::Malformed { key, .. } => key,
        }
    }
}

impl fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigProblem::Missing(key) => write!(f, "{} is missing", key),
            ConfigProblem::Malformed { key, reason } => write!(f, "{} is invalid: {}", key, reason),
        }
    }
}

/// Configuration errors, detected only at startup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Every problem found in one validation pass
    #[error("invalid worker configuration: {}", join_problems(.0))]
    Invalid(Vec<ConfigProblem>),
}

impl ConfigError {
    pub fn problems(&self) -> &[ConfigProblem] {
        match self {
            ConfigError::Invalid(problems) => problems,
        }
    }

    /// Keys reported as missing, in validation order
    pub fn missing_keys(&self) -> Vec<&'static str> {
        self.problems()
            .iter()
            .filter_map(|p| match p {
                ConfigProblem::Missing(key) => Some(*key),
                _ => None,
            })
            .collect()
    }
}

fn join_problems(problems: &[ConfigProblem]) -> String {
    problems
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the worker loop itself
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A ledger error that stops all processing until an operator intervenes
    #[error("worker halted: {0}")]
    Halted(LedgerError),

    /// A firing thread could not be spawned or panicked
    #[error("worker thread error: {0}")]
    Thread(String),
}
