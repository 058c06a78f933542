use crate::id::{EvaluationId, RequestId, TransactionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a tokenization request.
///
/// Status only moves forward: `Pending -> Minting -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Queued by the approval workflow
    Pending,
    /// Claimed by the worker, ledger calls in flight
    Minting,
    /// Both ledger transactions succeeded
    Completed,
    /// Processing stopped; the reason is kept in `error_message`
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Minting => "minting",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    /// Terminal records are retained for audit and never processed again
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// Whether `next` is a legal forward step from this status
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (RequestStatus::Pending, RequestStatus::Minting)
                | (RequestStatus::Minting, RequestStatus::Completed)
                | (RequestStatus::Minting, RequestStatus::Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "minting" => Ok(RequestStatus::Minting),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(format!("Unknown request status: {}", other)),
        }
    }
}

/// A row of the durable tokenization queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizationRequest {
    pub id: RequestId,
    pub evaluation_id: EvaluationId,
    pub status: RequestStatus,
    /// Ledger transactions accumulated as steps succeed; never truncated
    pub transaction_ids: Vec<TransactionId>,
    /// Last failure reason, cleared on success
    pub error_message: Option<String>,
    /// Number of times the record was claimed (`pending -> minting`)
    pub attempts: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Approved crop evaluation joined with the owning farmer's wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropEvaluation {
    pub evaluation_id: EvaluationId,
    pub farmer_id: UserId,
    pub crop_type: String,
    /// Pre-computed valuation in whole monetary units
    pub estimated_value: u64,
    pub harvest_date: Option<DateTime<Utc>>,
    /// Ledger account of the farmer, as stored on the profile
    pub wallet_address: Option<String>,
}

/// Result of an evaluation lookup, distinct from a transport error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationLookup {
    Found(CropEvaluation),
    NotFound,
}

/// Outcome of a conditional status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The guard matched and the row was updated
    Applied,
    /// The row was not in the expected prior status; nothing changed
    Stale,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

/// Kind of terminal notification delivered to a farmer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TokenizationCompleted,
    TokenizationFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::TokenizationCompleted => "tokenization_completed",
            NotificationKind::TokenizationFailed => "tokenization_failed",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tokenization_completed" => Ok(NotificationKind::TokenizationCompleted),
            "tokenization_failed" => Ok(NotificationKind::TokenizationFailed),
            other => Err(format!("Unknown notification type: {}", other)),
        }
    }
}

/// A row for the notification store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub message: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
