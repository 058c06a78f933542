use std::sync::Arc;

use chrono::Utc;
use cropmint_core::id::UserId;
use cropmint_core::objects::{NotificationKind, NotificationRecord};
use cropmint_store::storage_traits::NotificationSink;
use serde_json::json;

use crate::orchestrator::RecordOutcome;

/// Tells the farmer how their tokenization request ended.
///
/// Best effort: failures are logged and never change the request.
pub struct OutcomeNotifier {
    sink: Arc<dyn NotificationSink>,
}

impl OutcomeNotifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Publish the notification for a terminal outcome
    pub fn notify(&self, farmer_id: Option<&UserId>, outcome: &RecordOutcome) {
        let Some(farmer_id) = farmer_id else {
            log::warn!(
                "No farmer known for request {}; skipping notification",
                outcome.request_id()
            );
            return;
        };

        let Some(notification) = build_notification(farmer_id, outcome) else {
            return;
        };

        match self.sink.publish(&notification) {
            Ok(()) => log::debug!(
                "Notified {} about request {}",
                farmer_id,
                outcome.request_id()
            ),
            Err(e) => log::warn!(
                "Failed to notify {} about request {}: {}",
                farmer_id,
                outcome.request_id(),
                e
            ),
        }
    }
}

/// The notification for `outcome`, or `None` for outcomes that are not terminal
pub fn build_notification(farmer_id: &UserId, outcome: &RecordOutcome) -> Option<NotificationRecord> {
    let (kind, message, metadata) = match outcome {
        RecordOutcome::Completed {
            evaluation_id,
            token_id,
            amount,
            transaction_ids,
            ..
        } => (
            NotificationKind::TokenizationCompleted,
            format!(
                "Your crop evaluation {} has been tokenized: {} collateral tokens issued under token {}.",
                evaluation_id, amount, token_id
            ),
            json!({
                "evaluationId": evaluation_id,
                "transactionIds": transaction_ids,
                "tokenId": token_id.0,
                "tokenAmount": amount,
            }),
        ),
        RecordOutcome::Failed {
            evaluation_id,
            reason,
            transaction_ids,
            ..
        } => (
            NotificationKind::TokenizationFailed,
            format!(
                "Tokenization of your crop evaluation {} failed: {}",
                evaluation_id, reason
            ),
            json!({
                "evaluationId": evaluation_id,
                "transactionIds": transaction_ids,
                "errorMessage": reason,
            }),
        ),
        RecordOutcome::Abandoned { .. } | RecordOutcome::Unrecorded { .. } => return None,
    };

    Some(NotificationRecord {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: farmer_id.clone(),
        kind,
        message,
        metadata,
        created_at: Utc::now(),
    })
}
