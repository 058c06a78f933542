use cropmint_core::error::StoreError;
use cropmint_core::id::{EvaluationId, RequestId, TransactionId};
use cropmint_core::objects::{EvaluationLookup, NotificationRecord, TokenizationRequest, Transition};

/// Gateway to the durable tokenization queue and the lookup tables it depends on.
///
/// Every status change is a single conditional update guarded by the expected
/// prior status. When the guard does not match, the row is left untouched and
/// the caller receives [`Transition::Stale`].
pub trait RecordStore: Send + Sync {
    /// Fetch up to `limit` pending records, oldest first, without changing their status
    ///
    /// Claiming is advisory: two processes reading at the same time may see the
    /// same records. Only [`RecordStore::transition_to_minting`] decides who works on one.
    fn claim_next_batch(&self, limit: usize) -> Result<Vec<TokenizationRequest>, StoreError>;

    /// Move a record from `pending` to `minting`, counting the claim attempt
    fn transition_to_minting(&self, id: &RequestId) -> Result<Transition, StoreError>;

    /// Append a ledger transaction id to a record that is still `minting`
    fn record_transaction_id(
        &self,
        id: &RequestId,
        transaction_id: &TransactionId,
    ) -> Result<Transition, StoreError>;

    /// Move a record from `minting` to `completed`
    ///
    /// # Parameters
    /// * `id` - The record to complete
    /// * `transaction_ids` - The full list of ledger transactions; must extend what is stored
    ///
    /// # Returns
    /// `Stale` if the record is not `minting`, or an error if the list would truncate history
    fn transition_to_completed(
        &self,
        id: &RequestId,
        transaction_ids: &[TransactionId],
    ) -> Result<Transition, StoreError>;

    /// Move a record from `minting` to `failed`
    ///
    /// `transaction_ids` are the ledger transactions the caller knows about.
    /// They are merged with what is already stored, so ids whose earlier append
    /// was lost still end up on the record. Lists that disagree are an error.
    fn transition_to_failed(
        &self,
        id: &RequestId,
        reason: &str,
        transaction_ids: &[TransactionId],
    ) -> Result<Transition, StoreError>;

    /// Join an evaluation with its owning farmer's wallet address
    fn lookup_evaluation_with_wallet(
        &self,
        evaluation_id: &EvaluationId,
    ) -> Result<EvaluationLookup, StoreError>;

    /// Read a single record
    fn get(&self, id: &RequestId) -> Result<Option<TokenizationRequest>, StoreError>;

    /// Fail every record left in `minting` by a previous process
    ///
    /// Only safe while no other worker instance is running. Returns the records
    /// that were moved to `failed`.
    fn fail_interrupted(&self, reason: &str) -> Result<Vec<TokenizationRequest>, StoreError>;
}

/// Destination for farmer-facing notifications
pub trait NotificationSink: Send + Sync {
    /// Durably store one notification
    fn publish(&self, notification: &NotificationRecord) -> Result<(), StoreError>;
}

impl<T: RecordStore + ?Sized> RecordStore for std::sync::Arc<T> {
    fn claim_next_batch(&self, limit: usize) -> Result<Vec<TokenizationRequest>, StoreError> {
        (**self).claim_next_batch(limit)
    }

    fn transition_to_minting(&self, id: &RequestId) -> Result<Transition, StoreError> {
        (**self).transition_to_minting(id)
    }

    fn record_transaction_id(
        &self,
        id: &RequestId,
        transaction_id: &TransactionId,
    ) -> Result<Transition, StoreError> {
        (**self).record_transaction_id(id, transaction_id)
    }

    fn transition_to_completed(
        &self,
        id: &RequestId,
        transaction_ids: &[TransactionId],
    ) -> Result<Transition, StoreError> {
        (**self).transition_to_completed(id, transaction_ids)
    }

    fn transition_to_failed(
        &self,
        id: &RequestId,
        reason: &str,
        transaction_ids: &[TransactionId],
    ) -> Result<Transition, StoreError> {
        (**self).transition_to_failed(id, reason, transaction_ids)
    }

    fn lookup_evaluation_with_wallet(
        &self,
        evaluation_id: &EvaluationId,
    ) -> Result<EvaluationLookup, StoreError> {
        (**self).lookup_evaluation_with_wallet(evaluation_id)
    }

    fn get(&self, id: &RequestId) -> Result<Option<TokenizationRequest>, StoreError> {
        (**self).get(id)
    }

    fn fail_interrupted(&self, reason: &str) -> Result<Vec<TokenizationRequest>, StoreError> {
        (**self).fail_interrupted(reason)
    }
}

impl<T: NotificationSink + ?Sized> NotificationSink for std::sync::Arc<T> {
    fn publish(&self, notification: &NotificationRecord) -> Result<(), StoreError> {
        (**self).publish(notification)
    }
}
