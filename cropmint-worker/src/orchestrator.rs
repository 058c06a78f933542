use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cropmint_core::error::{LedgerError, WorkerError};
use cropmint_core::id::{AccountId, EvaluationId, RequestId, TokenId, TransactionId, UserId};
use cropmint_core::objects::{CropEvaluation, EvaluationLookup, TokenizationRequest, Transition};
use cropmint_ledger::traits::{created_token_id, CollateralTokenClass, LedgerClient};
use cropmint_store::storage_traits::RecordStore;

use crate::notifier::OutcomeNotifier;

/// Reason recorded on requests found in `minting` at startup
pub const INTERRUPTED_REASON: &str =
    "worker interrupted while minting; reconcile ledger state before re-enqueueing";

/// Crops whose collateral matures after the long window
const LONG_MATURITY_CROPS: &[&str] = &["coffee", "cocoa", "cacao", "cafe", "café"];
const LONG_MATURITY_DAYS: i64 = 120;
const DEFAULT_MATURITY_DAYS: i64 = 90;

/// What happened to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Completed {
        request_id: RequestId,
        evaluation_id: EvaluationId,
        token_id: TokenId,
        amount: u64,
        transaction_ids: Vec<TransactionId>,
    },
    Failed {
        request_id: RequestId,
        evaluation_id: EvaluationId,
        reason: String,
        transaction_ids: Vec<TransactionId>,
    },
    /// The conditional transition did not match; another actor owns the record
    Abandoned { request_id: RequestId },
    /// The store could not record the outcome; the record keeps its previous status
    Unrecorded { request_id: RequestId, error: String },
}

impl RecordOutcome {
    pub fn request_id(&self) -> &RequestId {
        match self {
            RecordOutcome::Completed { request_id, .. }
            | RecordOutcome::Failed { request_id, .. }
            | RecordOutcome::Abandoned { request_id }
            | RecordOutcome::Unrecorded { request_id, .. } => request_id,
        }
    }
}

/// Drives one tokenization request through `pending -> minting -> completed | failed`.
///
/// Every per-record problem ends as a status transition with a reason. The
/// only error returned to the caller is [`WorkerError::Halted`], raised after
/// the affected record has been failed and its farmer notified.
pub struct TokenizationOrchestrator {
    store: Arc<dyn RecordStore>,
    ledger: Arc<dyn LedgerClient>,
    notifier: OutcomeNotifier,
}

impl TokenizationOrchestrator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<dyn LedgerClient>,
        notifier: OutcomeNotifier,
    ) -> Self {
        Self {
            store,
            ledger,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Process a single pending request
    pub fn process(&self, request: &TokenizationRequest) -> Result<RecordOutcome, WorkerError> {
        match self.store.transition_to_minting(&request.id) {
            Ok(Transition::Applied) => {
                log::info!(
                    "Request {} for evaluation {} moved to minting",
                    request.id,
                    request.evaluation_id
                );
            }
            Ok(Transition::Stale) => {
                log::info!("Request {} is no longer pending; skipping", request.id);
                return Ok(RecordOutcome::Abandoned {
                    request_id: request.id.clone(),
                });
            }
            Err(e) => {
                log::error!("Could not claim request {}: {}", request.id, e);
                return Ok(RecordOutcome::Unrecorded {
                    request_id: request.id.clone(),
                    error: e.to_string(),
                });
            }
        }

        let evaluation = match self.store.lookup_evaluation_with_wallet(&request.evaluation_id) {
            Ok(EvaluationLookup::Found(evaluation)) => evaluation,
            Ok(EvaluationLookup::NotFound) => {
                let reason = format!("crop evaluation {} not found", request.evaluation_id);
                return self.fail(request, None, Vec::new(), reason);
            }
            Err(e) => {
                let reason = format!(
                    "failed to load crop evaluation {}: {}",
                    request.evaluation_id, e
                );
                return self.fail(request, None, Vec::new(), reason);
            }
        };

        let recipient = match validate_evaluation(&evaluation) {
            Ok(recipient) => recipient,
            Err(reason) => return self.fail(request, Some(&evaluation.farmer_id), Vec::new(), reason),
        };

        self.mint(request, &evaluation, recipient)
    }

    /// Ledger part of the state machine: create the class, recover its id, issue tokens
    fn mint(
        &self,
        request: &TokenizationRequest,
        evaluation: &CropEvaluation,
        recipient: AccountId,
    ) -> Result<RecordOutcome, WorkerError> {
        let farmer = Some(&evaluation.farmer_id);
        let class = collateral_class(evaluation, recipient.clone(), Utc::now());
        let mut transaction_ids = request.transaction_ids.clone();

        let create_tx = match self.ledger.create_collateral_token_class(&class) {
            Ok(transaction_id) => transaction_id,
            Err(e) => {
                return self.fail_on_ledger_error(
                    request,
                    farmer,
                    transaction_ids,
                    "creating collateral token class",
                    e,
                )
            }
        };
        log::info!(
            "Created token class {} for request {} in {}",
            class.symbol,
            request.id,
            create_tx
        );

        match self.store.record_transaction_id(&request.id, &create_tx) {
            Ok(Transition::Applied) => {}
            Ok(Transition::Stale) => log::warn!(
                "Request {} left minting before {} could be recorded",
                request.id,
                create_tx
            ),
            // Completion and failure both write the full list again
            Err(e) => log::error!(
                "Could not record {} on request {}: {}",
                create_tx,
                request.id,
                e
            ),
        }
        transaction_ids.push(create_tx);

        let token_id = match self.recover_token_id(&class) {
            Ok(token_id) => token_id,
            Err(e) => {
                return self.fail_on_ledger_error(
                    request,
                    farmer,
                    transaction_ids,
                    "recovering created token id",
                    e,
                )
            }
        };

        let amount = evaluation.estimated_value;
        let mint_tx = match self.ledger.issue_tokens(token_id, amount, &recipient) {
            Ok(transaction_id) => transaction_id,
            Err(e) => {
                return self.fail_on_ledger_error(
                    request,
                    farmer,
                    transaction_ids,
                    "issuing tokens",
                    e,
                )
            }
        };
        log::info!(
            "Issued {} tokens of {} to {} in {}",
            amount,
            token_id,
            recipient,
            mint_tx
        );
        transaction_ids.push(mint_tx);

        match self.store.transition_to_completed(&request.id, &transaction_ids) {
            Ok(Transition::Applied) => {}
            Ok(Transition::Stale) => {
                log::error!(
                    "Request {} left minting before completion; ledger transactions {:?}",
                    request.id,
                    transaction_ids
                );
                return Ok(RecordOutcome::Abandoned {
                    request_id: request.id.clone(),
                });
            }
            Err(e) => {
                log::error!(
                    "Could not complete request {} after {:?}: {}",
                    request.id,
                    transaction_ids,
                    e
                );
                return Ok(RecordOutcome::Unrecorded {
                    request_id: request.id.clone(),
                    error: e.to_string(),
                });
            }
        }
        log::info!("Request {} completed", request.id);

        self.verify_balance(token_id, &recipient, amount);

        let outcome = RecordOutcome::Completed {
            request_id: request.id.clone(),
            evaluation_id: request.evaluation_id.clone(),
            token_id,
            amount,
            transaction_ids,
        };
        self.notifier.notify(farmer, &outcome);
        Ok(outcome)
    }

    /// Read the id assigned to the class just created and check it really is that class
    fn recover_token_id(&self, class: &CollateralTokenClass) -> Result<TokenId, LedgerError> {
        let token_id = created_token_id(self.ledger.as_ref())?;
        let details = self.ledger.query_token_details(token_id)?;
        if !details.matches(class) {
            return Err(LedgerError::Inconsistent(format!(
                "token {} is {} owned by {}, expected {} owned by {}",
                token_id, details.symbol, details.owner, class.symbol, class.owner
            )));
        }
        Ok(token_id)
    }

    /// The farmer balance covers every class, so it can only be checked against a lower bound
    fn verify_balance(&self, token_id: TokenId, recipient: &AccountId, amount: u64) {
        match self.ledger.query_account_balance(recipient) {
            Ok(balance) if balance >= amount => {
                log::info!("{} holds {} collateral tokens after {}", recipient, balance, token_id)
            }
            Ok(balance) => log::warn!(
                "{} holds {} collateral tokens right after receiving {} of {}",
                recipient,
                balance,
                amount,
                token_id
            ),
            Err(e) => log::warn!("Could not read balance of {}: {}", recipient, e),
        }
    }

    fn fail_on_ledger_error(
        &self,
        request: &TokenizationRequest,
        farmer: Option<&UserId>,
        transaction_ids: Vec<TransactionId>,
        step: &str,
        error: LedgerError,
    ) -> Result<RecordOutcome, WorkerError> {
        let outcome = self.fail(
            request,
            farmer,
            transaction_ids,
            format!("{} failed: {}", step, error),
        );

        if error.halts_worker() {
            log::error!(
                "Halting after request {}: {}; fix the ledger configuration before restarting",
                request.id,
                error
            );
            return Err(WorkerError::Halted(error));
        }
        outcome
    }

    fn fail(
        &self,
        request: &TokenizationRequest,
        farmer: Option<&UserId>,
        transaction_ids: Vec<TransactionId>,
        reason: String,
    ) -> Result<RecordOutcome, WorkerError> {
        match self
            .store
            .transition_to_failed(&request.id, &reason, &transaction_ids)
        {
            Ok(Transition::Applied) => {
                log::warn!("Request {} failed: {}", request.id, reason);
            }
            Ok(Transition::Stale) => {
                log::warn!(
                    "Request {} left minting before it could be failed ({})",
                    request.id,
                    reason
                );
                return Ok(RecordOutcome::Abandoned {
                    request_id: request.id.clone(),
                });
            }
            Err(e) => {
                log::error!(
                    "Could not mark request {} as failed ({}): {}",
                    request.id,
                    reason,
                    e
                );
                return Ok(RecordOutcome::Unrecorded {
                    request_id: request.id.clone(),
                    error: e.to_string(),
                });
            }
        }

        let outcome = RecordOutcome::Failed {
            request_id: request.id.clone(),
            evaluation_id: request.evaluation_id.clone(),
            reason,
            transaction_ids,
        };
        self.notifier.notify(farmer, &outcome);
        Ok(outcome)
    }

    /// Fail every request a previous process left in `minting` and notify its farmer.
    ///
    /// Must run before the first scan and only while no other worker is running.
    pub fn recover_interrupted(&self) -> Result<Vec<RecordOutcome>, WorkerError> {
        let interrupted = self.store.fail_interrupted(INTERRUPTED_REASON)?;
        if interrupted.is_empty() {
            return Ok(Vec::new());
        }

        log::warn!(
            "Failed {} requests interrupted while minting",
            interrupted.len()
        );

        let mut outcomes = Vec::with_capacity(interrupted.len());
        for request in interrupted {
            log::warn!(
                "Request {} was interrupted with transactions {:?}",
                request.id,
                request.transaction_ids
            );

            let farmer = match self.store.lookup_evaluation_with_wallet(&request.evaluation_id) {
                Ok(EvaluationLookup::Found(evaluation)) => Some(evaluation.farmer_id),
                Ok(EvaluationLookup::NotFound) => None,
                Err(e) => {
                    log::warn!(
                        "Could not load evaluation {} for recovery notice: {}",
                        request.evaluation_id,
                        e
                    );
                    None
                }
            };

            let outcome = RecordOutcome::Failed {
                request_id: request.id,
                evaluation_id: request.evaluation_id,
                reason: INTERRUPTED_REASON.to_string(),
                transaction_ids: request.transaction_ids,
            };
            self.notifier.notify(farmer.as_ref(), &outcome);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

/// Input checks that need no ledger call. Returns the recipient account.
fn validate_evaluation(evaluation: &CropEvaluation) -> Result<AccountId, String> {
    let wallet = match evaluation.wallet_address.as_deref().map(str::trim) {
        Some(wallet) if !wallet.is_empty() => wallet,
        _ => {
            return Err(format!(
                "farmer {} has no wallet address",
                evaluation.farmer_id
            ))
        }
    };

    let recipient = wallet.parse::<AccountId>().map_err(|e| {
        format!(
            "farmer {} has a malformed wallet address '{}': {}",
            evaluation.farmer_id, wallet, e
        )
    })?;

    if evaluation.estimated_value == 0 {
        return Err(format!(
            "crop evaluation {} has no estimated value",
            evaluation.evaluation_id
        ));
    }

    Ok(recipient)
}

fn collateral_class(
    evaluation: &CropEvaluation,
    owner: AccountId,
    now: DateTime<Utc>,
) -> CollateralTokenClass {
    let harvest = evaluation
        .harvest_date
        .unwrap_or_else(|| now + maturity_window(&evaluation.crop_type));

    CollateralTokenClass {
        owner,
        value: evaluation.estimated_value,
        crop_type: evaluation.crop_type.clone(),
        harvest_timestamp: harvest.timestamp(),
        symbol: token_symbol(&evaluation.crop_type, now),
    }
}

/// Up to four letters of the crop followed by the last four digits of the millisecond clock
pub fn token_symbol(crop_type: &str, now: DateTime<Utc>) -> String {
    let mut prefix: String = crop_type
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .take(4)
        .collect();
    if prefix.is_empty() {
        prefix.push_str("CROP");
    }
    format!("{}{:04}", prefix, now.timestamp_millis().rem_euclid(10_000))
}

/// Time from approval to expected harvest when the evaluation has no harvest date
pub fn maturity_window(crop_type: &str) -> Duration {
    let crop = crop_type.trim().to_lowercase();
    if LONG_MATURITY_CROPS.contains(&crop.as_str()) {
        Duration::days(LONG_MATURITY_DAYS)
    } else {
        Duration::days(DEFAULT_MATURITY_DAYS)
    }
}
