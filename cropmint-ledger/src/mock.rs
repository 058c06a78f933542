use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use cropmint_core::error::LedgerError;
use cropmint_core::id::{AccountId, TokenId, TransactionId};

use crate::traits::{CollateralTokenClass, LedgerClient, TokenDetails};

/// Ledger operations as seen by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOperation {
    CreateTokenClass,
    IssueTokens,
    QueryTokenDetails,
    QueryAccountBalance,
    QueryNextTokenId,
}

impl LedgerOperation {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            LedgerOperation::CreateTokenClass | LedgerOperation::IssueTokens
        )
    }
}

/// One call made against the mock ledger
#[derive(Debug, Clone)]
pub struct LedgerCall {
    pub operation: LedgerOperation,
    pub started: Instant,
    pub finished: Instant,
    /// Set for writes that produced a transaction, successful or not
    pub transaction_id: Option<TransactionId>,
    pub succeeded: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_token_id: u64,
    tokens: BTreeMap<u64, TokenDetails>,
    balances: HashMap<(u64, AccountId), u64>,
    calls: Vec<LedgerCall>,
    scripted: HashMap<LedgerOperation, VecDeque<LedgerError>>,
    transactions: u64,
    /// Number of upcoming creates followed by a create from another submitter
    foreign_creates: u32,
}

/// In-memory ledger for tests.
///
/// Keeps a token counter, token classes and balances, records every call
/// with its start and end instant, and fails calls on demand.
pub struct MockLedger {
    operator: AccountId,
    latency: Duration,
    state: Mutex<MockState>,
}

impl MockLedger {
    /// Create a new MockLedger paid for by `0.0.2`
    pub fn new() -> Self {
        Self {
            operator: AccountId::new(0, 0, 2),
            latency: Duration::ZERO,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Make every call take at least `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Start the token counter at `next_token_id`
    pub fn with_next_token_id(self, next_token_id: u64) -> Self {
        self.state().next_token_id = next_token_id;
        self
    }

    /// Fail the next call of `operation` with `error`. Queued errors are used in order.
    pub fn fail_next(&self, operation: LedgerOperation, error: LedgerError) {
        self.state()
            .scripted
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Have another submitter create a token class right after the next successful create
    pub fn race_next_create(&self) {
        self.state().foreign_creates += 1;
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.state().calls.clone()
    }

    pub fn calls_of(&self, operation: LedgerOperation) -> Vec<LedgerCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .cloned()
            .collect()
    }

    pub fn token(&self, token_id: TokenId) -> Option<TokenDetails> {
        self.state().tokens.get(&token_id.0).cloned()
    }

    pub fn tokens(&self) -> Vec<TokenDetails> {
        self.state().tokens.values().cloned().collect()
    }

    pub fn balance(&self, token_id: TokenId, account: &AccountId) -> u64 {
        self.state()
            .balances
            .get(&(token_id.0, account.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` against the state, recording the call and applying scripted failures
    fn record<T>(
        &self,
        operation: LedgerOperation,
        op: impl FnOnce(&mut MockState, Option<TransactionId>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let started = Instant::now();
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let mut state = self.state();
        let transaction_id = operation.is_write().then(|| {
            state.transactions += 1;
            TransactionId::new(format!("{}@1700000000.{:09}", self.operator, state.transactions))
        });

        let scripted = state
            .scripted
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());
        let result = match scripted {
            Some(error) => Err(error),
            None => op(&mut *state, transaction_id.clone()),
        };

        state.calls.push(LedgerCall {
            operation,
            started,
            finished: Instant::now(),
            transaction_id,
            succeeded: result.is_ok(),
        });
        result
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerClient for MockLedger {
    fn create_collateral_token_class(
        &self,
        class: &CollateralTokenClass,
    ) -> Result<TransactionId, LedgerError> {
        self.record(LedgerOperation::CreateTokenClass, |state, transaction_id| {
            let transaction_id = transaction_id.ok_or_else(|| {
                LedgerError::Unreachable("write without transaction id".to_string())
            })?;

            let token_id = state.next_token_id;
            state.tokens.insert(
                token_id,
                TokenDetails {
                    token_id: TokenId(token_id),
                    owner: class.owner.clone(),
                    value: class.value,
                    crop_type: class.crop_type.clone(),
                    harvest_timestamp: class.harvest_timestamp,
                    symbol: class.symbol.clone(),
                },
            );
            state.next_token_id += 1;

            if state.foreign_creates > 0 {
                state.foreign_creates -= 1;
                let foreign_id = state.next_token_id;
                state.tokens.insert(
                    foreign_id,
                    TokenDetails {
                        token_id: TokenId(foreign_id),
                        owner: AccountId::new(0, 0, 999_999),
                        value: 1,
                        crop_type: "maize".to_string(),
                        harvest_timestamp: class.harvest_timestamp,
                        symbol: "MAIZ0000".to_string(),
                    },
                );
                state.next_token_id += 1;
            }

            Ok(transaction_id)
        })
    }

    fn issue_tokens(
        &self,
        token_id: TokenId,
        amount: u64,
        recipient: &AccountId,
    ) -> Result<TransactionId, LedgerError> {
        self.record(LedgerOperation::IssueTokens, |state, transaction_id| {
            let transaction_id = transaction_id.ok_or_else(|| {
                LedgerError::Unreachable("write without transaction id".to_string())
            })?;

            if !state.tokens.contains_key(&token_id.0) {
                return Err(LedgerError::Rejected {
                    transaction_id,
                    status: "INVALID_TOKEN_ID".to_string(),
                });
            }

            let balance = state
                .balances
                .entry((token_id.0, recipient.clone()))
                .or_insert(0);
            *balance = balance.saturating_add(amount);
            Ok(transaction_id)
        })
    }

    fn query_token_details(&self, token_id: TokenId) -> Result<TokenDetails, LedgerError> {
        self.record(LedgerOperation::QueryTokenDetails, |state, _| {
            state.tokens.get(&token_id.0).cloned().ok_or_else(|| {
                LedgerError::Inconsistent(format!("token {} does not exist", token_id))
            })
        })
    }

    fn query_account_balance(&self, account: &AccountId) -> Result<u64, LedgerError> {
        self.record(LedgerOperation::QueryAccountBalance, |state, _| {
            Ok(state
                .balances
                .iter()
                .filter(|((_, holder), _)| holder == account)
                .fold(0u64, |total, (_, balance)| total.saturating_add(*balance)))
        })
    }

    fn query_next_token_id(&self) -> Result<u64, LedgerError> {
        self.record(LedgerOperation::QueryNextTokenId, |state, _| {
            Ok(state.next_token_id)
        })
    }
}
