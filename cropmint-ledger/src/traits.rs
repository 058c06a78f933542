use cropmint_core::error::LedgerError;
use cropmint_core::id::{AccountId, TokenId, TransactionId};
use serde::{Deserialize, Serialize};

/// Parameters of a new collateral-token class on the token-factory contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralTokenClass {
    /// Farmer account that owns the class and receives the tokens
    pub owner: AccountId,
    /// Collateral value in whole monetary units
    pub value: u64,
    pub crop_type: String,
    /// Expected harvest, unix seconds
    pub harvest_timestamp: i64,
    pub symbol: String,
}

/// Token class as reported by `getTokenDetails`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDetails {
    pub token_id: TokenId,
    pub owner: AccountId,
    pub value: u64,
    pub crop_type: String,
    pub harvest_timestamp: i64,
    pub symbol: String,
}

impl TokenDetails {
    /// Whether these details describe the class that `class` asked for
    pub fn matches(&self, class: &CollateralTokenClass) -> bool {
        self.owner == class.owner && self.symbol == class.symbol
    }
}

/// Blocking interface to the ledger.
///
/// Write operations return only once the ledger reports a terminal receipt.
/// Implementations must never retry a write on their own; a write that may or
/// may not have executed is reported as [`LedgerError::Unreachable`].
pub trait LedgerClient: Send + Sync {
    /// Create a collateral-token class on the token-factory contract
    ///
    /// # Parameters
    /// * `class` - Owner, valuation, crop and symbol of the new class
    ///
    /// # Returns
    /// The id of the successful transaction. The new token id is not part of
    /// the receipt; see [`created_token_id`].
    fn create_collateral_token_class(
        &self,
        class: &CollateralTokenClass,
    ) -> Result<TransactionId, LedgerError>;

    /// Issue `amount` tokens of class `token_id` to `recipient`
    fn issue_tokens(
        &self,
        token_id: TokenId,
        amount: u64,
        recipient: &AccountId,
    ) -> Result<TransactionId, LedgerError>;

    /// Read a token class from the contract
    fn query_token_details(&self, token_id: TokenId) -> Result<TokenDetails, LedgerError>;

    /// Collateral token balance the factory contract reports for `account`, across all classes
    fn query_account_balance(&self, account: &AccountId) -> Result<u64, LedgerError>;

    /// Current value of the contract's `nextTokenId()` counter
    fn query_next_token_id(&self) -> Result<u64, LedgerError>;

    /// Cheap read used at startup to detect a bad gateway, contract or credential
    fn probe(&self) -> Result<u64, LedgerError> {
        self.query_next_token_id()
    }
}

/// Recover the id of the token class created by the last successful create.
///
/// The token-factory contract assigns ids from a counter and does not report
/// the new id in the receipt, so the id is read back as `nextTokenId() - 1`.
/// This is only correct while no other create is submitted to the same
/// contract between the create receipt and this read, which is why records
/// are processed one at a time.
pub fn created_token_id<L: LedgerClient + ?Sized>(ledger: &L) -> Result<TokenId, LedgerError> {
    let next = ledger.query_next_token_id()?;
    match next.checked_sub(1) {
        Some(id) => Ok(TokenId(id)),
        None => Err(LedgerError::Inconsistent(
            "nextTokenId() is 0 right after a successful create".to_string(),
        )),
    }
}

impl<T: LedgerClient + ?Sized> LedgerClient for std::sync::Arc<T> {
    fn create_collateral_token_class(
        &self,
        class: &CollateralTokenClass,
    ) -> Result<TransactionId, LedgerError> {
        (**self).create_collateral_token_class(class)
    }

    fn issue_tokens(
        &self,
        token_id: TokenId,
        amount: u64,
        recipient: &AccountId,
    ) -> Result<TransactionId, LedgerError> {
        (**self).issue_tokens(token_id, amount, recipient)
    }

    fn query_token_details(&self, token_id: TokenId) -> Result<TokenDetails, LedgerError> {
        (**self).query_token_details(token_id)
    }

    fn query_account_balance(&self, account: &AccountId) -> Result<u64, LedgerError> {
        (**self).query_account_balance(account)
    }

    fn query_next_token_id(&self) -> Result<u64, LedgerError> {
        (**self).query_next_token_id()
    }

    fn probe(&self) -> Result<u64, LedgerError> {
        (**self).probe()
    }
}
