pub mod gateway;
pub mod mock;
pub mod signer;
pub mod traits;

// Re-export the main types for convenience
pub use gateway::{GatewayLedgerClient, CREATE_TOKEN_GAS, MINT_GAS, QUERY_GAS};
pub use mock::{LedgerCall, LedgerOperation, MockLedger};
pub use signer::OperatorSigner;
pub use traits::{created_token_id, CollateralTokenClass, LedgerClient, TokenDetails};
