//! CropMint collateral tokenization
//!
//! This crate re-exports all the components of the CropMint worker.

pub use cropmint_core::*;
pub use cropmint_ledger::*;
pub use cropmint_store::*;
pub use cropmint_worker::*;
