use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                $name(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                $name(id)
            }
        }
    };
}

opaque_id!(
    /// Identifier of a row in the tokenization request queue
    RequestId
);
opaque_id!(
    /// Identifier of a crop evaluation owned by the approval workflow
    EvaluationId
);
opaque_id!(
    /// Identifier of a platform user (farmers receive notifications under it)
    UserId
);

/// Ledger entity identifier in `shard.realm.num` form (e.g. `0.0.789012`).
///
/// Accounts and contracts share the same address space on the ledger, so the
/// same type is used for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId {
    pub shard: u64,
    pub realm: u64,
    pub num: u64,
}

/// A ledger account (farmer wallets, the operator account)
pub type AccountId = EntityId;

/// A deployed ledger contract
pub type ContractId = EntityId;

impl EntityId {
    pub fn new(shard: u64, realm: u64, num: u64) -> Self {
        Self { shard, realm, num }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.shard, self.realm, self.num)
    }
}

impl FromStr for EntityId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(format!("expected shard.realm.num, got '{}'", s));
        }

        let mut numbers = [0u64; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("expected shard.realm.num, got '{}'", s));
            }
            *slot = part
                .parse()
                .map_err(|_| format!("component '{}' of '{}' is out of range", part, s))?;
        }

        Ok(EntityId::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl TryFrom<String> for EntityId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.to_string()
    }
}

/// Ledger transaction identifier, `<payer>@<seconds>.<nanos>`.
///
/// Transaction ids are chosen by the submitter, which is what allows a receipt
/// to be looked up after the submit response itself was lost.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        TransactionId(id.into())
    }

    /// Build the transaction id for a transaction paid by `payer` and valid from `valid_start`
    pub fn generate(payer: &AccountId, valid_start: DateTime<Utc>) -> Self {
        TransactionId(format!(
            "{}@{}.{:09}",
            payer,
            valid_start.timestamp(),
            valid_start.timestamp_subsec_nanos()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Index of a collateral-token class inside the token-factory contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
