use chrono::{DateTime, Duration, Utc};
use cropmint_core::config::OperatorKey;
use cropmint_core::id::{AccountId, TransactionId};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Mutex;

/// DER header of an ed25519 SubjectPublicKeyInfo; ledger tooling expects public keys in this form
pub const ED25519_PUBLIC_DER_PREFIX: &str = "302a300506032b6570032100";

/// Signs contract calls on behalf of the operator account
pub struct OperatorSigner {
    account: AccountId,
    key: SigningKey,
    last_valid_start: Mutex<Option<DateTime<Utc>>>,
}

impl OperatorSigner {
    pub fn new(account: AccountId, key: &OperatorKey) -> Self {
        Self {
            account,
            key: SigningKey::from_bytes(key.as_bytes()),
            last_valid_start: Mutex::new(None),
        }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Public key as DER-prefixed hex
    pub fn public_key_hex(&self) -> String {
        format!(
            "{}{}",
            ED25519_PUBLIC_DER_PREFIX,
            hex::encode(self.key.verifying_key().as_bytes())
        )
    }

    /// Hex ed25519 signature over the SHA-256 digest of the canonical form of `body`
    pub fn sign(&self, body: &Value) -> String {
        let digest = Sha256::digest(canonical_json(body).as_bytes());
        hex::encode(self.key.sign(&digest).to_bytes())
    }

    /// A fresh transaction id paid by the operator.
    ///
    /// Valid-start times are strictly increasing within the process so two
    /// submissions never share an id.
    pub fn next_transaction_id(&self) -> TransactionId {
        let mut last = self
            .last_valid_start
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut valid_start = Utc::now();
        if let Some(previous) = *last {
            if valid_start <= previous {
                valid_start = previous + Duration::nanoseconds(1);
            }
        }
        *last = Some(valid_start);

        TransactionId::generate(&self.account, valid_start)
    }
}

impl std::fmt::Debug for OperatorSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorSigner")
            .field("account", &self.account)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Compact JSON with object keys sorted, so that signer and gateway hash the same bytes.
///
/// serde_json keeps object keys in a `BTreeMap` unless its `preserve_order`
/// feature is enabled, which this workspace never does.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};
    use serde_json::json;

    // RFC 8032 test vector 1
    const SECRET: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";
    const PUBLIC: &str = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";

    fn signer() -> OperatorSigner {
        OperatorSigner::new("0.0.1001".parse().unwrap(), &SECRET.parse().unwrap())
    }

    #[test]
    fn test_public_key_is_der_prefixed() {
        assert_eq!(
            signer().public_key_hex(),
            format!("{}{}", ED25519_PUBLIC_DER_PREFIX, PUBLIC)
        );
    }

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"d": [true, null], "c": "x"}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":"x","d":[true,null]},"b":1}"#);
    }

    #[test]
    fn test_signature_verifies_over_canonical_digest() {
        let signer = signer();
        let body = json!({"function": "mintTokens", "args": ["3", "4000", "0.0.789012"]});
        let signature = hex::decode(signer.sign(&body)).unwrap();
        let signature = Signature::from_slice(&signature).unwrap();

        let reordered = json!({"args": ["3", "4000", "0.0.789012"], "function": "mintTokens"});
        let digest = Sha256::digest(canonical_json(&reordered).as_bytes());
        assert!(signer.verifying_key().verify(&digest, &signature).is_ok());
    }

    #[test]
    fn test_transaction_ids_are_unique_and_paid_by_operator() {
        let signer = signer();
        let ids: Vec<_> = (0..50).map(|_| signer.next_transaction_id()).collect();

        let mut unique = ids.clone();
        unique.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.iter().all(|id| id.as_str().starts_with("0.0.1001@")));
    }

    #[test]
    fn test_debug_omits_secret() {
        let debug = format!("{:?}", signer());
        assert!(!debug.contains(SECRET));
        assert!(debug.contains(PUBLIC));
    }
}
