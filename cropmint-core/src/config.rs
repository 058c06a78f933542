//! Worker configuration.
//!
//! Raw settings are collected as optional strings (from flags, the environment
//! or a `.env` file) and validated in a single pass so that an operator sees
//! every missing or malformed key at once.

use crate::error::{ConfigError, ConfigProblem};
use crate::id::{AccountId, ContractId, EntityId};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// PKCS#8 DER prefix ledger tooling prepends to raw ed25519 private keys
pub const ED25519_PRIVATE_DER_PREFIX: &str = "302e020100300506032b657004220420";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_RECORD_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECEIPT_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_RECEIPT_POLL_MS: u64 = 1_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Ledger network the worker signs transactions for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerNetwork {
    Mainnet,
    Testnet,
    Previewnet,
    Local,
}

impl LedgerNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerNetwork::Mainnet => "mainnet",
            LedgerNetwork::Testnet => "testnet",
            LedgerNetwork::Previewnet => "previewnet",
            LedgerNetwork::Local => "local",
        }
    }
}

impl fmt::Display for LedgerNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(LedgerNetwork::Mainnet),
            "testnet" => Ok(LedgerNetwork::Testnet),
            "previewnet" => Ok(LedgerNetwork::Previewnet),
            "local" => Ok(LedgerNetwork::Local),
            other => Err(format!(
                "unknown network '{}', expected mainnet, testnet, previewnet or local",
                other
            )),
        }
    }
}

/// Raw ed25519 private key of the operator account. Wiped on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct OperatorKey([u8; 32]);

impl OperatorKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        OperatorKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for OperatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OperatorKey(<redacted>)")
    }
}

impl FromStr for OperatorKey {
    type Err = String;

    /// Accepts 64 hex characters, or the same key behind the DER prefix (96 characters)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed).to_ascii_lowercase();
        let raw = trimmed
            .strip_prefix(ED25519_PRIVATE_DER_PREFIX)
            .unwrap_or(&trimmed);

        if raw.len() != 64 {
            return Err(
                "expected a 32-byte ed25519 key as hex, optionally DER-prefixed".to_string(),
            );
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(raw, &mut bytes).map_err(|e| format!("not valid hex: {}", e))?;
        Ok(OperatorKey(bytes))
    }
}

/// Retry parameters for idempotent ledger reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            backoff: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// Everything the ledger client needs
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub network: LedgerNetwork,
    pub gateway_url: String,
    pub operator_id: AccountId,
    pub operator_key: OperatorKey,
    pub token_factory: ContractId,
    /// Validated at startup; only downstream loan logic calls it
    pub loan_manager: ContractId,
    pub receipt_timeout: Duration,
    pub receipt_poll_interval: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Polling loop parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Pause between two records of the same batch
    pub record_delay: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            batch_size: DEFAULT_BATCH_SIZE,
            record_delay: Duration::from_millis(DEFAULT_RECORD_DELAY_MS),
        }
    }
}

/// Validated, immutable worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub ledger: LedgerSettings,
    pub scheduler: SchedulerSettings,
    pub database_url: String,
    pub log_level: String,
}

/// Unvalidated settings as read from the environment or command line
#[derive(Debug, Clone, Default)]
pub struct RawSettings {
    pub ledger_network: Option<String>,
    pub ledger_gateway_url: Option<String>,
    pub ledger_operator_id: Option<String>,
    pub ledger_operator_key: Option<String>,
    pub token_factory_contract_id: Option<String>,
    pub loan_manager_contract_id: Option<String>,
    pub database_url: Option<String>,
    pub poll_interval_ms: Option<String>,
    pub max_retries: Option<String>,
    pub retry_delay_ms: Option<String>,
    pub batch_size: Option<String>,
    pub record_delay_ms: Option<String>,
    pub receipt_timeout_ms: Option<String>,
    pub receipt_poll_ms: Option<String>,
    pub request_timeout_ms: Option<String>,
    pub log_level: Option<String>,
}

/// Collects problems while validating so none is reported in isolation
struct Validator {
    problems: Vec<ConfigProblem>,
}

impl Validator {
    fn new() -> Self {
        Self {
            problems: Vec::new(),
        }
    }

    fn malformed(&mut self, key: &'static str, reason: impl Into<String>) {
        self.problems.push(ConfigProblem::Malformed {
            key,
            reason: reason.into(),
        });
    }

    /// A value that must be present and non-blank
    fn required<'a>(&mut self, key: &'static str, value: &'a Option<String>) -> Option<&'a str> {
        match value.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => Some(v),
            _ => {
                self.problems.push(ConfigProblem::Missing(key));
                None
            }
        }
    }

    fn parsed<T: FromStr<Err = String>>(
        &mut self,
        key: &'static str,
        value: &Option<String>,
    ) -> Option<T> {
        let raw = self.required(key, value)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(reason) => {
                self.malformed(key, reason);
                None
            }
        }
    }

    fn entity(&mut self, key: &'static str, value: &Option<String>) -> Option<EntityId> {
        self.parsed(key, value)
    }

    fn url(&mut self, key: &'static str, value: &Option<String>, schemes: &[&str]) -> Option<String> {
        let raw = self.required(key, value)?;
        if schemes.iter().any(|scheme| raw.starts_with(scheme)) {
            Some(raw.to_string())
        } else {
            self.malformed(key, format!("must start with one of {}", schemes.join(", ")));
            None
        }
    }

    /// An optional integer with a default; `min` is the smallest accepted value
    fn integer(&mut self, key: &'static str, value: &Option<String>, default: u64, min: u64) -> u64 {
        let raw = match value.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => v,
            _ => return default,
        };
        match raw.parse::<u64>() {
            Ok(v) if v >= min => v,
            _ => {
                let reason = if min > 0 {
                    format!("'{}' is not a positive integer", raw)
                } else {
                    format!("'{}' is not a non-negative integer", raw)
                };
                self.malformed(key, reason);
                default
            }
        }
    }
}

impl WorkerConfig {
    /// Validate raw settings, reporting every missing or malformed key at once
    pub fn from_raw(raw: &RawSettings) -> Result<Self, ConfigError> {
        let mut v = Validator::new();

        let network = v.parsed::<LedgerNetwork>("LEDGER_NETWORK", &raw.ledger_network);
        let gateway_url = v.url(
            "LEDGER_GATEWAY_URL",
            &raw.ledger_gateway_url,
            &["http://", "https://"],
        );
        let operator_id = v.entity("LEDGER_OPERATOR_ID", &raw.ledger_operator_id);
        let operator_key = v.parsed::<OperatorKey>("LEDGER_OPERATOR_KEY", &raw.ledger_operator_key);
        let token_factory = v.entity("TOKEN_FACTORY_CONTRACT_ID", &raw.token_factory_contract_id);
        let loan_manager = v.entity("LOAN_MANAGER_CONTRACT_ID", &raw.loan_manager_contract_id);
        let database_url = v.url("DATABASE_URL", &raw.database_url, &["sqlite:"]);

        let poll_interval_ms =
            v.integer("POLL_INTERVAL_MS", &raw.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS, 1);
        let max_retries =
            v.integer("MAX_RETRIES", &raw.max_retries, DEFAULT_MAX_RETRIES as u64, 1);
        let retry_delay_ms =
            v.integer("RETRY_DELAY_MS", &raw.retry_delay_ms, DEFAULT_RETRY_DELAY_MS, 0);
        let batch_size = v.integer("BATCH_SIZE", &raw.batch_size, DEFAULT_BATCH_SIZE as u64, 1);
        let record_delay_ms =
            v.integer("RECORD_DELAY_MS", &raw.record_delay_ms, DEFAULT_RECORD_DELAY_MS, 0);
        let receipt_timeout_ms = v.integer(
            "RECEIPT_TIMEOUT_MS",
            &raw.receipt_timeout_ms,
            DEFAULT_RECEIPT_TIMEOUT_MS,
            1,
        );
        let receipt_poll_ms =
            v.integer("RECEIPT_POLL_MS", &raw.receipt_poll_ms, DEFAULT_RECEIPT_POLL_MS, 1);
        let request_timeout_ms = v.integer(
            "REQUEST_TIMEOUT_MS",
            &raw.request_timeout_ms,
            DEFAULT_REQUEST_TIMEOUT_MS,
            1,
        );

        let max_attempts = u32::try_from(max_retries).unwrap_or_else(|_| {
            v.malformed("MAX_RETRIES", "out of range");
            DEFAULT_MAX_RETRIES
        });

        let log_level = raw
            .log_level
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_LOG_LEVEL)
            .to_string();

        match (
            network,
            gateway_url,
            operator_id,
            operator_key,
            token_factory,
            loan_manager,
            database_url,
        ) {
            (
                Some(network),
                Some(gateway_url),
                Some(operator_id),
                Some(operator_key),
                Some(token_factory),
                Some(loan_manager),
                Some(database_url),
            ) if v.problems.is_empty() => Ok(WorkerConfig {
                ledger: LedgerSettings {
                    network,
                    gateway_url,
                    operator_id,
                    operator_key,
                    token_factory,
                    loan_manager,
                    receipt_timeout: Duration::from_millis(receipt_timeout_ms),
                    receipt_poll_interval: Duration::from_millis(receipt_poll_ms),
                    request_timeout: Duration::from_millis(request_timeout_ms),
                    retry: RetryPolicy {
                        max_attempts,
                        backoff: Duration::from_millis(retry_delay_ms),
                    },
                },
                scheduler: SchedulerSettings {
                    poll_interval: Duration::from_millis(poll_interval_ms),
                    batch_size: batch_size as usize,
                    record_delay: Duration::from_millis(record_delay_ms),
                },
                database_url,
                log_level,
            }),
            _ => Err(ConfigError::Invalid(v.problems)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_KEY: &str =
        "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    pub(crate) fn complete_settings() -> RawSettings {
        RawSettings {
            ledger_network: Some("testnet".to_string()),
            ledger_gateway_url: Some("https://gateway.testnet.example".to_string()),
            ledger_operator_id: Some("0.0.1001".to_string()),
            ledger_operator_key: Some(TEST_KEY.to_string()),
            token_factory_contract_id: Some("0.0.5005".to_string()),
            loan_manager_contract_id: Some("0.0.5006".to_string()),
            database_url: Some("sqlite:/tmp/cropmint.db".to_string()),
            ..RawSettings::default()
        }
    }

    #[test]
    fn test_complete_settings_use_defaults() {
        let config = WorkerConfig::from_raw(&complete_settings()).unwrap();

        assert_eq!(config.ledger.network, LedgerNetwork::Testnet);
        assert_eq!(config.ledger.operator_id.to_string(), "0.0.1001");
        assert_eq!(config.ledger.token_factory.to_string(), "0.0.5005");
        assert_eq!(config.scheduler.poll_interval, Duration::from_secs(30));
        assert_eq!(config.scheduler.batch_size, 10);
        assert_eq!(config.ledger.retry, RetryPolicy::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_every_missing_key_reported_at_once() {
        let err = WorkerConfig::from_raw(&RawSettings::default()).unwrap_err();

        assert_eq!(
            err.missing_keys(),
            vec![
                "LEDGER_NETWORK",
                "LEDGER_GATEWAY_URL",
                "LEDGER_OPERATOR_ID",
                "LEDGER_OPERATOR_KEY",
                "TOKEN_FACTORY_CONTRACT_ID",
                "LOAN_MANAGER_CONTRACT_ID",
                "DATABASE_URL",
            ]
        );
    }

    #[test]
    fn test_missing_and_malformed_reported_together() {
        let mut raw = complete_settings();
        raw.ledger_network = None;
        raw.token_factory_contract_id = Some("factory".to_string());
        raw.poll_interval_ms = Some("0".to_string());
        raw.retry_delay_ms = Some("soon".to_string());

        let err = WorkerConfig::from_raw(&raw).unwrap_err();
        let keys: Vec<_> = err.problems().iter().map(|p| p.key()).collect();

        assert_eq!(
            keys,
            vec![
                "LEDGER_NETWORK",
                "TOKEN_FACTORY_CONTRACT_ID",
                "POLL_INTERVAL_MS",
                "RETRY_DELAY_MS",
            ]
        );
    }

    #[test]
    fn test_blank_values_count_as_missing() {
        let mut raw = complete_settings();
        raw.database_url = Some("   ".to_string());

        let err = WorkerConfig::from_raw(&raw).unwrap_err();
        assert_eq!(err.missing_keys(), vec!["DATABASE_URL"]);
    }

    #[test]
    fn test_operator_key_formats() {
        let plain: OperatorKey = TEST_KEY.parse().unwrap();
        let der: OperatorKey = format!("{}{}", ED25519_PRIVATE_DER_PREFIX, TEST_KEY)
            .parse()
            .unwrap();
        assert_eq!(plain.as_bytes(), der.as_bytes());

        assert!("abcd".parse::<OperatorKey>().is_err());
        assert!("zz".repeat(32).parse::<OperatorKey>().is_err());
        assert_eq!(format!("{:?}", plain), "OperatorKey(<redacted>)");
    }

    #[test]
    fn test_network_and_scheme_validation() {
        let mut raw = complete_settings();
        raw.ledger_network = Some("devnet".to_string());
        raw.ledger_gateway_url = Some("ftp://gateway".to_string());
        raw.database_url = Some("postgres://db".to_string());

        let err = WorkerConfig::from_raw(&raw).unwrap_err();
        let keys: Vec<_> = err.problems().iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec!["LEDGER_NETWORK", "LEDGER_GATEWAY_URL", "DATABASE_URL"]);
    }
}
