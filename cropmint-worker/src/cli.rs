use clap::Parser;
use cropmint_core::config::RawSettings;

/// Command-line arguments. Every setting can also come from its environment variable.
///
/// Values are kept as raw strings here so that validation can report every
/// problem at once.
#[derive(Parser, Debug, Default)]
#[command(name = "cropmint-worker")]
#[command(about = "Turns approved crop evaluations into collateral tokens on the ledger")]
#[command(version)]
pub struct WorkerArgs {
    /// Run startup recovery and a single scan, then exit
    #[arg(long)]
    pub once: bool,

    /// Ledger network: mainnet, testnet, previewnet or local
    #[arg(long, env = "LEDGER_NETWORK")]
    pub ledger_network: Option<String>,

    /// JSON-RPC endpoint of the ledger gateway
    #[arg(long, env = "LEDGER_GATEWAY_URL")]
    pub ledger_gateway_url: Option<String>,

    /// Operator account paying for transactions (shard.realm.num)
    #[arg(long, env = "LEDGER_OPERATOR_ID")]
    pub ledger_operator_id: Option<String>,

    /// Operator ed25519 private key, hex
    #[arg(long, env = "LEDGER_OPERATOR_KEY", hide_env_values = true)]
    pub ledger_operator_key: Option<String>,

    /// Token-factory contract id
    #[arg(long, env = "TOKEN_FACTORY_CONTRACT_ID")]
    pub token_factory_contract_id: Option<String>,

    /// Loan-manager contract id
    #[arg(long, env = "LOAN_MANAGER_CONTRACT_ID")]
    pub loan_manager_contract_id: Option<String>,

    /// Record store location (sqlite: URL)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Milliseconds between scans
    #[arg(long, env = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<String>,

    /// Attempts for idempotent ledger reads
    #[arg(long, env = "MAX_RETRIES")]
    pub max_retries: Option<String>,

    /// Milliseconds between read attempts
    #[arg(long, env = "RETRY_DELAY_MS")]
    pub retry_delay_ms: Option<String>,

    /// Requests per scan
    #[arg(long, env = "BATCH_SIZE")]
    pub batch_size: Option<String>,

    /// Milliseconds between two requests of a scan
    #[arg(long, env = "RECORD_DELAY_MS")]
    pub record_delay_ms: Option<String>,

    /// Milliseconds to wait for a transaction receipt
    #[arg(long, env = "RECEIPT_TIMEOUT_MS")]
    pub receipt_timeout_ms: Option<String>,

    /// Milliseconds between receipt polls
    #[arg(long, env = "RECEIPT_POLL_MS")]
    pub receipt_poll_ms: Option<String>,

    /// Timeout of a single gateway request, in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<String>,

    /// Log filter, e.g. `info` or `cropmint_worker=debug`
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl WorkerArgs {
    pub fn raw_settings(&self) -> RawSettings {
        RawSettings {
            ledger_network: self.ledger_network.clone(),
            ledger_gateway_url: self.ledger_gateway_url.clone(),
            ledger_operator_id: self.ledger_operator_id.clone(),
            ledger_operator_key: self.ledger_operator_key.clone(),
            token_factory_contract_id: self.token_factory_contract_id.clone(),
            loan_manager_contract_id: self.loan_manager_contract_id.clone(),
            database_url: self.database_url.clone(),
            poll_interval_ms: self.poll_interval_ms.clone(),
            max_retries: self.max_retries.clone(),
            retry_delay_ms: self.retry_delay_ms.clone(),
            batch_size: self.batch_size.clone(),
            record_delay_ms: self.record_delay_ms.clone(),
            receipt_timeout_ms: self.receipt_timeout_ms.clone(),
            receipt_poll_ms: self.receipt_poll_ms.clone(),
            request_timeout_ms: self.request_timeout_ms.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cropmint_core::config::WorkerConfig;
    use cropmint_core::error::ConfigError;

    #[test]
    fn test_flags_map_to_settings() {
        let args = WorkerArgs::try_parse_from([
            "cropmint-worker",
            "--once",
            "--ledger-network",
            "testnet",
            "--ledger-gateway-url",
            "https://gateway.testnet.example",
            "--ledger-operator-id",
            "0.0.1001",
            "--ledger-operator-key",
            "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60",
            "--token-factory-contract-id",
            "0.0.5005",
            "--loan-manager-contract-id",
            "0.0.5006",
            "--database-url",
            "sqlite:/tmp/cropmint.db",
            "--batch-size",
            "3",
        ])
        .unwrap();

        assert!(args.once);
        let config = WorkerConfig::from_raw(&args.raw_settings()).unwrap();
        assert_eq!(config.scheduler.batch_size, 3);
        assert_eq!(config.ledger.token_factory.to_string(), "0.0.5005");
    }

    #[test]
    fn test_malformed_flag_is_reported_by_validation() {
        let args = WorkerArgs {
            batch_size: Some("lots".to_string()),
            ..Default::default()
        };

        match WorkerConfig::from_raw(&args.raw_settings()) {
            Err(ConfigError::Invalid(problems)) => {
                assert!(problems.iter().any(|p| p.key() == "BATCH_SIZE"));
                assert!(problems.iter().any(|p| p.key() == "DATABASE_URL"));
            }
            Ok(_) => panic!("configuration should be rejected"),
        }
    }
}
