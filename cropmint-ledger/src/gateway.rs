use crate::signer::OperatorSigner;
use crate::traits::{CollateralTokenClass, LedgerClient, TokenDetails};
use cropmint_core::config::{LedgerNetwork, LedgerSettings, RetryPolicy};
use cropmint_core::context::WorkerContext;
use cropmint_core::error::LedgerError;
use cropmint_core::id::{AccountId, ContractId, TokenId, TransactionId};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::time::Instant;

/// Gas ceiling for `createCropToken`
pub const CREATE_TOKEN_GAS: u64 = 1_000_000;
/// Gas ceiling for `mintTokens`
pub const MINT_GAS: u64 = 500_000;
/// Gas ceiling for read-only contract calls
pub const QUERY_GAS: u64 = 100_000;

/// Receipt statuses caused by the worker's own setup rather than by the record
const MISCONFIGURED_STATUSES: &[&str] = &[
    "INVALID_CONTRACT_ID",
    "INVALID_SIGNATURE",
    "INVALID_PAYER_SIGNATURE",
    "INVALID_ACCOUNT_ID",
    "PAYER_ACCOUNT_NOT_FOUND",
    "KEY_PREFIX_MISMATCH",
    "INVALID_TRANSACTION_ID",
    "INSUFFICIENT_PAYER_BALANCE",
];

/// JSON-RPC methods exposed by the ledger gateway
mod rpc {
    pub const SUBMIT_CONTRACT_CALL: &str = "ledger_submitContractCall";
    pub const GET_RECEIPT: &str = "ledger_getReceipt";
    pub const CALL_CONTRACT: &str = "ledger_callContract";

    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const INVALID_PARAMS: i64 = -32602;
}

/// Token-factory contract functions
mod contract {
    pub const CREATE_CROP_TOKEN: &str = "createCropToken";
    pub const MINT_TOKENS: &str = "mintTokens";
    pub const GET_TOKEN_DETAILS: &str = "getTokenDetails";
    pub const GET_FARMER_BALANCE: &str = "getFarmerBalance";
    pub const NEXT_TOKEN_ID: &str = "nextTokenId";
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenDetailsWire {
    owner: String,
    value: Value,
    crop_type: String,
    harvest_timestamp: i64,
    symbol: String,
}

/// Receipt state as reported by `ledger_getReceipt`
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReceiptStatus {
    Success,
    /// Known to the ledger, not yet final
    Pending,
    /// Never seen by the ledger
    NotFound,
    Failed(String),
}

impl ReceiptStatus {
    fn parse(status: &str) -> Self {
        match status {
            "SUCCESS" => ReceiptStatus::Success,
            "UNKNOWN" => ReceiptStatus::Pending,
            "RECEIPT_NOT_FOUND" => ReceiptStatus::NotFound,
            other => ReceiptStatus::Failed(other.to_string()),
        }
    }
}

/// Why a single gateway call failed, before it is mapped to a [`LedgerError`]
#[derive(Debug)]
enum CallError {
    /// Connection, timeout, 5xx or undecodable body; the call may or may not have reached the ledger
    Transport(String),
    /// The gateway refused the request at the HTTP level
    Refused(String),
    Rpc {
        method: &'static str,
        error: RpcErrorObject,
    },
}

impl CallError {
    fn ledger_status(&self) -> Option<&str> {
        match self {
            CallError::Rpc { error, .. } => error
                .data
                .as_ref()
                .and_then(|data| data.get("status"))
                .and_then(Value::as_str),
            _ => None,
        }
    }

    fn into_ledger_error(self, transaction_id: Option<&TransactionId>) -> LedgerError {
        if let Some(status) = self.ledger_status() {
            return classify_status(status, transaction_id);
        }

        match self {
            CallError::Transport(reason) => LedgerError::Unreachable(reason),
            CallError::Refused(reason) => LedgerError::Misconfigured(reason),
            CallError::Rpc { method, error } => match error.code {
                rpc::METHOD_NOT_FOUND => LedgerError::Misconfigured(format!(
                    "gateway does not implement {}: {}",
                    method, error.message
                )),
                rpc::PARSE_ERROR | rpc::INVALID_REQUEST | rpc::INVALID_PARAMS => {
                    LedgerError::Misconfigured(format!(
                        "gateway refused {} ({}): {}",
                        method, error.code, error.message
                    ))
                }
                code => LedgerError::Unreachable(format!(
                    "gateway error on {} ({}): {}",
                    method, code, error.message
                )),
            },
        }
    }
}

/// Map a non-success ledger status to the failure taxonomy.
///
/// Without a transaction id the status came from a read, which cannot be
/// rejected; a failed read means the contract state is not what was expected.
fn classify_status(status: &str, transaction_id: Option<&TransactionId>) -> LedgerError {
    if MISCONFIGURED_STATUSES.contains(&status) {
        return LedgerError::Misconfigured(format!("ledger returned {}", status));
    }

    match transaction_id {
        Some(transaction_id) => LedgerError::Rejected {
            transaction_id: transaction_id.clone(),
            status: status.to_string(),
        },
        None => LedgerError::Inconsistent(format!("contract call failed with {}", status)),
    }
}

fn parse_u64(value: &Value, what: &str) -> Result<u64, LedgerError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| LedgerError::Inconsistent(format!("unexpected {} value {}", what, value)))
}

/// Ledger client speaking JSON-RPC 2.0 to a ledger gateway.
///
/// One HTTP connection pool and one operator key are held for the lifetime of
/// the client. Writes are signed here and submitted exactly once; the client
/// then polls for a terminal receipt.
pub struct GatewayLedgerClient {
    http: Client,
    rt: Arc<Runtime>,
    gateway_url: String,
    network: LedgerNetwork,
    token_factory: ContractId,
    signer: OperatorSigner,
    receipt_timeout: Duration,
    receipt_poll_interval: Duration,
    retry: RetryPolicy,
    request_ids: AtomicU64,
}

impl GatewayLedgerClient {
    /// Build the client described by the worker configuration
    pub fn connect(ctx: &WorkerContext) -> Result<Self, LedgerError> {
        Self::new(&ctx.config().ledger, ctx.runtime())
    }

    pub fn new(settings: &LedgerSettings, rt: Arc<Runtime>) -> Result<Self, LedgerError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let http = Client::builder()
            .default_headers(headers)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| LedgerError::Misconfigured(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            rt,
            gateway_url: settings.gateway_url.clone(),
            network: settings.network,
            token_factory: settings.token_factory.clone(),
            signer: OperatorSigner::new(settings.operator_id.clone(), &settings.operator_key),
            receipt_timeout: settings.receipt_timeout,
            receipt_poll_interval: settings.receipt_poll_interval,
            retry: settings.retry,
            request_ids: AtomicU64::new(1),
        })
    }

    /// Account paying for and signing every write
    pub fn operator(&self) -> &AccountId {
        self.signer.account()
    }

    pub fn token_factory(&self) -> &ContractId {
        &self.token_factory
    }

    async fn call(&self, method: &'static str, params: &Value) -> Result<Value, CallError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.request_ids.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(&self.gateway_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| CallError::Transport(format!("{} request failed: {}", method, e)))?;

        let status = response.status();
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            return Err(CallError::Transport(format!(
                "{} returned HTTP {}",
                method, status
            )));
        }
        if status.is_client_error() {
            return Err(CallError::Refused(format!(
                "gateway rejected {} with HTTP {}",
                method, status
            )));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| CallError::Transport(format!("undecodable {} response: {}", method, e)))?;

        match body.error {
            Some(error) => Err(CallError::Rpc { method, error }),
            None => Ok(body.result),
        }
    }

    /// Run an idempotent read, retrying while the gateway is unreachable
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    log::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt,
                        attempts,
                        e,
                        self.retry.backoff
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn fetch_receipt(&self, transaction_id: &TransactionId) -> Result<ReceiptStatus, LedgerError> {
        let params = json!({ "transactionId": transaction_id.as_str() });
        match self.call(rpc::GET_RECEIPT, &params).await {
            Ok(result) => {
                let status = result.get("status").and_then(Value::as_str).ok_or_else(|| {
                    LedgerError::Unreachable(format!("receipt for {} has no status", transaction_id))
                })?;
                Ok(ReceiptStatus::parse(status))
            }
            Err(e) if e.ledger_status() == Some("RECEIPT_NOT_FOUND") => Ok(ReceiptStatus::NotFound),
            Err(e) => Err(e.into_ledger_error(Some(transaction_id))),
        }
    }

    /// Poll until the receipt is terminal or the receipt timeout elapses
    async fn wait_for_receipt(&self, transaction_id: &TransactionId) -> Result<(), LedgerError> {
        let deadline = Instant::now() + self.receipt_timeout;
        loop {
            let status = self
                .with_retry("receipt lookup", move || self.fetch_receipt(transaction_id))
                .await?;

            match status {
                ReceiptStatus::Success => {
                    log::info!("Transaction {} succeeded", transaction_id);
                    return Ok(());
                }
                ReceiptStatus::Failed(status) => {
                    log::warn!("Transaction {} failed with {}", transaction_id, status);
                    return Err(classify_status(&status, Some(transaction_id)));
                }
                ReceiptStatus::Pending | ReceiptStatus::NotFound => {
                    if Instant::now() >= deadline {
                        return Err(LedgerError::Unreachable(format!(
                            "no receipt for {} after {:?}",
                            transaction_id, self.receipt_timeout
                        )));
                    }
                    tokio::time::sleep(self.receipt_poll_interval).await;
                }
            }
        }
    }

    /// Sign, submit once and wait for the receipt of a token-factory call
    async fn submit(
        &self,
        function: &'static str,
        args: Value,
        gas: u64,
    ) -> Result<TransactionId, LedgerError> {
        let transaction_id = self.signer.next_transaction_id();
        let mut body = json!({
            "network": self.network.as_str(),
            "transactionId": transaction_id.as_str(),
            "contractId": self.token_factory.to_string(),
            "function": function,
            "args": args,
            "gas": gas,
            "memo": format!("cropmint:{}", function),
        });
        let signature = self.signer.sign(&body);
        if let Some(fields) = body.as_object_mut() {
            fields.insert("publicKey".to_string(), Value::String(self.signer.public_key_hex()));
            fields.insert("signature".to_string(), Value::String(signature));
        }

        log::info!(
            "Submitting {} to contract {} as {}",
            function,
            self.token_factory,
            transaction_id
        );

        match self.call(rpc::SUBMIT_CONTRACT_CALL, &body).await {
            Ok(_) => {}
            Err(CallError::Transport(reason)) => {
                return self.recover_lost_submission(&transaction_id, reason).await;
            }
            Err(e) => return Err(e.into_ledger_error(Some(&transaction_id))),
        }

        self.wait_for_receipt(&transaction_id).await?;
        Ok(transaction_id)
    }

    /// The submit response was lost; the transaction may still have executed.
    ///
    /// Looks the receipt up once. Only a success is accepted, since resubmitting
    /// could execute the call twice.
    async fn recover_lost_submission(
        &self,
        transaction_id: &TransactionId,
        reason: String,
    ) -> Result<TransactionId, LedgerError> {
        log::warn!(
            "Submission of {} failed in transport ({}); checking its receipt",
            transaction_id,
            reason
        );

        match self.fetch_receipt(transaction_id).await {
            Ok(ReceiptStatus::Success) => {
                log::info!(
                    "Transaction {} executed although its submission failed",
                    transaction_id
                );
                Ok(transaction_id.clone())
            }
            Ok(status) => {
                log::warn!("Transaction {} receipt is {:?}", transaction_id, status);
                Err(LedgerError::Unreachable(reason))
            }
            Err(e) => {
                log::warn!("Receipt lookup for {} failed: {}", transaction_id, e);
                Err(LedgerError::Unreachable(reason))
            }
        }
    }

    /// Read-only call against the token-factory contract
    async fn query(&self, function: &'static str, args: Value) -> Result<Value, LedgerError> {
        let params = json!({
            "contractId": self.token_factory.to_string(),
            "function": function,
            "args": args,
            "gas": QUERY_GAS,
        });
        let params = &params;

        self.with_retry(function, move || async move {
            self.call(rpc::CALL_CONTRACT, params)
                .await
                .map_err(|e| e.into_ledger_error(None))
        })
        .await
    }
}

impl LedgerClient for GatewayLedgerClient {
    fn create_collateral_token_class(
        &self,
        class: &CollateralTokenClass,
    ) -> Result<TransactionId, LedgerError> {
        let args = json!([
            class.owner.to_string(),
            class.value.to_string(),
            class.crop_type,
            class.harvest_timestamp,
            class.symbol,
        ]);
        self.rt
            .block_on(self.submit(contract::CREATE_CROP_TOKEN, args, CREATE_TOKEN_GAS))
    }

    fn issue_tokens(
        &self,
        token_id: TokenId,
        amount: u64,
        recipient: &AccountId,
    ) -> Result<TransactionId, LedgerError> {
        let args = json!([token_id.0.to_string(), amount.to_string(), recipient.to_string()]);
        self.rt.block_on(self.submit(contract::MINT_TOKENS, args, MINT_GAS))
    }

    fn query_token_details(&self, token_id: TokenId) -> Result<TokenDetails, LedgerError> {
        let result = self.rt.block_on(
            self.query(contract::GET_TOKEN_DETAILS, json!([token_id.0.to_string()])),
        )?;

        let wire: TokenDetailsWire = serde_json::from_value(result).map_err(|e| {
            LedgerError::Inconsistent(format!("unexpected details for token {}: {}", token_id, e))
        })?;

        Ok(TokenDetails {
            token_id,
            owner: wire.owner.parse().map_err(|e| {
                LedgerError::Inconsistent(format!("token {} has invalid owner: {}", token_id, e))
            })?,
            value: parse_u64(&wire.value, "token value")?,
            crop_type: wire.crop_type,
            harvest_timestamp: wire.harvest_timestamp,
            symbol: wire.symbol,
        })
    }

    fn query_account_balance(&self, account: &AccountId) -> Result<u64, LedgerError> {
        let result = self.rt.block_on(
            self.query(contract::GET_FARMER_BALANCE, json!([account.to_string()])),
        )?;
        parse_u64(&result, "balance")
    }

    fn query_next_token_id(&self) -> Result<u64, LedgerError> {
        let result = self.rt.block_on(self.query(contract::NEXT_TOKEN_ID, json!([])))?;
        parse_u64(&result, "nextTokenId")
    }
}

impl std::fmt::Debug for GatewayLedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayLedgerClient")
            .field("gateway_url", &self.gateway_url)
            .field("network", &self.network)
            .field("token_factory", &self.token_factory)
            .field("signer", &self.signer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{canonical_json, ED25519_PUBLIC_DER_PREFIX};
    use ed25519_dalek::{Signature, Verifier};
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    // Field order matters: the client and server are dropped before the server runtime
    struct Harness {
        client: GatewayLedgerClient,
        server: MockServer,
        server_rt: tokio::runtime::Runtime,
    }

    impl Harness {
        fn new() -> Self {
            let server_rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            let server = server_rt.block_on(MockServer::start());

            let settings = LedgerSettings {
                network: LedgerNetwork::Testnet,
                gateway_url: server.uri(),
                operator_id: "0.0.1001".parse().unwrap(),
                operator_key: SECRET.parse().unwrap(),
                token_factory: "0.0.5005".parse().unwrap(),
                loan_manager: "0.0.5006".parse().unwrap(),
                receipt_timeout: Duration::from_millis(200),
                receipt_poll_interval: Duration::from_millis(10),
                request_timeout: Duration::from_secs(2),
                retry: RetryPolicy {
                    max_attempts: 3,
                    backoff: Duration::from_millis(5),
                },
            };
            let client_rt = Arc::new(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap(),
            );
            let client = GatewayLedgerClient::new(&settings, client_rt).unwrap();

            Self {
                client,
                server,
                server_rt,
            }
        }

        fn mount(&self, rpc_method: &str, response: ResponseTemplate) {
            self.server_rt.block_on(
                Mock::given(method("POST"))
                    .and(body_partial_json(json!({ "method": rpc_method })))
                    .respond_with(response)
                    .mount(&self.server),
            );
        }

        /// Mounted responses are matched in registration order, so this one wins until used
        fn mount_once(&self, rpc_method: &str, response: ResponseTemplate) {
            self.server_rt.block_on(
                Mock::given(method("POST"))
                    .and(body_partial_json(json!({ "method": rpc_method })))
                    .respond_with(response)
                    .up_to_n_times(1)
                    .mount(&self.server),
            );
        }

        fn params_of(&self, rpc_method: &str) -> Vec<Value> {
            let requests = self
                .server_rt
                .block_on(self.server.received_requests())
                .unwrap_or_default();
            requests
                .iter()
                .filter_map(|r| r.body_json::<Value>().ok())
                .filter(|body| body["method"] == rpc_method)
                .map(|body| body["params"].clone())
                .collect()
        }
    }

    fn rpc_result(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
    }

    fn rpc_error(code: i64, message: &str, data: Option<Value>) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": code, "message": message, "data": data },
        }))
    }

    fn receipt(status: &str) -> ResponseTemplate {
        rpc_result(json!({ "status": status }))
    }

    fn class() -> CollateralTokenClass {
        CollateralTokenClass {
            owner: "0.0.789012".parse().unwrap(),
            value: 4000,
            crop_type: "cafe".to_string(),
            harvest_timestamp: 1_760_000_000,
            symbol: "CAFE4821".to_string(),
        }
    }

    #[test]
    fn test_create_submits_signed_call_and_waits_for_receipt() {
        let h = Harness::new();
        h.mount(rpc::SUBMIT_CONTRACT_CALL, rpc_result(json!({ "transactionId": "ignored" })));
        h.mount_once(rpc::GET_RECEIPT, receipt("UNKNOWN"));
        h.mount(rpc::GET_RECEIPT, receipt("SUCCESS"));

        let transaction_id = h.client.create_collateral_token_class(&class()).unwrap();
        assert!(transaction_id.as_str().starts_with("0.0.1001@"));

        let submits = h.params_of(rpc::SUBMIT_CONTRACT_CALL);
        assert_eq!(submits.len(), 1);
        let params = &submits[0];
        assert_eq!(params["function"], "createCropToken");
        assert_eq!(params["gas"], CREATE_TOKEN_GAS);
        assert_eq!(params["contractId"], "0.0.5005");
        assert_eq!(params["network"], "testnet");
        assert_eq!(params["transactionId"], transaction_id.as_str());
        assert_eq!(
            params["args"],
            json!(["0.0.789012", "4000", "cafe", 1_760_000_000, "CAFE4821"])
        );

        // The signature covers every field except the key and signature themselves
        let public_key = params["publicKey"].as_str().unwrap();
        assert!(public_key.starts_with(ED25519_PUBLIC_DER_PREFIX));
        let signature = hex::decode(params["signature"].as_str().unwrap()).unwrap();
        let signature = Signature::from_slice(&signature).unwrap();
        let mut unsigned = params.clone();
        let fields = unsigned.as_object_mut().unwrap();
        fields.remove("publicKey");
        fields.remove("signature");
        let digest = Sha256::digest(canonical_json(&unsigned).as_bytes());
        let signer = OperatorSigner::new("0.0.1001".parse().unwrap(), &SECRET.parse().unwrap());
        assert!(signer.verifying_key().verify(&digest, &signature).is_ok());

        assert_eq!(h.params_of(rpc::GET_RECEIPT).len(), 2);
    }

    #[test]
    fn test_mint_uses_mint_gas_and_exact_amount() {
        let h = Harness::new();
        h.mount(rpc::SUBMIT_CONTRACT_CALL, rpc_result(json!({})));
        h.mount(rpc::GET_RECEIPT, receipt("SUCCESS"));

        let recipient: AccountId = "0.0.789012".parse().unwrap();
        h.client
            .issue_tokens(TokenId(7), 18_446_744_073_709_551_615, &recipient)
            .unwrap();

        let params = &h.params_of(rpc::SUBMIT_CONTRACT_CALL)[0];
        assert_eq!(params["function"], "mintTokens");
        assert_eq!(params["gas"], MINT_GAS);
        assert_eq!(
            params["args"],
            json!(["7", "18446744073709551615", "0.0.789012"])
        );
    }

    #[test]
    fn test_failed_receipt_is_rejected_with_transaction_id() {
        let h = Harness::new();
        h.mount(rpc::SUBMIT_CONTRACT_CALL, rpc_result(json!({})));
        h.mount(rpc::GET_RECEIPT, receipt("CONTRACT_REVERT_EXECUTED"));

        match h.client.create_collateral_token_class(&class()) {
            Err(LedgerError::Rejected {
                transaction_id,
                status,
            }) => {
                assert_eq!(status, "CONTRACT_REVERT_EXECUTED");
                assert_eq!(
                    h.params_of(rpc::SUBMIT_CONTRACT_CALL)[0]["transactionId"],
                    transaction_id.as_str()
                );
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_signature_status_is_misconfiguration() {
        let h = Harness::new();
        h.mount(rpc::SUBMIT_CONTRACT_CALL, rpc_result(json!({})));
        h.mount(rpc::GET_RECEIPT, receipt("INVALID_SIGNATURE"));

        let err = h.client.create_collateral_token_class(&class()).unwrap_err();
        assert!(err.halts_worker(), "{:?}", err);
    }

    #[test]
    fn test_underfunded_operator_is_misconfiguration() {
        let h = Harness::new();
        h.mount(rpc::SUBMIT_CONTRACT_CALL, rpc_result(json!({})));
        h.mount(rpc::GET_RECEIPT, receipt("INSUFFICIENT_PAYER_BALANCE"));

        let err = h
            .client
            .issue_tokens(TokenId(3), 4000, &"0.0.789012".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Misconfigured(_)), "{:?}", err);
        assert!(err.halts_worker());
    }

    #[test]
    fn test_submit_error_with_status_is_classified_without_receipt_lookup() {
        let h = Harness::new();
        h.mount(
            rpc::SUBMIT_CONTRACT_CALL,
            rpc_error(-32000, "precheck failed", Some(json!({ "status": "INVALID_CONTRACT_ID" }))),
        );

        let err = h.client.create_collateral_token_class(&class()).unwrap_err();
        assert!(matches!(err, LedgerError::Misconfigured(_)));
        assert!(h.params_of(rpc::GET_RECEIPT).is_empty());
    }

    #[test]
    fn test_lost_submission_is_accepted_when_receipt_succeeded() {
        let h = Harness::new();
        h.mount(rpc::SUBMIT_CONTRACT_CALL, ResponseTemplate::new(503));
        h.mount(rpc::GET_RECEIPT, receipt("SUCCESS"));

        let transaction_id = h.client.create_collateral_token_class(&class()).unwrap();

        let submits = h.params_of(rpc::SUBMIT_CONTRACT_CALL);
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0]["transactionId"], transaction_id.as_str());
        assert_eq!(h.params_of(rpc::GET_RECEIPT).len(), 1);
    }

    #[test]
    fn test_lost_submission_is_never_resubmitted() {
        let h = Harness::new();
        h.mount(rpc::SUBMIT_CONTRACT_CALL, ResponseTemplate::new(503));
        h.mount(
            rpc::GET_RECEIPT,
            rpc_error(-32000, "not found", Some(json!({ "status": "RECEIPT_NOT_FOUND" }))),
        );

        let err = h.client.create_collateral_token_class(&class()).unwrap_err();
        assert!(matches!(err, LedgerError::Unreachable(ref reason) if reason.contains("503")));
        assert_eq!(h.params_of(rpc::SUBMIT_CONTRACT_CALL).len(), 1);
        assert_eq!(h.params_of(rpc::GET_RECEIPT).len(), 1);
    }

    #[test]
    fn test_pending_receipt_times_out_as_unreachable() {
        let h = Harness::new();
        h.mount(rpc::SUBMIT_CONTRACT_CALL, rpc_result(json!({})));
        h.mount(rpc::GET_RECEIPT, receipt("UNKNOWN"));

        let started = std::time::Instant::now();
        let err = h.client.create_collateral_token_class(&class()).unwrap_err();
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(h.params_of(rpc::GET_RECEIPT).len() > 1);
    }

    #[test]
    fn test_queries_retry_while_unreachable() {
        let h = Harness::new();
        h.mount_once(rpc::CALL_CONTRACT, ResponseTemplate::new(502));
        h.mount_once(rpc::CALL_CONTRACT, ResponseTemplate::new(502));
        h.mount(rpc::CALL_CONTRACT, rpc_result(json!("8")));

        assert_eq!(h.client.query_next_token_id().unwrap(), 8);

        let calls = h.params_of(rpc::CALL_CONTRACT);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0]["function"], "nextTokenId");
        assert_eq!(calls[0]["gas"], QUERY_GAS);
    }

    #[test]
    fn test_queries_give_up_after_max_attempts() {
        let h = Harness::new();
        h.mount(rpc::CALL_CONTRACT, ResponseTemplate::new(503));

        let err = h.client.query_next_token_id().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.params_of(rpc::CALL_CONTRACT).len(), 3);
    }

    #[test]
    fn test_missing_method_fails_probe_as_misconfigured() {
        let h = Harness::new();
        h.mount(rpc::CALL_CONTRACT, rpc_error(-32601, "Method not found", None));

        let err = h.client.probe().unwrap_err();
        assert!(err.halts_worker());
        assert_eq!(h.params_of(rpc::CALL_CONTRACT).len(), 1);
    }

    #[test]
    fn test_token_details_and_balance_are_decoded() {
        let h = Harness::new();
        h.mount(
            rpc::CALL_CONTRACT,
            rpc_result(json!({
                "owner": "0.0.789012",
                "value": "4000",
                "cropType": "cafe",
                "harvestTimestamp": 1_760_000_000,
                "symbol": "CAFE4821",
            })),
        );

        let details = h.client.query_token_details(TokenId(3)).unwrap();
        assert_eq!(details.token_id, TokenId(3));
        assert_eq!(details.value, 4000);
        assert!(details.matches(&class()));
        assert_eq!(h.params_of(rpc::CALL_CONTRACT)[0]["args"], json!(["3"]));

        // A details object is not a balance
        let err = h
            .client
            .query_account_balance(&"0.0.789012".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, LedgerError::Inconsistent(_)));
    }

    #[test]
    fn test_balance_asks_for_farmer_balance_by_address() {
        let h = Harness::new();
        h.mount(rpc::CALL_CONTRACT, rpc_result(json!("4000")));

        let balance = h
            .client
            .query_account_balance(&"0.0.789012".parse().unwrap())
            .unwrap();

        assert_eq!(balance, 4000);
        let params = h.params_of(rpc::CALL_CONTRACT);
        assert_eq!(params[0]["function"], "getFarmerBalance");
        assert_eq!(params[0]["args"], json!(["0.0.789012"]));
        assert_eq!(params[0]["gas"], QUERY_GAS);
    }
}
