pub mod subscription;
pub mod trace;
pub mod wire;

use alloy::primitives::U256;
use bigdecimal::BigDecimal;
use governor::{Quota, RateLimiter};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::importer::{BlockParams, InternalTransactionParams, LogParams, TransactionParams, UncleRelationParams};
use crate::sequence::BlockRange;
use wire::{encode_quantity, parse_quantity, u256_decimal, ReceiptData, WireBlock, WireReceipt};

/// Retry delays for RPC calls (in seconds)
const RPC_RETRY_DELAYS: &[u64] = &[2, 5, 10, 20, 30];
const RPC_MAX_RETRIES: usize = 5;

const SELECTOR_BALANCE_OF: &str = "0x70a08231";
const SELECTOR_NAME: &str = "0x06fdde03";
const SELECTOR_SYMBOL: &str = "0x95d89b41";
const SELECTOR_DECIMALS: &str = "0x313ce567";
const SELECTOR_TOTAL_SUPPLY: &str = "0x18160ddd";

type SharedRateLimiter = Arc<
    RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>,
>;

/// How an RPC call failed. Only `Transport` and `RateLimited` are retried
/// inside the client; everything else surfaces to the caller.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rate limited by node")]
    RateLimited,

    #[error("decode failure: {0}")]
    Decode(String),

    #[error("node rejected request (code {code}): {message}")]
    NodeRejected { code: i64, message: String },

    #[error("unclassified RPC failure: {0}")]
    Unknown(String),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::RateLimited)
    }

    /// A rejection precise enough that retrying the same entry is useless.
    pub fn is_classified_reject(&self) -> bool {
        match self {
            RpcError::NodeRejected { message, .. } => {
                let message = message.to_ascii_lowercase();
                ["invalid", "not found", "does not exist", "unsupported", "reverted", "execution error"]
                    .iter()
                    .any(|pattern| message.contains(pattern))
            }
            _ => false,
        }
    }
}

/// Per-method endpoint routing: every method goes to `default_url` unless
/// the operator pinned it elsewhere (tracing often runs on a separate
/// archive node).
#[derive(Debug, Clone)]
pub struct RpcEndpoints {
    pub default_url: String,
    pub overrides: HashMap<String, String>,
}

impl RpcEndpoints {
    pub fn new(default_url: String) -> Self {
        Self {
            default_url,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, method: &str, url: String) -> Self {
        self.overrides.insert(method.to_string(), url);
        self
    }

    fn url_for(&self, method: &str) -> &str {
        self.overrides
            .get(method)
            .map(String::as_str)
            .unwrap_or(&self.default_url)
    }
}

// ---------------------------------------------------------------------------
// Request/response shapes for the typed operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStatus {
    More,
    EndOfChain,
}

pub struct RangeBlocks {
    pub blocks: Vec<BlockParams>,
    pub transactions: Vec<TransactionParams>,
    pub uncle_relations: Vec<UncleRelationParams>,
    pub next: NextStatus,
}

#[derive(Debug, Clone)]
pub struct ReceiptRequest {
    pub hash: String,
    pub block_number: i64,
    pub gas: Option<BigDecimal>,
}

#[derive(Debug)]
pub struct ReceiptBatch {
    pub receipts: Vec<ReceiptData>,
    pub logs: Vec<LogParams>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceRequest {
    pub address_hash: String,
    pub block_number: i64,
}

#[derive(Debug, Clone)]
pub struct FetchedBalance {
    pub address_hash: String,
    pub block_number: i64,
    pub value: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRequest {
    pub transaction_hash: String,
    pub block_number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBalanceRequest {
    pub address_hash: String,
    pub token_contract_address_hash: String,
    pub block_number: i64,
}

#[derive(Debug, Clone)]
pub struct FetchedTokenBalance {
    pub address_hash: String,
    pub token_contract_address_hash: String,
    pub block_number: i64,
    pub value: BigDecimal,
}

#[derive(Debug, Clone)]
pub struct TokenMetadata {
    pub contract_address_hash: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<i16>,
    pub total_supply: Option<BigDecimal>,
}

/// Outcome of a batched fetch where individual entries can fail without
/// sinking the batch: `dropped` entries hit a classified node rejection
/// and should be logged and abandoned, `retry` entries are worth another
/// round.
pub struct PartialResults<T, P> {
    pub fetched: Vec<T>,
    pub dropped: Vec<(P, RpcError)>,
    pub retry: Vec<(P, RpcError)>,
}

impl<T, P> Default for PartialResults<T, P> {
    fn default() -> Self {
        Self {
            fetched: Vec::new(),
            dropped: Vec::new(),
            retry: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct EthClient {
    client: reqwest::Client,
    endpoints: RpcEndpoints,
    limiter: SharedRateLimiter,
    max_batch_size: usize,
}

impl EthClient {
    pub fn new(
        endpoints: RpcEndpoints,
        requests_per_second: u32,
        timeout: Duration,
        max_batch_size: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");
        let rps = NonZeroU32::new(requests_per_second)
            .unwrap_or_else(|| NonZeroU32::new(100).expect("nonzero"));
        Self {
            client,
            endpoints,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Current chain tip via eth_blockNumber.
    pub async fn fetch_block_number(&self) -> Result<u64, RpcError> {
        let mut results = self.execute_batch("eth_blockNumber", vec![json!([])]).await?;
        let value = results.remove(0)?;
        let raw = value
            .as_str()
            .ok_or_else(|| RpcError::Decode("eth_blockNumber did not return a quantity".into()))?;
        parse_quantity(raw).map_err(RpcError::Decode)
    }

    /// Block number behind a tag ("earliest", "latest", "pending").
    pub async fn fetch_block_number_by_tag(&self, tag: &str) -> Result<u64, RpcError> {
        let mut results = self
            .execute_batch("eth_getBlockByNumber", vec![json!([tag, false])])
            .await?;
        let value = results.remove(0)?;
        if value.is_null() {
            return Err(RpcError::Unknown(format!("no block for tag {tag}")));
        }
        let raw = value
            .get("number")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::Decode("block without a number".into()))?;
        parse_quantity(raw).map_err(RpcError::Decode)
    }

    /// Fetch full blocks (with transactions) over a range. A null block
    /// means the walk ran past the tip; the caller caps its sequence.
    pub async fn fetch_blocks_by_range(&self, range: BlockRange) -> Result<RangeBlocks, RpcError> {
        let numbers: Vec<u64> = range.numbers().collect();
        let params: Vec<Value> = numbers
            .iter()
            .map(|n| json!([encode_quantity(*n), true]))
            .collect();
        let results = self.execute_batch("eth_getBlockByNumber", params).await?;

        let mut out = RangeBlocks {
            blocks: Vec::with_capacity(numbers.len()),
            transactions: Vec::new(),
            uncle_relations: Vec::new(),
            next: NextStatus::More,
        };

        for (number, result) in numbers.iter().zip(results) {
            let value = result?;
            if value.is_null() {
                out.next = NextStatus::EndOfChain;
                break;
            }
            let block: WireBlock = serde_json::from_value(value)
                .map_err(|e| RpcError::Decode(format!("block {number}: {e}")))?;
            for (position, tx) in block.transactions.iter().enumerate() {
                out.transactions.push(tx.to_params(&block, position));
            }
            out.uncle_relations.extend(block.uncle_relations());
            out.blocks.push(block.to_params(true));
        }

        Ok(out)
    }

    /// Fetch receipts (and their logs) for collated transactions. The
    /// first failing entry sinks the whole call so the caller can requeue
    /// its range; a null receipt means the node has not mined the
    /// transaction yet and is surfaced as a retryable transport error.
    pub async fn fetch_transaction_receipts(
        &self,
        requests: &[ReceiptRequest],
    ) -> Result<ReceiptBatch, RpcError> {
        if requests.is_empty() {
            return Ok(ReceiptBatch {
                receipts: Vec::new(),
                logs: Vec::new(),
            });
        }

        let params: Vec<Value> = requests.iter().map(|r| json!([r.hash])).collect();
        let results = self
            .execute_batch("eth_getTransactionReceipt", params)
            .await?;

        let mut batch = ReceiptBatch {
            receipts: Vec::with_capacity(requests.len()),
            logs: Vec::new(),
        };
        for (request, result) in requests.iter().zip(results) {
            let value = result?;
            if value.is_null() {
                return Err(RpcError::Transport(format!(
                    "receipt for {} not available yet",
                    request.hash
                )));
            }
            let receipt: WireReceipt = serde_json::from_value(value)
                .map_err(|e| RpcError::Decode(format!("receipt {}: {e}", request.hash)))?;
            let data = receipt
                .to_data(request.gas.as_ref())
                .map_err(RpcError::Decode)?;
            batch
                .logs
                .extend(receipt.logs_params(&request.hash, Some(request.block_number)));
            batch.receipts.push(data);
        }
        Ok(batch)
    }

    /// eth_getBalance for a batch of (address, block) pairs.
    pub async fn fetch_balances(
        &self,
        requests: &[BalanceRequest],
    ) -> Result<PartialResults<FetchedBalance, BalanceRequest>, RpcError> {
        let params: Vec<Value> = requests
            .iter()
            .map(|r| json!([r.address_hash, encode_quantity(r.block_number as u64)]))
            .collect();
        let results = self.execute_batch("eth_getBalance", params).await?;

        let mut out = PartialResults::default();
        for (request, result) in requests.iter().zip(results) {
            match result.and_then(|value| decode_quantity_value(&value)) {
                Ok(value) => out.fetched.push(FetchedBalance {
                    address_hash: request.address_hash.clone(),
                    block_number: request.block_number,
                    value: u256_decimal(&value),
                }),
                Err(error) if error.is_classified_reject() => {
                    out.dropped.push((request.clone(), error))
                }
                Err(error) => out.retry.push((request.clone(), error)),
            }
        }
        Ok(out)
    }

    /// Replay traces for a batch of transactions through the chain's
    /// tracer endpoint.
    pub async fn fetch_internal_transactions(
        &self,
        requests: &[TraceRequest],
    ) -> Result<PartialResults<InternalTransactionParams, TraceRequest>, RpcError> {
        let params: Vec<Value> = requests
            .iter()
            .map(|r| json!([r.transaction_hash, ["trace"]]))
            .collect();
        let results = self.execute_batch("trace_replayTransaction", params).await?;

        let mut out = PartialResults::default();
        for (request, result) in requests.iter().zip(results) {
            let decoded = result.and_then(|value| {
                serde_json::from_value::<trace::WireTraceResult>(value)
                    .map_err(|e| RpcError::Decode(format!("trace {}: {e}", request.transaction_hash)))
            });
            match decoded {
                Ok(replay) => {
                    match trace::to_params(
                        &request.transaction_hash,
                        request.block_number,
                        &replay.trace,
                    ) {
                        Ok(params) => out.fetched.extend(params),
                        Err(message) => out
                            .retry
                            .push((request.clone(), RpcError::Decode(message))),
                    }
                }
                Err(error) if error.is_classified_reject() => {
                    out.dropped.push((request.clone(), error))
                }
                Err(error) => out.retry.push((request.clone(), error)),
            }
        }
        Ok(out)
    }

    /// balanceOf(address) via eth_call at a block height.
    pub async fn fetch_token_balances(
        &self,
        requests: &[TokenBalanceRequest],
    ) -> Result<PartialResults<FetchedTokenBalance, TokenBalanceRequest>, RpcError> {
        let params: Vec<Value> = requests
            .iter()
            .map(|r| {
                let data = format!(
                    "{}000000000000000000000000{}",
                    SELECTOR_BALANCE_OF,
                    r.address_hash.trim_start_matches("0x")
                );
                json!([
                    { "to": r.token_contract_address_hash, "data": data },
                    encode_quantity(r.block_number as u64)
                ])
            })
            .collect();
        let results = self.execute_batch("eth_call", params).await?;

        let mut out = PartialResults::default();
        for (request, result) in requests.iter().zip(results) {
            let decoded = result.and_then(|value| {
                let bytes = decode_hex_value(&value)?;
                wire::decode_abi_uint(&bytes).ok_or_else(|| {
                    RpcError::NodeRejected {
                        code: 0,
                        message: format!(
                            "invalid balanceOf return from {}",
                            request.token_contract_address_hash
                        ),
                    }
                })
            });
            match decoded {
                Ok(value) => out.fetched.push(FetchedTokenBalance {
                    address_hash: request.address_hash.clone(),
                    token_contract_address_hash: request.token_contract_address_hash.clone(),
                    block_number: request.block_number,
                    value: u256_decimal(&value),
                }),
                Err(error) if error.is_classified_reject() => {
                    out.dropped.push((request.clone(), error))
                }
                Err(error) => out.retry.push((request.clone(), error)),
            }
        }
        Ok(out)
    }

    /// Read name/symbol/decimals/totalSupply for token contracts. Tokens
    /// are allowed to implement any subset; absent reads stay None.
    pub async fn fetch_token_metadata(
        &self,
        contracts: &[String],
    ) -> Result<Vec<TokenMetadata>, RpcError> {
        let selectors = [
            SELECTOR_NAME,
            SELECTOR_SYMBOL,
            SELECTOR_DECIMALS,
            SELECTOR_TOTAL_SUPPLY,
        ];
        let params: Vec<Value> = contracts
            .iter()
            .flat_map(|contract| {
                selectors
                    .iter()
                    .map(|selector| json!([{ "to": contract, "data": selector }, "latest"]))
                    .collect::<Vec<_>>()
            })
            .collect();
        let results = self.execute_batch("eth_call", params).await?;

        let mut out = Vec::with_capacity(contracts.len());
        for (i, contract) in contracts.iter().enumerate() {
            let read = |offset: usize| -> Option<Vec<u8>> {
                results
                    .get(i * selectors.len() + offset)
                    .and_then(|r| r.as_ref().ok())
                    .and_then(|value| decode_hex_value(value).ok())
            };
            out.push(TokenMetadata {
                contract_address_hash: contract.clone(),
                name: read(0).as_deref().and_then(wire::decode_abi_string),
                symbol: read(1).as_deref().and_then(wire::decode_abi_string),
                decimals: read(2)
                    .as_deref()
                    .and_then(wire::decode_abi_uint)
                    .and_then(|d| i16::try_from(d).ok()),
                total_supply: read(3)
                    .as_deref()
                    .and_then(wire::decode_abi_uint)
                    .map(|t| u256_decimal(&t)),
            });
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Batch plumbing
    // -----------------------------------------------------------------------

    /// Issue one JSON-RPC method over a list of param sets, splitting into
    /// `max_batch_size` HTTP batches. Per-entry results come back in
    /// request order; whole-batch failures are retried here when they are
    /// transport-shaped.
    async fn execute_batch(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let mut results = Vec::with_capacity(params.len());
        for chunk in params.chunks(self.max_batch_size) {
            results.extend(self.execute_chunk(method, chunk).await?);
        }
        Ok(results)
    }

    async fn execute_chunk(
        &self,
        method: &str,
        params: &[Value],
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        for _ in 0..params.len() {
            self.limiter.until_ready().await;
        }

        let batch_request: Vec<Value> = params
            .iter()
            .enumerate()
            .map(|(id, p)| {
                json!({
                    "jsonrpc": "2.0",
                    "method": method,
                    "params": p,
                    "id": id
                })
            })
            .collect();
        let url = self.endpoints.url_for(method);

        let mut last_error = RpcError::Unknown("no attempt made".into());
        for attempt in 0..RPC_MAX_RETRIES {
            if attempt > 0 {
                let delay = RPC_RETRY_DELAYS
                    .get(attempt - 1)
                    .copied()
                    .unwrap_or(*RPC_RETRY_DELAYS.last().unwrap_or(&30));
                tracing::warn!(
                    "{} batch failed (attempt {}/{}): {}. Retrying in {}s...",
                    method,
                    attempt,
                    RPC_MAX_RETRIES,
                    last_error,
                    delay
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }

            let response = match self.client.post(url).json(&batch_request).send().await {
                Ok(response) => response,
                Err(e) => {
                    last_error = RpcError::Transport(format!("HTTP request failed: {e}"));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                last_error = RpcError::RateLimited;
                continue;
            }
            if status.is_server_error() {
                last_error = RpcError::Transport(format!("node returned {status}"));
                continue;
            }
            if !status.is_success() {
                return Err(RpcError::Unknown(format!("node returned {status}")));
            }

            match response.json::<Vec<Value>>().await {
                Ok(entries) => return Ok(match_responses(params.len(), entries)),
                Err(e) => {
                    last_error = RpcError::Decode(format!("failed to parse batch response: {e}"));
                    continue;
                }
            }
        }

        Err(last_error)
    }
}

/// Match response entries back to request ids; responses may arrive in
/// any order.
fn match_responses(count: usize, entries: Vec<Value>) -> Vec<Result<Value, RpcError>> {
    let mut by_id: BTreeMap<u64, Value> = BTreeMap::new();
    for entry in entries {
        if let Some(id) = entry.get("id").and_then(Value::as_u64) {
            by_id.insert(id, entry);
        }
    }

    (0..count as u64)
        .map(|id| match by_id.remove(&id) {
            None => Err(RpcError::Decode(format!("missing response for request {id}"))),
            Some(entry) => classify_entry(entry),
        })
        .collect()
}

fn classify_entry(entry: Value) -> Result<Value, RpcError> {
    if let Some(error) = entry.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if code == 429 || message.to_ascii_lowercase().contains("rate limit") {
            return Err(RpcError::RateLimited);
        }
        return Err(RpcError::NodeRejected { code, message });
    }
    match entry.get("result") {
        Some(result) => Ok(result.clone()),
        None => Err(RpcError::Decode("response without result".into())),
    }
}

fn decode_quantity_value(value: &Value) -> Result<U256, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RpcError::Decode("expected a hex quantity".into()))?;
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Decode(format!("quantity missing 0x prefix: {raw}")))?;
    U256::from_str_radix(digits, 16)
        .map_err(|e| RpcError::Decode(format!("bad quantity {raw}: {e}")))
}

fn decode_hex_value(value: &Value) -> Result<Vec<u8>, RpcError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RpcError::Decode("expected hex data".into()))?;
    hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| RpcError::Decode(format!("bad hex data: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> EthClient {
        EthClient::new(
            RpcEndpoints::new(server.uri()),
            10_000,
            Duration::from_secs(5),
            50,
        )
    }

    #[tokio::test]
    async fn fetch_block_number_decodes_the_tip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "jsonrpc": "2.0", "id": 0, "result": "0x10" }
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.fetch_block_number().await.unwrap(), 16);
    }

    #[tokio::test]
    async fn per_method_routing_sends_traces_elsewhere() {
        let default_server = MockServer::start().await;
        let trace_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "jsonrpc": "2.0", "id": 0, "result": { "trace": [] } }
            ])))
            .expect(1)
            .mount(&trace_server)
            .await;

        let endpoints = RpcEndpoints::new(default_server.uri())
            .with_override("trace_replayTransaction", trace_server.uri());
        let client = EthClient::new(endpoints, 10_000, Duration::from_secs(5), 50);

        let requests = vec![TraceRequest {
            transaction_hash: format!("0x{:0>64}", "1"),
            block_number: 5,
        }];
        let results = client.fetch_internal_transactions(&requests).await.unwrap();
        assert!(results.fetched.is_empty());
        assert!(results.retry.is_empty());
    }

    #[tokio::test]
    async fn node_rejections_are_split_from_retryable_entries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "jsonrpc": "2.0", "id": 0, "result": "0x64" },
                { "jsonrpc": "2.0", "id": 1, "error": { "code": -32602, "message": "invalid argument 0: hex string" } },
                { "jsonrpc": "2.0", "id": 2, "error": { "code": -32000, "message": "missing trie node" } }
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let requests: Vec<BalanceRequest> = (0..3)
            .map(|i| BalanceRequest {
                address_hash: format!("0x{i:0>40}"),
                block_number: 7,
            })
            .collect();
        let results = client.fetch_balances(&requests).await.unwrap();

        assert_eq!(results.fetched.len(), 1);
        assert_eq!(results.fetched[0].value, BigDecimal::from(100));
        assert_eq!(results.dropped.len(), 1);
        assert_eq!(results.dropped[0].0, requests[1]);
        assert_eq!(results.retry.len(), 1);
        assert_eq!(results.retry[0].0, requests[2]);
    }

    #[tokio::test]
    async fn null_block_caps_the_range() {
        let server = MockServer::start().await;
        let block = serde_json::json!({
            "hash": format!("0x{:0>64}", "aa"),
            "number": "0x5",
            "parentHash": format!("0x{:0>64}", "a9"),
            "miner": format!("0x{:0>40}", "1"),
            "timestamp": "0x5b8d80",
            "gasUsed": "0x0",
            "gasLimit": "0x7a1200",
            "transactions": [],
            "uncles": []
        });
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "jsonrpc": "2.0", "id": 0, "result": block },
                { "jsonrpc": "2.0", "id": 1, "result": null }
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let range = client
            .fetch_blocks_by_range(BlockRange::new(5, 6))
            .await
            .unwrap();
        assert_eq!(range.blocks.len(), 1);
        assert_eq!(range.blocks[0].number, 5);
        assert_eq!(range.next, NextStatus::EndOfChain);
    }

    #[tokio::test]
    async fn missing_receipt_is_a_retryable_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "jsonrpc": "2.0", "id": 0, "result": null }
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let requests = vec![ReceiptRequest {
            hash: format!("0x{:0>64}", "2"),
            block_number: 9,
            gas: Some(BigDecimal::from(21_000)),
        }];
        let error = client
            .fetch_transaction_receipts(&requests)
            .await
            .unwrap_err();
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn token_metadata_reads_are_lenient() {
        let server = MockServer::start().await;
        // ABI-encoded string "USDC"
        let name_hex = format!(
            "0x{}{}{}",
            format!("{:0>64}", "20"),
            format!("{:0>64}", "4"),
            format!("{:0<64}", hex::encode("USDC"))
        );
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "jsonrpc": "2.0", "id": 0, "result": name_hex },
                { "jsonrpc": "2.0", "id": 1, "error": { "code": -32000, "message": "execution reverted" } },
                { "jsonrpc": "2.0", "id": 2, "result": format!("0x{:0>64}", "6") },
                { "jsonrpc": "2.0", "id": 3, "result": "0x" }
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let metadata = client
            .fetch_token_metadata(&[format!("0x{:0>40}", "9")])
            .await
            .unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].name.as_deref(), Some("USDC"));
        assert_eq!(metadata[0].symbol, None);
        assert_eq!(metadata[0].decimals, Some(6));
        assert_eq!(metadata[0].total_supply, None);
    }
}
