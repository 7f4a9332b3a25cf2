mod addresses;
mod block_second_degree_relations;
mod blocks;
mod coin_balances;
mod current_token_balances;
mod internal_transactions;
mod logs;
mod token_balances;
mod token_transfers;
mod tokens;
mod transaction_forks;
mod transactions;

pub use tokens::TokensConflict;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use ember_common::{CallType, InternalTransactionType, TxStatus};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::events::{BroadcastType, EventBus};

// ---------------------------------------------------------------------------
// Import params, one struct per entity. Hashes are lowercase 0x-hex strings;
// 256-bit quantities are BigDecimal so they bind straight onto numeric
// columns.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BlockParams {
    pub hash: String,
    pub number: i64,
    pub parent_hash: String,
    pub miner_hash: String,
    pub timestamp: i64,
    pub difficulty: Option<BigDecimal>,
    pub total_difficulty: Option<BigDecimal>,
    pub gas_used: i64,
    pub gas_limit: i64,
    pub size: Option<i64>,
    pub nonce: Option<String>,
    pub consensus: bool,
    /// Stamped by the internal-transactions runner once every collated
    /// transaction of the block has its traces; fetched blocks arrive
    /// with it unset, so a replaced block queues its traces for refetch.
    pub internal_transactions_indexed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct TransactionParams {
    pub hash: String,
    pub nonce: i64,
    pub from_address_hash: String,
    pub to_address_hash: Option<String>,
    pub value: BigDecimal,
    pub gas: BigDecimal,
    pub gas_price: BigDecimal,
    pub input: Vec<u8>,
    pub v: Option<BigDecimal>,
    pub r: Option<BigDecimal>,
    pub s: Option<BigDecimal>,
    pub block_hash: Option<String>,
    pub block_number: Option<i64>,
    pub index: Option<i32>,
    pub cumulative_gas_used: Option<BigDecimal>,
    pub gas_used: Option<BigDecimal>,
    pub status: Option<TxStatus>,
    pub error: Option<String>,
    pub created_contract_address_hash: Option<String>,
}

impl TransactionParams {
    pub fn is_collated(&self) -> bool {
        self.block_hash.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct LogParams {
    pub transaction_hash: String,
    pub index: i32,
    pub address_hash: String,
    pub data: Vec<u8>,
    pub first_topic: Option<String>,
    pub second_topic: Option<String>,
    pub third_topic: Option<String>,
    pub fourth_topic: Option<String>,
    pub block_number: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct InternalTransactionParams {
    pub transaction_hash: String,
    pub index: i32,
    pub kind: InternalTransactionType,
    pub call_type: Option<CallType>,
    pub from_address_hash: String,
    pub to_address_hash: Option<String>,
    pub created_contract_address_hash: Option<String>,
    pub value: BigDecimal,
    pub gas: Option<BigDecimal>,
    pub gas_used: Option<BigDecimal>,
    pub input: Option<Vec<u8>>,
    pub init: Option<Vec<u8>>,
    pub output: Option<Vec<u8>>,
    pub created_contract_code: Option<Vec<u8>>,
    pub trace_address: Vec<i32>,
    pub error: Option<String>,
    pub block_number: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AddressParams {
    pub hash: String,
    pub contract_code: Option<Vec<u8>>,
    pub fetched_balance: Option<BigDecimal>,
    pub fetched_balance_block_number: Option<i64>,
}

impl AddressParams {
    pub fn bare(hash: String) -> Self {
        Self {
            hash,
            contract_code: None,
            fetched_balance: None,
            fetched_balance_block_number: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoinBalanceParams {
    pub address_hash: String,
    pub block_number: i64,
    pub value: Option<BigDecimal>,
}

#[derive(Debug, Clone)]
pub struct UncleRelationParams {
    pub nephew_hash: String,
    pub uncle_hash: String,
}

#[derive(Debug, Clone)]
pub struct TransactionForkParams {
    pub uncle_hash: String,
    pub index: i32,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct TokenParams {
    pub contract_address_hash: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<i16>,
    pub total_supply: Option<BigDecimal>,
    pub kind: String,
    pub cataloged: bool,
}

#[derive(Debug, Clone)]
pub struct TokenTransferParams {
    pub transaction_hash: String,
    pub log_index: i32,
    pub token_contract_address_hash: String,
    pub from_address_hash: String,
    pub to_address_hash: String,
    pub amount: Option<BigDecimal>,
    pub token_id: Option<BigDecimal>,
    pub block_number: i64,
}

#[derive(Debug, Clone)]
pub struct TokenBalanceParams {
    pub address_hash: String,
    pub token_contract_address_hash: String,
    pub block_number: i64,
    pub value: Option<BigDecimal>,
    pub value_fetched_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

/// Input to [`Importer::all`]. Empty lists are skipped; runners execute in
/// foreign-key order inside one transaction.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub addresses: Vec<AddressParams>,
    pub address_coin_balances: Vec<CoinBalanceParams>,
    pub blocks: Vec<BlockParams>,
    pub block_second_degree_relations: Vec<UncleRelationParams>,
    pub transactions: Vec<TransactionParams>,
    pub transaction_forks: Vec<TransactionForkParams>,
    pub internal_transactions: Vec<InternalTransactionParams>,
    pub logs: Vec<LogParams>,
    pub tokens: Vec<TokenParams>,
    pub tokens_on_conflict: TokensConflict,
    pub token_transfers: Vec<TokenTransferParams>,
    pub token_balances: Vec<TokenBalanceParams>,
    pub current_token_balances: Vec<TokenBalanceParams>,
    pub broadcast: Option<BroadcastType>,
    pub timeout: Duration,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            address_coin_balances: Vec::new(),
            blocks: Vec::new(),
            block_second_degree_relations: Vec::new(),
            transactions: Vec::new(),
            transaction_forks: Vec::new(),
            internal_transactions: Vec::new(),
            logs: Vec::new(),
            tokens: Vec::new(),
            tokens_on_conflict: TokensConflict::Nothing,
            token_transfers: Vec::new(),
            token_balances: Vec::new(),
            current_token_balances: Vec::new(),
            broadcast: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl ImportOptions {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
            && self.address_coin_balances.is_empty()
            && self.blocks.is_empty()
            && self.block_second_degree_relations.is_empty()
            && self.transactions.is_empty()
            && self.transaction_forks.is_empty()
            && self.internal_transactions.is_empty()
            && self.logs.is_empty()
            && self.tokens.is_empty()
            && self.token_transfers.is_empty()
            && self.token_balances.is_empty()
            && self.current_token_balances.is_empty()
    }
}

/// Everything a successful import wrote, grouped per entity. Handed to the
/// event bus and to the async fetchers for follow-up work.
#[derive(Debug, Clone, Default)]
pub struct Imported {
    pub addresses: Vec<AddressParams>,
    pub address_coin_balances: Vec<CoinBalanceParams>,
    pub blocks: Vec<BlockParams>,
    pub block_second_degree_relations: Vec<UncleRelationParams>,
    pub transactions: Vec<TransactionParams>,
    pub transaction_forks: Vec<TransactionForkParams>,
    pub internal_transactions: Vec<InternalTransactionParams>,
    pub logs: Vec<LogParams>,
    pub tokens: Vec<TokenParams>,
    pub token_transfers: Vec<TokenTransferParams>,
    pub token_balances: Vec<TokenBalanceParams>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangesetError {
    pub entity: &'static str,
    pub index: usize,
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ChangesetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}].{}: {}",
            self.entity, self.index, self.field, self.message
        )
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("changeset validation failed: {0:?}")]
    Validation(Vec<ChangesetError>),

    #[error("import step {step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("import transaction timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

// ---------------------------------------------------------------------------
// Importer
// ---------------------------------------------------------------------------

pub struct Importer {
    pool: PgPool,
    bus: EventBus,
}

impl Importer {
    pub fn new(pool: PgPool, bus: EventBus) -> Self {
        Self { pool, bus }
    }

    /// Atomically ingest one batch: validate every param list, then run the
    /// present runners in FK order inside a single transaction. Nothing is
    /// written when any changeset is invalid.
    pub async fn all(&self, options: ImportOptions) -> Result<Imported, ImportError> {
        let errors = validate(&options);
        if !errors.is_empty() {
            return Err(ImportError::Validation(errors));
        }
        if options.is_empty() {
            return Ok(Imported::default());
        }

        let timeout = options.timeout;
        let broadcast = options.broadcast;
        match tokio::time::timeout(timeout, self.run_transaction(&options)).await {
            // the dropped future rolls the open transaction back
            Err(_) => Err(ImportError::Timeout(timeout)),
            Ok(Err(error)) => Err(error),
            Ok(Ok(())) => {
                let imported = Imported {
                    addresses: options.addresses,
                    address_coin_balances: options.address_coin_balances,
                    blocks: options.blocks,
                    block_second_degree_relations: options.block_second_degree_relations,
                    transactions: options.transactions,
                    transaction_forks: options.transaction_forks,
                    internal_transactions: options.internal_transactions,
                    logs: options.logs,
                    tokens: options.tokens,
                    token_transfers: options.token_transfers,
                    token_balances: options.token_balances,
                };
                if let Some(broadcast_type) = broadcast {
                    self.bus.publish(Arc::new(imported.clone()), broadcast_type);
                }
                Ok(imported)
            }
        }
    }

    async fn run_transaction(&self, options: &ImportOptions) -> Result<(), ImportError> {
        let mut tx = self.pool.begin().await?;
        // per-runner statement budget inside the batch transaction
        sqlx::query("SET LOCAL statement_timeout = '60s'")
            .execute(&mut *tx)
            .await?;

        step("addresses", addresses::run(&mut tx, &options.addresses).await)?;
        step(
            "address_coin_balances",
            coin_balances::run(&mut tx, &options.address_coin_balances).await,
        )?;
        step("blocks", blocks::run(&mut tx, &options.blocks).await)?;
        step(
            "block_second_degree_relations",
            block_second_degree_relations::run(&mut tx, &options.block_second_degree_relations)
                .await,
        )?;
        step(
            "transactions",
            transactions::run(&mut tx, &options.transactions).await,
        )?;
        step(
            "transaction_forks",
            transaction_forks::run(&mut tx, &options.transaction_forks).await,
        )?;
        step(
            "internal_transactions",
            internal_transactions::run(&mut tx, &options.internal_transactions).await,
        )?;
        step("logs", logs::run(&mut tx, &options.logs).await)?;
        step(
            "tokens",
            tokens::run(&mut tx, &options.tokens, options.tokens_on_conflict).await,
        )?;
        step(
            "token_transfers",
            token_transfers::run(&mut tx, &options.token_transfers).await,
        )?;
        step(
            "token_balances",
            token_balances::run(&mut tx, &options.token_balances).await,
        )?;
        step(
            "current_token_balances",
            current_token_balances::run(&mut tx, &options.current_token_balances).await,
        )?;

        tx.commit().await?;
        Ok(())
    }
}

fn step(name: &'static str, result: Result<(), sqlx::Error>) -> Result<(), ImportError> {
    result.map_err(|source| {
        tracing::debug!("import step {} failed: {}", name, source);
        ImportError::Step { step: name, source }
    })
}

// ---------------------------------------------------------------------------
// Changeset validation — runs before the transaction opens; all errors
// across all entities are collected into one list.
// ---------------------------------------------------------------------------

fn is_full_hash(s: &str) -> bool {
    s.len() == 66 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn is_address_hash(s: &str) -> bool {
    s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
}

fn validate(options: &ImportOptions) -> Vec<ChangesetError> {
    let mut errors = Vec::new();
    let mut push = |entity, index, field, message: String| {
        errors.push(ChangesetError {
            entity,
            index,
            field,
            message,
        })
    };

    for (i, block) in options.blocks.iter().enumerate() {
        if !is_full_hash(&block.hash) {
            push("blocks", i, "hash", format!("not a block hash: {}", block.hash));
        }
        if !is_full_hash(&block.parent_hash) {
            push(
                "blocks",
                i,
                "parent_hash",
                format!("not a block hash: {}", block.parent_hash),
            );
        }
        if !is_address_hash(&block.miner_hash) {
            push(
                "blocks",
                i,
                "miner_hash",
                format!("not an address: {}", block.miner_hash),
            );
        }
        if block.number < 0 {
            push("blocks", i, "number", format!("negative: {}", block.number));
        }
    }

    for (i, tx) in options.transactions.iter().enumerate() {
        if !is_full_hash(&tx.hash) {
            push("transactions", i, "hash", format!("not a transaction hash: {}", tx.hash));
        }
        if !is_address_hash(&tx.from_address_hash) {
            push(
                "transactions",
                i,
                "from_address_hash",
                format!("not an address: {}", tx.from_address_hash),
            );
        }
        if let Some(to) = &tx.to_address_hash {
            if !is_address_hash(to) {
                push("transactions", i, "to_address_hash", format!("not an address: {}", to));
            }
        }
        if tx.is_collated() {
            if tx.block_number.is_none() {
                push("transactions", i, "block_number", "collated without block_number".into());
            }
            if tx.index.is_none() {
                push("transactions", i, "index", "collated without index".into());
            }
            if tx.status.is_none() {
                push("transactions", i, "status", "collated without status".into());
            }
        } else {
            if tx.block_number.is_some()
                || tx.index.is_some()
                || tx.cumulative_gas_used.is_some()
                || tx.gas_used.is_some()
                || tx.status.is_some()
            {
                push(
                    "transactions",
                    i,
                    "block_hash",
                    "pending transaction carries collated fields".into(),
                );
            }
        }
    }

    for (i, log) in options.logs.iter().enumerate() {
        if !is_full_hash(&log.transaction_hash) {
            push("logs", i, "transaction_hash", format!("not a transaction hash: {}", log.transaction_hash));
        }
        if !is_address_hash(&log.address_hash) {
            push("logs", i, "address_hash", format!("not an address: {}", log.address_hash));
        }
        if log.index < 0 {
            push("logs", i, "index", format!("negative: {}", log.index));
        }
    }

    for (i, itx) in options.internal_transactions.iter().enumerate() {
        if !is_full_hash(&itx.transaction_hash) {
            push(
                "internal_transactions",
                i,
                "transaction_hash",
                format!("not a transaction hash: {}", itx.transaction_hash),
            );
        }
        if !is_address_hash(&itx.from_address_hash) {
            push(
                "internal_transactions",
                i,
                "from_address_hash",
                format!("not an address: {}", itx.from_address_hash),
            );
        }
        match itx.kind {
            InternalTransactionType::Create => {
                if itx.init.is_none() {
                    push("internal_transactions", i, "init", "create trace without init".into());
                }
            }
            InternalTransactionType::Call => {
                if itx.input.is_none() {
                    push("internal_transactions", i, "input", "call trace without input".into());
                }
                if itx.call_type.is_none() {
                    push(
                        "internal_transactions",
                        i,
                        "call_type",
                        "call trace without call_type".into(),
                    );
                }
            }
            _ => {}
        }
    }

    for (i, address) in options.addresses.iter().enumerate() {
        if !is_address_hash(&address.hash) {
            push("addresses", i, "hash", format!("not an address: {}", address.hash));
        }
    }

    for (i, balance) in options.address_coin_balances.iter().enumerate() {
        if !is_address_hash(&balance.address_hash) {
            push(
                "address_coin_balances",
                i,
                "address_hash",
                format!("not an address: {}", balance.address_hash),
            );
        }
        if balance.block_number < 0 {
            push(
                "address_coin_balances",
                i,
                "block_number",
                format!("negative: {}", balance.block_number),
            );
        }
    }

    for (i, relation) in options.block_second_degree_relations.iter().enumerate() {
        if !is_full_hash(&relation.nephew_hash) {
            push(
                "block_second_degree_relations",
                i,
                "nephew_hash",
                format!("not a block hash: {}", relation.nephew_hash),
            );
        }
        if !is_full_hash(&relation.uncle_hash) {
            push(
                "block_second_degree_relations",
                i,
                "uncle_hash",
                format!("not a block hash: {}", relation.uncle_hash),
            );
        }
    }

    for (i, fork) in options.transaction_forks.iter().enumerate() {
        if !is_full_hash(&fork.uncle_hash) {
            push("transaction_forks", i, "uncle_hash", format!("not a block hash: {}", fork.uncle_hash));
        }
        if !is_full_hash(&fork.hash) {
            push("transaction_forks", i, "hash", format!("not a transaction hash: {}", fork.hash));
        }
    }

    for (i, token) in options.tokens.iter().enumerate() {
        if !is_address_hash(&token.contract_address_hash) {
            push(
                "tokens",
                i,
                "contract_address_hash",
                format!("not an address: {}", token.contract_address_hash),
            );
        }
        if token.kind != "ERC-20" && token.kind != "ERC-721" {
            push("tokens", i, "type", format!("unknown token type: {}", token.kind));
        }
    }

    for (i, transfer) in options.token_transfers.iter().enumerate() {
        if !is_full_hash(&transfer.transaction_hash) {
            push(
                "token_transfers",
                i,
                "transaction_hash",
                format!("not a transaction hash: {}", transfer.transaction_hash),
            );
        }
        for (field, value) in [
            ("token_contract_address_hash", &transfer.token_contract_address_hash),
            ("from_address_hash", &transfer.from_address_hash),
            ("to_address_hash", &transfer.to_address_hash),
        ] {
            if !is_address_hash(value) {
                push("token_transfers", i, field, format!("not an address: {}", value));
            }
        }
    }

    for (list, entity) in [
        (&options.token_balances, "token_balances"),
        (&options.current_token_balances, "current_token_balances"),
    ] {
        for (i, balance) in list.iter().enumerate() {
            if !is_address_hash(&balance.address_hash) {
                push(entity, i, "address_hash", format!("not an address: {}", balance.address_hash));
            }
            if !is_address_hash(&balance.token_contract_address_hash) {
                push(
                    entity,
                    i,
                    "token_contract_address_hash",
                    format!("not an address: {}", balance.token_contract_address_hash),
                );
            }
        }
    }

    errors
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

#[cfg(test)]
impl BlockParams {
    pub fn test_fixture(number: i64, hash: &str) -> Self {
        Self {
            hash: pad_hash(hash),
            number,
            parent_hash: pad_hash("0x00"),
            miner_hash: format!("0x{:0>40}", "1"),
            timestamp: 1_500_000_000 + number,
            difficulty: None,
            total_difficulty: None,
            gas_used: 0,
            gas_limit: 8_000_000,
            size: None,
            nonce: None,
            consensus: true,
            internal_transactions_indexed_at: None,
        }
    }
}

#[cfg(test)]
pub(crate) fn pad_hash(hash: &str) -> String {
    format!("0x{:0>64}", hash.trim_start_matches("0x"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collated_transaction() -> TransactionParams {
        TransactionParams {
            hash: pad_hash("0xfeed"),
            nonce: 0,
            from_address_hash: format!("0x{:0>40}", "2"),
            to_address_hash: None,
            value: BigDecimal::from(0),
            gas: BigDecimal::from(21_000),
            gas_price: BigDecimal::from(1),
            input: Vec::new(),
            v: None,
            r: None,
            s: None,
            block_hash: Some(pad_hash("0xaa")),
            block_number: Some(100),
            index: Some(0),
            cumulative_gas_used: Some(BigDecimal::from(21_000)),
            gas_used: Some(BigDecimal::from(21_000)),
            status: Some(TxStatus::Ok),
            error: None,
            created_contract_address_hash: None,
        }
    }

    #[test]
    fn valid_options_produce_no_errors() {
        let options = ImportOptions {
            blocks: vec![BlockParams::test_fixture(100, "0xaa")],
            transactions: vec![collated_transaction()],
            ..Default::default()
        };
        assert!(validate(&options).is_empty());
    }

    #[test]
    fn malformed_block_hash_is_reported() {
        let mut block = BlockParams::test_fixture(100, "0xaa");
        block.hash = "0xnothex".into();
        let options = ImportOptions {
            blocks: vec![block],
            ..Default::default()
        };
        let errors = validate(&options);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].entity, "blocks");
        assert_eq!(errors[0].field, "hash");
    }

    #[test]
    fn collated_transaction_requires_status() {
        let mut tx = collated_transaction();
        tx.status = None;
        let options = ImportOptions {
            transactions: vec![tx],
            ..Default::default()
        };
        let errors = validate(&options);
        assert!(errors.iter().any(|e| e.field == "status"));
    }

    #[test]
    fn pending_transaction_must_not_carry_collated_fields() {
        let mut tx = collated_transaction();
        tx.block_hash = None;
        let options = ImportOptions {
            transactions: vec![tx],
            ..Default::default()
        };
        let errors = validate(&options);
        assert!(errors.iter().any(|e| e.field == "block_hash"));
    }

    #[test]
    fn errors_are_collected_across_entities() {
        let mut block = BlockParams::test_fixture(100, "0xaa");
        block.miner_hash = "bogus".into();
        let options = ImportOptions {
            blocks: vec![block],
            addresses: vec![AddressParams::bare("0xshort".into())],
            ..Default::default()
        };
        let errors = validate(&options);
        assert_eq!(errors.len(), 2);
        let entities: Vec<_> = errors.iter().map(|e| e.entity).collect();
        assert!(entities.contains(&"blocks"));
        assert!(entities.contains(&"addresses"));
    }

    #[test]
    fn empty_options_are_empty() {
        assert!(ImportOptions::default().is_empty());
        let options = ImportOptions {
            addresses: vec![AddressParams::bare(format!("0x{:0>40}", "3"))],
            ..Default::default()
        };
        assert!(!options.is_empty());
    }
}
