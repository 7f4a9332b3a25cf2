use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Block as stored in the database.
///
/// At most one row per `number` carries `consensus = true`; competing
/// blocks at the same height keep their rows with `consensus = false`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Block {
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
    pub internal_transactions_indexed_at: Option<DateTime<Utc>>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Transaction as stored in the database.
///
/// Pending transactions have all collation fields (block_hash,
/// block_number, index, cumulative_gas_used, gas_used, status) null.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
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
    pub status: Option<i16>,
    pub error: Option<String>,
    pub created_contract_address_hash: Option<String>,
    pub internal_transactions_indexed_at: Option<DateTime<Utc>>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Event log as stored in the database, unique on (transaction_hash, index).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Log {
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

/// Internal transaction (trace entry), unique on (transaction_hash, index).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InternalTransaction {
    pub transaction_hash: String,
    pub index: i32,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub call_type: Option<String>,
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

/// Address as stored in the database, keyed by hash.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Address {
    pub hash: String,
    pub fetched_balance: Option<BigDecimal>,
    pub fetched_balance_block_number: Option<i64>,
    pub contract_code: Option<Vec<u8>>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Coin balance at a block height, unique on (address_hash, block_number).
/// `value` stays null until the balance fetcher has read it from the node.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CoinBalance {
    pub address_hash: String,
    pub block_number: i64,
    pub value: Option<BigDecimal>,
    pub value_fetched_at: Option<DateTime<Utc>>,
}

/// Token balance at a block height, unique on
/// (address_hash, token_contract_address_hash, block_number).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenBalance {
    pub address_hash: String,
    pub token_contract_address_hash: String,
    pub block_number: i64,
    pub value: Option<BigDecimal>,
    pub value_fetched_at: Option<DateTime<Utc>>,
}

/// Derived projection of the newest token balance per (address, token).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CurrentTokenBalance {
    pub address_hash: String,
    pub token_contract_address_hash: String,
    pub block_number: i64,
    pub value: Option<BigDecimal>,
    pub value_fetched_at: Option<DateTime<Utc>>,
}

/// Token contract as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Token {
    pub contract_address_hash: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<i16>,
    pub total_supply: Option<BigDecimal>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub cataloged: bool,
    pub holder_count: i64,
}

/// Token transfer decoded from a log, unique on (transaction_hash, log_index).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenTransfer {
    pub transaction_hash: String,
    pub log_index: i32,
    pub token_contract_address_hash: String,
    pub from_address_hash: String,
    pub to_address_hash: String,
    pub amount: Option<BigDecimal>,
    pub token_id: Option<BigDecimal>,
    pub block_number: i64,
}

/// Uncle relation, unique on (nephew_hash, uncle_hash).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BlockSecondDegreeRelation {
    pub nephew_hash: String,
    pub uncle_hash: String,
    pub uncle_fetched_at: Option<DateTime<Utc>>,
}

/// A transaction that was collated into a block that lost consensus,
/// unique on (uncle_hash, index).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TransactionFork {
    pub uncle_hash: String,
    pub index: i32,
    pub hash: String,
}

/// Post-execution status of a collated transaction.
///
/// Pending transactions carry no status at all (NULL column), so the sum
/// has only the two collated outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Ok,
    Error,
}

impl TxStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            TxStatus::Ok => 1,
            TxStatus::Error => 0,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            1 => Some(TxStatus::Ok),
            0 => Some(TxStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxStatus::Ok => write!(f, "ok"),
            TxStatus::Error => write!(f, "error"),
        }
    }
}

/// Kind of trace entry produced by the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalTransactionType {
    Call,
    Create,
    Reward,
    Suicide,
}

impl InternalTransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InternalTransactionType::Call => "call",
            InternalTransactionType::Create => "create",
            InternalTransactionType::Reward => "reward",
            InternalTransactionType::Suicide => "suicide",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "call" => Some(InternalTransactionType::Call),
            "create" => Some(InternalTransactionType::Create),
            "reward" => Some(InternalTransactionType::Reward),
            "suicide" => Some(InternalTransactionType::Suicide),
            _ => None,
        }
    }
}

impl std::fmt::Display for InternalTransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Call flavor for `call`-type internal transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Call => "call",
            CallType::CallCode => "callcode",
            CallType::DelegateCall => "delegatecall",
            CallType::StaticCall => "staticcall",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "call" => Some(CallType::Call),
            "callcode" => Some(CallType::CallCode),
            "delegatecall" => Some(CallType::DelegateCall),
            "staticcall" => Some(CallType::StaticCall),
            _ => None,
        }
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_status_round_trips_through_db_representation() {
        for status in [TxStatus::Ok, TxStatus::Error] {
            assert_eq!(TxStatus::from_i16(status.as_i16()), Some(status));
        }
        assert_eq!(TxStatus::from_i16(7), None);
    }

    #[test]
    fn internal_transaction_type_parses_known_kinds() {
        for kind in [
            InternalTransactionType::Call,
            InternalTransactionType::Create,
            InternalTransactionType::Reward,
            InternalTransactionType::Suicide,
        ] {
            assert_eq!(InternalTransactionType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(InternalTransactionType::parse("selfdestruct"), None);
    }

    #[test]
    fn call_type_parses_known_flavors() {
        for call_type in [
            CallType::Call,
            CallType::CallCode,
            CallType::DelegateCall,
            CallType::StaticCall,
        ] {
            assert_eq!(CallType::parse(call_type.as_str()), Some(call_type));
        }
    }
}
