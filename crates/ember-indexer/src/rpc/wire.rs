use alloy::primitives::{Address, Bytes, B256, U256};
use bigdecimal::BigDecimal;
use ember_common::TxStatus;
use serde::Deserialize;
use std::str::FromStr;

use crate::importer::{BlockParams, LogParams, TransactionParams, UncleRelationParams};

/// Decode a JSON-RPC hex quantity ("0x1b4") into a u64.
pub fn parse_quantity(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| format!("quantity missing 0x prefix: {s}"))?;
    if digits.is_empty() {
        return Err(format!("empty quantity: {s}"));
    }
    u64::from_str_radix(digits, 16).map_err(|e| format!("bad quantity {s}: {e}"))
}

pub fn encode_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

pub(crate) mod quantity {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_quantity(&s).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod quantity_opt {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(s) => super::parse_quantity(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Lowercase 0x-hex rendering used for all DB hash keys.
pub fn hash_str(hash: &B256) -> String {
    format!("{hash:?}")
}

pub fn address_str(address: &Address) -> String {
    format!("{address:?}")
}

pub fn u256_decimal(value: &U256) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// eth_getBlockByNumber (full transactions)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBlock {
    pub hash: B256,
    #[serde(with = "quantity")]
    pub number: u64,
    pub parent_hash: B256,
    pub miner: Address,
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(default)]
    pub difficulty: Option<U256>,
    #[serde(default)]
    pub total_difficulty: Option<U256>,
    #[serde(with = "quantity")]
    pub gas_used: u64,
    #[serde(with = "quantity")]
    pub gas_limit: u64,
    #[serde(default, with = "quantity_opt")]
    pub size: Option<u64>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub uncles: Vec<B256>,
    #[serde(default)]
    pub transactions: Vec<WireTransaction>,
}

impl WireBlock {
    pub fn to_params(&self, consensus: bool) -> BlockParams {
        BlockParams {
            hash: hash_str(&self.hash),
            number: self.number as i64,
            parent_hash: hash_str(&self.parent_hash),
            miner_hash: address_str(&self.miner),
            timestamp: self.timestamp as i64,
            difficulty: self.difficulty.as_ref().map(u256_decimal),
            total_difficulty: self.total_difficulty.as_ref().map(u256_decimal),
            gas_used: self.gas_used as i64,
            gas_limit: self.gas_limit as i64,
            size: self.size.map(|s| s as i64),
            nonce: self.nonce.clone(),
            consensus,
            internal_transactions_indexed_at: None,
        }
    }

    pub fn uncle_relations(&self) -> Vec<UncleRelationParams> {
        self.uncles
            .iter()
            .map(|uncle| UncleRelationParams {
                nephew_hash: hash_str(&self.hash),
                uncle_hash: hash_str(uncle),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTransaction {
    pub hash: B256,
    #[serde(with = "quantity")]
    pub nonce: u64,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    pub value: U256,
    pub gas: U256,
    #[serde(default)]
    pub gas_price: Option<U256>,
    pub input: Bytes,
    #[serde(default)]
    pub v: Option<U256>,
    #[serde(default)]
    pub r: Option<U256>,
    #[serde(default)]
    pub s: Option<U256>,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default, with = "quantity_opt")]
    pub block_number: Option<u64>,
    #[serde(default, with = "quantity_opt")]
    pub transaction_index: Option<u64>,
}

impl WireTransaction {
    /// Build transaction params collated to the enclosing block. Receipt
    /// fields (status, gas_used, cumulative_gas_used) are joined in later.
    pub fn to_params(&self, block: &WireBlock, position: usize) -> TransactionParams {
        TransactionParams {
            hash: hash_str(&self.hash),
            nonce: self.nonce as i64,
            from_address_hash: address_str(&self.from),
            to_address_hash: self.to.as_ref().map(address_str),
            value: u256_decimal(&self.value),
            gas: u256_decimal(&self.gas),
            gas_price: self
                .gas_price
                .as_ref()
                .map(u256_decimal)
                .unwrap_or_default(),
            input: self.input.to_vec(),
            v: self.v.as_ref().map(u256_decimal),
            r: self.r.as_ref().map(u256_decimal),
            s: self.s.as_ref().map(u256_decimal),
            block_hash: Some(hash_str(&self.block_hash.unwrap_or(block.hash))),
            block_number: Some(self.block_number.unwrap_or(block.number) as i64),
            index: Some(self.transaction_index.unwrap_or(position as u64) as i32),
            cumulative_gas_used: None,
            gas_used: None,
            status: None,
            error: None,
            created_contract_address_hash: None,
        }
    }
}

// ---------------------------------------------------------------------------
// eth_getTransactionReceipt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireReceipt {
    pub transaction_hash: B256,
    #[serde(default, with = "quantity_opt")]
    pub block_number: Option<u64>,
    pub cumulative_gas_used: U256,
    pub gas_used: U256,
    #[serde(default)]
    pub contract_address: Option<Address>,
    #[serde(default, with = "quantity_opt")]
    pub status: Option<u64>,
    #[serde(default)]
    pub logs: Vec<WireLog>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLog {
    pub address: Address,
    #[serde(default)]
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default, with = "quantity_opt")]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default, with = "quantity_opt")]
    pub block_number: Option<u64>,
}

/// Receipt fields that get joined onto their transaction before import.
#[derive(Debug, Clone)]
pub struct ReceiptData {
    pub transaction_hash: String,
    pub block_number: Option<i64>,
    pub cumulative_gas_used: BigDecimal,
    pub gas_used: BigDecimal,
    pub created_contract_address_hash: Option<String>,
    pub status: TxStatus,
}

impl WireReceipt {
    /// Convert the receipt, deriving a status for pre-Byzantium nodes that
    /// omit it: a transaction that consumed its whole gas budget failed.
    pub fn to_data(&self, gas_budget: Option<&BigDecimal>) -> Result<ReceiptData, String> {
        let gas_used = u256_decimal(&self.gas_used);
        let status = derive_status(self.status, &gas_used, gas_budget)?;
        Ok(ReceiptData {
            transaction_hash: hash_str(&self.transaction_hash),
            block_number: self.block_number.map(|n| n as i64),
            cumulative_gas_used: u256_decimal(&self.cumulative_gas_used),
            gas_used,
            created_contract_address_hash: self.contract_address.as_ref().map(address_str),
            status,
        })
    }

    pub fn logs_params(&self, fallback_tx_hash: &str, block_number: Option<i64>) -> Vec<LogParams> {
        self.logs
            .iter()
            .map(|log| {
                let topic = |i: usize| log.topics.get(i).map(hash_str);
                LogParams {
                    transaction_hash: log
                        .transaction_hash
                        .as_ref()
                        .map(hash_str)
                        .unwrap_or_else(|| fallback_tx_hash.to_string()),
                    index: log.log_index.unwrap_or(0) as i32,
                    address_hash: address_str(&log.address),
                    data: log.data.to_vec(),
                    first_topic: topic(0),
                    second_topic: topic(1),
                    third_topic: topic(2),
                    fourth_topic: topic(3),
                    block_number: log.block_number.map(|n| n as i64).or(block_number),
                }
            })
            .collect()
    }
}

pub fn derive_status(
    status: Option<u64>,
    gas_used: &BigDecimal,
    gas_budget: Option<&BigDecimal>,
) -> Result<TxStatus, String> {
    match status {
        Some(1) => Ok(TxStatus::Ok),
        Some(0) => Ok(TxStatus::Error),
        Some(other) => Err(format!("unknown receipt status {other}")),
        None => match gas_budget {
            Some(budget) if gas_used >= budget => Ok(TxStatus::Error),
            Some(_) => Ok(TxStatus::Ok),
            None => Err("receipt has neither status nor a gas budget to derive one".into()),
        },
    }
}

// ---------------------------------------------------------------------------
// ABI return decoding for eth_call-backed reads
// ---------------------------------------------------------------------------

pub fn decode_abi_uint(data: &[u8]) -> Option<U256> {
    if data.len() < 32 {
        return None;
    }
    Some(U256::from_be_slice(&data[..32]))
}

/// Decode an ABI-encoded string return; falls back to treating the first
/// word as bytes32 for the handful of tokens that return one.
pub fn decode_abi_string(data: &[u8]) -> Option<String> {
    if data.len() >= 64 {
        let offset = usize::try_from(U256::from_be_slice(&data[..32])).ok()?;
        if let Some(len_word) = data.get(offset..offset + 32) {
            let len = usize::try_from(U256::from_be_slice(len_word)).ok()?;
            let bytes = data.get(offset + 32..offset + 32 + len)?;
            return String::from_utf8(bytes.to_vec())
                .ok()
                .map(|s| s.trim_end_matches('\0').to_string());
        }
    }
    if data.len() >= 32 {
        let trimmed: Vec<u8> = data[..32].iter().copied().take_while(|b| *b != 0).collect();
        if trimmed.is_empty() {
            return None;
        }
        return String::from_utf8(trimmed).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_decode_encode_round_trips() {
        for n in [0u64, 1, 0x10, 436, u32::MAX as u64, u64::MAX] {
            assert_eq!(parse_quantity(&encode_quantity(n)).unwrap(), n);
        }
    }

    #[test]
    fn quantity_rejects_malformed_input() {
        assert!(parse_quantity("1b4").is_err());
        assert!(parse_quantity("0x").is_err());
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn status_is_taken_from_the_receipt_when_present() {
        let gas_used = BigDecimal::from(21_000);
        assert_eq!(
            derive_status(Some(1), &gas_used, None).unwrap(),
            TxStatus::Ok
        );
        assert_eq!(
            derive_status(Some(0), &gas_used, None).unwrap(),
            TxStatus::Error
        );
    }

    #[test]
    fn absent_status_derives_from_gas_consumption() {
        let budget = BigDecimal::from(100_000);
        // whole budget burned: failed
        assert_eq!(
            derive_status(None, &BigDecimal::from(100_000), Some(&budget)).unwrap(),
            TxStatus::Error
        );
        assert_eq!(
            derive_status(None, &BigDecimal::from(99_999), Some(&budget)).unwrap(),
            TxStatus::Ok
        );
    }

    #[test]
    fn absent_status_and_budget_is_an_error() {
        assert!(derive_status(None, &BigDecimal::from(1), None).is_err());
    }

    #[test]
    fn wire_block_decodes_and_converts() {
        let json = serde_json::json!({
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "number": "0x64",
            "parentHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "miner": "0x3333333333333333333333333333333333333333",
            "timestamp": "0x5b8d80",
            "difficulty": "0x400",
            "gasUsed": "0x5208",
            "gasLimit": "0x7a1200",
            "size": "0x220",
            "nonce": "0x0000000000000042",
            "uncles": ["0x4444444444444444444444444444444444444444444444444444444444444444"],
            "transactions": [{
                "hash": "0x5555555555555555555555555555555555555555555555555555555555555555",
                "nonce": "0x0",
                "from": "0x6666666666666666666666666666666666666666",
                "to": "0x7777777777777777777777777777777777777777",
                "value": "0xde0b6b3a7640000",
                "gas": "0x5208",
                "gasPrice": "0x3b9aca00",
                "input": "0x",
                "transactionIndex": "0x0"
            }]
        });
        let block: WireBlock = serde_json::from_value(json).unwrap();
        let params = block.to_params(true);
        assert_eq!(params.number, 100);
        assert_eq!(params.gas_used, 21_000);
        assert!(params.consensus);
        assert_eq!(block.uncle_relations().len(), 1);

        let tx = block.transactions[0].to_params(&block, 0);
        assert_eq!(tx.block_number, Some(100));
        assert_eq!(tx.index, Some(0));
        assert_eq!(tx.value, BigDecimal::from(1_000_000_000_000_000_000u64));
        assert!(tx.status.is_none());
    }

    #[test]
    fn abi_string_decoding_handles_dynamic_and_bytes32() {
        // ABI-encoded "USDC"
        let mut dynamic = vec![0u8; 32];
        dynamic[31] = 0x20;
        let mut len_word = vec![0u8; 32];
        len_word[31] = 4;
        dynamic.extend(len_word);
        let mut body = b"USDC".to_vec();
        body.resize(32, 0);
        dynamic.extend(body);
        assert_eq!(decode_abi_string(&dynamic).as_deref(), Some("USDC"));

        // bytes32-style return
        let mut fixed = b"MKR".to_vec();
        fixed.resize(32, 0);
        assert_eq!(decode_abi_string(&fixed).as_deref(), Some("MKR"));

        assert_eq!(decode_abi_string(&[]), None);
    }

    #[test]
    fn abi_uint_decoding_reads_the_first_word() {
        let mut word = vec![0u8; 32];
        word[31] = 18;
        assert_eq!(decode_abi_uint(&word), Some(U256::from(18)));
        assert_eq!(decode_abi_uint(&[0u8; 4]), None);
    }
}
