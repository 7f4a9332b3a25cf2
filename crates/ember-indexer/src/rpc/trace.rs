use alloy::primitives::{Address, Bytes, U256};
use ember_common::{CallType, InternalTransactionType};
use serde::Deserialize;

use super::wire::{address_str, u256_decimal};
use crate::importer::InternalTransactionParams;

/// `trace_replayTransaction(hash, ["trace"])` response shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTraceResult {
    #[serde(default)]
    pub trace: Vec<WireTraceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTraceEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: WireTraceAction,
    #[serde(default)]
    pub result: Option<WireTraceOutcome>,
    #[serde(default)]
    pub trace_address: Vec<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Union of the per-kind action shapes; the tracer only populates the
/// fields belonging to the entry's `type`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTraceAction {
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub from: Option<Address>,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub gas: Option<U256>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default)]
    pub input: Option<Bytes>,
    #[serde(default)]
    pub init: Option<Bytes>,
    // suicide
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub refund_address: Option<Address>,
    #[serde(default)]
    pub balance: Option<U256>,
    // reward
    #[serde(default)]
    pub author: Option<Address>,
    #[serde(default)]
    pub reward_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTraceOutcome {
    #[serde(default)]
    pub gas_used: Option<U256>,
    #[serde(default)]
    pub output: Option<Bytes>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub code: Option<Bytes>,
}

/// Flatten a transaction's trace into internal-transaction params, indexed
/// in tracer order.
pub fn to_params(
    transaction_hash: &str,
    block_number: i64,
    entries: &[WireTraceEntry],
) -> Result<Vec<InternalTransactionParams>, String> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| entry_to_params(transaction_hash, block_number, index as i32, entry))
        .collect()
}

fn entry_to_params(
    transaction_hash: &str,
    block_number: i64,
    index: i32,
    entry: &WireTraceEntry,
) -> Result<InternalTransactionParams, String> {
    let kind = InternalTransactionType::parse(&entry.kind)
        .ok_or_else(|| format!("unknown trace type: {}", entry.kind))?;
    let action = &entry.action;
    let outcome = entry.result.as_ref();

    let mut params = InternalTransactionParams {
        transaction_hash: transaction_hash.to_string(),
        index,
        kind,
        call_type: None,
        from_address_hash: String::new(),
        to_address_hash: None,
        created_contract_address_hash: None,
        value: action.value.as_ref().map(u256_decimal).unwrap_or_default(),
        gas: action.gas.as_ref().map(u256_decimal),
        gas_used: outcome.and_then(|o| o.gas_used.as_ref()).map(u256_decimal),
        input: None,
        init: None,
        output: None,
        created_contract_code: None,
        trace_address: entry.trace_address.iter().map(|t| *t as i32).collect(),
        error: entry.error.clone(),
        block_number: Some(block_number),
    };

    match kind {
        InternalTransactionType::Call => {
            let from = action
                .from
                .as_ref()
                .ok_or_else(|| "call trace without from".to_string())?;
            params.from_address_hash = address_str(from);
            params.to_address_hash = action.to.as_ref().map(address_str);
            params.call_type = Some(
                action
                    .call_type
                    .as_deref()
                    .and_then(CallType::parse)
                    .ok_or_else(|| {
                        format!("unknown call type: {:?}", action.call_type)
                    })?,
            );
            params.input = Some(action.input.as_ref().map(|b| b.to_vec()).unwrap_or_default());
            params.output = outcome.and_then(|o| o.output.as_ref()).map(|b| b.to_vec());
        }
        InternalTransactionType::Create => {
            let from = action
                .from
                .as_ref()
                .ok_or_else(|| "create trace without from".to_string())?;
            params.from_address_hash = address_str(from);
            params.init = Some(action.init.as_ref().map(|b| b.to_vec()).unwrap_or_default());
            if entry.error.is_none() {
                params.created_contract_address_hash =
                    outcome.and_then(|o| o.address.as_ref()).map(address_str);
                params.created_contract_code =
                    outcome.and_then(|o| o.code.as_ref()).map(|b| b.to_vec());
            }
        }
        InternalTransactionType::Suicide => {
            let address = action
                .address
                .as_ref()
                .ok_or_else(|| "suicide trace without address".to_string())?;
            params.from_address_hash = address_str(address);
            params.to_address_hash = action.refund_address.as_ref().map(address_str);
            params.value = action.balance.as_ref().map(u256_decimal).unwrap_or_default();
        }
        InternalTransactionType::Reward => {
            let author = action
                .author
                .as_ref()
                .ok_or_else(|| "reward trace without author".to_string())?;
            params.from_address_hash = address_str(author);
        }
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;

    fn hash() -> String {
        format!("0x{:0>64}", "ab")
    }

    #[test]
    fn call_trace_maps_action_and_result() {
        let json = serde_json::json!([{
            "type": "call",
            "action": {
                "callType": "call",
                "from": "0x1111111111111111111111111111111111111111",
                "to": "0x2222222222222222222222222222222222222222",
                "gas": "0x76c0",
                "value": "0x0",
                "input": "0xabcdef"
            },
            "result": { "gasUsed": "0x5208", "output": "0x01" },
            "subtraces": 0,
            "traceAddress": [0, 1]
        }]);
        let entries: Vec<WireTraceEntry> = serde_json::from_value(json).unwrap();
        let params = to_params(&hash(), 100, &entries).unwrap();
        assert_eq!(params.len(), 1);
        let p = &params[0];
        assert_eq!(p.kind, InternalTransactionType::Call);
        assert_eq!(p.call_type, Some(CallType::Call));
        assert_eq!(p.trace_address, vec![0, 1]);
        assert_eq!(p.gas, Some(BigDecimal::from(0x76c0)));
        assert_eq!(p.gas_used, Some(BigDecimal::from(0x5208)));
        assert_eq!(p.input.as_deref(), Some(&[0xab, 0xcd, 0xefu8][..]));
        assert_eq!(p.block_number, Some(100));
    }

    #[test]
    fn successful_create_trace_captures_contract_and_code() {
        let json = serde_json::json!([{
            "type": "create",
            "action": {
                "from": "0x1111111111111111111111111111111111111111",
                "gas": "0x3d090",
                "value": "0x0",
                "init": "0x6060"
            },
            "result": {
                "gasUsed": "0x1d090",
                "address": "0x3333333333333333333333333333333333333333",
                "code": "0x6060aa"
            },
            "traceAddress": []
        }]);
        let entries: Vec<WireTraceEntry> = serde_json::from_value(json).unwrap();
        let params = to_params(&hash(), 7, &entries).unwrap();
        let p = &params[0];
        assert_eq!(p.kind, InternalTransactionType::Create);
        assert_eq!(
            p.created_contract_address_hash.as_deref(),
            Some("0x3333333333333333333333333333333333333333")
        );
        assert_eq!(p.created_contract_code.as_deref(), Some(&[0x60, 0x60, 0xaau8][..]));
    }

    #[test]
    fn failed_create_trace_has_no_contract() {
        let json = serde_json::json!([{
            "type": "create",
            "action": {
                "from": "0x1111111111111111111111111111111111111111",
                "gas": "0x0",
                "value": "0x0",
                "init": "0x6060"
            },
            "error": "Out of gas",
            "traceAddress": []
        }]);
        let entries: Vec<WireTraceEntry> = serde_json::from_value(json).unwrap();
        let params = to_params(&hash(), 7, &entries).unwrap();
        let p = &params[0];
        assert!(p.created_contract_address_hash.is_none());
        assert_eq!(p.error.as_deref(), Some("Out of gas"));
    }

    #[test]
    fn suicide_trace_moves_balance_to_refund_address() {
        let json = serde_json::json!([{
            "type": "suicide",
            "action": {
                "address": "0x1111111111111111111111111111111111111111",
                "refundAddress": "0x2222222222222222222222222222222222222222",
                "balance": "0x64"
            },
            "traceAddress": [2]
        }]);
        let entries: Vec<WireTraceEntry> = serde_json::from_value(json).unwrap();
        let params = to_params(&hash(), 9, &entries).unwrap();
        let p = &params[0];
        assert_eq!(p.kind, InternalTransactionType::Suicide);
        assert_eq!(p.value, BigDecimal::from(100));
        assert_eq!(
            p.to_address_hash.as_deref(),
            Some("0x2222222222222222222222222222222222222222")
        );
    }

    #[test]
    fn unknown_trace_type_is_rejected() {
        let json = serde_json::json!([{
            "type": "delegate",
            "action": {},
            "traceAddress": []
        }]);
        let entries: Vec<WireTraceEntry> = serde_json::from_value(json).unwrap();
        assert!(to_params(&hash(), 1, &entries).is_err());
    }
}
