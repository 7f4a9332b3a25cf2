use std::collections::{BTreeMap, HashMap};

use crate::importer::{
    AddressParams, BlockParams, InternalTransactionParams, LogParams, TokenTransferParams,
    TransactionParams,
};
use ember_common::InternalTransactionType;

/// Everything in a batch that can mention an address.
#[derive(Default)]
pub struct AddressSources<'a> {
    pub blocks: &'a [BlockParams],
    pub transactions: &'a [TransactionParams],
    pub internal_transactions: &'a [InternalTransactionParams],
    pub logs: &'a [LogParams],
    pub token_transfers: &'a [TokenTransferParams],
}

/// One record per address seen anywhere in the batch, plus the highest
/// block each was seen in. The block map feeds the balance fetcher; it is
/// not a stored column on the address row itself.
pub struct ExtractedAddresses {
    pub params: Vec<AddressParams>,
    pub balance_block_numbers: HashMap<String, i64>,
}

struct Seen {
    max_block: Option<i64>,
    contract_code: Option<Vec<u8>>,
}

/// Derive the deduplicated address set. When two sources yield the same
/// hash the higher block number wins, and contract code is retained if
/// any source provided it.
pub fn extract(sources: &AddressSources<'_>) -> ExtractedAddresses {
    let mut seen: BTreeMap<String, Seen> = BTreeMap::new();

    let mut touch = |hash: &str, block: Option<i64>, code: Option<&[u8]>| {
        let entry = seen.entry(hash.to_string()).or_insert(Seen {
            max_block: None,
            contract_code: None,
        });
        if let Some(block) = block {
            entry.max_block = Some(entry.max_block.map_or(block, |b| b.max(block)));
        }
        if entry.contract_code.is_none() {
            entry.contract_code = code.map(|c| c.to_vec());
        }
    };

    for block in sources.blocks {
        touch(&block.miner_hash, Some(block.number), None);
    }

    for tx in sources.transactions {
        touch(&tx.from_address_hash, tx.block_number, None);
        if let Some(to) = &tx.to_address_hash {
            touch(to, tx.block_number, None);
        }
        if let Some(created) = &tx.created_contract_address_hash {
            touch(created, tx.block_number, None);
        }
    }

    for itx in sources.internal_transactions {
        touch(&itx.from_address_hash, itx.block_number, None);
        if let Some(to) = &itx.to_address_hash {
            touch(to, itx.block_number, None);
        }
        if let Some(created) = &itx.created_contract_address_hash {
            let code = if itx.kind == InternalTransactionType::Create && itx.error.is_none() {
                itx.created_contract_code.as_deref()
            } else {
                None
            };
            touch(created, itx.block_number, code);
        }
    }

    for log in sources.logs {
        touch(&log.address_hash, log.block_number, None);
    }

    for transfer in sources.token_transfers {
        touch(&transfer.from_address_hash, Some(transfer.block_number), None);
        touch(&transfer.to_address_hash, Some(transfer.block_number), None);
        touch(
            &transfer.token_contract_address_hash,
            Some(transfer.block_number),
            None,
        );
    }

    let mut params = Vec::with_capacity(seen.len());
    let mut balance_block_numbers = HashMap::with_capacity(seen.len());
    for (hash, entry) in seen {
        if let Some(block) = entry.max_block {
            balance_block_numbers.insert(hash.clone(), block);
        }
        let mut address = AddressParams::bare(hash);
        address.contract_code = entry.contract_code;
        params.push(address);
    }

    ExtractedAddresses {
        params,
        balance_block_numbers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::pad_hash;
    use bigdecimal::BigDecimal;

    fn addr(n: u32) -> String {
        format!("0x{n:0>40x}")
    }

    fn log_at(address: &str, block: i64) -> LogParams {
        LogParams {
            transaction_hash: pad_hash("0x1"),
            index: 0,
            address_hash: address.to_string(),
            data: Vec::new(),
            first_topic: None,
            second_topic: None,
            third_topic: None,
            fourth_topic: None,
            block_number: Some(block),
        }
    }

    fn create_itx(created: &str, block: i64, code: &[u8]) -> InternalTransactionParams {
        InternalTransactionParams {
            transaction_hash: pad_hash("0x2"),
            index: 0,
            kind: InternalTransactionType::Create,
            call_type: None,
            from_address_hash: addr(9),
            to_address_hash: None,
            created_contract_address_hash: Some(created.to_string()),
            value: BigDecimal::from(0),
            gas: None,
            gas_used: None,
            input: None,
            init: Some(vec![0x60]),
            output: None,
            created_contract_code: Some(code.to_vec()),
            trace_address: Vec::new(),
            error: None,
            block_number: Some(block),
        }
    }

    #[test]
    fn the_highest_block_number_wins() {
        let logs = vec![log_at(&addr(1), 5), log_at(&addr(1), 9), log_at(&addr(1), 7)];
        let extracted = extract(&AddressSources {
            logs: &logs,
            ..Default::default()
        });
        assert_eq!(extracted.params.len(), 1);
        assert_eq!(extracted.balance_block_numbers[&addr(1)], 9);
    }

    #[test]
    fn contract_code_is_retained_from_successful_creates() {
        let itxs = vec![create_itx(&addr(3), 4, &[0xde, 0xad])];
        let logs = vec![log_at(&addr(3), 10)];
        let extracted = extract(&AddressSources {
            internal_transactions: &itxs,
            logs: &logs,
            ..Default::default()
        });
        let address = extracted
            .params
            .iter()
            .find(|a| a.hash == addr(3))
            .unwrap();
        assert_eq!(address.contract_code.as_deref(), Some(&[0xde, 0xadu8][..]));
        assert_eq!(extracted.balance_block_numbers[&addr(3)], 10);
    }

    #[test]
    fn failed_create_yields_no_contract_code() {
        let mut itx = create_itx(&addr(4), 4, &[0xde]);
        itx.error = Some("Out of gas".into());
        let extracted = extract(&AddressSources {
            internal_transactions: std::slice::from_ref(&itx),
            ..Default::default()
        });
        let address = extracted
            .params
            .iter()
            .find(|a| a.hash == addr(4))
            .unwrap();
        assert!(address.contract_code.is_none());
    }

    #[test]
    fn extraction_distributes_over_source_partition() {
        // extracting the union equals max-merging per-part extractions
        let part_a = vec![log_at(&addr(1), 3), log_at(&addr(2), 8)];
        let part_b = vec![log_at(&addr(1), 6), log_at(&addr(3), 2)];
        let both: Vec<LogParams> = part_a.iter().chain(part_b.iter()).cloned().collect();

        let whole = extract(&AddressSources {
            logs: &both,
            ..Default::default()
        });

        let left = extract(&AddressSources {
            logs: &part_a,
            ..Default::default()
        });
        let right = extract(&AddressSources {
            logs: &part_b,
            ..Default::default()
        });
        let mut merged = left.balance_block_numbers;
        for (hash, block) in right.balance_block_numbers {
            merged
                .entry(hash)
                .and_modify(|existing| *existing = (*existing).max(block))
                .or_insert(block);
        }

        assert_eq!(whole.balance_block_numbers, merged);
    }

    #[test]
    fn block_miners_are_extracted() {
        let blocks = vec![crate::importer::BlockParams::test_fixture(12, "0xbb")];
        let extracted = extract(&AddressSources {
            blocks: &blocks,
            ..Default::default()
        });
        assert_eq!(extracted.params.len(), 1);
        assert_eq!(
            extracted.balance_block_numbers[&blocks[0].miner_hash],
            12
        );
    }
}
