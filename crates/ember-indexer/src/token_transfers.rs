use alloy::primitives::U256;

use crate::importer::{LogParams, TokenBalanceParams, TokenParams, TokenTransferParams};
use bigdecimal::BigDecimal;
use std::str::FromStr;

/// ERC-20/721 Transfer event signature: Transfer(address,address,uint256)
const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Token data decoded out of a batch of logs.
#[derive(Default)]
pub struct ParsedTokenTransfers {
    pub transfers: Vec<TokenTransferParams>,
    pub tokens: Vec<TokenParams>,
    /// Unfetched (address, token, block) rows; the token balance fetcher
    /// fills their values in.
    pub balance_placeholders: Vec<TokenBalanceParams>,
}

/// Decode Transfer logs into token transfers.
///
/// Three indexed topics (from, to, tokenId) mean ERC-721; two indexed
/// topics with a 32-byte data word mean ERC-20. Anything else under the
/// Transfer signature is skipped.
pub fn parse(logs: &[LogParams]) -> ParsedTokenTransfers {
    let mut parsed = ParsedTokenTransfers::default();

    for log in logs {
        if log.first_topic.as_deref() != Some(TRANSFER_TOPIC) {
            continue;
        }
        let (Some(second), Some(third)) = (&log.second_topic, &log.third_topic) else {
            continue;
        };
        let Some(block_number) = log.block_number else {
            continue;
        };
        let from = topic_address(second);
        let to = topic_address(third);
        let contract = log.address_hash.clone();

        match &log.fourth_topic {
            // ERC-721: Transfer(address indexed, address indexed, uint256 indexed tokenId)
            Some(fourth) => {
                let token_id = topic_u256(fourth);
                parsed.transfers.push(TokenTransferParams {
                    transaction_hash: log.transaction_hash.clone(),
                    log_index: log.index,
                    token_contract_address_hash: contract.clone(),
                    from_address_hash: from.clone(),
                    to_address_hash: to.clone(),
                    amount: None,
                    token_id: Some(token_id),
                    block_number,
                });
                parsed.tokens.push(bare_token(contract, "ERC-721"));
            }
            // ERC-20: Transfer(address indexed, address indexed, uint256 value)
            None if log.data.len() >= 32 => {
                let amount = BigDecimal::from_str(
                    &U256::from_be_slice(&log.data[..32]).to_string(),
                )
                .unwrap_or_default();
                parsed.transfers.push(TokenTransferParams {
                    transaction_hash: log.transaction_hash.clone(),
                    log_index: log.index,
                    token_contract_address_hash: contract.clone(),
                    from_address_hash: from.clone(),
                    to_address_hash: to.clone(),
                    amount: Some(amount),
                    token_id: None,
                    block_number,
                });
                for holder in [&from, &to] {
                    if holder != ZERO_ADDRESS {
                        parsed.balance_placeholders.push(TokenBalanceParams {
                            address_hash: holder.clone(),
                            token_contract_address_hash: contract.clone(),
                            block_number,
                            value: None,
                            value_fetched_at: None,
                        });
                    }
                }
                parsed.tokens.push(bare_token(contract, "ERC-20"));
            }
            None => {}
        }
    }

    parsed
}

fn bare_token(contract: String, kind: &str) -> TokenParams {
    TokenParams {
        contract_address_hash: contract,
        name: None,
        symbol: None,
        decimals: None,
        total_supply: None,
        kind: kind.to_string(),
        cataloged: false,
    }
}

/// Last 20 bytes of a 32-byte topic, as a 0x-address.
fn topic_address(topic: &str) -> String {
    let digits = topic.trim_start_matches("0x");
    if digits.len() >= 40 {
        format!("0x{}", &digits[digits.len() - 40..])
    } else {
        format!("0x{digits:0>40}")
    }
}

fn topic_u256(topic: &str) -> BigDecimal {
    let digits = topic.trim_start_matches("0x");
    U256::from_str_radix(digits, 16)
        .map(|v| BigDecimal::from_str(&v.to_string()).unwrap_or_default())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::pad_hash;

    fn topic_for(address: &str) -> String {
        format!("0x{:0>64}", address.trim_start_matches("0x"))
    }

    fn transfer_log(
        from: &str,
        to: &str,
        data: Vec<u8>,
        fourth: Option<String>,
        block: i64,
    ) -> LogParams {
        LogParams {
            transaction_hash: pad_hash("0x77"),
            index: 3,
            address_hash: format!("0x{:0>40}", "c"),
            data,
            first_topic: Some(TRANSFER_TOPIC.to_string()),
            second_topic: Some(topic_for(from)),
            third_topic: Some(topic_for(to)),
            fourth_topic: fourth,
            block_number: Some(block),
        }
    }

    fn amount_word(value: u64) -> Vec<u8> {
        let mut word = vec![0u8; 32];
        word[24..].copy_from_slice(&value.to_be_bytes());
        word
    }

    #[test]
    fn erc20_transfer_is_decoded_with_balance_placeholders() {
        let from = format!("0x{:0>40}", "a");
        let to = format!("0x{:0>40}", "b");
        let log = transfer_log(&from, &to, amount_word(1_000), None, 42);

        let parsed = parse(std::slice::from_ref(&log));
        assert_eq!(parsed.transfers.len(), 1);
        let transfer = &parsed.transfers[0];
        assert_eq!(transfer.amount, Some(BigDecimal::from(1_000)));
        assert_eq!(transfer.token_id, None);
        assert_eq!(transfer.from_address_hash, from);
        assert_eq!(transfer.to_address_hash, to);

        assert_eq!(parsed.tokens.len(), 1);
        assert_eq!(parsed.tokens[0].kind, "ERC-20");
        assert!(!parsed.tokens[0].cataloged);

        assert_eq!(parsed.balance_placeholders.len(), 2);
        assert!(parsed.balance_placeholders.iter().all(|b| b.value.is_none()));
    }

    #[test]
    fn erc721_transfer_carries_the_token_id() {
        let from = format!("0x{:0>40}", "a");
        let to = format!("0x{:0>40}", "b");
        let token_id = format!("0x{:0>64}", "2a");
        let log = transfer_log(&from, &to, Vec::new(), Some(token_id), 43);

        let parsed = parse(std::slice::from_ref(&log));
        assert_eq!(parsed.transfers.len(), 1);
        assert_eq!(parsed.transfers[0].token_id, Some(BigDecimal::from(42)));
        assert_eq!(parsed.transfers[0].amount, None);
        assert_eq!(parsed.tokens[0].kind, "ERC-721");
        // NFT ownership is tracked through transfers, not balance rows
        assert!(parsed.balance_placeholders.is_empty());
    }

    #[test]
    fn mints_skip_the_zero_address_placeholder() {
        let to = format!("0x{:0>40}", "b");
        let log = transfer_log(ZERO_ADDRESS, &to, amount_word(5), None, 44);

        let parsed = parse(std::slice::from_ref(&log));
        assert_eq!(parsed.balance_placeholders.len(), 1);
        assert_eq!(parsed.balance_placeholders[0].address_hash, to);
    }

    #[test]
    fn non_transfer_and_malformed_logs_are_ignored() {
        let mut other = transfer_log(
            &format!("0x{:0>40}", "a"),
            &format!("0x{:0>40}", "b"),
            amount_word(5),
            None,
            45,
        );
        other.first_topic = Some(pad_hash("0x01"));
        let short_data = transfer_log(
            &format!("0x{:0>40}", "a"),
            &format!("0x{:0>40}", "b"),
            vec![0x01],
            None,
            45,
        );

        let parsed = parse(&[other, short_data]);
        assert!(parsed.transfers.is_empty());
    }
}
