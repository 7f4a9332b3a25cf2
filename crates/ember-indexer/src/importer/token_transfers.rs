use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;

use super::TokenTransferParams;

/// Upsert token transfers by (transaction_hash, log_index).
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[TokenTransferParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    let mut merged: BTreeMap<(&str, i32), &TokenTransferParams> = BTreeMap::new();
    for param in params {
        merged.insert((param.transaction_hash.as_str(), param.log_index), param);
    }

    let len = merged.len();
    let mut tx_hashes: Vec<String> = Vec::with_capacity(len);
    let mut log_indexes: Vec<i32> = Vec::with_capacity(len);
    let mut contracts: Vec<String> = Vec::with_capacity(len);
    let mut froms: Vec<String> = Vec::with_capacity(len);
    let mut tos: Vec<String> = Vec::with_capacity(len);
    let mut amounts: Vec<Option<String>> = Vec::with_capacity(len);
    let mut token_ids: Vec<Option<String>> = Vec::with_capacity(len);
    let mut block_numbers: Vec<i64> = Vec::with_capacity(len);

    for (_, param) in merged {
        tx_hashes.push(param.transaction_hash.clone());
        log_indexes.push(param.log_index);
        contracts.push(param.token_contract_address_hash.clone());
        froms.push(param.from_address_hash.clone());
        tos.push(param.to_address_hash.clone());
        amounts.push(param.amount.as_ref().map(|a| a.to_string()));
        token_ids.push(param.token_id.as_ref().map(|t| t.to_string()));
        block_numbers.push(param.block_number);
    }

    sqlx::query(
        "INSERT INTO token_transfers
            (transaction_hash, log_index, token_contract_address_hash, from_address_hash,
             to_address_hash, amount, token_id, block_number)
         SELECT transaction_hash, log_index, token_contract_address_hash, from_address_hash,
                to_address_hash, amount::numeric, token_id::numeric, block_number
         FROM unnest($1::text[], $2::int[], $3::text[], $4::text[], $5::text[], $6::text[],
                     $7::text[], $8::bigint[])
            AS t(transaction_hash, log_index, token_contract_address_hash, from_address_hash,
                 to_address_hash, amount, token_id, block_number)
         ON CONFLICT (transaction_hash, log_index) DO UPDATE SET
            token_contract_address_hash = EXCLUDED.token_contract_address_hash,
            from_address_hash = EXCLUDED.from_address_hash,
            to_address_hash = EXCLUDED.to_address_hash,
            amount = EXCLUDED.amount,
            token_id = EXCLUDED.token_id,
            block_number = EXCLUDED.block_number",
    )
    .bind(&tx_hashes[..])
    .bind(&log_indexes[..])
    .bind(&contracts[..])
    .bind(&froms[..])
    .bind(&tos[..])
    .bind(&amounts[..])
    .bind(&token_ids[..])
    .bind(&block_numbers[..])
    .execute(&mut **tx)
    .await?;

    Ok(())
}
