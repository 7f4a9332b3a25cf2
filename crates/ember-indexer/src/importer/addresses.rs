use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;

use super::AddressParams;

/// Upsert addresses by hash. On conflict the earliest `inserted_at` is
/// retained and `updated_at` advances; `contract_code` is only filled when
/// previously null; a fetched balance only replaces one from an older
/// block.
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[AddressParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    // merge duplicates; a single INSERT must not hit the same row twice
    let mut merged: BTreeMap<&str, AddressParams> = BTreeMap::new();
    for param in params {
        merged
            .entry(param.hash.as_str())
            .and_modify(|existing| {
                if existing.contract_code.is_none() {
                    existing.contract_code = param.contract_code.clone();
                }
                if param.fetched_balance_block_number > existing.fetched_balance_block_number {
                    existing.fetched_balance = param.fetched_balance.clone();
                    existing.fetched_balance_block_number = param.fetched_balance_block_number;
                }
            })
            .or_insert_with(|| param.clone());
    }

    let mut hashes: Vec<String> = Vec::with_capacity(merged.len());
    let mut codes: Vec<Option<Vec<u8>>> = Vec::with_capacity(merged.len());
    let mut balances: Vec<Option<String>> = Vec::with_capacity(merged.len());
    let mut balance_blocks: Vec<Option<i64>> = Vec::with_capacity(merged.len());
    for (_, param) in merged {
        hashes.push(param.hash);
        codes.push(param.contract_code);
        balances.push(param.fetched_balance.map(|b| b.to_string()));
        balance_blocks.push(param.fetched_balance_block_number);
    }

    sqlx::query(
        "INSERT INTO addresses
            (hash, contract_code, fetched_balance, fetched_balance_block_number, inserted_at, updated_at)
         SELECT hash, contract_code, fetched_balance::numeric, fetched_balance_block_number, NOW(), NOW()
         FROM unnest($1::text[], $2::bytea[], $3::text[], $4::bigint[])
            AS t(hash, contract_code, fetched_balance, fetched_balance_block_number)
         ON CONFLICT (hash) DO UPDATE SET
            contract_code = COALESCE(addresses.contract_code, EXCLUDED.contract_code),
            fetched_balance = CASE
                WHEN EXCLUDED.fetched_balance IS NOT NULL
                 AND (addresses.fetched_balance_block_number IS NULL
                      OR EXCLUDED.fetched_balance_block_number >= addresses.fetched_balance_block_number)
                THEN EXCLUDED.fetched_balance
                ELSE addresses.fetched_balance
            END,
            fetched_balance_block_number = CASE
                WHEN EXCLUDED.fetched_balance IS NOT NULL
                 AND (addresses.fetched_balance_block_number IS NULL
                      OR EXCLUDED.fetched_balance_block_number >= addresses.fetched_balance_block_number)
                THEN EXCLUDED.fetched_balance_block_number
                ELSE addresses.fetched_balance_block_number
            END,
            updated_at = NOW()",
    )
    .bind(&hashes[..])
    .bind(&codes[..])
    .bind(&balances[..])
    .bind(&balance_blocks[..])
    .execute(&mut **tx)
    .await?;

    Ok(())
}
