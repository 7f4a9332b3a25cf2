use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;

use super::TokenBalanceParams;

/// Upsert the current-balance projection by (address, token_contract);
/// a row only moves forward to a newer block.
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[TokenBalanceParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    let mut merged: BTreeMap<(&str, &str), &TokenBalanceParams> = BTreeMap::new();
    for param in params {
        let key = (
            param.address_hash.as_str(),
            param.token_contract_address_hash.as_str(),
        );
        let entry = merged.entry(key).or_insert(param);
        if param.block_number > entry.block_number {
            *entry = param;
        }
    }

    let len = merged.len();
    let mut addresses: Vec<String> = Vec::with_capacity(len);
    let mut contracts: Vec<String> = Vec::with_capacity(len);
    let mut block_numbers: Vec<i64> = Vec::with_capacity(len);
    let mut values: Vec<Option<String>> = Vec::with_capacity(len);
    let mut fetched_ats: Vec<Option<chrono::DateTime<chrono::Utc>>> = Vec::with_capacity(len);

    for (_, param) in merged {
        addresses.push(param.address_hash.clone());
        contracts.push(param.token_contract_address_hash.clone());
        block_numbers.push(param.block_number);
        values.push(param.value.as_ref().map(|v| v.to_string()));
        fetched_ats.push(param.value_fetched_at);
    }

    sqlx::query(
        "INSERT INTO address_current_token_balances
            (address_hash, token_contract_address_hash, block_number, value, value_fetched_at)
         SELECT address_hash, token_contract_address_hash, block_number, value::numeric,
                value_fetched_at
         FROM unnest($1::text[], $2::text[], $3::bigint[], $4::text[], $5::timestamptz[])
            AS t(address_hash, token_contract_address_hash, block_number, value, value_fetched_at)
         ON CONFLICT (address_hash, token_contract_address_hash) DO UPDATE SET
            block_number = EXCLUDED.block_number,
            value = EXCLUDED.value,
            value_fetched_at = EXCLUDED.value_fetched_at
         WHERE EXCLUDED.block_number >= address_current_token_balances.block_number",
    )
    .bind(&addresses[..])
    .bind(&contracts[..])
    .bind(&block_numbers[..])
    .bind(&values[..])
    .bind(&fetched_ats[..])
    .execute(&mut **tx)
    .await?;

    Ok(())
}
