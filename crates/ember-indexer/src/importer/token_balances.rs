use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;

use super::TokenBalanceParams;

/// Upsert token balances by (address, token_contract, block_number).
/// On conflict the row with the fresher `value_fetched_at` wins, so a
/// slow fetch can never roll a balance backwards.
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[TokenBalanceParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    let mut merged: BTreeMap<(&str, &str, i64), &TokenBalanceParams> = BTreeMap::new();
    for param in params {
        let key = (
            param.address_hash.as_str(),
            param.token_contract_address_hash.as_str(),
            param.block_number,
        );
        let entry = merged.entry(key).or_insert(param);
        if param.value_fetched_at > entry.value_fetched_at {
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
        "INSERT INTO address_token_balances
            (address_hash, token_contract_address_hash, block_number, value, value_fetched_at)
         SELECT address_hash, token_contract_address_hash, block_number, value::numeric,
                value_fetched_at
         FROM unnest($1::text[], $2::text[], $3::bigint[], $4::text[], $5::timestamptz[])
            AS t(address_hash, token_contract_address_hash, block_number, value, value_fetched_at)
         ON CONFLICT (address_hash, token_contract_address_hash, block_number) DO UPDATE SET
            value = EXCLUDED.value,
            value_fetched_at = EXCLUDED.value_fetched_at
         WHERE EXCLUDED.value_fetched_at IS NOT NULL
           AND (address_token_balances.value_fetched_at IS NULL
                OR EXCLUDED.value_fetched_at > address_token_balances.value_fetched_at)",
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
