use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;

use super::CoinBalanceParams;

/// Upsert coin balances by (address_hash, block_number). Placeholder rows
/// (no value yet) never clobber a fetched value; a fetched value always
/// lands together with its `value_fetched_at` stamp.
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[CoinBalanceParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    let mut merged: BTreeMap<(&str, i64), &CoinBalanceParams> = BTreeMap::new();
    for param in params {
        let entry = merged
            .entry((param.address_hash.as_str(), param.block_number))
            .or_insert(param);
        if entry.value.is_none() && param.value.is_some() {
            *entry = param;
        }
    }

    let mut addresses: Vec<String> = Vec::with_capacity(merged.len());
    let mut block_numbers: Vec<i64> = Vec::with_capacity(merged.len());
    let mut values: Vec<Option<String>> = Vec::with_capacity(merged.len());
    for (_, param) in merged {
        addresses.push(param.address_hash.clone());
        block_numbers.push(param.block_number);
        values.push(param.value.as_ref().map(|v| v.to_string()));
    }

    sqlx::query(
        "INSERT INTO address_coin_balances (address_hash, block_number, value, value_fetched_at)
         SELECT address_hash, block_number, value::numeric,
                CASE WHEN value IS NOT NULL THEN NOW() END
         FROM unnest($1::text[], $2::bigint[], $3::text[])
            AS t(address_hash, block_number, value)
         ON CONFLICT (address_hash, block_number) DO UPDATE SET
            value = EXCLUDED.value,
            value_fetched_at = EXCLUDED.value_fetched_at
         WHERE EXCLUDED.value IS NOT NULL",
    )
    .bind(&addresses[..])
    .bind(&block_numbers[..])
    .bind(&values[..])
    .execute(&mut **tx)
    .await?;

    Ok(())
}
