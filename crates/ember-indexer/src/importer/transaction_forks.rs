use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;

use super::TransactionForkParams;

/// Upsert transaction forks by (uncle_hash, index); the pointed-at
/// transaction hash is replaced on conflict.
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[TransactionForkParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    let mut merged: BTreeMap<(&str, i32), &TransactionForkParams> = BTreeMap::new();
    for param in params {
        merged.insert((param.uncle_hash.as_str(), param.index), param);
    }

    let mut uncle_hashes: Vec<String> = Vec::with_capacity(merged.len());
    let mut indexes: Vec<i32> = Vec::with_capacity(merged.len());
    let mut hashes: Vec<String> = Vec::with_capacity(merged.len());
    for (_, param) in merged {
        uncle_hashes.push(param.uncle_hash.clone());
        indexes.push(param.index);
        hashes.push(param.hash.clone());
    }

    sqlx::query(
        "INSERT INTO transaction_forks (uncle_hash, index, hash)
         SELECT * FROM unnest($1::text[], $2::int[], $3::text[]) AS t(uncle_hash, index, hash)
         ON CONFLICT (uncle_hash, index) DO UPDATE SET hash = EXCLUDED.hash",
    )
    .bind(&uncle_hashes[..])
    .bind(&indexes[..])
    .bind(&hashes[..])
    .execute(&mut **tx)
    .await?;

    Ok(())
}
