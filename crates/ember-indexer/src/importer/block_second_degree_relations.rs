use sqlx::{Postgres, Transaction};
use std::collections::BTreeSet;

use super::UncleRelationParams;

/// Upsert uncle relations by (nephew_hash, uncle_hash).
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[UncleRelationParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    let unique: BTreeSet<(&str, &str)> = params
        .iter()
        .map(|p| (p.nephew_hash.as_str(), p.uncle_hash.as_str()))
        .collect();

    let mut nephews: Vec<String> = Vec::with_capacity(unique.len());
    let mut uncles: Vec<String> = Vec::with_capacity(unique.len());
    for (nephew, uncle) in unique {
        nephews.push(nephew.to_string());
        uncles.push(uncle.to_string());
    }

    sqlx::query(
        "INSERT INTO block_second_degree_relations (nephew_hash, uncle_hash)
         SELECT * FROM unnest($1::text[], $2::text[]) AS t(nephew_hash, uncle_hash)
         ON CONFLICT (nephew_hash, uncle_hash) DO NOTHING",
    )
    .bind(&nephews[..])
    .bind(&uncles[..])
    .execute(&mut **tx)
    .await?;

    Ok(())
}
