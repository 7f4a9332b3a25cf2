use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;

use super::TokenParams;

/// Conflict policy for the tokens runner. Import-discovered tokens use
/// `Nothing` so they never clobber cataloged metadata; the metadata
/// cataloger passes `ReplaceAll` when it has fresher data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokensConflict {
    #[default]
    Nothing,
    ReplaceAll,
}

/// Upsert tokens by contract_address_hash.
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[TokenParams],
    on_conflict: TokensConflict,
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    let mut merged: BTreeMap<&str, &TokenParams> = BTreeMap::new();
    for param in params {
        merged.insert(param.contract_address_hash.as_str(), param);
    }

    let len = merged.len();
    let mut contracts: Vec<String> = Vec::with_capacity(len);
    let mut names: Vec<Option<String>> = Vec::with_capacity(len);
    let mut symbols: Vec<Option<String>> = Vec::with_capacity(len);
    let mut decimals: Vec<Option<i16>> = Vec::with_capacity(len);
    let mut total_supplies: Vec<Option<String>> = Vec::with_capacity(len);
    let mut kinds: Vec<String> = Vec::with_capacity(len);
    let mut catalogeds: Vec<bool> = Vec::with_capacity(len);

    for (_, param) in merged {
        contracts.push(param.contract_address_hash.clone());
        names.push(param.name.clone());
        symbols.push(param.symbol.clone());
        decimals.push(param.decimals);
        total_supplies.push(param.total_supply.as_ref().map(|t| t.to_string()));
        kinds.push(param.kind.clone());
        catalogeds.push(param.cataloged);
    }

    let conflict = match on_conflict {
        TokensConflict::Nothing => "ON CONFLICT (contract_address_hash) DO NOTHING",
        TokensConflict::ReplaceAll => {
            "ON CONFLICT (contract_address_hash) DO UPDATE SET
                name = EXCLUDED.name,
                symbol = EXCLUDED.symbol,
                decimals = EXCLUDED.decimals,
                total_supply = EXCLUDED.total_supply,
                type = EXCLUDED.type,
                cataloged = EXCLUDED.cataloged"
        }
    };

    let sql = format!(
        "INSERT INTO tokens
            (contract_address_hash, name, symbol, decimals, total_supply, type, cataloged)
         SELECT contract_address_hash, name, symbol, decimals, total_supply::numeric, type, cataloged
         FROM unnest($1::text[], $2::text[], $3::text[], $4::smallint[], $5::text[],
                     $6::text[], $7::bool[])
            AS t(contract_address_hash, name, symbol, decimals, total_supply, type, cataloged)
         {conflict}"
    );

    sqlx::query(&sql)
        .bind(&contracts[..])
        .bind(&names[..])
        .bind(&symbols[..])
        .bind(&decimals[..])
        .bind(&total_supplies[..])
        .bind(&kinds[..])
        .bind(&catalogeds[..])
        .execute(&mut **tx)
        .await?;

    Ok(())
}
