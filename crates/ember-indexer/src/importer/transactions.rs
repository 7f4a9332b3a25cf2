use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;

use super::TransactionParams;

/// Upsert transactions by hash. Collated rows replace everything (a
/// pending row transitioning to collated picks up its block and receipt
/// fields); pure-pending inserts never clobber an existing row.
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[TransactionParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    let mut collated: BTreeMap<&str, &TransactionParams> = BTreeMap::new();
    let mut pending: BTreeMap<&str, &TransactionParams> = BTreeMap::new();
    for param in params {
        if param.is_collated() {
            collated.insert(param.hash.as_str(), param);
            pending.remove(param.hash.as_str());
        } else if !collated.contains_key(param.hash.as_str()) {
            pending.insert(param.hash.as_str(), param);
        }
    }

    let collated: Vec<&TransactionParams> = collated.into_values().collect();
    let pending: Vec<&TransactionParams> = pending.into_values().collect();

    if !collated.is_empty() {
        upsert(tx, &collated, true).await?;
    }
    if !pending.is_empty() {
        upsert(tx, &pending, false).await?;
    }
    Ok(())
}

async fn upsert(
    tx: &mut Transaction<'_, Postgres>,
    params: &[&TransactionParams],
    replace_on_conflict: bool,
) -> Result<(), sqlx::Error> {
    let len = params.len();
    let mut hashes: Vec<String> = Vec::with_capacity(len);
    let mut nonces: Vec<i64> = Vec::with_capacity(len);
    let mut froms: Vec<String> = Vec::with_capacity(len);
    let mut tos: Vec<Option<String>> = Vec::with_capacity(len);
    let mut values: Vec<String> = Vec::with_capacity(len);
    let mut gases: Vec<String> = Vec::with_capacity(len);
    let mut gas_prices: Vec<String> = Vec::with_capacity(len);
    let mut inputs: Vec<Vec<u8>> = Vec::with_capacity(len);
    let mut vs: Vec<Option<String>> = Vec::with_capacity(len);
    let mut rs: Vec<Option<String>> = Vec::with_capacity(len);
    let mut ss: Vec<Option<String>> = Vec::with_capacity(len);
    let mut block_hashes: Vec<Option<String>> = Vec::with_capacity(len);
    let mut block_numbers: Vec<Option<i64>> = Vec::with_capacity(len);
    let mut indexes: Vec<Option<i32>> = Vec::with_capacity(len);
    let mut cumulative_gas: Vec<Option<String>> = Vec::with_capacity(len);
    let mut gas_useds: Vec<Option<String>> = Vec::with_capacity(len);
    let mut statuses: Vec<Option<i16>> = Vec::with_capacity(len);
    let mut errors: Vec<Option<String>> = Vec::with_capacity(len);
    let mut created_contracts: Vec<Option<String>> = Vec::with_capacity(len);

    for param in params {
        hashes.push(param.hash.clone());
        nonces.push(param.nonce);
        froms.push(param.from_address_hash.clone());
        tos.push(param.to_address_hash.clone());
        values.push(param.value.to_string());
        gases.push(param.gas.to_string());
        gas_prices.push(param.gas_price.to_string());
        inputs.push(param.input.clone());
        vs.push(param.v.as_ref().map(|v| v.to_string()));
        rs.push(param.r.as_ref().map(|r| r.to_string()));
        ss.push(param.s.as_ref().map(|s| s.to_string()));
        block_hashes.push(param.block_hash.clone());
        block_numbers.push(param.block_number);
        indexes.push(param.index);
        cumulative_gas.push(param.cumulative_gas_used.as_ref().map(|g| g.to_string()));
        gas_useds.push(param.gas_used.as_ref().map(|g| g.to_string()));
        statuses.push(param.status.map(|s| s.as_i16()));
        errors.push(param.error.clone());
        created_contracts.push(param.created_contract_address_hash.clone());
    }

    let conflict = if replace_on_conflict {
        "ON CONFLICT (hash) DO UPDATE SET
            nonce = EXCLUDED.nonce,
            from_address_hash = EXCLUDED.from_address_hash,
            to_address_hash = EXCLUDED.to_address_hash,
            value = EXCLUDED.value,
            gas = EXCLUDED.gas,
            gas_price = EXCLUDED.gas_price,
            input = EXCLUDED.input,
            v = EXCLUDED.v,
            r = EXCLUDED.r,
            s = EXCLUDED.s,
            block_hash = EXCLUDED.block_hash,
            block_number = EXCLUDED.block_number,
            index = EXCLUDED.index,
            cumulative_gas_used = EXCLUDED.cumulative_gas_used,
            gas_used = EXCLUDED.gas_used,
            status = EXCLUDED.status,
            error = EXCLUDED.error,
            created_contract_address_hash = EXCLUDED.created_contract_address_hash,
            updated_at = NOW()"
    } else {
        "ON CONFLICT (hash) DO NOTHING"
    };

    let sql = format!(
        "INSERT INTO transactions
            (hash, nonce, from_address_hash, to_address_hash, value, gas, gas_price, input,
             v, r, s, block_hash, block_number, index, cumulative_gas_used, gas_used,
             status, error, created_contract_address_hash, inserted_at, updated_at)
         SELECT hash, nonce, from_address_hash, to_address_hash, value::numeric, gas::numeric,
                gas_price::numeric, input, v::numeric, r::numeric, s::numeric, block_hash,
                block_number, index, cumulative_gas_used::numeric, gas_used::numeric,
                status, error, created_contract_address_hash, NOW(), NOW()
         FROM unnest($1::text[], $2::bigint[], $3::text[], $4::text[], $5::text[], $6::text[],
                     $7::text[], $8::bytea[], $9::text[], $10::text[], $11::text[], $12::text[],
                     $13::bigint[], $14::int[], $15::text[], $16::text[], $17::smallint[],
                     $18::text[], $19::text[])
            AS t(hash, nonce, from_address_hash, to_address_hash, value, gas, gas_price, input,
                 v, r, s, block_hash, block_number, index, cumulative_gas_used, gas_used,
                 status, error, created_contract_address_hash)
         {conflict}"
    );

    sqlx::query(&sql)
        .bind(&hashes[..])
        .bind(&nonces[..])
        .bind(&froms[..])
        .bind(&tos[..])
        .bind(&values[..])
        .bind(&gases[..])
        .bind(&gas_prices[..])
        .bind(&inputs[..])
        .bind(&vs[..])
        .bind(&rs[..])
        .bind(&ss[..])
        .bind(&block_hashes[..])
        .bind(&block_numbers[..])
        .bind(&indexes[..])
        .bind(&cumulative_gas[..])
        .bind(&gas_useds[..])
        .bind(&statuses[..])
        .bind(&errors[..])
        .bind(&created_contracts[..])
        .execute(&mut **tx)
        .await?;

    Ok(())
}
