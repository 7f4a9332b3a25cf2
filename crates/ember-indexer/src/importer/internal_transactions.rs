use sqlx::{Postgres, Transaction};
use std::collections::{BTreeMap, BTreeSet};

use super::InternalTransactionParams;

/// Upsert internal transactions by (transaction_hash, index), then stamp
/// the parent transactions as trace-indexed.
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[InternalTransactionParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    let mut merged: BTreeMap<(&str, i32), &InternalTransactionParams> = BTreeMap::new();
    for param in params {
        merged.insert((param.transaction_hash.as_str(), param.index), param);
    }

    let len = merged.len();
    let mut tx_hashes: Vec<String> = Vec::with_capacity(len);
    let mut indexes: Vec<i32> = Vec::with_capacity(len);
    let mut kinds: Vec<String> = Vec::with_capacity(len);
    let mut call_types: Vec<Option<String>> = Vec::with_capacity(len);
    let mut froms: Vec<String> = Vec::with_capacity(len);
    let mut tos: Vec<Option<String>> = Vec::with_capacity(len);
    let mut created_contracts: Vec<Option<String>> = Vec::with_capacity(len);
    let mut values: Vec<String> = Vec::with_capacity(len);
    let mut gases: Vec<Option<String>> = Vec::with_capacity(len);
    let mut gas_useds: Vec<Option<String>> = Vec::with_capacity(len);
    let mut inputs: Vec<Option<Vec<u8>>> = Vec::with_capacity(len);
    let mut inits: Vec<Option<Vec<u8>>> = Vec::with_capacity(len);
    let mut outputs: Vec<Option<Vec<u8>>> = Vec::with_capacity(len);
    let mut created_codes: Vec<Option<Vec<u8>>> = Vec::with_capacity(len);
    let mut trace_addresses: Vec<String> = Vec::with_capacity(len);
    let mut errors: Vec<Option<String>> = Vec::with_capacity(len);
    let mut block_numbers: Vec<Option<i64>> = Vec::with_capacity(len);

    for (_, param) in merged {
        tx_hashes.push(param.transaction_hash.clone());
        indexes.push(param.index);
        kinds.push(param.kind.as_str().to_string());
        call_types.push(param.call_type.map(|c| c.as_str().to_string()));
        froms.push(param.from_address_hash.clone());
        tos.push(param.to_address_hash.clone());
        created_contracts.push(param.created_contract_address_hash.clone());
        values.push(param.value.to_string());
        gases.push(param.gas.as_ref().map(|g| g.to_string()));
        gas_useds.push(param.gas_used.as_ref().map(|g| g.to_string()));
        inputs.push(param.input.clone());
        inits.push(param.init.clone());
        outputs.push(param.output.clone());
        created_codes.push(param.created_contract_code.clone());
        // int[] literals survive the text[] transport
        trace_addresses.push(format!(
            "{{{}}}",
            param
                .trace_address
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",")
        ));
        errors.push(param.error.clone());
        block_numbers.push(param.block_number);
    }

    sqlx::query(
        "INSERT INTO internal_transactions
            (transaction_hash, index, type, call_type, from_address_hash, to_address_hash,
             created_contract_address_hash, value, gas, gas_used, input, init, output,
             created_contract_code, trace_address, error, block_number)
         SELECT transaction_hash, index, type, call_type, from_address_hash, to_address_hash,
                created_contract_address_hash, value::numeric, gas::numeric, gas_used::numeric,
                input, init, output, created_contract_code, trace_address::int[], error, block_number
         FROM unnest($1::text[], $2::int[], $3::text[], $4::text[], $5::text[], $6::text[],
                     $7::text[], $8::text[], $9::text[], $10::text[], $11::bytea[], $12::bytea[],
                     $13::bytea[], $14::bytea[], $15::text[], $16::text[], $17::bigint[])
            AS t(transaction_hash, index, type, call_type, from_address_hash, to_address_hash,
                 created_contract_address_hash, value, gas, gas_used, input, init, output,
                 created_contract_code, trace_address, error, block_number)
         ON CONFLICT (transaction_hash, index) DO UPDATE SET
            type = EXCLUDED.type,
            call_type = EXCLUDED.call_type,
            from_address_hash = EXCLUDED.from_address_hash,
            to_address_hash = EXCLUDED.to_address_hash,
            created_contract_address_hash = EXCLUDED.created_contract_address_hash,
            value = EXCLUDED.value,
            gas = EXCLUDED.gas,
            gas_used = EXCLUDED.gas_used,
            input = EXCLUDED.input,
            init = EXCLUDED.init,
            output = EXCLUDED.output,
            created_contract_code = EXCLUDED.created_contract_code,
            trace_address = EXCLUDED.trace_address,
            error = EXCLUDED.error,
            block_number = EXCLUDED.block_number",
    )
    .bind(&tx_hashes[..])
    .bind(&indexes[..])
    .bind(&kinds[..])
    .bind(&call_types[..])
    .bind(&froms[..])
    .bind(&tos[..])
    .bind(&created_contracts[..])
    .bind(&values[..])
    .bind(&gases[..])
    .bind(&gas_useds[..])
    .bind(&inputs[..])
    .bind(&inits[..])
    .bind(&outputs[..])
    .bind(&created_codes[..])
    .bind(&trace_addresses[..])
    .bind(&errors[..])
    .bind(&block_numbers[..])
    .execute(&mut **tx)
    .await?;

    let parents: Vec<String> = tx_hashes
        .into_iter()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();
    sqlx::query(
        "UPDATE transactions SET internal_transactions_indexed_at = NOW(), updated_at = NOW()
         FROM (
             SELECT hash FROM transactions
             WHERE hash = ANY($1)
             ORDER BY hash
             FOR UPDATE
         ) AS locked
         WHERE transactions.hash = locked.hash",
    )
    .bind(&parents)
    .execute(&mut **tx)
    .await?;

    // a block is trace-indexed once none of its transactions still wait
    sqlx::query(
        "UPDATE blocks SET internal_transactions_indexed_at = NOW(), updated_at = NOW()
         FROM (
             SELECT hash FROM blocks
             WHERE hash IN (
                 SELECT block_hash FROM transactions
                 WHERE hash = ANY($1) AND block_hash IS NOT NULL
             )
               AND internal_transactions_indexed_at IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM transactions t
                   WHERE t.block_hash = blocks.hash
                     AND t.internal_transactions_indexed_at IS NULL
               )
             ORDER BY hash
             FOR UPDATE
         ) AS locked
         WHERE blocks.hash = locked.hash",
    )
    .bind(&parents)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
