use bigdecimal::BigDecimal;
use sqlx::{Postgres, Row, Transaction};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::BlockParams;

/// Blocks runner: repair consensus around the incoming batch, then upsert
/// the blocks themselves.
///
/// Every multi-row mutation locks its rows in the canonical key order so
/// concurrent imports over overlapping heights cannot deadlock.
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[BlockParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    // dedupe by hash (realtime and catch-up may both deliver a block)
    let mut by_hash: BTreeMap<&str, &BlockParams> = BTreeMap::new();
    for param in params {
        by_hash.insert(param.hash.as_str(), param);
    }
    let blocks: Vec<&BlockParams> = by_hash.into_values().collect();

    let consensus: Vec<&BlockParams> = blocks.iter().copied().filter(|b| b.consensus).collect();
    let consensus_numbers: Vec<i64> = {
        let set: BTreeSet<i64> = consensus.iter().map(|b| b.number).collect();
        set.into_iter().collect()
    };
    let consensus_hashes: Vec<String> = consensus.iter().map(|b| b.hash.clone()).collect();
    let all_hashes: Vec<String> = blocks.iter().map(|b| b.hash.clone()).collect();
    let nonconsensus_hashes: Vec<String> = blocks
        .iter()
        .filter(|b| !b.consensus)
        .map(|b| b.hash.clone())
        .collect();

    let forked_hashes =
        derive_transaction_forks(tx, &consensus_numbers, &consensus_hashes, &nonconsensus_hashes)
            .await?;

    let mut affected_numbers: BTreeSet<i64> = BTreeSet::new();
    affected_numbers.extend(lose_consensus(tx, &consensus_numbers, &all_hashes).await?);
    affected_numbers.extend(lose_invalid_neighbour_consensus(tx, &consensus, &all_hashes).await?);
    let affected_numbers: Vec<i64> = affected_numbers.into_iter().collect();

    remove_nonconsensus_data(tx, &affected_numbers).await?;
    fork_transactions(tx, &forked_hashes).await?;

    let mut affected_pairs: BTreeSet<(String, String)> = BTreeSet::new();
    affected_pairs.extend(delete_address_token_balances(tx, &affected_numbers).await?);
    let deleted_current = delete_address_current_token_balances(tx, &affected_numbers).await?;
    affected_pairs.extend(
        deleted_current
            .iter()
            .map(|(address, token, _)| (address.clone(), token.clone())),
    );

    let derived = derive_address_current_token_balances(tx, &affected_pairs).await?;

    let deltas = holder_count_deltas(
        deleted_current.iter().map(|(_, token, value)| (token.as_str(), value)),
        derived.iter().map(|(_, token, value)| (token.as_str(), value)),
    );
    update_token_holder_counts(tx, &deltas).await?;

    delete_rewards(tx, &nonconsensus_hashes, &consensus_numbers).await?;
    upsert_blocks(tx, &blocks).await?;
    mark_uncles_fetched(tx, &all_hashes).await?;
    refresh_internal_transaction_block_numbers(tx, &all_hashes).await?;

    Ok(())
}

/// Snapshot transactions that are about to lose their block into
/// transaction_forks, keyed by the losing block hash. Rows lock in
/// (uncle_hash, index) order.
async fn derive_transaction_forks(
    tx: &mut Transaction<'_, Postgres>,
    consensus_numbers: &[i64],
    consensus_hashes: &[String],
    nonconsensus_hashes: &[String],
) -> Result<Vec<String>, sqlx::Error> {
    if consensus_numbers.is_empty() && nonconsensus_hashes.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "INSERT INTO transaction_forks (uncle_hash, index, hash)
         SELECT t.block_hash, t.index, t.hash
         FROM (
             SELECT hash, block_hash, index
             FROM transactions
             WHERE (block_number = ANY($1) AND NOT (block_hash = ANY($2)))
                OR block_hash = ANY($3)
             ORDER BY block_hash, index
             FOR UPDATE
         ) AS t
         ON CONFLICT (uncle_hash, index) DO UPDATE SET hash = EXCLUDED.hash
         RETURNING hash",
    )
    .bind(consensus_numbers)
    .bind(consensus_hashes)
    .bind(nonconsensus_hashes)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows.iter().map(|row| row.get("hash")).collect())
}

/// Demote persisted blocks that share a height with an incoming consensus
/// block. Returns the affected heights.
async fn lose_consensus(
    tx: &mut Transaction<'_, Postgres>,
    consensus_numbers: &[i64],
    incoming_hashes: &[String],
) -> Result<Vec<i64>, sqlx::Error> {
    if consensus_numbers.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "UPDATE blocks SET consensus = FALSE, updated_at = NOW()
         FROM (
             SELECT hash, number FROM blocks
             WHERE number = ANY($1) AND consensus AND NOT (hash = ANY($2))
             ORDER BY hash
             FOR UPDATE
         ) AS locked
         WHERE blocks.hash = locked.hash
         RETURNING locked.number",
    )
    .bind(consensus_numbers)
    .bind(incoming_hashes)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows.iter().map(|row| row.get("number")).collect())
}

/// Demote persisted neighbours whose parent linkage contradicts an
/// incoming consensus block. Returns the affected heights.
async fn lose_invalid_neighbour_consensus(
    tx: &mut Transaction<'_, Postgres>,
    consensus: &[&BlockParams],
    incoming_hashes: &[String],
) -> Result<Vec<i64>, sqlx::Error> {
    if consensus.is_empty() {
        return Ok(Vec::new());
    }

    let numbers: Vec<i64> = consensus.iter().map(|b| b.number).collect();
    let hashes: Vec<String> = consensus.iter().map(|b| b.hash.clone()).collect();
    let parent_hashes: Vec<String> = consensus.iter().map(|b| b.parent_hash.clone()).collect();

    let rows = sqlx::query(
        "UPDATE blocks SET consensus = FALSE, updated_at = NOW()
         FROM (
             SELECT hash, number FROM blocks
             WHERE hash IN (
                 SELECT b.hash
                 FROM blocks b
                 JOIN unnest($1::bigint[], $2::text[], $3::text[])
                    AS incoming(number, hash, parent_hash)
                   ON (b.number = incoming.number - 1 AND b.hash <> incoming.parent_hash)
                   OR (b.number = incoming.number + 1 AND b.parent_hash <> incoming.hash)
                 WHERE b.consensus
             ) AND NOT (hash = ANY($4))
             ORDER BY hash
             FOR UPDATE
         ) AS locked
         WHERE blocks.hash = locked.hash
         RETURNING locked.number",
    )
    .bind(&numbers)
    .bind(&hashes)
    .bind(&parent_hashes)
    .bind(incoming_hashes)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows.iter().map(|row| row.get("number")).collect())
}

/// Delete token transfers, logs, and internal transactions of demoted
/// heights; they belong to blocks that are no longer canonical.
async fn remove_nonconsensus_data(
    tx: &mut Transaction<'_, Postgres>,
    numbers: &[i64],
) -> Result<(), sqlx::Error> {
    if numbers.is_empty() {
        return Ok(());
    }

    sqlx::query(
        "DELETE FROM token_transfers
         USING (
             SELECT transaction_hash, log_index FROM token_transfers
             WHERE block_number = ANY($1)
             ORDER BY transaction_hash, log_index
             FOR UPDATE
         ) AS locked
         WHERE token_transfers.transaction_hash = locked.transaction_hash
           AND token_transfers.log_index = locked.log_index",
    )
    .bind(numbers)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "DELETE FROM logs
         USING (
             SELECT transaction_hash, index FROM logs
             WHERE block_number = ANY($1)
             ORDER BY transaction_hash, index
             FOR UPDATE
         ) AS locked
         WHERE logs.transaction_hash = locked.transaction_hash
           AND logs.index = locked.index",
    )
    .bind(numbers)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "DELETE FROM internal_transactions
         USING (
             SELECT transaction_hash, index FROM internal_transactions
             WHERE block_number = ANY($1)
             ORDER BY transaction_hash, index
             FOR UPDATE
         ) AS locked
         WHERE internal_transactions.transaction_hash = locked.transaction_hash
           AND internal_transactions.index = locked.index",
    )
    .bind(numbers)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Forked transactions become pending again: all collation fields null.
async fn fork_transactions(
    tx: &mut Transaction<'_, Postgres>,
    forked_hashes: &[String],
) -> Result<(), sqlx::Error> {
    if forked_hashes.is_empty() {
        return Ok(());
    }

    sqlx::query(
        "UPDATE transactions SET
            block_hash = NULL,
            block_number = NULL,
            gas_used = NULL,
            cumulative_gas_used = NULL,
            index = NULL,
            status = NULL,
            error = NULL,
            created_contract_address_hash = NULL,
            internal_transactions_indexed_at = NULL,
            updated_at = NOW()
         FROM (
             SELECT hash FROM transactions
             WHERE hash = ANY($1)
             ORDER BY hash
             FOR UPDATE
         ) AS locked
         WHERE transactions.hash = locked.hash",
    )
    .bind(forked_hashes)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn delete_address_token_balances(
    tx: &mut Transaction<'_, Postgres>,
    numbers: &[i64],
) -> Result<Vec<(String, String)>, sqlx::Error> {
    if numbers.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "DELETE FROM address_token_balances
         USING (
             SELECT address_hash, token_contract_address_hash, block_number
             FROM address_token_balances
             WHERE block_number = ANY($1)
             ORDER BY address_hash, token_contract_address_hash, block_number
             FOR UPDATE
         ) AS locked
         WHERE address_token_balances.address_hash = locked.address_hash
           AND address_token_balances.token_contract_address_hash = locked.token_contract_address_hash
           AND address_token_balances.block_number = locked.block_number
         RETURNING address_token_balances.address_hash,
                   address_token_balances.token_contract_address_hash",
    )
    .bind(numbers)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("address_hash"), row.get("token_contract_address_hash")))
        .collect())
}

async fn delete_address_current_token_balances(
    tx: &mut Transaction<'_, Postgres>,
    numbers: &[i64],
) -> Result<Vec<(String, String, Option<BigDecimal>)>, sqlx::Error> {
    if numbers.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        "DELETE FROM address_current_token_balances
         USING (
             SELECT address_hash, token_contract_address_hash
             FROM address_current_token_balances
             WHERE block_number = ANY($1)
             ORDER BY address_hash, token_contract_address_hash
             FOR UPDATE
         ) AS locked
         WHERE address_current_token_balances.address_hash = locked.address_hash
           AND address_current_token_balances.token_contract_address_hash = locked.token_contract_address_hash
         RETURNING address_current_token_balances.address_hash,
                   address_current_token_balances.token_contract_address_hash,
                   address_current_token_balances.value",
    )
    .bind(numbers)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get("address_hash"),
                row.get("token_contract_address_hash"),
                row.get("value"),
            )
        })
        .collect())
}

/// Rebuild current balances for the affected pairs from whatever token
/// balance rows remain, newest block per pair.
async fn derive_address_current_token_balances(
    tx: &mut Transaction<'_, Postgres>,
    pairs: &BTreeSet<(String, String)>,
) -> Result<Vec<(String, String, Option<BigDecimal>)>, sqlx::Error> {
    if pairs.is_empty() {
        return Ok(Vec::new());
    }

    let addresses: Vec<String> = pairs.iter().map(|(address, _)| address.clone()).collect();
    let tokens: Vec<String> = pairs.iter().map(|(_, token)| token.clone()).collect();

    let rows = sqlx::query(
        "INSERT INTO address_current_token_balances
            (address_hash, token_contract_address_hash, block_number, value, value_fetched_at)
         SELECT DISTINCT ON (address_hash, token_contract_address_hash)
                address_hash, token_contract_address_hash, block_number, value, value_fetched_at
         FROM address_token_balances
         WHERE (address_hash, token_contract_address_hash) IN (
             SELECT * FROM unnest($1::text[], $2::text[])
         )
         ORDER BY address_hash, token_contract_address_hash, block_number DESC
         RETURNING address_hash, token_contract_address_hash, value",
    )
    .bind(&addresses)
    .bind(&tokens)
    .fetch_all(&mut **tx)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            (
                row.get("address_hash"),
                row.get("token_contract_address_hash"),
                row.get("value"),
            )
        })
        .collect())
}

/// Net holder-count change per token: -1 for each deleted current balance
/// that held value, +1 for each re-derived one that does.
fn holder_count_deltas<'a>(
    deleted: impl Iterator<Item = (&'a str, &'a Option<BigDecimal>)>,
    derived: impl Iterator<Item = (&'a str, &'a Option<BigDecimal>)>,
) -> Vec<(String, i64)> {
    let zero = BigDecimal::from(0);
    let mut deltas: HashMap<&str, i64> = HashMap::new();
    for (token, value) in deleted {
        if value.as_ref().is_some_and(|v| *v > zero) {
            *deltas.entry(token).or_default() -= 1;
        }
    }
    for (token, value) in derived {
        if value.as_ref().is_some_and(|v| *v > zero) {
            *deltas.entry(token).or_default() += 1;
        }
    }
    let mut out: Vec<(String, i64)> = deltas
        .into_iter()
        .filter(|(_, delta)| *delta != 0)
        .map(|(token, delta)| (token.to_string(), delta))
        .collect();
    out.sort();
    out
}

async fn update_token_holder_counts(
    tx: &mut Transaction<'_, Postgres>,
    deltas: &[(String, i64)],
) -> Result<(), sqlx::Error> {
    if deltas.is_empty() {
        return Ok(());
    }

    let tokens: Vec<String> = deltas.iter().map(|(token, _)| token.clone()).collect();
    let amounts: Vec<i64> = deltas.iter().map(|(_, delta)| *delta).collect();

    sqlx::query(
        "UPDATE tokens SET holder_count = tokens.holder_count + updates.delta
         FROM (
             SELECT t.contract_address_hash, u.delta
             FROM tokens t
             JOIN unnest($1::text[], $2::bigint[]) AS u(hash, delta)
               ON t.contract_address_hash = u.hash
             ORDER BY t.contract_address_hash
             FOR UPDATE OF t
         ) AS updates
         WHERE tokens.contract_address_hash = updates.contract_address_hash",
    )
    .bind(&tokens)
    .bind(&amounts)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Wipe block rewards: by hash for incoming non-consensus blocks, by
/// height for consensus replacements.
async fn delete_rewards(
    tx: &mut Transaction<'_, Postgres>,
    nonconsensus_hashes: &[String],
    consensus_numbers: &[i64],
) -> Result<(), sqlx::Error> {
    if nonconsensus_hashes.is_empty() && consensus_numbers.is_empty() {
        return Ok(());
    }

    sqlx::query(
        "DELETE FROM block_rewards
         USING (
             SELECT address_hash, address_type, block_hash FROM block_rewards
             WHERE block_hash = ANY($1)
                OR block_hash IN (SELECT hash FROM blocks WHERE number = ANY($2))
             ORDER BY address_hash, address_type, block_hash
             FOR UPDATE
         ) AS locked
         WHERE block_rewards.address_hash = locked.address_hash
           AND block_rewards.address_type = locked.address_type
           AND block_rewards.block_hash = locked.block_hash",
    )
    .bind(nonconsensus_hashes)
    .bind(consensus_numbers)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Upsert the incoming blocks by hash. The update only fires when some
/// observed field actually changed, which keeps overlapping realtime and
/// catch-up imports idempotent.
async fn upsert_blocks(
    tx: &mut Transaction<'_, Postgres>,
    blocks: &[&BlockParams],
) -> Result<(), sqlx::Error> {
    let mut hashes: Vec<String> = Vec::with_capacity(blocks.len());
    let mut numbers: Vec<i64> = Vec::with_capacity(blocks.len());
    let mut parent_hashes: Vec<String> = Vec::with_capacity(blocks.len());
    let mut miners: Vec<String> = Vec::with_capacity(blocks.len());
    let mut timestamps: Vec<i64> = Vec::with_capacity(blocks.len());
    let mut difficulties: Vec<Option<String>> = Vec::with_capacity(blocks.len());
    let mut total_difficulties: Vec<Option<String>> = Vec::with_capacity(blocks.len());
    let mut gas_useds: Vec<i64> = Vec::with_capacity(blocks.len());
    let mut gas_limits: Vec<i64> = Vec::with_capacity(blocks.len());
    let mut sizes: Vec<Option<i64>> = Vec::with_capacity(blocks.len());
    let mut nonces: Vec<Option<String>> = Vec::with_capacity(blocks.len());
    let mut consensuses: Vec<bool> = Vec::with_capacity(blocks.len());
    let mut indexed_ats: Vec<Option<chrono::DateTime<chrono::Utc>>> =
        Vec::with_capacity(blocks.len());
    for block in blocks {
        hashes.push(block.hash.clone());
        numbers.push(block.number);
        parent_hashes.push(block.parent_hash.clone());
        miners.push(block.miner_hash.clone());
        timestamps.push(block.timestamp);
        difficulties.push(block.difficulty.as_ref().map(|d| d.to_string()));
        total_difficulties.push(block.total_difficulty.as_ref().map(|d| d.to_string()));
        gas_useds.push(block.gas_used);
        gas_limits.push(block.gas_limit);
        sizes.push(block.size);
        nonces.push(block.nonce.clone());
        consensuses.push(block.consensus);
        indexed_ats.push(block.internal_transactions_indexed_at);
    }

    sqlx::query(
        "INSERT INTO blocks
            (hash, number, parent_hash, miner_hash, timestamp, difficulty, total_difficulty,
             gas_used, gas_limit, size, nonce, consensus, internal_transactions_indexed_at,
             inserted_at, updated_at)
         SELECT hash, number, parent_hash, miner_hash, timestamp, difficulty::numeric,
                total_difficulty::numeric, gas_used, gas_limit, size, nonce, consensus,
                internal_transactions_indexed_at, NOW(), NOW()
         FROM unnest($1::text[], $2::bigint[], $3::text[], $4::text[], $5::bigint[], $6::text[],
                     $7::text[], $8::bigint[], $9::bigint[], $10::bigint[], $11::text[],
                     $12::bool[], $13::timestamptz[])
            AS t(hash, number, parent_hash, miner_hash, timestamp, difficulty,
                 total_difficulty, gas_used, gas_limit, size, nonce, consensus,
                 internal_transactions_indexed_at)
         ON CONFLICT (hash) DO UPDATE SET
            number = EXCLUDED.number,
            parent_hash = EXCLUDED.parent_hash,
            miner_hash = EXCLUDED.miner_hash,
            timestamp = EXCLUDED.timestamp,
            difficulty = EXCLUDED.difficulty,
            total_difficulty = EXCLUDED.total_difficulty,
            gas_used = EXCLUDED.gas_used,
            gas_limit = EXCLUDED.gas_limit,
            size = EXCLUDED.size,
            nonce = EXCLUDED.nonce,
            consensus = EXCLUDED.consensus,
            internal_transactions_indexed_at = EXCLUDED.internal_transactions_indexed_at,
            updated_at = NOW()
         WHERE (blocks.consensus, blocks.difficulty, blocks.gas_limit, blocks.gas_used,
                blocks.miner_hash, blocks.nonce, blocks.number, blocks.parent_hash,
                blocks.size, blocks.timestamp, blocks.total_difficulty,
                blocks.internal_transactions_indexed_at)
            IS DISTINCT FROM
               (EXCLUDED.consensus, EXCLUDED.difficulty, EXCLUDED.gas_limit, EXCLUDED.gas_used,
                EXCLUDED.miner_hash, EXCLUDED.nonce, EXCLUDED.number, EXCLUDED.parent_hash,
                EXCLUDED.size, EXCLUDED.timestamp, EXCLUDED.total_difficulty,
                EXCLUDED.internal_transactions_indexed_at)",
    )
    .bind(&hashes[..])
    .bind(&numbers[..])
    .bind(&parent_hashes[..])
    .bind(&miners[..])
    .bind(&timestamps[..])
    .bind(&difficulties[..])
    .bind(&total_difficulties[..])
    .bind(&gas_useds[..])
    .bind(&gas_limits[..])
    .bind(&sizes[..])
    .bind(&nonces[..])
    .bind(&consensuses[..])
    .bind(&indexed_ats[..])
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Stamp uncle relations whose uncle body just arrived in this batch.
async fn mark_uncles_fetched(
    tx: &mut Transaction<'_, Postgres>,
    incoming_hashes: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE block_second_degree_relations SET uncle_fetched_at = NOW()
         FROM (
             SELECT nephew_hash, uncle_hash FROM block_second_degree_relations
             WHERE uncle_hash = ANY($1) AND uncle_fetched_at IS NULL
             ORDER BY nephew_hash, uncle_hash
             FOR UPDATE
         ) AS locked
         WHERE block_second_degree_relations.nephew_hash = locked.nephew_hash
           AND block_second_degree_relations.uncle_hash = locked.uncle_hash",
    )
    .bind(incoming_hashes)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Refresh the denormalized block_number on traces whose parent
/// transactions are collated to blocks in this batch.
async fn refresh_internal_transaction_block_numbers(
    tx: &mut Transaction<'_, Postgres>,
    incoming_hashes: &[String],
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE internal_transactions SET block_number = refreshed.block_number
         FROM (
             SELECT i.transaction_hash, i.index, t.block_number
             FROM internal_transactions i
             JOIN transactions t ON t.hash = i.transaction_hash
             WHERE t.block_hash = ANY($1)
             ORDER BY i.transaction_hash, i.index
             FOR UPDATE OF i
         ) AS refreshed
         WHERE internal_transactions.transaction_hash = refreshed.transaction_hash
           AND internal_transactions.index = refreshed.index",
    )
    .bind(incoming_hashes)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(v: i64) -> Option<BigDecimal> {
        Some(BigDecimal::from(v))
    }

    #[test]
    fn holder_deltas_cancel_when_pair_is_rederived() {
        let deleted = vec![("0xtoken".to_string(), value(5))];
        let derived = vec![("0xtoken".to_string(), value(3))];
        let deltas = holder_count_deltas(
            deleted.iter().map(|(t, v)| (t.as_str(), v)),
            derived.iter().map(|(t, v)| (t.as_str(), v)),
        );
        assert!(deltas.is_empty());
    }

    #[test]
    fn holder_deltas_count_losses_and_gains() {
        let deleted = vec![
            ("0xa".to_string(), value(5)),
            ("0xa".to_string(), value(2)),
            ("0xb".to_string(), value(0)),
        ];
        let derived = vec![("0xc".to_string(), value(1))];
        let deltas = holder_count_deltas(
            deleted.iter().map(|(t, v)| (t.as_str(), v)),
            derived.iter().map(|(t, v)| (t.as_str(), v)),
        );
        assert_eq!(deltas, vec![("0xa".to_string(), -2), ("0xc".to_string(), 1)]);
    }

    #[test]
    fn holder_deltas_ignore_null_and_zero_values() {
        let deleted = vec![("0xa".to_string(), None), ("0xb".to_string(), value(0))];
        let derived: Vec<(String, Option<BigDecimal>)> = Vec::new();
        let deltas = holder_count_deltas(
            deleted.iter().map(|(t, v)| (t.as_str(), v)),
            derived.iter().map(|(t, v)| (t.as_str(), v)),
        );
        assert!(deltas.is_empty());
    }
}
