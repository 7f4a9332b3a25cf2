use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;

use super::LogParams;

/// Upsert event logs by (transaction_hash, index).
pub(super) async fn run(
    tx: &mut Transaction<'_, Postgres>,
    params: &[LogParams],
) -> Result<(), sqlx::Error> {
    if params.is_empty() {
        return Ok(());
    }

    let mut merged: BTreeMap<(&str, i32), &LogParams> = BTreeMap::new();
    for param in params {
        merged.insert((param.transaction_hash.as_str(), param.index), param);
    }

    let len = merged.len();
    let mut tx_hashes: Vec<String> = Vec::with_capacity(len);
    let mut indexes: Vec<i32> = Vec::with_capacity(len);
    let mut addresses: Vec<String> = Vec::with_capacity(len);
    let mut datas: Vec<Vec<u8>> = Vec::with_capacity(len);
    let mut first_topics: Vec<Option<String>> = Vec::with_capacity(len);
    let mut second_topics: Vec<Option<String>> = Vec::with_capacity(len);
    let mut third_topics: Vec<Option<String>> = Vec::with_capacity(len);
    let mut fourth_topics: Vec<Option<String>> = Vec::with_capacity(len);
    let mut block_numbers: Vec<Option<i64>> = Vec::with_capacity(len);

    for (_, param) in merged {
        tx_hashes.push(param.transaction_hash.clone());
        indexes.push(param.index);
        addresses.push(param.address_hash.clone());
        datas.push(param.data.clone());
        first_topics.push(param.first_topic.clone());
        second_topics.push(param.second_topic.clone());
        third_topics.push(param.third_topic.clone());
        fourth_topics.push(param.fourth_topic.clone());
        block_numbers.push(param.block_number);
    }

    sqlx::query(
        "INSERT INTO logs
            (transaction_hash, index, address_hash, data, first_topic, second_topic,
             third_topic, fourth_topic, block_number)
         SELECT * FROM unnest($1::text[], $2::int[], $3::text[], $4::bytea[], $5::text[],
                              $6::text[], $7::text[], $8::text[], $9::bigint[])
            AS t(transaction_hash, index, address_hash, data, first_topic, second_topic,
                 third_topic, fourth_topic, block_number)
         ON CONFLICT (transaction_hash, index) DO UPDATE SET
            address_hash = EXCLUDED.address_hash,
            data = EXCLUDED.data,
            first_topic = EXCLUDED.first_topic,
            second_topic = EXCLUDED.second_topic,
            third_topic = EXCLUDED.third_topic,
            fourth_topic = EXCLUDED.fourth_topic,
            block_number = EXCLUDED.block_number",
    )
    .bind(&tx_hashes[..])
    .bind(&indexes[..])
    .bind(&addresses[..])
    .bind(&datas[..])
    .bind(&first_topics[..])
    .bind(&second_topics[..])
    .bind(&third_topics[..])
    .bind(&fourth_topics[..])
    .bind(&block_numbers[..])
    .execute(&mut **tx)
    .await?;

    Ok(())
}
