use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use super::balances::{BalanceEntry, BalanceRunner};
use crate::address_extraction::{self, AddressSources};
use crate::buffered_task::{BatchRunner, BufferedTask, RunOutcome};
use crate::events::BroadcastType;
use crate::importer::{ImportOptions, Importer};
use crate::rpc::{EthClient, TraceRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub transaction_hash: String,
    pub block_number: i64,
}

/// Replays traces for collated transactions, imports the resulting
/// internal transactions, and feeds any newly-discovered addresses to the
/// balance fetcher.
pub struct InternalTransactionRunner {
    pool: PgPool,
    rpc: Arc<EthClient>,
    importer: Arc<Importer>,
    balances: BufferedTask<BalanceRunner>,
}

impl InternalTransactionRunner {
    pub fn new(
        pool: PgPool,
        rpc: Arc<EthClient>,
        importer: Arc<Importer>,
        balances: BufferedTask<BalanceRunner>,
    ) -> Self {
        Self {
            pool,
            rpc,
            importer,
            balances,
        }
    }
}

#[async_trait]
impl BatchRunner for InternalTransactionRunner {
    type Entry = TraceEntry;
    const NAME: &'static str = "internal_transaction_fetcher";

    fn init(&self, chunk_size: usize) -> BoxStream<'_, Result<Vec<TraceEntry>, sqlx::Error>> {
        let pool = self.pool.clone();
        futures::stream::unfold((pool, 0i64), move |(pool, offset)| async move {
            let page = sqlx::query_as::<_, (String, i64)>(
                "SELECT hash, block_number FROM transactions
                 WHERE internal_transactions_indexed_at IS NULL AND block_hash IS NOT NULL
                 ORDER BY hash
                 LIMIT $1 OFFSET $2",
            )
            .bind(chunk_size as i64)
            .bind(offset)
            .fetch_all(&pool)
            .await;

            match page {
                Err(error) => Some((Err(error), (pool, offset))),
                Ok(rows) if rows.is_empty() => None,
                Ok(rows) => {
                    let next = offset + rows.len() as i64;
                    let entries = rows
                        .into_iter()
                        .map(|(transaction_hash, block_number)| TraceEntry {
                            transaction_hash,
                            block_number,
                        })
                        .collect();
                    Some((Ok(entries), (pool, next)))
                }
            }
        })
        .boxed()
    }

    async fn run(&self, batch: Vec<TraceEntry>, retries: u32) -> RunOutcome<TraceEntry> {
        // a transaction only has one trace; duplicates mean the producer
        // saw it again in a neighbouring block import
        let mut unique: HashMap<String, i64> = HashMap::new();
        let total = batch.len();
        for entry in batch {
            if unique
                .insert(entry.transaction_hash.clone(), entry.block_number)
                .is_some()
            {
                tracing::warn!(
                    "duplicate trace request for transaction {}",
                    entry.transaction_hash
                );
            }
        }
        if unique.len() < total {
            tracing::warn!(
                "collapsed {} trace requests into {} unique transactions",
                total,
                unique.len()
            );
        }
        let requests: Vec<TraceRequest> = unique
            .into_iter()
            .map(|(transaction_hash, block_number)| TraceRequest {
                transaction_hash,
                block_number,
            })
            .collect();

        let results = match self.rpc.fetch_internal_transactions(&requests).await {
            Ok(results) => results,
            Err(error) => {
                return RunOutcome::Retry {
                    entries: requests.into_iter().map(to_entry).collect(),
                    reason: error.to_string(),
                }
            }
        };

        for (request, error) in &results.dropped {
            tracing::warn!(
                "dropping trace fetch for {}: {}",
                request.transaction_hash,
                error
            );
        }

        if !results.fetched.is_empty() {
            let extracted = address_extraction::extract(&AddressSources {
                internal_transactions: &results.fetched,
                ..Default::default()
            });
            // addresses first seen inside traces still need balances
            let derived: Vec<BalanceEntry> = extracted
                .balance_block_numbers
                .iter()
                .map(|(address_hash, block_number)| BalanceEntry {
                    address_hash: address_hash.clone(),
                    block_number: *block_number,
                })
                .collect();

            let options = ImportOptions {
                addresses: extracted.params,
                internal_transactions: results.fetched.clone(),
                broadcast: Some(BroadcastType::Catchup),
                ..Default::default()
            };
            if let Err(error) = self.importer.all(options).await {
                let mut entries: Vec<TraceEntry> = results
                    .fetched
                    .iter()
                    .map(|itx| TraceEntry {
                        transaction_hash: itx.transaction_hash.clone(),
                        block_number: itx.block_number.unwrap_or_default(),
                    })
                    .collect();
                entries.dedup_by(|a, b| a.transaction_hash == b.transaction_hash);
                entries.extend(results.retry.iter().map(|(request, _)| to_entry(request.clone())));
                return RunOutcome::Retry {
                    entries,
                    reason: format!("import failed: {error}"),
                };
            }
            self.balances.buffer(derived);
        }

        super::balances::finish_round(results.retry, retries, to_entry)
    }
}

fn to_entry(request: TraceRequest) -> TraceEntry {
    TraceEntry {
        transaction_hash: request.transaction_hash,
        block_number: request.block_number,
    }
}
