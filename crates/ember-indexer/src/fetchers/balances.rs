use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use super::UNCLASSIFIED_RETRY_LIMIT;
use crate::buffered_task::{BatchRunner, RunOutcome};
use crate::events::BroadcastType;
use crate::importer::{AddressParams, CoinBalanceParams, ImportOptions, Importer};
use crate::rpc::{BalanceRequest, EthClient, RpcError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceEntry {
    pub address_hash: String,
    pub block_number: i64,
}

/// Fetches coin balances for addresses observed during import and writes
/// them back through the addresses + coin balances runners.
pub struct BalanceRunner {
    pool: PgPool,
    rpc: Arc<EthClient>,
    importer: Arc<Importer>,
}

impl BalanceRunner {
    pub fn new(pool: PgPool, rpc: Arc<EthClient>, importer: Arc<Importer>) -> Self {
        Self {
            pool,
            rpc,
            importer,
        }
    }
}

#[async_trait]
impl BatchRunner for BalanceRunner {
    type Entry = BalanceEntry;
    const NAME: &'static str = "balance_fetcher";

    fn init(&self, chunk_size: usize) -> BoxStream<'_, Result<Vec<BalanceEntry>, sqlx::Error>> {
        let pool = self.pool.clone();
        futures::stream::unfold((pool, 0i64), move |(pool, offset)| async move {
            let page = sqlx::query_as::<_, ember_common::CoinBalance>(
                "SELECT address_hash, block_number, value, value_fetched_at
                 FROM address_coin_balances
                 WHERE value_fetched_at IS NULL
                 ORDER BY address_hash, block_number
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
                        .map(|balance| BalanceEntry {
                            address_hash: balance.address_hash,
                            block_number: balance.block_number,
                        })
                        .collect();
                    Some((Ok(entries), (pool, next)))
                }
            }
        })
        .boxed()
    }

    async fn run(&self, batch: Vec<BalanceEntry>, retries: u32) -> RunOutcome<BalanceEntry> {
        // collapse duplicate addresses to their newest block; fetching the
        // same address at several neighbouring heights is wasted upserts
        let mut newest: HashMap<String, i64> = HashMap::new();
        for entry in batch {
            newest
                .entry(entry.address_hash)
                .and_modify(|block| *block = (*block).max(entry.block_number))
                .or_insert(entry.block_number);
        }
        let requests: Vec<BalanceRequest> = newest
            .into_iter()
            .map(|(address_hash, block_number)| BalanceRequest {
                address_hash,
                block_number,
            })
            .collect();

        let results = match self.rpc.fetch_balances(&requests).await {
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
                "dropping balance fetch for {} at {}: {}",
                request.address_hash,
                request.block_number,
                error
            );
        }

        if !results.fetched.is_empty() {
            let addresses: Vec<AddressParams> = results
                .fetched
                .iter()
                .map(|balance| AddressParams {
                    hash: balance.address_hash.clone(),
                    contract_code: None,
                    fetched_balance: Some(balance.value.clone()),
                    fetched_balance_block_number: Some(balance.block_number),
                })
                .collect();
            let coin_balances: Vec<CoinBalanceParams> = results
                .fetched
                .iter()
                .map(|balance| CoinBalanceParams {
                    address_hash: balance.address_hash.clone(),
                    block_number: balance.block_number,
                    value: Some(balance.value.clone()),
                })
                .collect();

            let options = ImportOptions {
                addresses,
                address_coin_balances: coin_balances,
                broadcast: Some(BroadcastType::Catchup),
                ..Default::default()
            };
            if let Err(error) = self.importer.all(options).await {
                return RunOutcome::Retry {
                    entries: results
                        .fetched
                        .iter()
                        .map(|balance| BalanceEntry {
                            address_hash: balance.address_hash.clone(),
                            block_number: balance.block_number,
                        })
                        .chain(results.retry.iter().map(|(request, _)| to_entry(request.clone())))
                        .collect(),
                    reason: format!("import failed: {error}"),
                };
            }
        }

        finish_round(results.retry, retries, to_entry)
    }
}

fn to_entry(request: BalanceRequest) -> BalanceEntry {
    BalanceEntry {
        address_hash: request.address_hash,
        block_number: request.block_number,
    }
}

/// Shared tail for the fetch runners: retry what is worth retrying, give
/// up on entries that keep drawing unclassified node errors.
pub(super) fn finish_round<P, E>(
    retry: Vec<(P, RpcError)>,
    retries: u32,
    to_entry: impl Fn(P) -> E,
) -> RunOutcome<E> {
    if retry.is_empty() {
        return RunOutcome::Ok;
    }
    let transient = retry.iter().any(|(_, error)| error.is_retryable());
    if !transient && retries >= UNCLASSIFIED_RETRY_LIMIT {
        return RunOutcome::Halt {
            reason: format!(
                "{} entries kept failing with node errors after {} rounds",
                retry.len(),
                retries
            ),
        };
    }
    let reason = retry
        .first()
        .map(|(_, error)| error.to_string())
        .unwrap_or_default();
    RunOutcome::Retry {
        entries: retry.into_iter().map(|(request, _)| to_entry(request)).collect(),
        reason,
    }
}
