use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;

use crate::buffered_task::{BatchRunner, RunOutcome};
use crate::importer::{ImportOptions, Importer, TokenBalanceParams};
use crate::rpc::{EthClient, TokenBalanceRequest};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenBalanceEntry {
    pub address_hash: String,
    pub token_contract_address_hash: String,
    pub block_number: i64,
}

/// Reads balanceOf(holder) for token balance placeholders created during
/// import and writes the values plus the current-balance projection.
pub struct TokenBalanceRunner {
    pool: PgPool,
    rpc: Arc<EthClient>,
    importer: Arc<Importer>,
}

impl TokenBalanceRunner {
    pub fn new(pool: PgPool, rpc: Arc<EthClient>, importer: Arc<Importer>) -> Self {
        Self {
            pool,
            rpc,
            importer,
        }
    }
}

#[async_trait]
impl BatchRunner for TokenBalanceRunner {
    type Entry = TokenBalanceEntry;
    const NAME: &'static str = "token_balance_fetcher";

    fn init(
        &self,
        chunk_size: usize,
    ) -> BoxStream<'_, Result<Vec<TokenBalanceEntry>, sqlx::Error>> {
        let pool = self.pool.clone();
        futures::stream::unfold((pool, 0i64), move |(pool, offset)| async move {
            let page = sqlx::query_as::<_, ember_common::TokenBalance>(
                "SELECT address_hash, token_contract_address_hash, block_number, value, value_fetched_at
                 FROM address_token_balances
                 WHERE value_fetched_at IS NULL
                 ORDER BY address_hash, token_contract_address_hash, block_number
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
                        .map(|balance| TokenBalanceEntry {
                            address_hash: balance.address_hash,
                            token_contract_address_hash: balance.token_contract_address_hash,
                            block_number: balance.block_number,
                        })
                        .collect();
                    Some((Ok(entries), (pool, next)))
                }
            }
        })
        .boxed()
    }

    async fn run(
        &self,
        batch: Vec<TokenBalanceEntry>,
        retries: u32,
    ) -> RunOutcome<TokenBalanceEntry> {
        let unique: HashSet<TokenBalanceEntry> = batch.into_iter().collect();
        let requests: Vec<TokenBalanceRequest> = unique
            .into_iter()
            .map(|entry| TokenBalanceRequest {
                address_hash: entry.address_hash,
                token_contract_address_hash: entry.token_contract_address_hash,
                block_number: entry.block_number,
            })
            .collect();

        let results = match self.rpc.fetch_token_balances(&requests).await {
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
                "dropping token balance fetch for {} on {}: {}",
                request.address_hash,
                request.token_contract_address_hash,
                error
            );
        }

        if !results.fetched.is_empty() {
            let fetched_at = Utc::now();
            let balances: Vec<TokenBalanceParams> = results
                .fetched
                .iter()
                .map(|balance| TokenBalanceParams {
                    address_hash: balance.address_hash.clone(),
                    token_contract_address_hash: balance.token_contract_address_hash.clone(),
                    block_number: balance.block_number,
                    value: Some(balance.value.clone()),
                    value_fetched_at: Some(fetched_at),
                })
                .collect();

            let options = ImportOptions {
                token_balances: balances.clone(),
                current_token_balances: balances,
                ..Default::default()
            };
            if let Err(error) = self.importer.all(options).await {
                return RunOutcome::Retry {
                    entries: results
                        .fetched
                        .iter()
                        .map(|balance| TokenBalanceEntry {
                            address_hash: balance.address_hash.clone(),
                            token_contract_address_hash: balance
                                .token_contract_address_hash
                                .clone(),
                            block_number: balance.block_number,
                        })
                        .chain(results.retry.iter().map(|(request, _)| to_entry(request.clone())))
                        .collect(),
                    reason: format!("import failed: {error}"),
                };
            }
        }

        super::balances::finish_round(results.retry, retries, to_entry)
    }
}

fn to_entry(request: TokenBalanceRequest) -> TokenBalanceEntry {
    TokenBalanceEntry {
        address_hash: request.address_hash,
        token_contract_address_hash: request.token_contract_address_hash,
        block_number: request.block_number,
    }
}
