use anyhow::Result;
use futures::StreamExt;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::address_extraction::{self, AddressSources};
use crate::buffered_task::BufferedTask;
use crate::config::Config;
use crate::events::BroadcastType;
use crate::fetchers::balances::{BalanceEntry, BalanceRunner};
use crate::fetchers::internal_transactions::{InternalTransactionRunner, TraceEntry};
use crate::fetchers::token_balances::{TokenBalanceEntry, TokenBalanceRunner};
use crate::importer::{CoinBalanceParams, ImportError, ImportOptions, Importer};
use crate::interval::BoundedInterval;
use crate::rpc::{EthClient, NextStatus, ReceiptBatch, ReceiptRequest, RpcError};
use crate::sequence::{BlockRange, Sequence};
use crate::token_transfers;

/// A catch-up worker walks away from a spinning range after this many
/// consecutive failures; the next pass re-derives the gap from the store.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum RangeError {
    #[error("fetching blocks failed: {0}")]
    Blocks(RpcError),

    #[error("fetching receipts failed: {0}")]
    Receipts(RpcError),

    #[error("import failed: {0}")]
    Import(#[from] ImportError),

    #[error("{0}")]
    Fatal(String),
}

/// The two indexing loops: catch-up walks historical gaps downwards from
/// the tip, realtime tracks the tip itself. Both funnel through
/// `import_range`, and overlapping work resolves through the importer's
/// keyed upserts.
pub struct BlockFetcher {
    pool: PgPool,
    rpc: Arc<EthClient>,
    importer: Arc<Importer>,
    config: Arc<Config>,
    balances: BufferedTask<BalanceRunner>,
    internal_transactions: BufferedTask<InternalTransactionRunner>,
    token_balances: BufferedTask<TokenBalanceRunner>,
}

impl BlockFetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        rpc: Arc<EthClient>,
        importer: Arc<Importer>,
        config: Arc<Config>,
        balances: BufferedTask<BalanceRunner>,
        internal_transactions: BufferedTask<InternalTransactionRunner>,
        token_balances: BufferedTask<TokenBalanceRunner>,
    ) -> Self {
        Self {
            pool,
            rpc,
            importer,
            config,
            balances,
            internal_transactions,
            token_balances,
        }
    }

    /// Catch-up loop: periodically look for missing consensus heights
    /// below the tip and backfill them. The timer doubles while the chain
    /// is fully indexed and snaps back once gaps reappear.
    pub async fn run_catchup(&self) -> Result<()> {
        let mut interval =
            BoundedInterval::new(self.config.block_interval, self.config.block_interval * 16);
        loop {
            tokio::time::sleep(interval.current()).await;
            match self.catchup_pass().await {
                Ok(0) => {
                    tracing::debug!("no missing blocks, backing off catch-up");
                    interval.increase();
                }
                Ok(missing) => {
                    tracing::info!("catch-up pass covered {} missing blocks", missing);
                    interval.decrease();
                }
                Err(error) => {
                    tracing::warn!("catch-up pass failed: {}", error);
                    interval.increase();
                }
            }
        }
    }

    async fn catchup_pass(&self) -> Result<u64> {
        let latest = self.rpc.fetch_block_number().await?;
        let first = latest.saturating_sub(1);
        let ranges = self.missing_block_number_ranges(first as i64).await?;
        let missing: u64 = ranges.iter().map(BlockRange::len).sum();
        if missing == 0 {
            return Ok(0);
        }
        tracing::info!(
            "catch-up: {} missing blocks below {} in {} ranges",
            missing,
            latest,
            ranges.len()
        );

        let sequence =
            Sequence::new_finite(&ranges, -(self.config.blocks_batch_size as i64));
        let workers = (0..self.config.blocks_concurrency).map(|_| {
            let sequence = sequence.clone();
            async move {
                let mut failures = 0u32;
                while let Some(range) = sequence.pop().await {
                    match self
                        .import_range(range, Some(&sequence), BroadcastType::Catchup)
                        .await
                    {
                        Ok(()) => failures = 0,
                        Err(error) => {
                            tracing::warn!("range {} failed: {}", range, error);
                            failures += 1;
                            if failures >= MAX_CONSECUTIVE_FAILURES {
                                tracing::warn!(
                                    "catch-up worker stopping after {} consecutive failures",
                                    failures
                                );
                                break;
                            }
                        }
                    }
                }
            }
        });
        futures::future::join_all(workers).await;
        Ok(missing)
    }

    /// Realtime loop: every half block interval (or sooner, when the WS
    /// subscription nudges), fetch the tip and the block after it. Tasks
    /// overlap freely; the conditional block upsert makes that idempotent.
    pub async fn run_realtime(self: Arc<Self>, mut nudge: watch::Receiver<u64>) -> Result<()> {
        let half = self.config.block_interval / 2;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(half) => {}
                changed = nudge.changed() => {
                    if changed.is_err() {
                        // subscription gone; stay on the timer alone
                        tokio::time::sleep(half).await;
                    }
                }
            }

            let latest = match self.rpc.fetch_block_number().await {
                Ok(latest) => latest,
                Err(error) => {
                    tracing::warn!("realtime tip lookup failed: {}", error);
                    continue;
                }
            };

            let fetcher = Arc::clone(&self);
            tokio::spawn(async move {
                let range = BlockRange::new(latest, latest + 1);
                if let Err(error) = fetcher
                    .import_range(range, None, BroadcastType::Realtime)
                    .await
                {
                    tracing::debug!("realtime range {} not imported: {}", range, error);
                }
            });
        }
    }

    /// Consensus gaps below `first`, highest ranges first, each walked
    /// downwards.
    async fn missing_block_number_ranges(&self, first: i64) -> Result<Vec<BlockRange>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT MAX(nr) AS first, MIN(nr) AS last
             FROM (
                 SELECT gs.nr, gs.nr - ROW_NUMBER() OVER (ORDER BY gs.nr) AS grp
                 FROM generate_series(0, $1::bigint) AS gs(nr)
                 LEFT JOIN blocks b ON b.number = gs.nr AND b.consensus
                 WHERE b.number IS NULL
             ) AS missing
             GROUP BY grp
             ORDER BY first DESC",
        )
        .bind(first)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let first: i64 = row.get("first");
                let last: i64 = row.get("last");
                BlockRange::new(first as u64, last as u64)
            })
            .collect())
    }

    /// Fetch, assemble, and import one range of blocks. On retryable
    /// failures the range goes back into the sequence (when there is
    /// one); invariant violations abort the range without requeueing.
    pub async fn import_range(
        &self,
        range: BlockRange,
        sequence: Option<&Sequence>,
        broadcast: BroadcastType,
    ) -> Result<(), RangeError> {
        let fetched = match self.rpc.fetch_blocks_by_range(range).await {
            Ok(fetched) => fetched,
            Err(error) => {
                if let Some(sequence) = sequence {
                    sequence.queue(range).await;
                }
                return Err(RangeError::Blocks(error));
            }
        };
        if fetched.next == NextStatus::EndOfChain {
            if let Some(sequence) = sequence {
                sequence.cap().await;
            }
        }
        if fetched.blocks.is_empty() {
            return Ok(());
        }

        let receipt_requests: Vec<ReceiptRequest> = fetched
            .transactions
            .iter()
            .map(|tx| ReceiptRequest {
                hash: tx.hash.clone(),
                block_number: tx.block_number.unwrap_or_default(),
                gas: Some(tx.gas.clone()),
            })
            .collect();
        let receipt_batch = match self.fetch_receipts_concurrently(&receipt_requests).await {
            Ok(batch) => batch,
            Err(error) => {
                if let Some(sequence) = sequence {
                    sequence.queue(range).await;
                }
                return Err(RangeError::Receipts(error));
            }
        };

        // the receipt join must be total; a hole here is not retryable
        let mut receipts_by_hash: HashMap<String, _> = receipt_batch
            .receipts
            .into_iter()
            .map(|receipt| (receipt.transaction_hash.clone(), receipt))
            .collect();
        let mut transactions = fetched.transactions;
        for tx in &mut transactions {
            let receipt = receipts_by_hash.remove(&tx.hash).ok_or_else(|| {
                RangeError::Fatal(format!("no receipt for transaction {}", tx.hash))
            })?;
            tx.cumulative_gas_used = Some(receipt.cumulative_gas_used);
            tx.gas_used = Some(receipt.gas_used);
            tx.status = Some(receipt.status);
            tx.created_contract_address_hash = receipt.created_contract_address_hash;
        }

        let parsed = token_transfers::parse(&receipt_batch.logs);

        let extracted = address_extraction::extract(&AddressSources {
            blocks: &fetched.blocks,
            transactions: &transactions,
            logs: &receipt_batch.logs,
            token_transfers: &parsed.transfers,
            ..Default::default()
        });

        // the balance-block map is carried separately; placeholder coin
        // balance rows let the balance fetcher re-derive dropped work
        let coin_balances: Vec<CoinBalanceParams> = extracted
            .balance_block_numbers
            .iter()
            .map(|(address_hash, block_number)| CoinBalanceParams {
                address_hash: address_hash.clone(),
                block_number: *block_number,
                value: None,
            })
            .collect();
        let balance_entries: Vec<BalanceEntry> = extracted
            .balance_block_numbers
            .iter()
            .map(|(address_hash, block_number)| BalanceEntry {
                address_hash: address_hash.clone(),
                block_number: *block_number,
            })
            .collect();
        let trace_entries: Vec<TraceEntry> = transactions
            .iter()
            .filter_map(|tx| {
                tx.block_number.map(|block_number| TraceEntry {
                    transaction_hash: tx.hash.clone(),
                    block_number,
                })
            })
            .collect();
        let token_balance_entries: Vec<TokenBalanceEntry> = parsed
            .balance_placeholders
            .iter()
            .map(|placeholder| TokenBalanceEntry {
                address_hash: placeholder.address_hash.clone(),
                token_contract_address_hash: placeholder.token_contract_address_hash.clone(),
                block_number: placeholder.block_number,
            })
            .collect();

        let options = ImportOptions {
            addresses: extracted.params,
            address_coin_balances: coin_balances,
            blocks: fetched.blocks,
            block_second_degree_relations: fetched.uncle_relations,
            transactions,
            logs: receipt_batch.logs,
            tokens: parsed.tokens,
            token_transfers: parsed.transfers,
            token_balances: parsed.balance_placeholders,
            broadcast: Some(broadcast),
            ..Default::default()
        };

        match self.importer.all(options).await {
            Ok(_imported) => {
                self.balances.buffer(balance_entries);
                self.internal_transactions.buffer(trace_entries);
                self.token_balances.buffer(token_balance_entries);
                tracing::debug!("imported range {}", range);
                Ok(())
            }
            Err(error) => {
                if let Some(sequence) = sequence {
                    sequence.queue(range).await;
                }
                Err(RangeError::Import(error))
            }
        }
    }

    /// Receipts are fetched in `receipts_batch_size` chunks with up to
    /// `receipts_concurrency` in flight; the first failing chunk sinks
    /// the whole call.
    async fn fetch_receipts_concurrently(
        &self,
        requests: &[ReceiptRequest],
    ) -> Result<ReceiptBatch, RpcError> {
        let mut batch = ReceiptBatch {
            receipts: Vec::with_capacity(requests.len()),
            logs: Vec::new(),
        };
        if requests.is_empty() {
            return Ok(batch);
        }

        let mut pending = Vec::new();
        for chunk in requests.chunks(self.config.receipts_batch_size) {
            pending.push(self.rpc.fetch_transaction_receipts(chunk));
        }
        let mut chunks =
            futures::stream::iter(pending).buffer_unordered(self.config.receipts_concurrency);

        while let Some(result) = chunks.next().await {
            let chunk = result?;
            batch.receipts.extend(chunk.receipts);
            batch.logs.extend(chunk.logs);
        }
        Ok(batch)
    }
}
