use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod address_extraction;
mod block_fetcher;
mod buffered_task;
mod config;
mod events;
mod fetchers;
mod importer;
mod interval;
mod memory;
mod rpc;
mod sequence;
mod token_transfers;

use block_fetcher::BlockFetcher;
use buffered_task::BufferedTask;
use events::EventBus;
use fetchers::balances::BalanceRunner;
use fetchers::internal_transactions::InternalTransactionRunner;
use fetchers::token_balances::TokenBalanceRunner;
use fetchers::token_metadata::TokenMetadataRunner;
use importer::Importer;
use memory::{MemoryMonitor, ShedQueue};
use rpc::{EthClient, RpcEndpoints};

/// Retry delays for exponential backoff (in seconds)
const RETRY_DELAYS: &[u64] = &[5, 10, 20, 30, 60];
const MAX_RETRY_DELAY: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ember_indexer=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Ember Indexer");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Arc::new(config::Config::from_env()?);

    // Create database pool
    let pool =
        ember_common::db::create_pool(&config.database_url, config.db_max_connections).await?;

    // Run migrations
    tracing::info!("Running database migrations");
    ember_common::db::run_migrations(&pool).await?;

    let bus = EventBus::new();
    let importer = Arc::new(Importer::new(pool.clone(), bus.clone()));

    let mut endpoints = RpcEndpoints::new(config.rpc_url.clone());
    if let Some(trace_url) = &config.trace_url {
        endpoints = endpoints.with_override("trace_replayTransaction", trace_url.clone());
    }
    let rpc = Arc::new(EthClient::new(
        endpoints,
        config.rpc_requests_per_second,
        config.rpc_timeout,
        config.rpc_max_batch_size,
    ));

    // Async fetchers, leaves first: the trace fetcher feeds the balance
    // fetcher with addresses it discovers inside traces
    let balances = BufferedTask::new(
        BalanceRunner::new(pool.clone(), rpc.clone(), importer.clone()),
        config.task_options(config.balances_batch_size, config.balances_concurrency),
    );
    let internal_transactions = BufferedTask::new(
        InternalTransactionRunner::new(
            pool.clone(),
            rpc.clone(),
            importer.clone(),
            balances.clone(),
        ),
        config.task_options(config.traces_batch_size, config.traces_concurrency),
    );
    let token_balances = BufferedTask::new(
        TokenBalanceRunner::new(pool.clone(), rpc.clone(), importer.clone()),
        config.task_options(
            config.token_balances_batch_size,
            config.token_balances_concurrency,
        ),
    );
    let token_metadata = BufferedTask::new(
        TokenMetadataRunner::new(pool.clone(), rpc.clone(), importer.clone()),
        config.task_options(
            config.token_metadata_batch_size,
            config.token_metadata_concurrency,
        ),
    );

    let _fetcher_handles = [
        balances.start(),
        internal_transactions.start(),
        token_balances.start(),
        token_metadata.start(),
    ];

    let mut monitor = MemoryMonitor::new(config.memory_limit);
    monitor.register(Arc::new(balances.clone()) as Arc<dyn ShedQueue>);
    monitor.register(Arc::new(internal_transactions.clone()) as Arc<dyn ShedQueue>);
    monitor.register(Arc::new(token_balances.clone()) as Arc<dyn ShedQueue>);
    monitor.register(Arc::new(token_metadata.clone()) as Arc<dyn ShedQueue>);
    let _monitor_handle = monitor.start();

    // WS subscription only nudges the realtime loop; polling continues
    // regardless
    let (nudge_tx, nudge_rx) = watch::channel(0u64);
    if let Some(ws_url) = config.ws_url.clone() {
        tokio::spawn(rpc::subscription::run_new_heads(ws_url, nudge_tx));
    } else {
        drop(nudge_tx);
    }

    let fetcher = Arc::new(BlockFetcher::new(
        pool.clone(),
        rpc,
        importer,
        config.clone(),
        balances,
        internal_transactions,
        token_balances,
    ));

    let catchup = {
        let fetcher = Arc::clone(&fetcher);
        tokio::spawn(async move { run_with_retry(|| fetcher.run_catchup()).await })
    };
    let realtime = {
        let fetcher = Arc::clone(&fetcher);
        tokio::spawn(async move {
            run_with_retry(move || Arc::clone(&fetcher).run_realtime(nudge_rx.clone())).await
        })
    };

    catchup.await??;
    realtime.await??;

    Ok(())
}

/// Run an async function with exponential backoff retry.
/// Transient errors are handled inside the loops with their own retry
/// logic; this outer retry is for catastrophic errors (DB failures, all
/// RPC retries exhausted, etc.)
async fn run_with_retry<F, Fut>(f: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut retry_count = 0;

    loop {
        match f().await {
            Ok(()) => {
                // Success - reset retry count and continue
                retry_count = 0;
            }
            Err(e) => {
                let delay = RETRY_DELAYS
                    .get(retry_count)
                    .copied()
                    .unwrap_or(MAX_RETRY_DELAY);

                tracing::error!(
                    "Fatal error (internal retries exhausted): {}. Restarting in {}s (attempt {})...",
                    e,
                    delay,
                    retry_count + 1
                );

                tokio::time::sleep(Duration::from_secs(delay)).await;
                retry_count += 1;
            }
        }
    }
}
