use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::buffered_task::BufferedTaskOptions;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub rpc_url: String,
    /// Separate endpoint for the tracer (usually an archive node).
    pub trace_url: Option<String>,
    pub ws_url: Option<String>,
    pub rpc_requests_per_second: u32,
    pub rpc_timeout: Duration,
    pub rpc_max_batch_size: usize,
    /// Nominal inter-block time of the chain.
    pub block_interval: Duration,
    pub blocks_batch_size: usize,
    pub blocks_concurrency: usize,
    pub receipts_batch_size: usize,
    pub receipts_concurrency: usize,
    pub flush_interval: Duration,
    pub init_chunk_size: usize,
    pub balances_batch_size: usize,
    pub balances_concurrency: usize,
    pub traces_batch_size: usize,
    pub traces_concurrency: usize,
    pub token_balances_batch_size: usize,
    pub token_balances_concurrency: usize,
    pub token_metadata_batch_size: usize,
    pub token_metadata_concurrency: usize,
    /// Soft limit on the aggregate fetcher backlog.
    pub memory_limit: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", "20")?,
            rpc_url: env::var("RPC_URL").context("RPC_URL must be set")?,
            trace_url: env::var("RPC_TRACE_URL").ok(),
            ws_url: env::var("RPC_WS_URL").ok(),
            rpc_requests_per_second: parse_env("RPC_REQUESTS_PER_SECOND", "100")?,
            rpc_timeout: Duration::from_secs(parse_env("RPC_TIMEOUT_SECS", "60")?),
            rpc_max_batch_size: parse_env("RPC_MAX_BATCH_SIZE", "250")?,
            block_interval: Duration::from_millis(parse_env("BLOCK_INTERVAL_MS", "5000")?),
            blocks_batch_size: parse_env("BLOCKS_BATCH_SIZE", "10")?,
            blocks_concurrency: parse_env("BLOCKS_CONCURRENCY", "10")?,
            receipts_batch_size: parse_env("RECEIPTS_BATCH_SIZE", "250")?,
            receipts_concurrency: parse_env("RECEIPTS_CONCURRENCY", "10")?,
            flush_interval: Duration::from_millis(parse_env("FETCHER_FLUSH_INTERVAL_MS", "3000")?),
            init_chunk_size: parse_env("FETCHER_INIT_CHUNK_SIZE", "1000")?,
            balances_batch_size: parse_env("BALANCES_BATCH_SIZE", "500")?,
            balances_concurrency: parse_env("BALANCES_CONCURRENCY", "4")?,
            traces_batch_size: parse_env("TRACES_BATCH_SIZE", "10")?,
            traces_concurrency: parse_env("TRACES_CONCURRENCY", "4")?,
            token_balances_batch_size: parse_env("TOKEN_BALANCES_BATCH_SIZE", "100")?,
            token_balances_concurrency: parse_env("TOKEN_BALANCES_CONCURRENCY", "4")?,
            token_metadata_batch_size: parse_env("TOKEN_METADATA_BATCH_SIZE", "50")?,
            token_metadata_concurrency: parse_env("TOKEN_METADATA_CONCURRENCY", "4")?,
            memory_limit: parse_env("MEMORY_LIMIT_BYTES", "1073741824")?,
        })
    }

    pub fn task_options(&self, max_batch_size: usize, max_concurrency: usize) -> BufferedTaskOptions {
        BufferedTaskOptions {
            flush_interval: self.flush_interval,
            max_batch_size,
            max_concurrency,
            init_chunk_size: self.init_chunk_size,
        }
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {key}"))
}
