use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::buffered_task::{BatchRunner, RunOutcome};
use crate::importer::{ImportOptions, Importer, TokenParams, TokensConflict};
use crate::rpc::EthClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMetadataEntry {
    pub contract_address_hash: String,
    pub kind: String,
}

/// Catalogs token metadata out of band: tokens are registered bare during
/// import, then this runner reads name/symbol/decimals/totalSupply and
/// re-imports them with replace-all semantics.
pub struct TokenMetadataRunner {
    pool: PgPool,
    rpc: Arc<EthClient>,
    importer: Arc<Importer>,
}

impl TokenMetadataRunner {
    pub fn new(pool: PgPool, rpc: Arc<EthClient>, importer: Arc<Importer>) -> Self {
        Self {
            pool,
            rpc,
            importer,
        }
    }
}

#[async_trait]
impl BatchRunner for TokenMetadataRunner {
    type Entry = TokenMetadataEntry;
    const NAME: &'static str = "token_metadata_fetcher";

    fn init(
        &self,
        chunk_size: usize,
    ) -> BoxStream<'_, Result<Vec<TokenMetadataEntry>, sqlx::Error>> {
        let pool = self.pool.clone();
        futures::stream::unfold((pool, 0i64), move |(pool, offset)| async move {
            let page = sqlx::query_as::<_, ember_common::Token>(
                "SELECT contract_address_hash, name, symbol, decimals, total_supply, type,
                        cataloged, holder_count
                 FROM tokens
                 WHERE cataloged = FALSE
                 ORDER BY contract_address_hash
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
                        .map(|token| TokenMetadataEntry {
                            contract_address_hash: token.contract_address_hash,
                            kind: token.kind,
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
        batch: Vec<TokenMetadataEntry>,
        _retries: u32,
    ) -> RunOutcome<TokenMetadataEntry> {
        let mut kinds: HashMap<String, String> = HashMap::new();
        for entry in batch {
            kinds.insert(entry.contract_address_hash, entry.kind);
        }
        let contracts: Vec<String> = kinds.keys().cloned().collect();

        let metadata = match self.rpc.fetch_token_metadata(&contracts).await {
            Ok(metadata) => metadata,
            Err(error) => {
                return RunOutcome::Retry {
                    entries: kinds
                        .into_iter()
                        .map(|(contract_address_hash, kind)| TokenMetadataEntry {
                            contract_address_hash,
                            kind,
                        })
                        .collect(),
                    reason: error.to_string(),
                }
            }
        };

        let tokens: Vec<TokenParams> = metadata
            .into_iter()
            .map(|m| TokenParams {
                kind: kinds
                    .get(&m.contract_address_hash)
                    .cloned()
                    .unwrap_or_else(|| "ERC-20".to_string()),
                contract_address_hash: m.contract_address_hash,
                name: m.name,
                symbol: m.symbol,
                decimals: m.decimals,
                total_supply: m.total_supply,
                // even an all-None read counts as cataloged; many tokens
                // simply do not implement the metadata views
                cataloged: true,
            })
            .collect();

        let options = ImportOptions {
            tokens,
            tokens_on_conflict: TokensConflict::ReplaceAll,
            ..Default::default()
        };
        match self.importer.all(options).await {
            Ok(_) => RunOutcome::Ok,
            Err(error) => RunOutcome::Retry {
                entries: kinds
                    .into_iter()
                    .map(|(contract_address_hash, kind)| TokenMetadataEntry {
                        contract_address_hash,
                        kind,
                    })
                    .collect(),
                reason: format!("import failed: {error}"),
            },
        }
    }
}
