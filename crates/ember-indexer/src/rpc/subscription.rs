use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use anyhow::Result;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::watch;

/// Reconnect delays after a dropped socket (in seconds)
const RECONNECT_DELAYS: &[u64] = &[5, 10, 20, 30, 60];

/// Subscribe to newHeads over WebSocket and push each head's number into
/// the realtime nudge channel, reconnecting forever. Best-effort only:
/// the realtime loop keeps polling on its own timer whether or not this
/// task is alive, so a dead socket degrades latency, never correctness.
pub async fn run_new_heads(ws_url: String, nudge: watch::Sender<u64>) {
    let mut attempt = 0usize;
    loop {
        match subscribe_once(&ws_url, &nudge).await {
            Ok(()) => {
                tracing::warn!("newHeads stream ended, resubscribing");
                attempt = 0;
            }
            Err(error) => {
                let delay = RECONNECT_DELAYS
                    .get(attempt)
                    .copied()
                    .unwrap_or(*RECONNECT_DELAYS.last().unwrap_or(&60));
                tracing::warn!(
                    "newHeads subscription failed: {}. Reconnecting in {}s...",
                    error,
                    delay
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;
                attempt += 1;
            }
        }
    }
}

async fn subscribe_once(ws_url: &str, nudge: &watch::Sender<u64>) -> Result<()> {
    let ws = WsConnect::new(ws_url.to_string());
    let provider = ProviderBuilder::new().connect_ws(ws).await?;

    let subscription = provider.subscribe_blocks().await?;
    let mut stream = subscription.into_stream();
    tracing::info!("newHeads subscription active on {}", ws_url);

    while let Some(header) = stream.next().await {
        // receivers only care that the tip moved
        let _ = nudge.send(header.number);
    }
    Ok(())
}
