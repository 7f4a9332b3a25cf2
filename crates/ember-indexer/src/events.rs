use crate::importer::Imported;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Result groups that fan out to subscribers after a successful import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainEventGroup {
    Addresses,
    AddressCoinBalances,
    Blocks,
    InternalTransactions,
    Logs,
    TokenTransfers,
    Transactions,
}

impl ChainEventGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainEventGroup::Addresses => "addresses",
            ChainEventGroup::AddressCoinBalances => "address_coin_balances",
            ChainEventGroup::Blocks => "blocks",
            ChainEventGroup::InternalTransactions => "internal_transactions",
            ChainEventGroup::Logs => "logs",
            ChainEventGroup::TokenTransfers => "token_transfers",
            ChainEventGroup::Transactions => "transactions",
        }
    }
}

/// Which pipeline produced the import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastType {
    Catchup,
    Realtime,
}

#[derive(Clone)]
pub struct ChainEvent {
    pub group: ChainEventGroup,
    pub broadcast_type: BroadcastType,
    pub imported: Arc<Imported>,
}

/// In-process fan-out registry keyed by event group. Delivery is
/// fire-and-forget and at-most-once; closed subscribers are dropped on
/// the next publish.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<ChainEventGroup, Vec<mpsc::UnboundedSender<ChainEvent>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, group: ChainEventGroup) -> mpsc::UnboundedReceiver<ChainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().expect("event bus poisoned");
        subscribers.entry(group).or_default().push(tx);
        rx
    }

    /// Deliver one event per non-empty result group of `imported`.
    pub fn publish(&self, imported: Arc<Imported>, broadcast_type: BroadcastType) {
        let groups = [
            (ChainEventGroup::Addresses, !imported.addresses.is_empty()),
            (
                ChainEventGroup::AddressCoinBalances,
                !imported.address_coin_balances.is_empty(),
            ),
            (ChainEventGroup::Blocks, !imported.blocks.is_empty()),
            (
                ChainEventGroup::InternalTransactions,
                !imported.internal_transactions.is_empty(),
            ),
            (ChainEventGroup::Logs, !imported.logs.is_empty()),
            (
                ChainEventGroup::TokenTransfers,
                !imported.token_transfers.is_empty(),
            ),
            (ChainEventGroup::Transactions, !imported.transactions.is_empty()),
        ];

        let mut subscribers = self.subscribers.lock().expect("event bus poisoned");
        for (group, non_empty) in groups {
            if !non_empty {
                continue;
            }
            let Some(senders) = subscribers.get_mut(&group) else {
                continue;
            };
            senders.retain(|sender| {
                sender
                    .send(ChainEvent {
                        group,
                        broadcast_type,
                        imported: Arc::clone(&imported),
                    })
                    .is_ok()
            });
            tracing::trace!("chain_event {} delivered to {} subscribers", group.as_str(), senders.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::BlockParams;

    fn imported_with_block() -> Imported {
        let mut imported = Imported::default();
        imported.blocks.push(BlockParams::test_fixture(100, "0xaa"));
        imported
    }

    #[tokio::test]
    async fn publishes_to_every_subscriber_of_a_non_empty_group() {
        let bus = EventBus::new();
        let mut first = bus.subscribe(ChainEventGroup::Blocks);
        let mut second = bus.subscribe(ChainEventGroup::Blocks);
        let mut logs = bus.subscribe(ChainEventGroup::Logs);

        bus.publish(Arc::new(imported_with_block()), BroadcastType::Realtime);

        let event = first.try_recv().expect("first subscriber event");
        assert_eq!(event.group, ChainEventGroup::Blocks);
        assert_eq!(event.broadcast_type, BroadcastType::Realtime);
        assert_eq!(event.imported.blocks.len(), 1);
        assert!(second.try_recv().is_ok());
        // logs group was empty, nothing delivered
        assert!(logs.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_break_delivery() {
        let bus = EventBus::new();
        let dead = bus.subscribe(ChainEventGroup::Blocks);
        drop(dead);
        let mut live = bus.subscribe(ChainEventGroup::Blocks);

        bus.publish(Arc::new(imported_with_block()), BroadcastType::Catchup);
        assert!(live.try_recv().is_ok());
    }
}
