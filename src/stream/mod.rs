pub mod batcher;

use std::collections::HashMap;

use anyhow::{bail, Result};
use tokio::sync::mpsc;

use crate::ledger::{AccountNamespace, EntryDelta};

/// Base units per whole solXEN token.
pub const SOL_XEN_DECIMALS: f64 = 1e9;

/// Channel capacity for a single subscription.
const SUBSCRIPTION_BUFFER: usize = 4_096;

/// One on-chain mining event: an incremental, append-only update
/// carrying per-account additive changes. Delivery is at-least-once
/// and ordered only within a single account's events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaEvent {
    pub slot: u64,
    /// Miner's Solana account, base58.
    pub sol_account: String,
    /// Associated Ethereum airdrop address, `0x`-prefixed hex.
    pub eth_account: String,
    pub hashes: u64,
    pub super_hashes: u64,
    /// Minted amount in base units.
    pub points: u128,
}

impl DeltaEvent {
    /// The account id this event keys on in the given namespace.
    pub fn account(&self, namespace: AccountNamespace) -> &str {
        match namespace {
            AccountNamespace::Solana => &self.sol_account,
            AccountNamespace::Ethereum => &self.eth_account,
        }
    }

    /// Ledger-shaped additive changes carried by this event.
    pub fn entry_delta(&self) -> EntryDelta {
        EntryDelta {
            hashes: self.hashes,
            super_hashes: self.super_hashes,
            points: self.points,
        }
    }
}

/// An opaque push source of delta events. Implementations own the
/// transport; subscribers only rely on per-account ordering within
/// one subscription.
pub trait EventSource: Send + Sync {
    /// Open a subscription for one source id (e.g. a program address).
    /// The subscription ends when the returned receiver is closed or
    /// the subscriber is dropped.
    fn subscribe(
        &self,
        source_id: &str,
    ) -> impl std::future::Future<Output = Result<mpsc::Receiver<DeltaEvent>>> + Send;
}

/// In-process event source backed by channels. Used to wire the
/// batcher to whatever transport feeds the process, and directly by
/// tests.
#[derive(Default)]
pub struct ChannelSource {
    subscribers: parking_lot::Mutex<HashMap<String, Vec<mpsc::Sender<DeltaEvent>>>>,
}

impl ChannelSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to every open subscription for `source_id`.
    /// Closed subscriptions are pruned; a full subscriber drops the
    /// event for that subscriber only.
    pub fn emit(&self, source_id: &str, event: DeltaEvent) {
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(source_id) else {
            return;
        };

        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            if tx.try_send(event.clone()).is_err() {
                tracing::warn!(source_id, "subscriber buffer full, event dropped");
            }
        }
    }

    /// Number of live subscriptions for `source_id`.
    pub fn subscriber_count(&self, source_id: &str) -> usize {
        let mut subscribers = self.subscribers.lock();
        match subscribers.get_mut(source_id) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }
}

impl EventSource for ChannelSource {
    async fn subscribe(&self, source_id: &str) -> Result<mpsc::Receiver<DeltaEvent>> {
        if source_id.is_empty() {
            bail!("source id must not be empty");
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .lock()
            .entry(source_id.to_string())
            .or_default()
            .push(tx);

        Ok(rx)
    }
}
