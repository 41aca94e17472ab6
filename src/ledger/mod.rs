use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Account namespace tracked by the leaderboard. Solana addresses are
/// base58 and case-sensitive; Ethereum addresses are hex and compared
/// lower-cased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountNamespace {
    Solana,
    Ethereum,
}

impl AccountNamespace {
    /// Infer the namespace from an address's shape (`0x` + 40 hex
    /// chars is Ethereum, anything else Solana).
    pub fn of(account: &str) -> Self {
        if account.len() == 42 && account.starts_with("0x") {
            Self::Ethereum
        } else {
            Self::Solana
        }
    }

    /// Canonical index key for an account in this namespace.
    pub fn normalize(self, account: &str) -> String {
        match self {
            Self::Solana => account.to_string(),
            Self::Ethereum => account.to_lowercase(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Solana => "solana",
            Self::Ethereum => "ethereum",
        }
    }
}

/// One ranked leaderboard row, owned exclusively by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub account: String,
    pub rank: u32,
    pub hashes: u64,
    pub super_hashes: u64,
    /// Airdrop points (Ethereum namespace).
    pub points: u128,
    /// Minted solXEN in base units (Solana namespace).
    pub sol_xen: u128,
    pub hash_rate: f64,
    pub last_active: Option<DateTime<Utc>>,
}

/// Additive per-account changes carried by one or more delta events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryDelta {
    pub hashes: u64,
    pub super_hashes: u64,
    pub points: u128,
}

/// Ordered ranked entries plus an account→position index.
///
/// The index is derived data: it is rebuilt wholesale on every
/// `replace` and never patched. Deltas mutate entries in place through
/// the index; rank and display order are allowed to go stale until the
/// next poll replaces the whole table.
#[derive(Debug)]
pub struct LeaderboardLedger {
    namespace: AccountNamespace,
    entries: Vec<LedgerEntry>,
    index: HashMap<String, usize>,
}

impl LeaderboardLedger {
    pub fn new(namespace: AccountNamespace) -> Self {
        Self {
            namespace,
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn namespace(&self) -> AccountNamespace {
        self.namespace
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Install a new ordered entry sequence for `namespace` and
    /// rebuild the index in one pass.
    pub fn replace(&mut self, namespace: AccountNamespace, entries: Vec<LedgerEntry>) {
        let mut index = HashMap::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            index.insert(namespace.normalize(&entry.account), position);
        }

        self.namespace = namespace;
        self.entries = entries;
        self.index = index;
    }

    /// Position of `account` in the current entry sequence, if tracked.
    pub fn lookup(&self, account: &str) -> Option<usize> {
        self.index
            .get(&self.namespace.normalize(account))
            .copied()
    }

    /// Add a delta to the tracked account's entry in place. Unknown
    /// accounts are a silent no-op: entries are only ever created by a
    /// full replace, and re-ranking waits for the next poll.
    pub fn apply_delta(&mut self, account: &str, delta: EntryDelta) {
        let Some(position) = self.lookup(account) else {
            return;
        };

        let Some(entry) = self.entries.get_mut(position) else {
            return;
        };

        entry.hashes = entry.hashes.saturating_add(delta.hashes);
        entry.super_hashes = entry.super_hashes.saturating_add(delta.super_hashes);
        match self.namespace {
            AccountNamespace::Ethereum => {
                entry.points = entry.points.saturating_add(delta.points);
            }
            AccountNamespace::Solana => {
                entry.sol_xen = entry.sol_xen.saturating_add(delta.points);
            }
        }
    }
}
