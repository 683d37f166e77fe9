//! Per-subaccount spent/unspent coin ledger.
//!
//! Scanning observes blocks in arbitrary temporal order: rescans replay old
//! blocks, reorgs re-deliver them, and a spend can surface before the
//! receipt that created the coin. The merge rules here are idempotent and
//! commutative with respect to replays of the same activity record.

use std::collections::HashMap;

use bitcoin::Amount;

use crate::primitives::{AccountId, Activity, Coin, KeyId};

/// The spent/unspent coin maps for one subaccount.
///
/// A coin is in exactly one of the two maps, or in neither if never
/// observed. The node is mutated only while its owner holds the node's own
/// lock; see [`crate::accounts::AccountIndex`].
#[derive(Debug)]
pub struct BalanceNode {
    account: AccountId,
    unspent: HashMap<Coin, (KeyId, Amount)>,
    spent: HashMap<Coin, (KeyId, Amount)>,
}

impl BalanceNode {
    /// Create an empty ledger for a subaccount.
    pub fn new(account: AccountId) -> Self {
        BalanceNode {
            account,
            unspent: HashMap::new(),
            spent: HashMap::new(),
        }
    }

    /// The subaccount this ledger belongs to.
    pub fn account(&self) -> AccountId {
        self.account
    }

    /// The single entry point mutating the coin maps. Applies every spent
    /// observation before any unspent observation: a spend is authoritative
    /// once observed, and applying it first means a receipt arriving in the
    /// same batch lands on the spent side where it belongs.
    ///
    /// Returns `true` when the ledger changed.
    pub fn associate_transaction(&mut self, unspent: &[Activity], spent: &[Activity]) -> bool {
        let mut changed = false;

        for activity in spent {
            changed |= self.process_spent(activity.coin(), activity.key(), activity.value());
        }
        for activity in unspent {
            changed |= self.process_unspent(activity.coin(), activity.key(), activity.value());
        }

        if changed {
            tracing::debug!(
                "{}: ledger now {} unspent / {} spent",
                self.account,
                self.unspent.len(),
                self.spent.len()
            );
        }

        changed
    }

    /// Record that `coin` was observed spent.
    ///
    /// If the coin is currently unspent it moves to the spent map carrying
    /// `max(incoming, recorded)` - the receipt is the authoritative source
    /// of the output's face value, and a spend observed after it must not
    /// lower what was recorded. If the coin was never observed (spend before
    /// receipt, normal under asynchronous scanning) it is inserted into the
    /// spent map directly, to be corrected when the receipt arrives.
    pub fn process_spent(&mut self, coin: Coin, key: KeyId, value: Amount) -> bool {
        let (key, value) = match self.unspent.remove(&coin) {
            Some((recorded_key, recorded_value)) => (recorded_key, value.max(recorded_value)),
            None => (key, value),
        };

        let previous = self.spent.insert(coin, (key, value));
        previous != Some((key, value))
    }

    /// Record that `coin` was observed as a spendable output.
    ///
    /// If the coin is already on the spent side the stored value is raised
    /// to `max(stored, incoming)` and the coin is NOT added to the unspent
    /// map; a coin must never appear spendable and already-spent at once.
    pub fn process_unspent(&mut self, coin: Coin, key: KeyId, value: Amount) -> bool {
        if let Some((spent_key, spent_value)) = self.spent.get_mut(&coin) {
            if value > *spent_value {
                *spent_value = value;
                *spent_key = key;
                return true;
            }
            return false;
        }

        let previous = self.unspent.insert(coin, (key, value));
        previous != Some((key, value))
    }

    /// Sum of all unspent coin values.
    pub fn unspent_total(&self) -> Amount {
        self.unspent
            .values()
            .fold(Amount::ZERO, |total, (_, value)| total + *value)
    }

    /// Look up an unspent coin.
    pub fn get_unspent(&self, coin: &Coin) -> Option<(KeyId, Amount)> {
        self.unspent.get(coin).copied()
    }

    /// Look up a spent coin.
    pub fn get_spent(&self, coin: &Coin) -> Option<(KeyId, Amount)> {
        self.spent.get(coin).copied()
    }

    /// Whether the ledger has ever observed this coin, on either side.
    pub fn contains(&self, coin: &Coin) -> bool {
        self.unspent.contains_key(coin) || self.spent.contains_key(coin)
    }

    #[cfg(test)]
    fn maps_are_disjoint(&self) -> bool {
        self.unspent.keys().all(|coin| !self.spent.contains_key(coin))
    }
}
