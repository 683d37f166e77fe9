//! Process-wide registry of wallet subaccounts.
//!
//! Constructed once at wallet startup and handed to every consumer as an
//! [`std::sync::Arc`]; there is no ambient singleton. All interior state is
//! guarded by the index's own lock, and each subaccount's balance ledger
//! sits behind its own serialization lock so reconciliation for different
//! subaccounts never contends.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use bitcoin::hashes::Hash;
use bitcoin::{Amount, PubkeyHash, ScriptBuf, WPubkeyHash};

use keel_config::Network;

use crate::balance::BalanceNode;
use crate::primitives::{AccountId, ChainPosition, KeyId, OwnerId, SubchainKey};

/// One registered subaccount: its chain, its owning identity and its
/// balance ledger. Immutable after creation apart from the ledger contents.
pub struct AccountEntry {
    account: AccountId,
    chain: Network,
    owner: OwnerId,
    balance: Arc<Mutex<BalanceNode>>,
}

impl AccountEntry {
    /// The subaccount id.
    pub fn account(&self) -> AccountId {
        self.account
    }

    /// The chain the subaccount lives on.
    pub fn chain(&self) -> Network {
        self.chain
    }

    /// The identity owning the subaccount.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

// per-subchain match state: the watched elements keyed by their byte string,
// the candidate scripts used to query filters, and the last position whose
// match results were applied.
#[derive(Default)]
struct SubchainWatch {
    elements: HashMap<Vec<u8>, u32>,
    queries: Vec<ScriptBuf>,
    last_match: Option<ChainPosition>,
}

#[derive(Default)]
struct IndexInner {
    entries: HashMap<AccountId, AccountEntry>,
    by_chain: HashMap<Network, BTreeSet<AccountId>>,
    by_owner: HashMap<OwnerId, BTreeSet<AccountId>>,
    subchains: HashMap<SubchainKey, SubchainWatch>,
}

/// Registry mapping subaccount identifiers to (chain, owning identity) and
/// back, plus the per-subchain watch sets driving filter queries and output
/// matching.
#[derive(Default)]
pub struct AccountIndex {
    inner: RwLock<IndexInner>,
}

impl AccountIndex {
    /// Create an empty index. Lives for the wallet's lifetime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subaccount. Returns `false` if the id is already taken;
    /// entries are immutable once created.
    pub fn register_account(&self, account: AccountId, chain: Network, owner: OwnerId) -> bool {
        let mut inner = self.write();
        if inner.entries.contains_key(&account) {
            return false;
        }

        inner.entries.insert(
            account,
            AccountEntry {
                account,
                chain,
                owner,
                balance: Arc::new(Mutex::new(BalanceNode::new(account))),
            },
        );
        inner.by_chain.entry(chain).or_default().insert(account);
        inner.by_owner.entry(owner).or_default().insert(account);

        tracing::info!("Registered {} on {} for {}", account, chain, owner);
        true
    }

    /// Add a watched 20-byte key-hash element for a subchain key. Candidate
    /// scripts for filter queries (legacy and segwit forms of the element)
    /// are derived here once.
    pub fn watch_element(&self, key: SubchainKey, index: u32, element: [u8; 20]) {
        let mut inner = self.write();
        let watch = inner.subchains.entry(key).or_default();
        if watch.elements.insert(element.to_vec(), index).is_none() {
            watch
                .queries
                .push(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(element)));
            watch
                .queries
                .push(ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array(element)));
        }
    }

    /// All subaccount ids, ascending.
    pub fn account_list(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> = self.read().entries.keys().copied().collect();
        accounts.sort_unstable();
        accounts
    }

    /// Look up one subaccount's (chain, owner) registration.
    pub fn lookup_account(&self, account: AccountId) -> Option<(Network, OwnerId)> {
        self.read()
            .entries
            .get(&account)
            .map(|entry| (entry.chain(), entry.owner()))
    }

    /// Subaccounts registered on a chain.
    pub fn accounts_for_chain(&self, chain: Network) -> Vec<AccountId> {
        self.read()
            .by_chain
            .get(&chain)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Subaccounts registered to an owner.
    pub fn accounts_for_owner(&self, owner: OwnerId) -> Vec<AccountId> {
        self.read()
            .by_owner
            .get(&owner)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every subchain key with at least one watched element, ascending. This
    /// is the set of scanning units the sync engine drives.
    pub fn subchain_keys(&self) -> Vec<SubchainKey> {
        let mut keys: Vec<SubchainKey> = self.read().subchains.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Candidate scripts to query a block filter with for one subchain.
    pub fn query_scripts(&self, key: &SubchainKey) -> Vec<ScriptBuf> {
        self.read()
            .subchains
            .get(key)
            .map(|watch| watch.queries.clone())
            .unwrap_or_default()
    }

    /// Resolve an extracted script element against a subchain's watch set.
    pub fn match_element(&self, key: &SubchainKey, element: &[u8]) -> Option<KeyId> {
        self.read()
            .subchains
            .get(key)?
            .elements
            .get(element)
            .map(|index| KeyId::from_parts(*key, *index))
    }

    /// Record the highest position whose match results were applied for a
    /// subchain. Regression (after a reorg) is accepted as-is.
    pub fn set_last_match(&self, key: SubchainKey, position: ChainPosition) {
        if let Some(watch) = self.write().subchains.get_mut(&key) {
            watch.last_match = Some(position);
        }
    }

    /// The highest applied match position for a subchain, if any.
    pub fn last_match(&self, key: &SubchainKey) -> Option<ChainPosition> {
        self.read().subchains.get(key).and_then(|watch| watch.last_match)
    }

    /// Lock and return a subaccount's balance ledger. The returned handle is
    /// the node's serialization lock; hold it across one reconciliation.
    pub fn balance_node(&self, account: AccountId) -> Option<Arc<Mutex<BalanceNode>>> {
        self.read()
            .entries
            .get(&account)
            .map(|entry| Arc::clone(&entry.balance))
    }

    /// Confirmed balance for one (owner, chain) pair: the sum of unspent
    /// coin values over every matching subaccount.
    pub fn balance(&self, owner: OwnerId, chain: Network) -> Amount {
        let inner = self.read();
        let Some(accounts) = inner.by_owner.get(&owner) else {
            return Amount::ZERO;
        };

        accounts
            .iter()
            .filter_map(|account| inner.entries.get(account))
            .filter(|entry| entry.chain() == chain)
            .fold(Amount::ZERO, |total, entry| {
                total + lock_node(&entry.balance).unspent_total()
            })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Lock a balance node, recovering the guard if a previous holder panicked.
pub fn lock_node(node: &Mutex<BalanceNode>) -> MutexGuard<'_, BalanceNode> {
    node.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use crate::primitives::Subchain;

    use super::*;

    fn owner(tag: u8) -> OwnerId {
        OwnerId([tag; 32])
    }

    #[test]
    fn register_and_lookup() {
        let index = AccountIndex::new();
        assert!(index.register_account(AccountId(1), Network::Regtest, owner(1)));
        assert!(!index.register_account(AccountId(1), Network::Mainnet, owner(2)));

        assert_eq!(
            index.lookup_account(AccountId(1)),
            Some((Network::Regtest, owner(1)))
        );
        assert_eq!(index.lookup_account(AccountId(9)), None);
        assert_eq!(index.account_list(), vec![AccountId(1)]);
    }

    #[test]
    fn reverse_indices() {
        let index = AccountIndex::new();
        index.register_account(AccountId(1), Network::Regtest, owner(1));
        index.register_account(AccountId(2), Network::Regtest, owner(1));
        index.register_account(AccountId(3), Network::Mainnet, owner(2));

        assert_eq!(
            index.accounts_for_chain(Network::Regtest),
            vec![AccountId(1), AccountId(2)]
        );
        assert_eq!(index.accounts_for_owner(owner(2)), vec![AccountId(3)]);
        assert!(index.accounts_for_owner(owner(9)).is_empty());
    }

    #[test]
    fn watch_elements_drive_matching() {
        let index = AccountIndex::new();
        index.register_account(AccountId(1), Network::Regtest, owner(1));
        let key = SubchainKey::from_parts(AccountId(1), Subchain::External);
        index.watch_element(key, 7, [0xab; 20]);

        assert_eq!(
            index.match_element(&key, &[0xab; 20]),
            Some(KeyId::from_parts(key, 7))
        );
        assert_eq!(index.match_element(&key, &[0xcd; 20]), None);
        // one legacy and one segwit candidate per element
        assert_eq!(index.query_scripts(&key).len(), 2);
        assert_eq!(index.subchain_keys(), vec![key]);

        // re-registering the same element must not duplicate queries
        index.watch_element(key, 7, [0xab; 20]);
        assert_eq!(index.query_scripts(&key).len(), 2);
    }

    #[test]
    fn balance_sums_over_owner_and_chain() {
        let index = AccountIndex::new();
        index.register_account(AccountId(1), Network::Regtest, owner(1));
        index.register_account(AccountId(2), Network::Mainnet, owner(1));

        let key = SubchainKey::from_parts(AccountId(1), Subchain::External);
        let node = index.balance_node(AccountId(1)).unwrap();
        lock_node(&node).process_unspent(
            crate::primitives::Coin::from_parts(bitcoin::Txid::from_byte_array([1; 32]), 0),
            KeyId::from_parts(key, 0),
            Amount::from_sat(1_500),
        );

        assert_eq!(index.balance(owner(1), Network::Regtest), Amount::from_sat(1_500));
        assert_eq!(index.balance(owner(1), Network::Mainnet), Amount::ZERO);
        assert_eq!(index.balance(owner(2), Network::Regtest), Amount::ZERO);
    }
}
