//! Module for primitive structs associated with the sync engine

use std::cmp::Ordering;
use std::fmt;

use bitcoin::hashes::Hash;
use bitcoin::{Amount, BlockHash, OutPoint, Txid};
use getset::CopyGetters;

use keel_config::Network;

/// A point on a block chain, identified by height and block hash.
///
/// Positions are totally ordered by height, with the hash as tiebreak so two
/// forks at equal height compare deterministically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct ChainPosition {
    /// Block height. `-1` for the pre-genesis sentinel.
    height: i64,
    /// Block hash at that height.
    hash: BlockHash,
}

impl ChainPosition {
    /// Sentinel for "before genesis". Every real position compares greater.
    pub fn null() -> Self {
        ChainPosition {
            height: -1,
            hash: BlockHash::all_zeros(),
        }
    }

    /// Creates a new position from parts.
    pub fn from_parts(height: i64, hash: BlockHash) -> Self {
        ChainPosition { height, hash }
    }

    /// The genesis position of the given chain.
    pub fn genesis(chain: Network) -> Self {
        ChainPosition {
            height: chain.genesis_height(),
            hash: chain.genesis_hash(),
        }
    }

    /// True for the pre-genesis sentinel.
    pub fn is_null(&self) -> bool {
        self.height < 0
    }
}

impl Ord for ChainPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for ChainPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChainPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.hash)
    }
}

/// Immutable identity of a spendable output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct Coin {
    /// ID of the transaction that created the output.
    txid: Txid,
    /// Index of the output within that transaction.
    index: u32,
}

impl Coin {
    /// Creates a new coin identity from parts.
    pub fn from_parts(txid: Txid, index: u32) -> Self {
        Coin { txid, index }
    }
}

impl From<OutPoint> for Coin {
    fn from(outpoint: OutPoint) -> Self {
        Coin {
            txid: outpoint.txid,
            index: outpoint.vout,
        }
    }
}

impl From<Coin> for OutPoint {
    fn from(coin: Coin) -> Self {
        OutPoint {
            txid: coin.txid,
            vout: coin.index,
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Identifier of a wallet subaccount.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub u32);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account-{}", self.0)
    }
}

/// Identity of the wallet owner a subaccount belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub [u8; 32]);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// A deterministic group of wallet addresses scanned as a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subchain {
    /// Receiving addresses.
    External,
    /// Change addresses.
    Internal,
}

/// Identifies one (subaccount, subchain) scanning unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct SubchainKey {
    /// The owning subaccount.
    account: AccountId,
    /// Which address group within the subaccount.
    subchain: Subchain,
}

impl SubchainKey {
    /// Creates a new subchain key from parts.
    pub fn from_parts(account: AccountId, subchain: Subchain) -> Self {
        SubchainKey { account, subchain }
    }
}

impl fmt::Display for SubchainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subchain {
            Subchain::External => write!(f, "{}/external", self.account),
            Subchain::Internal => write!(f, "{}/internal", self.account),
        }
    }
}

/// The wallet key an output matched against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, CopyGetters)]
#[getset(get_copy = "pub")]
pub struct KeyId {
    /// The (subaccount, subchain) the key belongs to.
    key: SubchainKey,
    /// Derivation index within the subchain.
    index: u32,
}

impl KeyId {
    /// Creates a new key id from parts.
    pub fn from_parts(key: SubchainKey, index: u32) -> Self {
        KeyId { key, index }
    }
}

/// One observed piece of wallet-relevant activity produced by scanning.
///
/// The same [`Coin`] may appear in both a spent and an unspent observation
/// depending on which block revealed it; reconciliation is the balance
/// node's job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, CopyGetters)]
pub struct Activity {
    /// The coin the observation is about.
    #[getset(get_copy = "pub")]
    coin: Coin,
    /// The wallet key that matched.
    #[getset(get_copy = "pub")]
    key: KeyId,
    /// Face value of the output, or [`Amount::ZERO`] when the observing
    /// block could not see it (a spend observed before its receipt).
    #[getset(get_copy = "pub")]
    value: Amount,
}

impl Activity {
    /// Creates a new activity record from parts.
    pub fn from_parts(coin: Coin, key: KeyId, value: Amount) -> Self {
        Activity { coin, key, value }
    }
}

/// Which of the two downloader instantiations a persisted tip belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DownloaderKind {
    /// The compact filter downloader.
    Filters,
    /// The block downloader.
    Blocks,
}

impl fmt::Display for DownloaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloaderKind::Filters => write!(f, "filters"),
            DownloaderKind::Blocks => write!(f, "blocks"),
        }
    }
}

/// Inbound events driving the sync loop, delivered over the message bus.
#[derive(Debug, Clone)]
pub enum SyncMessage {
    /// A new block was announced; wake the scanners.
    NewBlock(ChainPosition),
    /// The best chain reorganized; `parent` is the common ancestor that
    /// survives.
    Reorg {
        /// Highest position still on the best chain.
        parent: ChainPosition,
    },
    /// Re-examine a position that was already scanned clean, e.g. because a
    /// new key was added afterwards.
    Rescan {
        /// The subchain that needs the re-examination.
        key: SubchainKey,
        /// The position to re-examine.
        position: ChainPosition,
    },
    /// Cooperative shutdown request.
    Shutdown,
}

/// Outbound notifications published to the message bus. Framing for the wire
/// is the bus adapter's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// A downloader advanced its persisted tip.
    TipChanged {
        /// Which downloader advanced.
        kind: DownloaderKind,
        /// The new tip.
        position: ChainPosition,
    },
    /// A subchain's scan progress advanced. Debounced: only published when
    /// the value differs from the last published one.
    Progress {
        /// The subchain that progressed.
        key: SubchainKey,
        /// Highest position scanned clean.
        position: ChainPosition,
    },
    /// A subchain reached the verified filter tip.
    CaughtUp {
        /// The subchain that caught up.
        key: SubchainKey,
        /// The tip it reached.
        position: ChainPosition,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> BlockHash {
        BlockHash::from_byte_array([byte; 32])
    }

    #[test]
    fn position_orders_by_height_then_hash() {
        let low = ChainPosition::from_parts(5, hash(0xff));
        let high = ChainPosition::from_parts(6, hash(0x00));
        assert!(low < high);

        let fork_a = ChainPosition::from_parts(6, hash(0x01));
        let fork_b = ChainPosition::from_parts(6, hash(0x02));
        assert!(fork_a < fork_b);
    }

    #[test]
    fn null_position_precedes_genesis() {
        let genesis = ChainPosition::from_parts(0, hash(0xaa));
        assert!(ChainPosition::null() < genesis);
        assert!(ChainPosition::null().is_null());
        assert!(!genesis.is_null());
    }

    #[test]
    fn coin_round_trips_outpoint() {
        let coin = Coin::from_parts(Txid::from_byte_array([7u8; 32]), 3);
        let outpoint: OutPoint = coin.into();
        assert_eq!(Coin::from(outpoint), coin);
    }
}
