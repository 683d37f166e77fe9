//! Traits for interfacing the sync engine with its external collaborators:
//! the header oracle, the peer layer and the wallet's persistent store.

use std::fmt::Debug;

use bitcoin::bip158::FilterHeader;
use bitcoin::Block;

use crate::client::FilterBundle;
use crate::primitives::{ChainPosition, DownloaderKind};
use crate::scan::BatchReport;

/// Read-only view of the canonical best chain, maintained externally.
///
/// The engine only ever takes snapshot reads; positions returned here are
/// immutable values and require no further coordination.
pub trait HeaderOracle {
    /// The current best tip.
    fn best_tip(&self) -> ChainPosition;

    /// Positions on the best chain strictly above `from`, ascending, capped
    /// at `limit`. When `from` is no longer on the best chain the walk
    /// starts above the highest ancestor of `from` that still is.
    fn best_chain(&self, from: &ChainPosition, limit: usize) -> Vec<ChainPosition>;

    /// The path from `from` toward `to`: the highest position at-or-below
    /// `from` that lies on the chain of `to` (the common ancestor,
    /// inclusive), followed by its descendants up to `to`, ascending and
    /// capped at `limit`.
    fn ancestors(
        &self,
        from: &ChainPosition,
        to: &ChainPosition,
        limit: usize,
    ) -> Vec<ChainPosition>;

    /// Whether `position` lies on the current best chain.
    fn is_in_best_chain(&self, position: &ChainPosition) -> bool;
}

/// The peer layer serving payload downloads. Connection management, peer
/// selection and misbehavior accounting all live behind this seam.
#[async_trait::async_trait]
pub trait PeerService: Send + Sync {
    /// Errors associated with the peer transport
    type Error: Debug + Send;

    /// Fetch the compact filter and claimed filter header for each position.
    /// Positions a peer cannot serve are simply absent from the response.
    async fn filters(
        &self,
        positions: &[ChainPosition],
    ) -> Result<Vec<(ChainPosition, FilterBundle)>, Self::Error>;

    /// Fetch the raw consensus-encoded block for each position.
    async fn blocks(
        &self,
        positions: &[ChainPosition],
    ) -> Result<Vec<(ChainPosition, Vec<u8>)>, Self::Error>;
}

/// Base trait for wallet storage, carrying the embedder's error type.
pub trait SyncWallet {
    /// Errors associated with the wallet's persistent store
    type Error: Debug;

    /// Returns the position the wallet was created at. Scanning never walks
    /// below this.
    fn birthday(&self) -> Result<ChainPosition, Self::Error>;
}

/// Persisted downloader tips.
pub trait SyncTips: SyncWallet {
    /// Load the persisted tip for a downloader, if one was ever stored.
    fn load_tip(&self, kind: DownloaderKind) -> Result<Option<ChainPosition>, Self::Error>;

    /// Persist a downloader tip. Called only after the payloads up to the
    /// tip were durably stored.
    fn store_tip(&mut self, kind: DownloaderKind, tip: ChainPosition) -> Result<(), Self::Error>;
}

/// Persisted compact filters and their verified headers.
pub trait SyncFilters: SyncWallet {
    /// Store a contiguous run of verified filters in one call.
    fn store_filters(
        &mut self,
        filters: Vec<(ChainPosition, FilterHeader, Vec<u8>)>,
    ) -> Result<(), Self::Error>;

    /// Load a stored filter and its verified header by position.
    fn load_filter(
        &self,
        position: &ChainPosition,
    ) -> Result<Option<(FilterHeader, Vec<u8>)>, Self::Error>;
}

/// Persisted full blocks.
pub trait SyncBlocks: SyncWallet {
    /// Store a contiguous run of verified blocks in one call.
    fn store_blocks(&mut self, blocks: Vec<(ChainPosition, Block)>) -> Result<(), Self::Error>;

    /// Load a stored block by position.
    fn load_block(&self, position: &ChainPosition) -> Result<Option<Block>, Self::Error>;
}

/// Persisted per-subchain match results.
pub trait SyncMatches: SyncWallet {
    /// Flush one batch's aggregated coin-level activity for a subchain in a
    /// single call. Failure is propagated to the caller as a hard error; the
    /// engine does not retry partial batches.
    fn subchain_match_block(&mut self, report: &BatchReport) -> Result<(), Self::Error>;
}
