//! Position-ordered batch downloader, generic over payload type.
//!
//! Keeps a persisted tip no further behind the header oracle's best chain
//! than necessary without exceeding memory limits. The two instantiations
//! ([`filters::FilterDownloader`], [`blocks::BlockDownloader`]) differ only
//! in payload type and in the verification rule applied before the tip may
//! advance.

use std::collections::VecDeque;

use crate::primitives::{ChainPosition, DownloaderKind};
use crate::traits::HeaderOracle;

pub mod blocks;
pub mod filters;

/// Outcome of re-deriving the outstanding positions from the header oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PositionUpdate {
    /// Nothing new to download.
    NoProgress,
    /// The best chain extends the current tip.
    Extended,
    /// The tip was rolled back to the common ancestor; payload verification
    /// must resume from the prior verified value at `parent`.
    Reorged {
        /// Highest previously verified position still on the best chain.
        parent: ChainPosition,
    },
}

// allocation sizes step up geometrically with queue depth
fn batch_size(pending: usize) -> usize {
    match pending {
        0 => 0,
        1..=9 => 1,
        10..=99 => 10,
        100..=999 => 100,
        _ => 1_000,
    }
}

/// Shared position bookkeeping for both downloader instantiations.
pub(crate) struct DownloaderCore {
    kind: DownloaderKind,
    tip: ChainPosition,
    pending: VecDeque<ChainPosition>,
    next_batch_id: u64,
}

impl DownloaderCore {
    pub(crate) fn new(kind: DownloaderKind, tip: ChainPosition) -> Self {
        DownloaderCore {
            kind,
            tip,
            pending: VecDeque::new(),
            next_batch_id: 0,
        }
    }

    /// The last verified, persisted position.
    pub(crate) fn tip(&self) -> ChainPosition {
        self.tip
    }

    /// True when the tip has reached `best` and nothing is queued.
    pub(crate) fn is_idle(&self, best: &ChainPosition) -> bool {
        self.pending.is_empty() && self.tip == *best
    }

    /// Re-derive the outstanding positions from the header oracle's current
    /// best chain. Invoked from the heartbeat, so a missed push notification
    /// can never stall the downloader permanently.
    pub(crate) fn update_position<H: HeaderOracle + ?Sized>(
        &mut self,
        oracle: &H,
        limit: usize,
    ) -> PositionUpdate {
        let best = oracle.best_tip();
        if best == self.tip {
            self.pending.clear();
            return PositionUpdate::NoProgress;
        }

        let path = oracle.ancestors(&self.tip, &best, limit);
        let Some(&first) = path.first() else {
            self.pending.clear();
            return PositionUpdate::NoProgress;
        };

        let update = if first == self.tip || self.tip.is_null() {
            PositionUpdate::Extended
        } else {
            // the common ancestor is below our tip: everything above it was
            // reorged away and must be rolled back before downloading resumes
            tracing::warn!(
                "{} downloader tip {} rolled back to {}",
                self.kind,
                self.tip,
                first
            );
            self.tip = first;
            PositionUpdate::Reorged { parent: first }
        };

        let tip = self.tip;
        self.pending = path.into_iter().filter(|position| *position != tip).collect();

        if self.pending.is_empty() {
            PositionUpdate::NoProgress
        } else {
            update
        }
    }

    /// Allocate the next batch of download positions, or `None` when there
    /// is no header progress to chase.
    pub(crate) fn next_batch(&mut self) -> Option<(u64, Vec<ChainPosition>)> {
        let size = batch_size(self.pending.len());
        if size == 0 {
            return None;
        }

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let positions: Vec<ChainPosition> = self.pending.drain(..size.min(self.pending.len())).collect();
        tracing::debug!(
            "{} downloader batch {} covers {} positions from {}",
            self.kind,
            batch_id,
            positions.len(),
            positions[0]
        );

        Some((batch_id, positions))
    }

    /// Return unverified positions to the front of the queue for redownload,
    /// preserving position order.
    pub(crate) fn reinstate(&mut self, positions: &[ChainPosition]) {
        for position in positions.iter().rev() {
            self.pending.push_front(*position);
        }
    }

    /// Advance the persisted tip. Caller must have completed the store write
    /// for everything up to `position` first.
    pub(crate) fn advance(&mut self, position: ChainPosition) {
        debug_assert!(self.tip < position);
        self.tip = position;
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;

    use super::*;

    fn position(height: i64) -> ChainPosition {
        ChainPosition::from_parts(height, BlockHash::from_byte_array([height as u8; 32]))
    }

    struct StubOracle {
        chain: Vec<ChainPosition>,
        // positions the caller's stale chain carried, for ancestor lookups
        previous: Vec<ChainPosition>,
    }

    impl StubOracle {
        fn linear(chain: Vec<ChainPosition>) -> Self {
            StubOracle {
                previous: chain.clone(),
                chain,
            }
        }
    }

    impl HeaderOracle for StubOracle {
        fn best_tip(&self) -> ChainPosition {
            self.chain.last().copied().unwrap_or_else(ChainPosition::null)
        }

        fn best_chain(&self, from: &ChainPosition, limit: usize) -> Vec<ChainPosition> {
            self.chain
                .iter()
                .copied()
                .filter(|p| p.height() > from.height())
                .take(limit)
                .collect()
        }

        fn ancestors(
            &self,
            from: &ChainPosition,
            _to: &ChainPosition,
            limit: usize,
        ) -> Vec<ChainPosition> {
            let ancestor = self
                .chain
                .iter()
                .copied()
                .filter(|p| p.height() <= from.height())
                .filter(|p| p == from || self.previous.contains(p))
                .last();
            let floor = ancestor.map(|a| a.height()).unwrap_or(-1);
            let above = self.chain.iter().copied().filter(|p| p.height() > floor);
            ancestor.into_iter().chain(above).take(limit).collect()
        }

        fn is_in_best_chain(&self, position: &ChainPosition) -> bool {
            self.chain.contains(position)
        }
    }

    #[test]
    fn batch_sizes_step_geometrically() {
        assert_eq!(batch_size(0), 0);
        assert_eq!(batch_size(1), 1);
        assert_eq!(batch_size(9), 1);
        assert_eq!(batch_size(10), 10);
        assert_eq!(batch_size(99), 10);
        assert_eq!(batch_size(100), 100);
        assert_eq!(batch_size(5_000), 1_000);
    }

    #[test]
    fn initial_sync_extends_from_null() {
        let oracle = StubOracle::linear((0..5).map(position).collect());
        let mut core = DownloaderCore::new(DownloaderKind::Filters, ChainPosition::null());

        assert_eq!(core.update_position(&oracle, 100), PositionUpdate::Extended);
        let (_, batch) = core.next_batch().unwrap();
        // five pending: geometric step allocates one at a time
        assert_eq!(batch, vec![position(0)]);
    }

    #[test]
    fn caught_up_reports_no_progress() {
        let oracle = StubOracle::linear((0..3).map(position).collect());
        let mut core = DownloaderCore::new(DownloaderKind::Filters, position(2));
        assert_eq!(core.update_position(&oracle, 100), PositionUpdate::NoProgress);
        assert!(core.next_batch().is_none());
        assert!(core.is_idle(&position(2)));
    }

    #[test]
    fn fork_rolls_tip_back_to_common_ancestor() {
        // best chain now diverges above height 2; the old tip at 4 is stale
        let mut chain: Vec<ChainPosition> = (0..3).map(position).collect();
        chain.push(ChainPosition::from_parts(3, BlockHash::from_byte_array([0xa3; 32])));
        chain.push(ChainPosition::from_parts(4, BlockHash::from_byte_array([0xa4; 32])));
        let oracle = StubOracle {
            chain,
            previous: (0..5).map(position).collect(),
        };

        let stale_tip = position(4);
        let mut core = DownloaderCore::new(DownloaderKind::Blocks, stale_tip);

        assert_eq!(
            core.update_position(&oracle, 100),
            PositionUpdate::Reorged { parent: position(2) }
        );
        assert_eq!(core.tip(), position(2));

        let (_, batch) = core.next_batch().unwrap();
        assert_eq!(batch[0].height(), 3);
    }

    #[test]
    fn reinstate_preserves_position_order() {
        let oracle = StubOracle::linear((0..30).map(position).collect());
        let mut core = DownloaderCore::new(DownloaderKind::Filters, ChainPosition::null());
        core.update_position(&oracle, 100);

        let (_, batch) = core.next_batch().unwrap();
        assert_eq!(batch.len(), 10);

        core.reinstate(&batch[4..]);
        let (_, retry) = core.next_batch().unwrap();
        assert_eq!(retry[0], batch[4]);
        assert_eq!(retry[1], batch[5]);
    }
}
