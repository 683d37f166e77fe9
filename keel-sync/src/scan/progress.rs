//! Dirty/clean progress bookkeeping for one subchain.
//!
//! The reported "caught up to height H" claim must never overstate actual
//! coverage, even when clean and dirty updates race: a clean watermark may
//! only rise while it stays below the lowest position still awaiting
//! processing.

use std::collections::BTreeSet;

use crate::primitives::ChainPosition;

/// Scan coverage state for one subchain.
#[derive(Debug, Default)]
pub(crate) struct ScanProgress {
    // last value published to the status channel, for debouncing
    last_reported: Option<ChainPosition>,
    highest_clean: Option<ChainPosition>,
    dirty: BTreeSet<ChainPosition>,
}

impl ScanProgress {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Merge newly dispatched positions into the dirty set, then
    /// conditionally raise the clean watermark. A claim at or above the
    /// lowest dirty position is silently kept at the prior lower value.
    pub(crate) fn update_scan<I>(&mut self, clean: Option<ChainPosition>, newly_dirty: I)
    where
        I: IntoIterator<Item = ChainPosition>,
    {
        self.dirty.extend(newly_dirty);

        if let Some(clean) = clean {
            let below_dirty = match self.dirty.first() {
                Some(floor) => clean < *floor,
                None => true,
            };
            let raises = self.highest_clean.map_or(true, |current| clean > current);
            if below_dirty && raises {
                self.highest_clean = Some(clean);
            }
        }
    }

    /// Remove positions whose batch work has been fully applied.
    pub(crate) fn update_process(&mut self, completed: &[ChainPosition]) {
        for position in completed {
            self.dirty.remove(position);
        }
    }

    /// The lowest dirty position, the ceiling for forward scanning.
    pub(crate) fn dirty_floor(&self) -> Option<ChainPosition> {
        self.dirty.first().copied()
    }

    pub(crate) fn highest_clean(&self) -> Option<ChainPosition> {
        self.highest_clean
    }

    /// Drop state invalidated by a reorg: the clean watermark falls back to
    /// `parent` if it exceeded it, and every dirty entry above `parent`
    /// disappears.
    pub(crate) fn truncate(&mut self, parent: &ChainPosition) {
        if let Some(clean) = self.highest_clean {
            if clean.height() >= parent.height() && clean != *parent {
                self.highest_clean = Some(*parent);
            }
        }
        self.dirty.retain(|position| position.height() <= parent.height());
    }

    /// The clean watermark, if it changed since it was last reported.
    /// Debouncing here keeps rapid catch-up from flooding the status bus
    /// with redundant broadcasts.
    pub(crate) fn report(&mut self) -> Option<ChainPosition> {
        if self.highest_clean != self.last_reported {
            self.last_reported = self.highest_clean;
            self.highest_clean
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn dirty_len(&self) -> usize {
        self.dirty.len()
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

    #[test]
    fn clean_never_passes_lowest_dirty() {
        let mut progress = ScanProgress::new();
        progress.update_scan(Some(position(10)), vec![position(5), position(7)]);

        // the claim of 10 jumps past dirty 5, so it is rejected
        assert_eq!(progress.highest_clean(), None);
        assert_eq!(progress.dirty_floor(), Some(position(5)));

        progress.update_scan(Some(position(4)), Vec::new());
        assert_eq!(progress.highest_clean(), Some(position(4)));
    }

    #[test]
    fn processing_unblocks_clean_watermark() {
        let mut progress = ScanProgress::new();
        progress.update_scan(Some(position(10)), vec![position(5), position(7)]);

        progress.update_process(&[position(5), position(7)]);
        assert_eq!(progress.dirty_floor(), None);

        progress.update_scan(Some(position(10)), Vec::new());
        assert_eq!(progress.highest_clean(), Some(position(10)));
    }

    #[test]
    fn clean_watermark_is_monotonic() {
        let mut progress = ScanProgress::new();
        progress.update_scan(Some(position(8)), Vec::new());
        progress.update_scan(Some(position(3)), Vec::new());
        assert_eq!(progress.highest_clean(), Some(position(8)));
    }

    #[test]
    fn reorg_truncates_clean_and_dirty() {
        let mut progress = ScanProgress::new();
        progress.update_scan(Some(position(104)), vec![position(105), position(110)]);
        assert_eq!(progress.highest_clean(), Some(position(104)));
        assert_eq!(progress.dirty_len(), 2);

        progress.truncate(&position(102));
        assert_eq!(progress.highest_clean(), Some(position(102)));
        assert_eq!(progress.dirty_floor(), None);
        assert_eq!(progress.dirty_len(), 0);
    }

    #[test]
    fn reorg_below_clean_watermark_is_a_no_op() {
        let mut progress = ScanProgress::new();
        progress.update_scan(Some(position(50)), Vec::new());
        progress.truncate(&position(80));
        assert_eq!(progress.highest_clean(), Some(position(50)));
    }

    #[test]
    fn reporting_is_debounced() {
        let mut progress = ScanProgress::new();
        progress.update_scan(Some(position(3)), Vec::new());

        assert_eq!(progress.report(), Some(position(3)));
        assert_eq!(progress.report(), None);

        progress.update_scan(Some(position(4)), Vec::new());
        assert_eq!(progress.report(), Some(position(4)));
    }
}
