//! Per-subchain scan state machine.
//!
//! Each (subaccount, subchain) pair walks the best chain from its last
//! scanned position toward the verified filter tip, feeding block positions
//! to the batch machinery in [`task`]. Positions handed out are tracked as
//! dirty in [`progress`] until their batch is fully applied; the forward
//! walk never passes the lowest dirty position.

use std::collections::{HashMap, VecDeque};

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use getset::Getters;
use tokio::sync::mpsc::UnboundedSender;

use crate::accounts::{lock_node, AccountIndex};
use crate::error::{ScanError, StorageError, SyncError};
use crate::primitives::{Activity, ChainPosition, StatusUpdate, SubchainKey};
use crate::scan::progress::ScanProgress;
use crate::scan::task::{Batch, Scanner, ScanTask, WorkOutcome};
use crate::traits::{SyncFilters, SyncMatches};

pub(crate) mod progress;
pub(crate) mod task;

/// One finished batch's aggregated results for a subchain, flushed to the
/// wallet store in a single call.
#[derive(Debug, Getters)]
#[getset(get = "pub")]
pub struct BatchReport {
    /// The subchain the batch belongs to.
    key: SubchainKey,
    /// Positions whose jobs completed successfully.
    positions: Vec<ChainPosition>,
    /// Newly observed unspent activity.
    unspent: Vec<Activity>,
    /// Newly observed spent activity.
    spent: Vec<Activity>,
}

/// Scan/rescan driver for one subchain.
pub(crate) struct SubchainScanner {
    key: SubchainKey,
    birthday: ChainPosition,
    last_scanned: Option<ChainPosition>,
    ready: bool,
    caught_up: bool,
    // externally fed positions that must be re-examined, strictly FIFO
    rescan_queue: VecDeque<ChainPosition>,
    progress: ScanProgress,
    open: Option<Batch>,
    sealed: HashMap<u64, Batch>,
    next_batch_id: u64,
}

impl SubchainScanner {
    pub(crate) fn new(key: SubchainKey, birthday: ChainPosition) -> Self {
        SubchainScanner {
            key,
            birthday,
            last_scanned: None,
            ready: true,
            caught_up: false,
            rescan_queue: VecDeque::new(),
            progress: ScanProgress::new(),
            open: None,
            sealed: HashMap::new(),
            next_batch_id: 0,
        }
    }

    pub(crate) fn key(&self) -> SubchainKey {
        self.key
    }

    /// A new block arrived; leave the cooperative-yield state.
    pub(crate) fn wake(&mut self) {
        self.ready = true;
        self.caught_up = false;
    }

    /// Queue a position for re-examination, e.g. after a key was added.
    pub(crate) fn request_rescan(&mut self, position: ChainPosition) {
        self.rescan_queue.push_back(position);
        self.wake();
    }

    /// True once the subchain reached the filter tip with nothing in
    /// flight. Cleared by [`SubchainScanner::wake`].
    pub(crate) fn is_caught_up(&self) -> bool {
        self.caught_up
            && self.rescan_queue.is_empty()
            && self.open.is_none()
            && self.sealed.is_empty()
    }

    /// One scan cycle: drain due rescan requests, then walk forward from the
    /// last scanned position toward `min(filter_tip, lowest_dirty - 1)`,
    /// handing each position to the batch machinery.
    pub(crate) fn scan<W, H>(
        &mut self,
        oracle: &H,
        wallet: &W,
        filter_tip: ChainPosition,
        pool: &Scanner,
        status_sender: &UnboundedSender<StatusUpdate>,
    ) -> Result<(), SyncError>
    where
        W: SyncFilters,
        H: crate::traits::HeaderOracle + ?Sized,
    {
        if !self.ready || filter_tip.is_null() {
            return Ok(());
        }

        let mut budget = pool.idle_workers();
        let mut dispatched: Vec<ChainPosition> = Vec::new();

        // rescan requests go first, in arrival order
        while budget > 0 {
            let Some(position) = self.rescan_queue.front().copied() else {
                break;
            };
            if position > filter_tip {
                // not coverable yet, leave it queued
                break;
            }
            if !oracle.is_in_best_chain(&position) {
                tracing::debug!("Dropping rescan of reorged position {}", position);
                self.rescan_queue.pop_front();
                continue;
            }
            if self.dispatch(position, wallet, pool)? {
                self.rescan_queue.pop_front();
                dispatched.push(position);
                budget -= 1;
            } else {
                break;
            }
        }

        // the forward walk never passes the lowest position still marked
        // dirty by pending work
        let ceiling = match self.progress.dirty_floor() {
            Some(floor) => filter_tip.height().min(floor.height() - 1),
            None => filter_tip.height(),
        };

        let from = self
            .last_scanned
            .or_else(|| self.progress.highest_clean())
            .unwrap_or_else(|| {
                ChainPosition::from_parts(self.birthday.height() - 1, BlockHash::all_zeros())
            });

        if budget > 0 && from.height() < ceiling {
            for position in oracle.best_chain(&from, budget) {
                if position.height() > ceiling {
                    break;
                }
                if !self.dispatch(position, wallet, pool)? {
                    break;
                }
                dispatched.push(position);
                self.last_scanned = Some(position);
            }
        }

        // seal the cycle's partial batch so its results can be applied
        if let Some(mut batch) = self.open.take() {
            batch.finalize();
            self.sealed.insert(batch.id(), batch);
        }

        // mark dispatched positions dirty, then re-assert the clean
        // watermark; the ordering guard in progress caps it below the dirty
        // floor
        self.progress.update_scan(self.last_scanned, dispatched);
        if let Some(position) = self.progress.report() {
            let _ = status_sender.send(StatusUpdate::Progress {
                key: self.key,
                position,
            });
        }

        // cooperative yield once the walk has covered the verified tip
        if self.last_scanned == Some(filter_tip)
            && self.rescan_queue.is_empty()
            && self.open.is_none()
            && self.sealed.is_empty()
            && self.progress.dirty_floor().is_none()
        {
            self.caught_up(filter_tip, status_sender);
        }

        Ok(())
    }

    // cooperative-yield transition: clear readiness and reset the scan
    // position so the next wake recomputes its walk from the header oracle
    fn caught_up(
        &mut self,
        tip: ChainPosition,
        status_sender: &UnboundedSender<StatusUpdate>,
    ) {
        self.ready = false;
        self.caught_up = true;
        self.last_scanned = None;
        let _ = status_sender.send(StatusUpdate::CaughtUp {
            key: self.key,
            position: tip,
        });
        tracing::info!("{} caught up at {}", self.key, tip);
    }

    // hand one position to the open batch and the worker pool. Returns false
    // when the filter is not yet available locally, which ends the cycle.
    fn dispatch<W: SyncFilters>(
        &mut self,
        position: ChainPosition,
        wallet: &W,
        pool: &Scanner,
    ) -> Result<bool, SyncError> {
        let Some((_, filter)) = wallet
            .load_filter(&position)
            .map_err(StorageError::from_store)?
        else {
            // the filter tip vouches for this position, so absence is a
            // transient race with the downloader; retry next heartbeat
            tracing::debug!("Filter for {} not yet stored", position);
            return Ok(false);
        };

        if self.open.is_none() {
            let id = self.next_batch_id;
            self.next_batch_id += 1;
            self.open = Some(Batch::new(id));
        }
        let batch = self.open.as_mut().expect("batch was just opened");

        batch.add_job(position);
        let batch_id = batch.id();
        if batch.is_full() {
            let mut full = self.open.take().expect("batch was just filled");
            full.finalize();
            self.sealed.insert(full.id(), full);
        }

        pool.add_scan_task(ScanTask {
            key: self.key,
            position,
            batch_id,
            filter,
        });

        Ok(true)
    }

    /// Record one job's outcome. Returns the owning batch once every one of
    /// its jobs has reported.
    pub(crate) fn complete_job(&mut self, outcome: WorkOutcome) -> Option<Batch> {
        let WorkOutcome {
            position,
            batch_id,
            result,
            ..
        } = outcome;

        if let Some(batch) = self.sealed.get_mut(&batch_id) {
            batch.complete_job(&position, result);
            if batch.is_finished() {
                return self.sealed.remove(&batch_id);
            }
        } else if let Some(batch) = self.open.as_mut().filter(|batch| batch.id() == batch_id) {
            batch.complete_job(&position, result);
        } else {
            // batch was dropped by a reorg; the result is stale
            tracing::debug!("Dropping result for retired batch {}", batch_id);
        }

        None
    }

    /// Apply a finished batch: merge its activity into the subaccount's
    /// balance ledger, flush the aggregated report to the wallet store in
    /// one call, then settle progress and the account index in one pass.
    pub(crate) fn apply_batch<W>(
        &mut self,
        batch: Batch,
        wallet: &mut W,
        accounts: &AccountIndex,
        status_sender: &UnboundedSender<StatusUpdate>,
    ) -> Result<(), SyncError>
    where
        W: SyncMatches,
    {
        let mut positions = Vec::new();
        let mut unspent = Vec::new();
        let mut spent = Vec::new();
        let mut abandoned = Vec::new();
        let mut hits = 0usize;

        for work in batch.into_jobs() {
            match work.outcome {
                Some(Ok(matches)) => {
                    positions.push(work.position);
                    if matches.matched {
                        hits += 1;
                    }
                    unspent.extend(matches.unspent);
                    spent.extend(matches.spent);
                }
                Some(Err(error)) => {
                    tracing::warn!("Job at {} failed: {}; requeueing", work.position, error);
                    abandoned.push(work.position);
                }
                None => abandoned.push(work.position),
            }
        }

        tracing::debug!(
            "{}: applying batch of {} blocks, {} filter hits",
            self.key,
            positions.len(),
            hits
        );

        if !unspent.is_empty() || !spent.is_empty() {
            let node = accounts
                .balance_node(self.key.account())
                .ok_or_else(|| ScanError::UnknownSubchain(self.key.to_string()))?;
            lock_node(&node).associate_transaction(&unspent, &spent);
        }

        let report = BatchReport {
            key: self.key,
            positions: positions.clone(),
            unspent,
            spent,
        };
        wallet
            .subchain_match_block(&report)
            .map_err(StorageError::from_store)?;

        self.progress.update_process(&positions);
        // abandoned jobs stay dirty, holding the clean watermark down until
        // their retry completes
        for position in abandoned {
            self.request_rescan(position);
        }

        if let Some(highest) = positions.iter().max().copied() {
            accounts.set_last_match(self.key, highest);
            self.progress.update_scan(Some(highest), Vec::new());
        }
        if let Some(position) = self.progress.report() {
            let _ = status_sender.send(StatusUpdate::Progress {
                key: self.key,
                position,
            });
        }

        Ok(())
    }

    /// Handle a chain reorganization down to `parent`. The rescan queue is
    /// flushed first so no queued request is silently dropped, then the base
    /// state is truncated and the scan position reset so the next cycle
    /// recomputes its walk from the header oracle.
    pub(crate) fn reorg<H>(&mut self, parent: &ChainPosition, oracle: &H)
    where
        H: crate::traits::HeaderOracle + ?Sized,
    {
        let queued: Vec<ChainPosition> = self.rescan_queue.drain(..).collect();
        for position in queued {
            if position.height() <= parent.height() && oracle.is_in_best_chain(&position) {
                self.progress.update_scan(None, vec![position]);
                self.rescan_queue.push_back(position);
            } else {
                tracing::debug!("Reorg invalidated queued rescan of {}", position);
            }
        }

        // drop in-flight batches touching positions above the parent; their
        // results no longer describe the best chain
        let stale: Vec<u64> = self
            .sealed
            .values()
            .filter(|batch| batch.positions().iter().any(|p| p.height() > parent.height()))
            .map(|batch| batch.id())
            .collect();
        for batch_id in stale {
            if let Some(batch) = self.sealed.remove(&batch_id) {
                self.progress.update_process(&batch.positions());
            }
        }
        let open_is_stale = self
            .open
            .as_ref()
            .map(|batch| batch.positions().iter().any(|p| p.height() > parent.height()))
            .unwrap_or(false);
        if open_is_stale {
            if let Some(batch) = self.open.take() {
                self.progress.update_process(&batch.positions());
            }
        }

        self.progress.truncate(parent);
        self.last_scanned = None;
        self.wake();

        tracing::info!("{} reorged down to {}", self.key, parent);
    }
}
