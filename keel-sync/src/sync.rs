//! Entrypoint for the sync engine
//!
//! One cooperative loop owns the wallet store and drives the downloader
//! state machines and per-subchain scanners on a heartbeat, while a fixed
//! pool of scan workers and a single fetch task run as separate tokio
//! tasks. Cross-task traffic is all channels; the only shared mutable state
//! is the account index behind its own lock.

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use keel_config::KeelConfig;

use crate::accounts::AccountIndex;
use crate::client::fetch::fetch;
use crate::downloader::blocks::BlockDownloader;
use crate::downloader::filters::FilterDownloader;
use crate::error::{StorageError, SyncError};
use crate::primitives::{ChainPosition, StatusUpdate, SyncMessage};
use crate::scan::task::{Scanner, WorkOutcome};
use crate::scan::SubchainScanner;
use crate::traits::{
    HeaderOracle, PeerService, SyncBlocks, SyncFilters, SyncMatches, SyncTips, SyncWallet,
};

// how long in-flight work may drain after a shutdown request
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Syncs a wallet to the latest state of the blockchain and keeps following
/// it until the inbound message channel closes or a shutdown message
/// arrives.
pub async fn sync<P, H, W>(
    peers: P,
    oracle: Arc<H>,
    config: &KeelConfig,
    wallet: &mut W,
    accounts: Arc<AccountIndex>,
    mut messages: mpsc::UnboundedReceiver<SyncMessage>,
    status_sender: mpsc::UnboundedSender<StatusUpdate>,
) -> Result<(), SyncError>
where
    P: PeerService + 'static,
    H: HeaderOracle + Send + Sync + 'static,
    W: SyncWallet + SyncTips + SyncFilters + SyncBlocks + SyncMatches,
{
    tracing::info!("Syncing wallet on {}...", config.chain);

    let mut handles = Vec::new();

    // create channel for sending fetch requests and launch the fetch task
    let (fetch_request_sender, fetch_request_receiver) = mpsc::unbounded_channel();
    let fetcher_handle = tokio::spawn(fetch(fetch_request_receiver, peers));
    handles.push(fetcher_handle);

    let mut filter_downloader = FilterDownloader::load(wallet)?;
    let mut block_downloader = BlockDownloader::load(wallet)?;

    // create channel for receiving job outcomes and launch the worker pool
    let (outcome_sender, mut outcome_receiver) = mpsc::unbounded_channel();
    let mut pool = Scanner::new(
        outcome_sender,
        fetch_request_sender.clone(),
        Arc::clone(&accounts),
    );
    pool.spawn_workers();

    let birthday = wallet.birthday().map_err(StorageError::from_store)?;
    let floor = if birthday.is_null() {
        ChainPosition::genesis(config.chain)
    } else {
        birthday
    };
    let mut scanners: Vec<SubchainScanner> = accounts
        .subchain_keys()
        .into_iter()
        .map(|key| SubchainScanner::new(key, floor))
        .collect();

    let mut messages_closed = false;
    let mut last_filter_tip = filter_downloader.tip();
    let mut interval = tokio::time::interval(config.heartbeat);
    loop {
        interval.tick().await;

        // inbound events: new blocks, reorgs, rescan requests, shutdown
        let mut shutdown = false;
        loop {
            match messages.try_recv() {
                Ok(SyncMessage::NewBlock(position)) => {
                    tracing::debug!("New block announced at {}", position);
                    for scanner in &mut scanners {
                        scanner.wake();
                    }
                }
                Ok(SyncMessage::Reorg { parent }) => {
                    for scanner in &mut scanners {
                        scanner.reorg(&parent, oracle.as_ref());
                    }
                    // the downloaders re-derive their own rollback from the
                    // oracle on the next step
                }
                Ok(SyncMessage::Rescan { key, position }) => {
                    if let Some(scanner) = scanners.iter_mut().find(|s| s.key() == key) {
                        scanner.request_rescan(position);
                    }
                }
                Ok(SyncMessage::Shutdown) => shutdown = true,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    messages_closed = true;
                    break;
                }
            }
        }
        if shutdown {
            break;
        }

        // heartbeat the downloaders; they re-derive outstanding positions
        // from the oracle, so missed notifications self-heal here
        filter_downloader
            .step(
                oracle.as_ref(),
                wallet,
                &fetch_request_sender,
                &status_sender,
                config.header_batch_limit,
            )
            .await?;
        block_downloader
            .step(
                oracle.as_ref(),
                wallet,
                &fetch_request_sender,
                &status_sender,
                config.header_batch_limit,
            )
            .await?;

        // a moved filter tip is new scan work; wake any scanner that had
        // yielded at the old tip
        let filter_tip = filter_downloader.tip();
        if filter_tip != last_filter_tip {
            last_filter_tip = filter_tip;
            for scanner in &mut scanners {
                scanner.wake();
            }
        }

        // scan cycles, bounded by idle workers
        for scanner in &mut scanners {
            scanner.scan(oracle.as_ref(), wallet, filter_tip, &pool, &status_sender)?;
        }

        // apply finished batches
        loop {
            match outcome_receiver.try_recv() {
                Ok(outcome) => {
                    route_outcome(&mut scanners, outcome, wallet, &accounts, &status_sender)?
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }

        // once the embedder hung up, finish outstanding work and return
        if messages_closed
            && filter_downloader.is_idle(oracle.as_ref())
            && block_downloader.is_idle(oracle.as_ref())
            && scanners.iter().all(|scanner| scanner.is_caught_up())
        {
            break;
        }
    }

    // drain: drop the pool so workers finish their current task and exit,
    // then apply whatever still lands, bounded so shutdown cannot hang
    drop(pool);
    let drain = async {
        while let Some(outcome) = outcome_receiver.recv().await {
            if route_outcome(&mut scanners, outcome, wallet, &accounts, &status_sender).is_err() {
                break;
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("Abandoning in-flight scan work after shutdown grace period");
    }

    drop(fetch_request_sender);
    try_join_all(handles)
        .await
        .map_err(|_| SyncError::ChannelClosed("fetch task"))?;

    tracing::info!("Sync finished.");
    Ok(())
}

// deliver one job outcome to its scanner and apply the batch it completes
fn route_outcome<W>(
    scanners: &mut [SubchainScanner],
    outcome: WorkOutcome,
    wallet: &mut W,
    accounts: &AccountIndex,
    status_sender: &mpsc::UnboundedSender<StatusUpdate>,
) -> Result<(), SyncError>
where
    W: SyncMatches,
{
    let Some(scanner) = scanners.iter_mut().find(|s| s.key() == outcome.key) else {
        return Ok(());
    };
    if let Some(batch) = scanner.complete_job(outcome) {
        scanner.apply_batch(batch, wallet, accounts, status_sender)?;
    }
    Ok(())
}
