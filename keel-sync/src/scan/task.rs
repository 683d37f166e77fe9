//! Batch bookkeeping and the scan worker pool.
//!
//! A [`Batch`] groups a bounded number of per-block match jobs; its results
//! are applied to the wallet in one pass once every job has reported.
//! Workers are plain tokio tasks with an idle flag, fed over per-worker
//! channels.

use std::sync::{
    atomic::{self, AtomicBool},
    Arc,
};

use bitcoin::bip158::BlockFilter;
use bitcoin::consensus::encode;
use bitcoin::{Amount, Block, OutPoint};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::accounts::AccountIndex;
use crate::client::{get_blocks, FetchRequest};
use crate::error::ScanError;
use crate::primitives::{Activity, ChainPosition, Coin, SubchainKey};
use crate::script;

const SCAN_WORKER_POOLSIZE: usize = 2;

/// Cap on jobs per batch. A full batch seals and a fresh one begins.
pub(crate) const MAX_BATCH_JOBS: usize = 10;

/// One block's worth of match scanning for one subchain.
pub(crate) struct ScanTask {
    pub(crate) key: SubchainKey,
    pub(crate) position: ChainPosition,
    pub(crate) batch_id: u64,
    pub(crate) filter: Vec<u8>,
}

/// What a worker reports back for one job.
pub(crate) struct WorkOutcome {
    pub(crate) key: SubchainKey,
    pub(crate) position: ChainPosition,
    pub(crate) batch_id: u64,
    pub(crate) result: Result<Matches, ScanError>,
}

/// Match results for one block.
#[derive(Default)]
pub(crate) struct Matches {
    pub(crate) matched: bool,
    pub(crate) unspent: Vec<Activity>,
    pub(crate) spent: Vec<Activity>,
}

/// One job slot inside a batch.
pub(crate) struct Work {
    pub(crate) position: ChainPosition,
    pub(crate) outcome: Option<Result<Matches, ScanError>>,
}

/// A bounded group of per-block jobs monitored to completion.
pub(crate) struct Batch {
    id: u64,
    jobs: Vec<Work>,
    running: usize,
    finalized: bool,
    reported: bool,
}

impl Batch {
    pub(crate) fn new(id: u64) -> Self {
        Batch {
            id,
            jobs: Vec::new(),
            running: 0,
            finalized: false,
            reported: false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_full(&self) -> bool {
        self.jobs.len() >= MAX_BATCH_JOBS
    }

    /// Append a job. Only valid while the batch is open.
    pub(crate) fn add_job(&mut self, position: ChainPosition) {
        debug_assert!(!self.finalized);
        self.jobs.push(Work {
            position,
            outcome: None,
        });
        self.running += 1;
    }

    /// Seal the batch; from here on completion is observed only through
    /// [`Batch::complete_job`] decrements.
    pub(crate) fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Record one job's result and decrement the running count.
    pub(crate) fn complete_job(&mut self, position: &ChainPosition, result: Result<Matches, ScanError>) {
        if let Some(work) = self
            .jobs
            .iter_mut()
            .find(|work| work.position == *position && work.outcome.is_none())
        {
            work.outcome = Some(result);
            self.running -= 1;
        }
    }

    /// True exactly once: when the batch is sealed, every job has reported,
    /// and nobody observed completion before.
    pub(crate) fn is_finished(&mut self) -> bool {
        if self.finalized && self.running == 0 && !self.reported {
            self.reported = true;
            true
        } else {
            false
        }
    }

    /// Positions covered by this batch.
    pub(crate) fn positions(&self) -> Vec<ChainPosition> {
        self.jobs.iter().map(|work| work.position).collect()
    }

    /// Consume the batch into its job slots.
    pub(crate) fn into_jobs(self) -> Vec<Work> {
        self.jobs
    }
}

/// Fixed pool of scan workers executing [`ScanTask`]s in parallel.
pub(crate) struct Scanner {
    workers: Vec<WorkerHandle>,
    outcome_sender: mpsc::UnboundedSender<WorkOutcome>,
    fetch_request_sender: mpsc::UnboundedSender<FetchRequest>,
    accounts: Arc<AccountIndex>,
}

impl Scanner {
    pub(crate) fn new(
        outcome_sender: mpsc::UnboundedSender<WorkOutcome>,
        fetch_request_sender: mpsc::UnboundedSender<FetchRequest>,
        accounts: Arc<AccountIndex>,
    ) -> Self {
        Self {
            workers: Vec::with_capacity(SCAN_WORKER_POOLSIZE),
            outcome_sender,
            fetch_request_sender,
            accounts,
        }
    }

    pub(crate) fn spawn_workers(&mut self) {
        for _ in 0..SCAN_WORKER_POOLSIZE {
            let (scan_task_sender, scan_task_receiver) = mpsc::unbounded_channel();
            let worker = ScanWorker::new(
                scan_task_receiver,
                self.outcome_sender.clone(),
                self.fetch_request_sender.clone(),
                Arc::clone(&self.accounts),
            );
            let is_scanning = Arc::clone(&worker.is_scanning);
            let handle = tokio::spawn(async move { worker.run().await });
            self.workers.push(WorkerHandle {
                _handle: handle,
                is_scanning,
                scan_task_sender,
            });
        }
    }

    pub(crate) fn idle_workers(&self) -> usize {
        self.workers.iter().filter(|worker| !worker.is_scanning()).count()
    }

    pub(crate) fn add_scan_task(&self, scan_task: ScanTask) {
        if let Some(worker) = self.workers.iter().find(|worker| !worker.is_scanning()) {
            worker.add_scan_task(scan_task);
        } else {
            panic!("no idle workers!")
        }
    }
}

struct WorkerHandle {
    _handle: JoinHandle<()>,
    is_scanning: Arc<AtomicBool>,
    scan_task_sender: mpsc::UnboundedSender<ScanTask>,
}

impl WorkerHandle {
    fn is_scanning(&self) -> bool {
        self.is_scanning.load(atomic::Ordering::Acquire)
    }

    fn add_scan_task(&self, scan_task: ScanTask) {
        // claim the worker before it picks the task up so one cycle cannot
        // over-commit a single worker
        self.is_scanning.store(true, atomic::Ordering::Release);
        self.scan_task_sender
            .send(scan_task)
            .expect("worker outlives its pool");
    }
}

struct ScanWorker {
    is_scanning: Arc<AtomicBool>,
    scan_task_receiver: mpsc::UnboundedReceiver<ScanTask>,
    outcome_sender: mpsc::UnboundedSender<WorkOutcome>,
    fetch_request_sender: mpsc::UnboundedSender<FetchRequest>,
    accounts: Arc<AccountIndex>,
}

impl ScanWorker {
    fn new(
        scan_task_receiver: mpsc::UnboundedReceiver<ScanTask>,
        outcome_sender: mpsc::UnboundedSender<WorkOutcome>,
        fetch_request_sender: mpsc::UnboundedSender<FetchRequest>,
        accounts: Arc<AccountIndex>,
    ) -> Self {
        Self {
            is_scanning: Arc::new(AtomicBool::new(false)),
            scan_task_receiver,
            outcome_sender,
            fetch_request_sender,
            accounts,
        }
    }

    async fn run(mut self) {
        while let Some(scan_task) = self.scan_task_receiver.recv().await {
            self.is_scanning.store(true, atomic::Ordering::Release);

            let key = scan_task.key;
            let position = scan_task.position;
            let batch_id = scan_task.batch_id;
            let result =
                scan_position(&self.fetch_request_sender, &self.accounts, scan_task).await;

            // the pool may already be gone during shutdown drain
            if self
                .outcome_sender
                .send(WorkOutcome {
                    key,
                    position,
                    batch_id,
                    result,
                })
                .is_err()
            {
                break;
            }

            self.is_scanning.store(false, atomic::Ordering::Release);
        }
    }
}

/// Execute one job: query the block's filter with the subchain's candidate
/// scripts, and on a hit fetch the block and extract matching activity.
async fn scan_position(
    fetch_request_sender: &mpsc::UnboundedSender<FetchRequest>,
    accounts: &AccountIndex,
    scan_task: ScanTask,
) -> Result<Matches, ScanError> {
    let ScanTask {
        key,
        position,
        filter,
        ..
    } = scan_task;

    let queries = accounts.query_scripts(&key);
    if queries.is_empty() {
        return Err(ScanError::UnknownSubchain(key.to_string()));
    }

    let filter = BlockFilter::new(&filter);
    let mut query = queries.iter().map(|script| script.as_bytes());
    let matched = filter
        .match_any(&position.hash(), &mut query)
        .map_err(|error| ScanError::FilterQuery {
            position,
            reason: error.to_string(),
        })?;

    if !matched {
        return Ok(Matches::default());
    }

    let raw = get_blocks(fetch_request_sender, vec![position])
        .await
        .map_err(|error| ScanError::BlockDecode {
            position,
            reason: error.to_string(),
        })?
        .into_iter()
        .find(|(fetched, _)| *fetched == position)
        .map(|(_, raw)| raw)
        .ok_or_else(|| ScanError::BlockDecode {
            position,
            reason: "peer returned no block".to_string(),
        })?;

    let block: Block = encode::deserialize(&raw).map_err(|error| ScanError::BlockDecode {
        position,
        reason: error.to_string(),
    })?;

    tracing::debug!("Filter hit for {} at {}", key, position);
    Ok(extract_matches(accounts, &key, &block))
}

// walk every transaction: outputs whose script elements resolve against the
// watch set become unspent observations; inputs whose spending-side elements
// resolve become spent observations of the consumed outpoint. Spend values
// are unknown at observation time and reconciled later.
fn extract_matches(accounts: &AccountIndex, key: &SubchainKey, block: &Block) -> Matches {
    let mut matches = Matches {
        matched: true,
        ..Default::default()
    };

    for transaction in &block.txdata {
        let txid = transaction.compute_txid();

        for (index, output) in transaction.output.iter().enumerate() {
            for element in script::extract_elements(&output.script_pubkey) {
                if let Some(key_id) = accounts.match_element(key, &element) {
                    matches.unspent.push(Activity::from_parts(
                        Coin::from_parts(txid, index as u32),
                        key_id,
                        output.value,
                    ));
                    break;
                }
            }
        }

        for input in &transaction.input {
            if input.previous_output == OutPoint::null() {
                continue;
            }
            for element in script::extract_input_elements(&input.script_sig, &input.witness) {
                if let Some(key_id) = accounts.match_element(key, &element) {
                    matches.spent.push(Activity::from_parts(
                        input.previous_output.into(),
                        key_id,
                        Amount::ZERO,
                    ));
                    break;
                }
            }
        }
    }

    matches
}
