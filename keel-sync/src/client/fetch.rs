//! Queue and serve fetch requests against the peer layer

use tokio::sync::mpsc::UnboundedReceiver;

use crate::client::FetchRequest;
use crate::traits::PeerService;

const MAX_ATTEMPTS: u32 = 3;

/// Receives [`FetchRequest`]s via an [`tokio::sync::mpsc::UnboundedReceiver`]
/// for queueing and fetching from the peer layer.
/// Returns the data specified in the [`FetchRequest`] variant via the
/// provided [`tokio::sync::oneshot::Sender`].
///
/// Serving all peer traffic from a single task keeps connection handling in
/// one place and leaves room for request prioritisation.
pub async fn fetch<P>(
    mut fetch_request_receiver: UnboundedReceiver<FetchRequest>,
    peers: P,
) -> Result<(), ()>
where
    P: PeerService,
{
    let mut fetch_request_queue: Vec<(u32, FetchRequest)> = Vec::new();

    loop {
        // `fetch` returns `Ok` here when all requests have been served and
        // the fetch_request channel is closed on sync completion.
        if receive_fetch_requests(&mut fetch_request_receiver, &mut fetch_request_queue).await {
            return Ok(());
        }

        if let Some((attempts, request)) = select_fetch_request(&mut fetch_request_queue) {
            if let Some(failed) = fetch_from_peers(&peers, request).await {
                if attempts + 1 < MAX_ATTEMPTS {
                    fetch_request_queue.push((attempts + 1, failed));
                } else {
                    // dropping the request closes its oneshot; the requester
                    // observes the failure and the heartbeat re-derives state
                    tracing::warn!("fetch request abandoned after {} attempts", MAX_ATTEMPTS);
                }
            }
        }
    }
}

// receives fetch requests and populates the fetch request queue
//
// returns `true` if the fetch request channel is closed and all fetch
// requests have been completed, signalling sync is complete.
async fn receive_fetch_requests(
    receiver: &mut UnboundedReceiver<FetchRequest>,
    fetch_request_queue: &mut Vec<(u32, FetchRequest)>,
) -> bool {
    // if there are no fetch requests to process, sleep until the next fetch
    // request is received or the channel is closed
    if fetch_request_queue.is_empty() {
        if let Some(fetch_request) = receiver.recv().await {
            fetch_request_queue.push((0, fetch_request));
        }
    }

    loop {
        match receiver.try_recv() {
            Ok(fetch_request) => fetch_request_queue.push((0, fetch_request)),
            Err(tokio::sync::mpsc::error::TryRecvError::Empty) => break,
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => {
                if fetch_request_queue.is_empty() {
                    return true;
                } else {
                    break;
                }
            }
        }
    }

    false
}

// selects the next fetch request to be processed, oldest first
fn select_fetch_request(
    fetch_request_queue: &mut Vec<(u32, FetchRequest)>,
) -> Option<(u32, FetchRequest)> {
    if fetch_request_queue.is_empty() {
        None
    } else {
        Some(fetch_request_queue.remove(0))
    }
}

// serves one request against the peer layer. returns the request back to the
// caller when the peer layer failed, so it can be retried or abandoned.
async fn fetch_from_peers<P>(peers: &P, fetch_request: FetchRequest) -> Option<FetchRequest>
where
    P: PeerService,
{
    match fetch_request {
        FetchRequest::Filters(sender, positions) => {
            tracing::debug!("Fetching {} filters.", positions.len());
            match peers.filters(&positions).await {
                Ok(filters) => {
                    // requester may have been dropped during a reorg
                    let _ = sender.send(filters);
                    None
                }
                Err(error) => {
                    tracing::warn!("Peer filter fetch failed: {:?}", error);
                    Some(FetchRequest::Filters(sender, positions))
                }
            }
        }
        FetchRequest::Blocks(sender, positions) => {
            tracing::debug!("Fetching {} blocks.", positions.len());
            match peers.blocks(&positions).await {
                Ok(blocks) => {
                    let _ = sender.send(blocks);
                    None
                }
                Err(error) => {
                    tracing::warn!("Peer block fetch failed: {:?}", error);
                    Some(FetchRequest::Blocks(sender, positions))
                }
            }
        }
    }
}
