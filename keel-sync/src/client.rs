//! Module for handling all requests to the peer layer

use bitcoin::bip158::FilterHeader;
use getset::Getters;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

use crate::error::DownloadError;
use crate::primitives::ChainPosition;

pub mod fetch;

/// A compact filter as delivered by a peer: the raw filter bytes plus the
/// filter header the peer claims for it. The claim is verified locally by
/// hash-chaining before anything is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
pub struct FilterBundle {
    /// Claimed filter header for the block.
    #[getset(get = "pub")]
    header: FilterHeader,
    /// Raw BIP-158 filter bytes.
    #[getset(get = "pub")]
    filter: Vec<u8>,
}

impl FilterBundle {
    /// Creates a new bundle from parts.
    pub fn from_parts(header: FilterHeader, filter: Vec<u8>) -> Self {
        FilterBundle { header, filter }
    }
}

/// Fetch requests are created and sent to the [`crate::client::fetch::fetch`]
/// task when data is required from the peer layer.
///
/// Each variant includes a [`tokio::sync::oneshot::Sender`] for returning the
/// fetched data to the requester.
#[derive(Debug)]
pub enum FetchRequest {
    /// Gets the compact filters for the specified positions.
    Filters(
        oneshot::Sender<Vec<(ChainPosition, FilterBundle)>>,
        Vec<ChainPosition>,
    ),
    /// Gets the raw blocks for the specified positions.
    Blocks(
        oneshot::Sender<Vec<(ChainPosition, Vec<u8>)>>,
        Vec<ChainPosition>,
    ),
}

/// Gets the compact filters for the specified positions.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently,
/// connected via the `fetch_request` channel.
pub async fn get_filters(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    positions: Vec<ChainPosition>,
) -> Result<Vec<(ChainPosition, FilterBundle)>, DownloadError> {
    let (sender, receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::Filters(sender, positions))
        .map_err(|_| DownloadError::Fetch("fetch task is gone".to_string()))?;

    receiver
        .await
        .map_err(|_| DownloadError::Fetch("filter request dropped".to_string()))
}

/// Gets the raw blocks for the specified positions.
///
/// Requires [`crate::client::fetch::fetch`] to be running concurrently,
/// connected via the `fetch_request` channel.
pub async fn get_blocks(
    fetch_request_sender: &UnboundedSender<FetchRequest>,
    positions: Vec<ChainPosition>,
) -> Result<Vec<(ChainPosition, Vec<u8>)>, DownloadError> {
    let (sender, receiver) = oneshot::channel();
    fetch_request_sender
        .send(FetchRequest::Blocks(sender, positions))
        .map_err(|_| DownloadError::Fetch("fetch task is gone".to_string()))?;

    receiver
        .await
        .map_err(|_| DownloadError::Fetch("block request dropped".to_string()))
}
