//! Compact filter downloader.
//!
//! The verification rule is the BIP-157 chained-header property: the filter
//! header for block N is the hash of block N's filter hash concatenated with
//! the verified header for block N-1. A tampered filter therefore fails
//! locally without downloading the full block.

use std::collections::HashMap;

use bitcoin::bip158::{BlockFilter, FilterHeader};
use bitcoin::hashes::Hash;
use tokio::sync::mpsc::UnboundedSender;

use crate::client::{get_filters, FetchRequest, FilterBundle};
use crate::downloader::{DownloaderCore, PositionUpdate};
use crate::error::{DownloadError, StorageError, SyncError};
use crate::primitives::{ChainPosition, DownloaderKind, StatusUpdate};
use crate::traits::{HeaderOracle, SyncFilters, SyncTips};

/// Downloads, verifies and persists compact filters along the best chain.
pub struct FilterDownloader {
    core: DownloaderCore,
    // verified filter header at the tip, the chain value the next filter
    // must link to
    cursor: FilterHeader,
}

impl FilterDownloader {
    /// Restore the downloader from the wallet's persisted tip. A persisted
    /// tip whose filter is missing from the store means the store lost data
    /// the tip vouches for, which is fatal.
    pub fn load<W>(wallet: &W) -> Result<Self, SyncError>
    where
        W: SyncTips + SyncFilters,
    {
        let tip = wallet
            .load_tip(DownloaderKind::Filters)
            .map_err(StorageError::from_store)?
            .unwrap_or_else(ChainPosition::null);

        let cursor = if tip.is_null() {
            null_header()
        } else {
            let (header, _) = wallet
                .load_filter(&tip)
                .map_err(StorageError::from_store)?
                .ok_or_else(|| {
                    StorageError::from_store(format!("missing filter for persisted tip {}", tip))
                })?;
            header
        };

        Ok(FilterDownloader {
            core: DownloaderCore::new(DownloaderKind::Filters, tip),
            cursor,
        })
    }

    /// The verified filter tip. Scanning never proceeds past this.
    pub fn tip(&self) -> ChainPosition {
        self.core.tip()
    }

    /// True when the tip has reached the oracle's best tip.
    pub fn is_idle<H: HeaderOracle + ?Sized>(&self, oracle: &H) -> bool {
        self.core.is_idle(&oracle.best_tip())
    }

    /// Heartbeat entry point: re-derive outstanding positions from the
    /// header oracle, then download, verify and persist one batch.
    pub async fn step<W, H>(
        &mut self,
        oracle: &H,
        wallet: &mut W,
        fetch_request_sender: &UnboundedSender<FetchRequest>,
        status_sender: &UnboundedSender<StatusUpdate>,
        limit: usize,
    ) -> Result<(), SyncError>
    where
        W: SyncTips + SyncFilters,
        H: HeaderOracle + ?Sized,
    {
        match self.core.update_position(oracle, limit) {
            PositionUpdate::NoProgress => return Ok(()),
            PositionUpdate::Extended => (),
            PositionUpdate::Reorged { parent } => {
                // resume hash-chaining from the prior verified header value
                self.cursor = if parent.is_null() {
                    null_header()
                } else {
                    wallet
                        .load_filter(&parent)
                        .map_err(StorageError::from_store)?
                        .map(|(header, _)| header)
                        .ok_or_else(|| {
                            StorageError::from_store(format!(
                                "missing filter for reorg parent {}",
                                parent
                            ))
                        })?
                };
            }
        }

        let Some((_batch_id, positions)) = self.core.next_batch() else {
            return Ok(());
        };

        // skip redundant downloads for filters that already exist locally
        let mut payloads: HashMap<ChainPosition, FilterBundle> = HashMap::new();
        let mut wanted = Vec::new();
        for position in &positions {
            match wallet.load_filter(position).map_err(StorageError::from_store)? {
                Some((header, filter)) => {
                    payloads.insert(*position, FilterBundle::from_parts(header, filter));
                }
                None => wanted.push(*position),
            }
        }

        if !wanted.is_empty() {
            match get_filters(fetch_request_sender, wanted).await {
                Ok(fetched) => payloads.extend(fetched),
                Err(error) => {
                    // transient: reinstate the whole batch, the next
                    // heartbeat retries
                    tracing::warn!("Filter fetch failed: {}", error);
                    self.core.reinstate(&positions);
                    return Ok(());
                }
            }
        }

        // apply strictly in position order, never proceeding past an
        // unverified gap
        let mut verified: Vec<(ChainPosition, FilterHeader, Vec<u8>)> = Vec::new();
        let mut cursor = self.cursor;
        for (index, position) in positions.iter().enumerate() {
            let Some(bundle) = payloads.remove(position) else {
                self.core.reinstate(&positions[index..]);
                break;
            };

            match verify_filter(position, &bundle, &cursor) {
                Ok(header) => {
                    cursor = header;
                    verified.push((*position, header, bundle.filter().clone()));
                }
                Err(error) => {
                    tracing::warn!("Redownloading: {}", error);
                    self.core.reinstate(&positions[index..]);
                    break;
                }
            }
        }

        let Some((new_tip, new_cursor)) = verified.last().map(|(p, h, _)| (*p, *h)) else {
            return Ok(());
        };

        // the tip may only advance after the corresponding store write
        // succeeds
        wallet
            .store_filters(verified)
            .map_err(StorageError::from_store)?;
        wallet
            .store_tip(DownloaderKind::Filters, new_tip)
            .map_err(StorageError::from_store)?;

        self.cursor = new_cursor;
        self.core.advance(new_tip);
        let _ = status_sender.send(StatusUpdate::TipChanged {
            kind: DownloaderKind::Filters,
            position: new_tip,
        });
        tracing::info!("Filter tip advanced to {}", new_tip);

        Ok(())
    }
}

// the filter chain starts from an all-zero header below genesis
fn null_header() -> FilterHeader {
    FilterHeader::from_byte_array([0u8; 32])
}

// the chained-header rule: hash(filter_hash_N || header_{N-1}) must equal
// the header the peer claimed for this filter
fn verify_filter(
    position: &ChainPosition,
    bundle: &FilterBundle,
    previous: &FilterHeader,
) -> Result<FilterHeader, DownloadError> {
    let filter = BlockFilter::new(bundle.filter());
    let header = filter.filter_header(previous);

    if header == *bundle.header() {
        Ok(header)
    } else {
        Err(DownloadError::FilterChainMismatch {
            position: *position,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::BlockHash;

    use super::*;

    fn position(height: i64) -> ChainPosition {
        ChainPosition::from_parts(height, BlockHash::from_byte_array([height as u8; 32]))
    }

    #[test]
    fn filter_chains_from_previous_header() {
        let previous = null_header();
        let filter = BlockFilter::new(&[0x01, 0xaa, 0xbb]);
        let claimed = filter.filter_header(&previous);
        let bundle = FilterBundle::from_parts(claimed, vec![0x01, 0xaa, 0xbb]);

        let verified = verify_filter(&position(0), &bundle, &previous).unwrap();
        assert_eq!(verified, claimed);
    }

    #[test]
    fn tampered_filter_fails_verification() {
        let previous = null_header();
        let filter = BlockFilter::new(&[0x01, 0xaa, 0xbb]);
        let claimed = filter.filter_header(&previous);
        // same claimed header, different filter content
        let bundle = FilterBundle::from_parts(claimed, vec![0x01, 0xaa, 0xcc]);

        let result = verify_filter(&position(0), &bundle, &previous);
        assert!(matches!(
            result,
            Err(DownloadError::FilterChainMismatch { .. })
        ));
    }

    #[test]
    fn stale_previous_header_fails_verification() {
        let filter = BlockFilter::new(&[0x01, 0xaa, 0xbb]);
        let claimed = filter.filter_header(&null_header());
        let bundle = FilterBundle::from_parts(claimed, vec![0x01, 0xaa, 0xbb]);

        let wrong_previous = FilterHeader::from_byte_array([9u8; 32]);
        assert!(verify_filter(&position(1), &bundle, &wrong_previous).is_err());
    }
}
