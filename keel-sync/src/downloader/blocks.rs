//! Full block downloader.
//!
//! The verification rule is direct: the downloaded block's computed hash
//! must equal the hash of the chain position it was requested for. The block
//! store fed here is what lets match processing skip its own network round
//! trips for blocks the downloader already walked past.

use std::collections::HashMap;

use bitcoin::consensus::encode;
use bitcoin::Block;
use tokio::sync::mpsc::UnboundedSender;

use crate::client::{get_blocks, FetchRequest};
use crate::downloader::{DownloaderCore, PositionUpdate};
use crate::error::{DownloadError, StorageError, SyncError};
use crate::primitives::{ChainPosition, DownloaderKind, StatusUpdate};
use crate::traits::{HeaderOracle, SyncBlocks, SyncTips};

/// Downloads, verifies and persists full blocks along the best chain.
pub struct BlockDownloader {
    core: DownloaderCore,
}

impl BlockDownloader {
    /// Restore the downloader from the wallet's persisted tip.
    pub fn load<W>(wallet: &W) -> Result<Self, SyncError>
    where
        W: SyncTips + SyncBlocks,
    {
        let tip = wallet
            .load_tip(DownloaderKind::Blocks)
            .map_err(StorageError::from_store)?
            .unwrap_or_else(ChainPosition::null);

        Ok(BlockDownloader {
            core: DownloaderCore::new(DownloaderKind::Blocks, tip),
        })
    }

    /// The verified block tip.
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
        W: SyncTips + SyncBlocks,
        H: HeaderOracle + ?Sized,
    {
        // blocks carry no chained verification value, so a reorg needs no
        // cursor restoration here
        if self.core.update_position(oracle, limit) == PositionUpdate::NoProgress {
            return Ok(());
        }

        let Some((_batch_id, positions)) = self.core.next_batch() else {
            return Ok(());
        };

        // skip redundant downloads for blocks that already exist locally
        let mut stored: HashMap<ChainPosition, Block> = HashMap::new();
        let mut wanted = Vec::new();
        for position in &positions {
            match wallet.load_block(position).map_err(StorageError::from_store)? {
                Some(block) => {
                    stored.insert(*position, block);
                }
                None => wanted.push(*position),
            }
        }

        let mut fetched: HashMap<ChainPosition, Vec<u8>> = HashMap::new();
        if !wanted.is_empty() {
            match get_blocks(fetch_request_sender, wanted).await {
                Ok(blocks) => fetched.extend(blocks),
                Err(error) => {
                    tracing::warn!("Block fetch failed: {}", error);
                    self.core.reinstate(&positions);
                    return Ok(());
                }
            }
        }

        // apply strictly in position order, never proceeding past an
        // unverified gap
        let mut verified: Vec<(ChainPosition, Block)> = Vec::new();
        for (index, position) in positions.iter().enumerate() {
            let block = if let Some(block) = stored.remove(position) {
                // already verified when it was stored
                Some(block)
            } else if let Some(raw) = fetched.remove(position) {
                match verify_block(position, &raw) {
                    Ok(block) => Some(block),
                    Err(error) => {
                        tracing::warn!("Redownloading: {}", error);
                        None
                    }
                }
            } else {
                None
            };

            match block {
                Some(block) => verified.push((*position, block)),
                None => {
                    self.core.reinstate(&positions[index..]);
                    break;
                }
            }
        }

        let Some(new_tip) = verified.last().map(|(position, _)| *position) else {
            return Ok(());
        };

        // tip advances only after the store write succeeds
        wallet
            .store_blocks(verified)
            .map_err(StorageError::from_store)?;
        wallet
            .store_tip(DownloaderKind::Blocks, new_tip)
            .map_err(StorageError::from_store)?;

        self.core.advance(new_tip);
        let _ = status_sender.send(StatusUpdate::TipChanged {
            kind: DownloaderKind::Blocks,
            position: new_tip,
        });
        tracing::info!("Block tip advanced to {}", new_tip);

        Ok(())
    }
}

// decode the raw payload and check its computed hash against the position
fn verify_block(position: &ChainPosition, raw: &[u8]) -> Result<Block, DownloadError> {
    let block: Block = encode::deserialize(raw).map_err(|error| DownloadError::Malformed {
        position: *position,
        reason: error.to_string(),
    })?;

    if block.block_hash() == position.hash() {
        Ok(block)
    } else {
        Err(DownloadError::BlockHashMismatch {
            position: *position,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::block::{Header, Version};
    use bitcoin::hashes::Hash;
    use bitcoin::{BlockHash, CompactTarget, TxMerkleNode};

    use super::*;

    fn empty_block(prev: BlockHash) -> Block {
        Block {
            header: Header {
                version: Version::TWO,
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: 0,
            },
            txdata: Vec::new(),
        }
    }

    #[test]
    fn block_matching_position_verifies() {
        let block = empty_block(BlockHash::all_zeros());
        let position = ChainPosition::from_parts(0, block.block_hash());
        let raw = encode::serialize(&block);

        let decoded = verify_block(&position, &raw).unwrap();
        assert_eq!(decoded.block_hash(), block.block_hash());
    }

    #[test]
    fn block_for_wrong_position_is_rejected() {
        let block = empty_block(BlockHash::all_zeros());
        let position = ChainPosition::from_parts(0, BlockHash::from_byte_array([1u8; 32]));
        let raw = encode::serialize(&block);

        assert!(matches!(
            verify_block(&position, &raw),
            Err(DownloadError::BlockHashMismatch { .. })
        ));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let block = empty_block(BlockHash::all_zeros());
        let position = ChainPosition::from_parts(0, block.block_hash());
        let raw = encode::serialize(&block);

        assert!(matches!(
            verify_block(&position, &raw[..raw.len() - 1]),
            Err(DownloadError::Malformed { .. })
        ));
    }
}
