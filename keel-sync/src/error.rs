//! Top level error module for the crate

use crate::primitives::ChainPosition;

/// Top level error enum encapsulating any error that may occur during sync
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Errors associated with downloading and verifying filters or blocks
    #[error("Download error. {0}")]
    Download(#[from] DownloadError),
    /// Errors associated with scanning
    #[error("Scan error. {0}")]
    Scan(#[from] ScanError),
    /// Errors surfaced by the wallet's persistent store. Fatal: the engine
    /// never retries a failed store write.
    #[error("Storage error. {0}")]
    Storage(#[from] StorageError),
    /// A channel to a collaborator task closed unexpectedly
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}

/// Errors raised while downloading or verifying payloads.
///
/// Verification variants are recoverable: the owning downloader reinstates
/// the failing position for redownload and never surfaces them past itself.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// The filter header did not hash-chain from its predecessor
    #[error("filter header at {position} does not chain from previous header")]
    FilterChainMismatch {
        /// The position whose filter failed verification.
        position: ChainPosition,
    },
    /// The downloaded block's computed hash differs from the expected hash
    #[error("block hash mismatch at {position}")]
    BlockHashMismatch {
        /// The position whose block failed verification.
        position: ChainPosition,
    },
    /// The payload could not be decoded
    #[error("malformed payload at {position}: {reason}")]
    Malformed {
        /// The position whose payload could not be decoded.
        position: ChainPosition,
        /// Decoder diagnostic.
        reason: String,
    },
    /// The peer layer failed to deliver a requested payload
    #[error("fetch failed: {0}")]
    Fetch(String),
}

/// Errors raised while scanning blocks for wallet activity
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// A block fetched for match processing could not be decoded
    #[error("failed to decode block at {position}: {reason}")]
    BlockDecode {
        /// The position whose block could not be decoded.
        position: ChainPosition,
        /// Decoder diagnostic.
        reason: String,
    },
    /// A stored filter could not be queried
    #[error("failed to query filter at {position}: {reason}")]
    FilterQuery {
        /// The position whose filter could not be queried.
        position: ChainPosition,
        /// Filter reader diagnostic.
        reason: String,
    },
    /// The subchain named by a job is not registered in the account index
    #[error("unknown subchain {0}")]
    UnknownSubchain(String),
}

/// Opaque wrapper for the embedder's store error type.
///
/// The store traits expose an associated `Error: Debug`; this type carries
/// its rendering across the engine boundary.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StorageError(String);

impl StorageError {
    /// Wrap an embedder store error, preserving its debug rendering.
    pub fn from_store<E: std::fmt::Debug>(error: E) -> Self {
        StorageError(format!("{:?}", error))
    }
}
