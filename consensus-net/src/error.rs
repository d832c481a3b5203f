//! Error types for the consensus networking layer.

use thiserror::Error;

/// Errors that can occur in the consensus networking layer.
#[derive(Error, Debug)]
pub enum ConsensusNetError {
    /// Failed to serialize or deserialize a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Message exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A message arrived on a channel its type does not belong to.
    #[error("message tag {tag:#04x} not valid on channel {channel:#04x}")]
    WrongChannel {
        /// The message's type tag.
        tag: u8,
        /// The channel it arrived on.
        channel: u8,
    },

    /// Unknown channel id byte in a frame.
    #[error("unknown channel id {0:#04x}")]
    UnknownChannel(u8),

    /// Unknown message tag byte for the given channel.
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),

    /// A frame was shorter than its header requires.
    #[error("truncated frame: {0}")]
    TruncatedFrame(String),

    /// The peer is not known to the peer manager.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Maximum peer count has been reached.
    #[error("maximum peers reached: {0}")]
    MaxPeersReached(usize),

    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The channel delivering messages to the state machine is closed.
    #[error("consensus channel closed")]
    ChannelClosed,

    /// The requested block height is not available.
    #[error("block not available at height {0}")]
    BlockNotAvailable(u64),

    /// A consensus-core error surfaced through the networking layer.
    #[error("consensus error: {0}")]
    Consensus(#[from] meridian_consensus_bft::ConsensusError),
}

/// Convenience result type for consensus networking operations.
pub type Result<T> = std::result::Result<T, ConsensusNetError>;
