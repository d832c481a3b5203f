//! Error types for the consensus core.
//!
//! Remote-input failures (bad signatures, stale or malformed messages) are
//! recoverable: the offending message is dropped and logged. Broken local
//! invariants (WAL corruption, height bookkeeping that contradicts the
//! store) are fatal and surface as the `WalCorrupt` / `HeightInvariant`
//! variants so the caller can halt with context.

use {crate::types::Address, thiserror::Error};

/// Errors produced by the consensus core.
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// A vote, proposal, or aggregate signature failed verification.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A message referenced a validator that is not in the current set.
    #[error("unknown validator: {0}")]
    UnknownValidator(Address),

    /// A message referenced a validator index outside the current set.
    #[error("validator index {index} out of range (set size {size})")]
    IndexOutOfRange {
        /// The offending index.
        index: u32,
        /// The validator-set size.
        size: usize,
    },

    /// A bitmap's width does not match the validator-set size. Usually a
    /// protocol-version or epoch mismatch on the remote side.
    #[error("bitmap size mismatch: bitmap {bitmap} vs validator set {validators}")]
    BitmapMismatch {
        /// Width of the offending bitmap.
        bitmap: usize,
        /// Validator-set size at that height.
        validators: usize,
    },

    /// An aggregate does not carry quorum voting power.
    #[error("insufficient voting power: tallied {tallied}, quorum {quorum}")]
    InsufficientVotingPower {
        /// Voting power selected by the bitmap.
        tallied: u64,
        /// Required 2/3+ threshold.
        quorum: u64,
    },

    /// A validator cast two different votes at the same (height, round,
    /// type). The first vote is retained; this surfaces the conflict.
    #[error("conflicting vote from validator {0} at height {1} round {2}")]
    ConflictingVote(Address, u64, u32),

    /// The message is for a height/round the machine has moved past.
    #[error("stale message: height {height} round {round}")]
    Stale {
        /// Message height.
        height: u64,
        /// Message round.
        round: u32,
    },

    /// A proposal was signed by someone other than the round's proposer.
    #[error("invalid proposer for height {0} round {1}")]
    InvalidProposer(u64, u32),

    /// A block failed basic validation.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// A block part failed its Merkle proof or shape checks.
    #[error("invalid block part: {0}")]
    InvalidPart(String),

    /// BLS aggregation over the collected signatures failed.
    #[error("signature aggregation failed: {0}")]
    AggregationFailed(String),

    /// The write-ahead log is unreadable. Fatal: operators restore from a
    /// snapshot.
    #[error("WAL corrupt: {0}")]
    WalCorrupt(String),

    /// The app/store/state height bookkeeping violates its invariants.
    /// Fatal and unrecoverable without operator intervention.
    #[error("height invariant violated: {0}")]
    HeightInvariant(String),

    /// The epoch manager was asked for an inconsistent transition.
    #[error("epoch error: {0}")]
    Epoch(String),

    /// The genesis document is malformed.
    #[error("invalid genesis: {0}")]
    InvalidGenesis(String),

    /// Wire or persisted-state encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON encoding of a persisted document failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem error from the WAL or epoch DB.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type for consensus-core operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;
