//! Meridian BFT Consensus Core
//!
//! This crate implements the deterministic heart of Meridian's
//! Tendermint-lineage consensus: a round-based, leader-rotating,
//! two-phase-vote state machine in which each finalization commit is a
//! single BLS signature aggregate over a validator bitmap instead of N
//! individual votes.
//!
//! 1. **Propose** — the round's proposer (an accum-weighted round-robin)
//!    chunks a candidate block into a Merkle-committed part set and
//!    broadcasts a signed proposal.
//! 2. **Prevote** — validators reassemble and validate the block, then
//!    send a BLS-signed prevote to the proposer.
//! 3. **Precommit** — on 2/3+ prevotes for one block id the proposer
//!    aggregates them into a `SignAggr`; validators verify it, lock, and
//!    precommit.
//! 4. **Commit** — the 2/3+ precommit aggregate is the commit; it is
//!    stored with the block and the next height begins.
//!
//! All I/O goes through collaborator traits ([`external`]); the state
//! machine itself ([`engine`]) is pure input → output, which is what the
//! write-ahead log ([`wal`]) and crash recovery ([`replay`]) rely on.
//! Validator-set transitions happen only at epoch boundaries
//! ([`epoch`]), so bitmap widths are stable within an epoch.

pub mod bit_array;
pub mod block;
pub mod config;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod events;
pub mod external;
pub mod genesis;
pub mod height_vote_set;
pub mod keys;
pub mod part_set;
pub mod replay;
pub mod sign_aggr;
pub mod timeout;
pub mod types;
pub mod validator_set;
pub mod vote;
pub mod wal;

// Re-exports for convenience
pub use bit_array::BitArray;
pub use block::{Block, BlockHeader};
pub use config::ConsensusConfig;
pub use engine::{ConsensusEngine, EngineInput, EngineOutput, RoundState, Step};
pub use epoch::{Epoch, EpochDescriptor, EpochManager, EpochStatus, EpochTransition};
pub use error::{ConsensusError, Result};
pub use events::ConsensusEvent;
pub use external::{
    ApplyResult, BlockExecutor, BlockProducer, BlockStore, Clock, LocalSigner,
    MemoryBlockStore, SignerError, SystemClock, VoteSigner,
};
pub use genesis::{Genesis, GenesisEpoch, GenesisValidator, RewardScheme};
pub use height_vote_set::{HeightVoteSet, VoteConflict, VoteSet};
pub use keys::{
    aggregate_signatures, derive_address, verify_aggregate, AggregateSignature,
    BlsSignature, ConsensusKeyPair, PubKey,
};
pub use part_set::{Part, PartSet, PART_SIZE};
pub use replay::{handshake, replay_wal, HandshakeOutcome};
pub use sign_aggr::SignAggr;
pub use timeout::{TimeoutInfo, TimeoutScheduler};
pub use types::{Address, Hash};
pub use validator_set::{Validator, ValidatorChange, ValidatorSet};
pub use vote::{
    proposal_sign_bytes, vote_sign_bytes, BlockId, PartSetHeader, Proposal, Vote, VoteType,
};
pub use wal::{Wal, WalEntry};
