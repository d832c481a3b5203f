//! Telemetry events emitted by the state machine.
//!
//! The reactor publishes these over a broadcast bus; RPC and metrics
//! collectors subscribe without ever touching round state.

use {
    crate::{
        engine::Step,
        types::{Address, Hash},
        vote::VoteType,
    },
    serde::{Deserialize, Serialize},
};

/// User-visible consensus happenings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConsensusEvent {
    /// The machine entered a new (height, round, step).
    NewRoundStep {
        /// Current height.
        height: u64,
        /// Current round.
        round: u32,
        /// Step just entered.
        step: Step,
    },

    /// A block was finalized and handed to the store.
    FinalCommitted {
        /// Committed height.
        height: u64,
        /// Hash of the committed block.
        block_hash: Hash,
        /// Round the commit happened in.
        round: u32,
    },

    /// A vote was cast locally or accepted from the network.
    Vote {
        /// Vote height.
        height: u64,
        /// Vote round.
        round: u32,
        /// Prevote or precommit.
        vote_type: VoteType,
        /// Index of the voting validator.
        validator_index: u32,
    },

    /// A remote message failed validation and was dropped.
    ValidationFailed {
        /// Peer the message came from ("local" for internal).
        peer_id: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The validator set changed at an epoch boundary.
    EpochTransition {
        /// The epoch that was entered.
        epoch_number: u64,
        /// First height governed by the new set.
        start_height: u64,
    },

    /// The local node joined the validator set and should start
    /// consensus if it is not already running.
    StartMining {
        /// The local validator address.
        address: Address,
    },
}
