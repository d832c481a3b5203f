//! Votes, proposals, and canonical sign-bytes.
//!
//! Sign-bytes must be byte-exact across implementations: they are the
//! bincode encoding of the canonical structs below, which carry the chain
//! id for domain separation. Changing either layout is a hard fork.

use {
    crate::{
        keys::BlsSignature,
        types::Hash,
    },
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// The two vote phases of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoteType {
    /// First-phase vote cast after evaluating the proposal.
    Prevote,
    /// Second-phase vote cast after observing a 2/3+ prevote aggregate.
    Precommit,
}

impl VoteType {
    /// Wire byte for this vote type.
    pub fn to_byte(self) -> u8 {
        match self {
            VoteType::Prevote => 0x01,
            VoteType::Precommit => 0x02,
        }
    }

    /// Parse a wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(VoteType::Prevote),
            0x02 => Some(VoteType::Precommit),
            _ => None,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "prevote"),
            VoteType::Precommit => write!(f, "precommit"),
        }
    }
}

/// Commitment to the chunked representation of a block used for gossip.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PartSetHeader {
    /// Number of parts the serialized block was split into.
    pub total: u32,
    /// Merkle root over the part hashes.
    pub root: Hash,
}

impl PartSetHeader {
    /// True for the zero header (no part set).
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.root.is_zero()
    }
}

impl fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.total, self.root)
    }
}

/// Identifies a block: its hash plus the part-set header committing to the
/// gossiped chunks. The zero value is the "nil" block id carried by nil
/// votes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockId {
    /// Hash of the block.
    pub hash: Hash,
    /// Part-set commitment.
    pub parts: PartSetHeader,
}

impl BlockId {
    /// The nil block id (all zero).
    pub fn nil() -> Self {
        Self::default()
    }

    /// True for the nil block id.
    pub fn is_nil(&self) -> bool {
        self.hash.is_zero() && self.parts.is_zero()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else {
            write!(f, "{}@{}", self.hash, self.parts)
        }
    }
}

/// A single validator's vote for one (height, round, type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Block height.
    pub height: u64,
    /// Round within the height.
    pub round: u32,
    /// Prevote or precommit.
    pub vote_type: VoteType,
    /// Voted block id; nil for a nil-vote.
    pub block_id: BlockId,
    /// The voter's index in the address-sorted validator set.
    pub validator_index: u32,
    /// BLS signature over the canonical sign-bytes.
    pub signature: BlsSignature,
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote{{{}/{} {} v{} {}}}",
            self.height, self.round, self.vote_type, self.validator_index, self.block_id
        )
    }
}

/// A block proposal signed by the round's proposer.
///
/// `pol_round`/`pol_block_id` carry the proof-of-lock: set when the
/// proposer re-proposes a block it saw 2/3+ prevotes for in an earlier
/// round, so locked validators know they may re-prevote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Block height.
    pub height: u64,
    /// Round within the height.
    pub round: u32,
    /// Proposed block: hash plus part-set commitment.
    pub block_id: BlockId,
    /// Round of the proof-of-lock, if re-proposing.
    pub pol_round: Option<u32>,
    /// Block id of the proof-of-lock; nil when `pol_round` is none.
    pub pol_block_id: BlockId,
    /// Proposer's BLS signature over the canonical sign-bytes.
    pub signature: BlsSignature,
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal{{{}/{} {} pol={:?}}}",
            self.height, self.round, self.block_id, self.pol_round
        )
    }
}

// ---------------------------------------------------------------------------
// Canonical sign-bytes
// ---------------------------------------------------------------------------

/// Canonical vote layout. The bincode encoding of this struct is what
/// validators sign and what aggregate verification runs against.
#[derive(Serialize, Deserialize)]
struct CanonicalVote<'a> {
    chain_id: &'a str,
    height: u64,
    round: u32,
    vote_type: u8,
    block_id: BlockId,
}

/// Canonical proposal layout. `pol_round` encodes as −1 when absent.
#[derive(Serialize, Deserialize)]
struct CanonicalProposal<'a> {
    chain_id: &'a str,
    height: u64,
    round: u32,
    pol_round: i64,
    block_id: BlockId,
}

/// Canonical sign-bytes for a vote at (height, round, type, block id).
pub fn vote_sign_bytes(
    chain_id: &str,
    height: u64,
    round: u32,
    vote_type: VoteType,
    block_id: &BlockId,
) -> Vec<u8> {
    let canonical = CanonicalVote {
        chain_id,
        height,
        round,
        vote_type: vote_type.to_byte(),
        block_id: *block_id,
    };
    bincode::serialize(&canonical).expect("canonical vote encoding cannot fail")
}

/// Canonical sign-bytes for a proposal.
pub fn proposal_sign_bytes(chain_id: &str, proposal: &Proposal) -> Vec<u8> {
    let canonical = CanonicalProposal {
        chain_id,
        height: proposal.height,
        round: proposal.round,
        pol_round: proposal.pol_round.map(i64::from).unwrap_or(-1),
        block_id: proposal.block_id,
    };
    bincode::serialize(&canonical).expect("canonical proposal encoding cannot fail")
}

impl Vote {
    /// This vote's canonical sign-bytes under the given chain id.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        vote_sign_bytes(
            chain_id,
            self.height,
            self.round,
            self.vote_type,
            &self.block_id,
        )
    }
}
