//! Wire messages, channel taxonomy, and framing.
//!
//! The message catalogue is closed: every frame is
//! `[len: u32-le][channel: u8][tag: u8][bincode payload]`, the tag byte
//! picks the variant, and decoding is an exhaustive match. A message
//! whose tag does not belong on the channel it arrived on is dropped by
//! the caller. All payloads are bounded by `max_message_size`.

use {
    crate::error::{ConsensusNetError, Result},
    meridian_consensus_bft::{
        BitArray, Block, BlockId, Part, PartSetHeader, Proposal, SignAggr, Step, Vote,
        VoteType,
    },
    serde::{Deserialize, Serialize},
};

/// Logical channels with distinct priorities and queue depths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Round-step metadata and vote bookkeeping.
    State,
    /// Proposals, block parts, and signature aggregates.
    Data,
    /// Individual votes.
    Vote,
    /// `VoteSetBits` responses.
    VoteSetBits,
    /// Fast-sync block requests and responses.
    BlockSync,
}

impl Channel {
    /// Wire id byte.
    pub fn id(self) -> u8 {
        match self {
            Channel::State => 0x20,
            Channel::Data => 0x21,
            Channel::Vote => 0x22,
            Channel::VoteSetBits => 0x23,
            Channel::BlockSync => 0x40,
        }
    }

    /// Parse a wire id byte.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x20 => Some(Channel::State),
            0x21 => Some(Channel::Data),
            0x22 => Some(Channel::Vote),
            0x23 => Some(Channel::VoteSetBits),
            0x40 => Some(Channel::BlockSync),
            _ => None,
        }
    }

    /// Send priority; higher drains first under backpressure.
    pub fn priority(self) -> u8 {
        match self {
            Channel::State => 5,
            Channel::Data => 10,
            Channel::Vote => 5,
            Channel::VoteSetBits => 1,
            Channel::BlockSync => 3,
        }
    }

    /// Receive-queue depth. The data channel runs deep because block
    /// parts arrive in bursts.
    pub fn recv_queue_capacity(self) -> usize {
        match self {
            Channel::State => 100,
            Channel::Data => 1000,
            Channel::Vote => 200,
            Channel::VoteSetBits => 16,
            Channel::BlockSync => 64,
        }
    }
}

// Message tag bytes.
const TAG_NEW_ROUND_STEP: u8 = 0x01;
const TAG_COMMIT_STEP: u8 = 0x02;
const TAG_PROPOSAL: u8 = 0x11;
const TAG_PROPOSAL_POL: u8 = 0x12;
const TAG_BLOCK_PART: u8 = 0x13;
const TAG_VOTE: u8 = 0x14;
const TAG_HAS_VOTE: u8 = 0x15;
const TAG_VOTE_SET_MAJ23: u8 = 0x16;
const TAG_VOTE_SET_BITS: u8 = 0x17;
const TAG_MAJ23_SIGN_AGGR: u8 = 0x18;
// Fast-sync tags (BlockSync channel).
const TAG_STATUS_REQUEST: u8 = 0x01;
const TAG_STATUS_RESPONSE: u8 = 0x02;
const TAG_BLOCK_REQUEST: u8 = 0x03;
const TAG_BLOCK_RESPONSE: u8 = 0x04;

/// Consensus wire messages (the state/data/vote/vote-set-bits channels).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConsensusWireMessage {
    /// Our current round-step position, broadcast on every transition.
    NewRoundStep {
        /// Current height.
        height: u64,
        /// Current round.
        round: u32,
        /// Current step.
        step: Step,
        /// Seconds since the height started.
        seconds_since_start: u64,
        /// Round of our last commit, for catch-up gossip.
        last_commit_round: Option<u32>,
    },
    /// We are in Commit and hold these parts of the committed block.
    CommitStep {
        /// Committing height.
        height: u64,
        /// Part-set header of the committed block.
        parts_header: PartSetHeader,
        /// Which parts we hold.
        parts: BitArray,
    },
    /// A signed proposal.
    Proposal(Proposal),
    /// Prevote bitmap for the proposal's POL round.
    ProposalPol {
        /// Height of the proposal.
        height: u64,
        /// The proof-of-lock round.
        pol_round: u32,
        /// Who prevoted in that round.
        pol: BitArray,
    },
    /// One block part.
    BlockPart {
        /// Height the part belongs to.
        height: u64,
        /// Round the part belongs to.
        round: u32,
        /// The part.
        part: Part,
    },
    /// An individual vote.
    Vote(Vote),
    /// Mark that a validator's vote exists, so peers skip it.
    HasVote {
        /// Vote height.
        height: u64,
        /// Vote round.
        round: u32,
        /// Prevote or precommit.
        vote_type: VoteType,
        /// Validator index that voted.
        index: u32,
    },
    /// Claim of an observed 2/3+ majority.
    VoteSetMaj23 {
        /// Height of the claim.
        height: u64,
        /// Round of the claim.
        round: u32,
        /// Vote type of the claim.
        vote_type: VoteType,
        /// The majority block id.
        block_id: BlockId,
    },
    /// Which individual votes we hold for the claimed majority.
    VoteSetBits {
        /// Height of the response.
        height: u64,
        /// Round of the response.
        round: u32,
        /// Vote type of the response.
        vote_type: VoteType,
        /// The block id asked about.
        block_id: BlockId,
        /// Our vote bitmap for it.
        votes: BitArray,
    },
    /// A proposer-built 2/3+ signature aggregate.
    Maj23SignAggr(SignAggr),
}

impl ConsensusWireMessage {
    /// This message's tag byte.
    pub fn tag(&self) -> u8 {
        match self {
            Self::NewRoundStep { .. } => TAG_NEW_ROUND_STEP,
            Self::CommitStep { .. } => TAG_COMMIT_STEP,
            Self::Proposal(_) => TAG_PROPOSAL,
            Self::ProposalPol { .. } => TAG_PROPOSAL_POL,
            Self::BlockPart { .. } => TAG_BLOCK_PART,
            Self::Vote(_) => TAG_VOTE,
            Self::HasVote { .. } => TAG_HAS_VOTE,
            Self::VoteSetMaj23 { .. } => TAG_VOTE_SET_MAJ23,
            Self::VoteSetBits { .. } => TAG_VOTE_SET_BITS,
            Self::Maj23SignAggr(_) => TAG_MAJ23_SIGN_AGGR,
        }
    }

    /// The only channel this message may travel on.
    pub fn channel(&self) -> Channel {
        match self.tag() {
            TAG_NEW_ROUND_STEP | TAG_COMMIT_STEP | TAG_HAS_VOTE | TAG_VOTE_SET_MAJ23 => {
                Channel::State
            }
            TAG_PROPOSAL | TAG_PROPOSAL_POL | TAG_BLOCK_PART | TAG_MAJ23_SIGN_AGGR => {
                Channel::Data
            }
            TAG_VOTE => Channel::Vote,
            TAG_VOTE_SET_BITS => Channel::VoteSetBits,
            _ => unreachable!("tag() is closed over the variants"),
        }
    }

    /// Human-readable tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewRoundStep { .. } => "new_round_step",
            Self::CommitStep { .. } => "commit_step",
            Self::Proposal(_) => "proposal",
            Self::ProposalPol { .. } => "proposal_pol",
            Self::BlockPart { .. } => "block_part",
            Self::Vote(_) => "vote",
            Self::HasVote { .. } => "has_vote",
            Self::VoteSetMaj23 { .. } => "vote_set_maj23",
            Self::VoteSetBits { .. } => "vote_set_bits",
            Self::Maj23SignAggr(_) => "maj23_sign_aggr",
        }
    }
}

/// Fast-sync messages (the block-sync channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Ask a peer for its current height.
    StatusRequest,
    /// Our current height.
    StatusResponse {
        /// Highest committed height.
        height: u64,
    },
    /// Ask for the block at a height.
    BlockRequest {
        /// Requested height.
        height: u64,
    },
    /// The requested block (with its stored commit riding in the next
    /// block's `last_commit` as usual).
    BlockResponse {
        /// Height of the returned block.
        height: u64,
        /// The block.
        block: Block,
    },
}

impl SyncMessage {
    /// This message's tag byte (block-sync channel tag space).
    pub fn tag(&self) -> u8 {
        match self {
            Self::StatusRequest => TAG_STATUS_REQUEST,
            Self::StatusResponse { .. } => TAG_STATUS_RESPONSE,
            Self::BlockRequest { .. } => TAG_BLOCK_REQUEST,
            Self::BlockResponse { .. } => TAG_BLOCK_RESPONSE,
        }
    }

    /// Human-readable tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StatusRequest => "status_request",
            Self::StatusResponse { .. } => "status_response",
            Self::BlockRequest { .. } => "block_request",
            Self::BlockResponse { .. } => "block_response",
        }
    }
}

/// A decoded frame: which channel it arrived on and what it carried.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// A consensus-channel message.
    Consensus(ConsensusWireMessage),
    /// A fast-sync message.
    Sync(SyncMessage),
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Encode `[len][channel][tag][payload]` for a consensus message on its
/// canonical channel.
pub fn encode_consensus(msg: &ConsensusWireMessage, max_size: usize) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg)?;
    encode_frame(msg.channel().id(), msg.tag(), &payload, max_size)
}

/// Encode a fast-sync message on the block-sync channel.
pub fn encode_sync(msg: &SyncMessage, max_size: usize) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg)?;
    encode_frame(Channel::BlockSync.id(), msg.tag(), &payload, max_size)
}

fn encode_frame(channel: u8, tag: u8, payload: &[u8], max_size: usize) -> Result<Vec<u8>> {
    let body_len = payload.len() + 2;
    if body_len > max_size {
        return Err(ConsensusNetError::MessageTooLarge {
            size: body_len,
            max: max_size,
        });
    }
    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.push(channel);
    frame.push(tag);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read the body length from a 4-byte frame header.
pub fn read_frame_len(header: &[u8; 4]) -> usize {
    u32::from_le_bytes(*header) as usize
}

/// Decode a frame body (`[channel][tag][payload]`), enforcing that the
/// tag belongs on the channel it arrived on.
pub fn decode_frame(body: &[u8]) -> Result<(Channel, WireMessage)> {
    if body.len() < 2 {
        return Err(ConsensusNetError::TruncatedFrame(format!(
            "{} bytes",
            body.len()
        )));
    }
    let channel_id = body[0];
    let tag = body[1];
    let payload = &body[2..];

    let channel = Channel::from_id(channel_id)
        .ok_or(ConsensusNetError::UnknownChannel(channel_id))?;

    if channel == Channel::BlockSync {
        let msg: SyncMessage = bincode::deserialize(payload)?;
        if msg.tag() != tag {
            return Err(ConsensusNetError::UnknownTag(tag));
        }
        return Ok((channel, WireMessage::Sync(msg)));
    }

    let msg: ConsensusWireMessage = bincode::deserialize(payload)?;
    if msg.tag() != tag {
        return Err(ConsensusNetError::UnknownTag(tag));
    }
    if msg.channel() != channel {
        return Err(ConsensusNetError::WrongChannel {
            tag,
            channel: channel_id,
        });
    }
    Ok((channel, WireMessage::Consensus(msg)))
}
