//! Aggregate-vote containers.
//!
//! A `SignAggr` replaces N individual votes with one BLS aggregate over a
//! validator bitmap. The proposer builds one when a vote set reaches 2/3+
//! for a single block id; every other validator verifies it instead of
//! tallying individual votes.

use {
    crate::{
        bit_array::BitArray,
        error::Result,
        keys::AggregateSignature,
        validator_set::ValidatorSet,
        vote::{vote_sign_bytes, BlockId, VoteType},
    },
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// A BLS signature aggregate standing in for 2/3+ individual votes at one
/// (height, round, type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignAggr {
    /// Block height.
    pub height: u64,
    /// Round within the height.
    pub round: u32,
    /// Which vote phase was aggregated.
    pub vote_type: VoteType,
    /// Validator-set size at this height; the bitmap width must match.
    pub num_validators: u32,
    /// The block id the aggregated votes agree on; nil for a nil
    /// aggregate.
    pub block_id: BlockId,
    /// One bit per validator in address-sorted order.
    pub bit_array: BitArray,
    /// Group sum of the contributors' individual signatures.
    pub signature: AggregateSignature,
}

impl SignAggr {
    /// Assemble an aggregate from its parts.
    pub fn new(
        height: u64,
        round: u32,
        vote_type: VoteType,
        num_validators: u32,
        block_id: BlockId,
        bit_array: BitArray,
        signature: AggregateSignature,
    ) -> Self {
        Self {
            height,
            round,
            vote_type,
            num_validators,
            block_id,
            bit_array,
            signature,
        }
    }

    /// The canonical message every contributor signed.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        vote_sign_bytes(
            chain_id,
            self.height,
            self.round,
            self.vote_type,
            &self.block_id,
        )
    }

    /// Full validity check against a validator set: bitmap width matches
    /// the set, the aggregate verifies against the bitmap-selected keys
    /// over the canonical sign-bytes, and the tallied power reaches
    /// quorum.
    pub fn verify(&self, chain_id: &str, validators: &ValidatorSet) -> Result<()> {
        let pub_keys = validators.bitmap_pub_keys(&self.bit_array)?;
        let msg = self.sign_bytes(chain_id);
        crate::keys::verify_aggregate(&self.signature, &pub_keys, &msg)?;

        let tallied = validators.tallied_voting_power(&self.bit_array)?;
        let quorum = validators.quorum();
        if tallied < quorum {
            return Err(crate::error::ConsensusError::InsufficientVotingPower {
                tallied,
                quorum,
            });
        }
        Ok(())
    }

    /// Whether the bitmap-selected power reaches quorum under `validators`.
    /// Width mismatches count as no.
    pub fn has_quorum(&self, validators: &ValidatorSet) -> bool {
        validators
            .tallied_voting_power(&self.bit_array)
            .map(|tallied| tallied >= validators.quorum())
            .unwrap_or(false)
    }

    /// True when this aggregate is a commit: a precommit aggregate for a
    /// concrete block id with quorum power.
    pub fn is_commit(&self, validators: &ValidatorSet) -> bool {
        self.vote_type == VoteType::Precommit
            && !self.block_id.is_nil()
            && self.has_quorum(validators)
    }
}

impl PartialEq for SignAggr {
    fn eq(&self, other: &Self) -> bool {
        self.height == other.height
            && self.round == other.round
            && self.vote_type == other.vote_type
            && self.num_validators == other.num_validators
            && self.block_id == other.block_id
            && self.bit_array == other.bit_array
            // Group elements compare by canonical encoding.
            && bincode::serialize(&self.signature).ok()
                == bincode::serialize(&other.signature).ok()
    }
}

impl fmt::Display for SignAggr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignAggr{{{}/{} {} {} bits={}}}",
            self.height, self.round, self.vote_type, self.block_id, self.bit_array
        )
    }
}
