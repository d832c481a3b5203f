//! Vote tallies for one height: per-round prevote and precommit sets.
//!
//! Each `VoteSet` tracks which validators voted (a bitmap), the voting
//! power behind every block id seen, and the first block id to cross the
//! 2/3+ threshold. Conflicting votes keep the first vote and surface the
//! conflict as evidence. `HeightVoteSet` owns the per-round sets and
//! creates them lazily.

use {
    crate::{
        bit_array::BitArray,
        error::{ConsensusError, Result},
        keys::{self, aggregate_signatures, BlsSignature},
        sign_aggr::SignAggr,
        validator_set::ValidatorSet,
        vote::{BlockId, Vote, VoteType},
    },
    log::warn,
    std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
    },
};

/// Evidence of a validator voting twice at the same (round, type) for
/// different block ids. Collection beyond surfacing is out of scope.
#[derive(Debug, Clone)]
pub struct VoteConflict {
    /// Index of the offending validator.
    pub validator_index: u32,
    /// The vote retained by the set.
    pub existing: Vote,
    /// The conflicting vote that was rejected.
    pub conflicting: Vote,
}

/// Votes of one type for one (height, round).
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: u32,
    vote_type: VoteType,
    validators: Arc<ValidatorSet>,
    votes: Vec<Option<Vote>>,
    bit_array: BitArray,
    sum: u64,
    power_by_block: HashMap<BlockId, u64>,
    maj23: Option<BlockId>,
    conflicts: Vec<VoteConflict>,
    peer_maj23s: HashMap<String, BlockId>,
}

impl VoteSet {
    /// Empty vote set for the given coordinates.
    pub fn new(
        chain_id: &str,
        height: u64,
        round: u32,
        vote_type: VoteType,
        validators: Arc<ValidatorSet>,
    ) -> Self {
        let size = validators.len();
        Self {
            chain_id: chain_id.to_string(),
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; size],
            bit_array: BitArray::new(size),
            sum: 0,
            power_by_block: HashMap::new(),
            maj23: None,
            conflicts: Vec::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    /// Which validators have voted.
    pub fn bit_array(&self) -> &BitArray {
        &self.bit_array
    }

    /// The vote cast by validator `index`, if any.
    pub fn get(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize).and_then(|v| v.as_ref())
    }

    /// Total voting power that has voted, across all block ids.
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Conflicts observed so far.
    pub fn conflicts(&self) -> &[VoteConflict] {
        &self.conflicts
    }

    /// Add a vote after verifying its signature and membership.
    ///
    /// Returns `Ok(false)` for an exact duplicate. A conflicting vote
    /// (same validator, different block id) keeps the first vote, records
    /// the conflict, and returns `ConflictingVote`.
    pub fn add_vote(&mut self, vote: &Vote) -> Result<bool> {
        if vote.height != self.height
            || vote.round != self.round
            || vote.vote_type != self.vote_type
        {
            return Err(ConsensusError::Stale {
                height: vote.height,
                round: vote.round,
            });
        }

        let index = vote.validator_index;
        let validator = self
            .validators
            .get_by_index(index as usize)
            .ok_or(ConsensusError::IndexOutOfRange {
                index,
                size: self.validators.len(),
            })?;

        keys::verify_single(
            &validator.pub_key,
            &vote.sign_bytes(&self.chain_id),
            &vote.signature,
        )?;

        if let Some(existing) = &self.votes[index as usize] {
            if existing.block_id == vote.block_id {
                return Ok(false); // idempotent duplicate
            }
            let conflict = VoteConflict {
                validator_index: index,
                existing: existing.clone(),
                conflicting: vote.clone(),
            };
            warn!(
                "conflicting {} from validator {} at {}/{}: kept {}, rejected {}",
                self.vote_type, index, self.height, self.round, conflict.existing.block_id,
                vote.block_id
            );
            self.conflicts.push(conflict);
            return Err(ConsensusError::ConflictingVote(
                validator.address,
                self.height,
                self.round,
            ));
        }

        let power = validator.voting_power;
        self.votes[index as usize] = Some(vote.clone());
        self.bit_array.set(index as usize, true);
        self.sum += power;

        let entry = self.power_by_block.entry(vote.block_id).or_insert(0);
        *entry += power;
        if self.maj23.is_none() && *entry >= self.validators.quorum() {
            // First block id (possibly nil) to cross quorum wins.
            self.maj23 = Some(vote.block_id);
        }
        Ok(true)
    }

    /// The first block id (possibly nil) that reached quorum, if any.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    /// Whether some single block id has reached quorum.
    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Whether the summed power across all block ids reaches quorum.
    pub fn has_two_thirds_any(&self) -> bool {
        self.sum >= self.validators.quorum()
    }

    /// Record a peer's claim that it observed 2/3+ for `block_id`, so the
    /// query routine stops asking it.
    pub fn set_peer_maj23(&mut self, peer_id: &str, block_id: BlockId) {
        self.peer_maj23s.insert(peer_id.to_string(), block_id);
    }

    /// A peer's recorded 2/3+ claim.
    pub fn peer_maj23(&self, peer_id: &str) -> Option<&BlockId> {
        self.peer_maj23s.get(peer_id)
    }

    /// Bitmap of our votes for the given block id, for `VoteSetBits`
    /// responses.
    pub fn votes_for(&self, block_id: &BlockId) -> BitArray {
        let mut bits = BitArray::new(self.validators.len());
        for (i, vote) in self.votes.iter().enumerate() {
            if let Some(vote) = vote {
                if vote.block_id == *block_id {
                    bits.set(i, true);
                }
            }
        }
        bits
    }

    /// Aggregate the votes behind the 2/3+ block id into a `SignAggr`.
    ///
    /// Returns `Ok(None)` when no block id has quorum yet.
    pub fn make_sign_aggr(&self) -> Result<Option<SignAggr>> {
        let Some(maj23) = self.maj23 else {
            return Ok(None);
        };
        let mut bits = BitArray::new(self.validators.len());
        let mut sigs: Vec<BlsSignature> = Vec::new();
        for (i, vote) in self.votes.iter().enumerate() {
            if let Some(vote) = vote {
                if vote.block_id == maj23 {
                    bits.set(i, true);
                    sigs.push(vote.signature.clone());
                }
            }
        }
        let signature = aggregate_signatures(sigs)?;
        Ok(Some(SignAggr::new(
            self.height,
            self.round,
            self.vote_type,
            self.validators.len() as u32,
            maj23,
            bits,
            signature,
        )))
    }
}

/// Prevote and precommit sets for one round.
#[derive(Debug, Clone)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// All vote sets for one height, keyed by round.
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: Arc<ValidatorSet>,
    round: u32,
    round_vote_sets: BTreeMap<u32, RoundVoteSet>,
}

impl HeightVoteSet {
    /// Fresh vote bookkeeping for a height.
    pub fn new(chain_id: &str, height: u64, validators: Arc<ValidatorSet>) -> Self {
        let mut hvs = Self {
            chain_id: chain_id.to_string(),
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
        };
        hvs.ensure_round(0);
        hvs
    }

    /// The height these sets belong to.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// The current round.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// The validator set backing the tallies.
    pub fn validators(&self) -> &Arc<ValidatorSet> {
        &self.validators
    }

    fn ensure_round(&mut self, round: u32) {
        if !self.round_vote_sets.contains_key(&round) {
            let prevotes = VoteSet::new(
                &self.chain_id,
                self.height,
                round,
                VoteType::Prevote,
                Arc::clone(&self.validators),
            );
            let precommits = VoteSet::new(
                &self.chain_id,
                self.height,
                round,
                VoteType::Precommit,
                Arc::clone(&self.validators),
            );
            self.round_vote_sets
                .insert(round, RoundVoteSet { prevotes, precommits });
        }
    }

    /// Advance the current round; sets for `round` and `round + 1` exist
    /// afterwards (votes one round ahead are buffered, not dropped).
    pub fn set_round(&mut self, round: u32) {
        self.round = round;
        self.ensure_round(round);
        self.ensure_round(round + 1);
    }

    /// Route a vote to its (round, type) set, creating it on first use.
    pub fn add_vote(&mut self, vote: &Vote) -> Result<bool> {
        if vote.height != self.height {
            return Err(ConsensusError::Stale {
                height: vote.height,
                round: vote.round,
            });
        }
        self.ensure_round(vote.round);
        let rvs = self
            .round_vote_sets
            .get_mut(&vote.round)
            .expect("round ensured above");
        match vote.vote_type {
            VoteType::Prevote => rvs.prevotes.add_vote(vote),
            VoteType::Precommit => rvs.precommits.add_vote(vote),
        }
    }

    /// Prevote set for `round`, if it exists.
    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|r| &r.prevotes)
    }

    /// Precommit set for `round`, if it exists.
    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|r| &r.precommits)
    }

    /// Mutable prevote set, created on first access.
    pub fn prevotes_mut(&mut self, round: u32) -> &mut VoteSet {
        self.ensure_round(round);
        &mut self
            .round_vote_sets
            .get_mut(&round)
            .expect("round ensured above")
            .prevotes
    }

    /// Mutable precommit set, created on first access.
    pub fn precommits_mut(&mut self, round: u32) -> &mut VoteSet {
        self.ensure_round(round);
        &mut self
            .round_vote_sets
            .get_mut(&round)
            .expect("round ensured above")
            .precommits
    }

    /// The latest round with a 2/3+ prevote for a concrete block:
    /// the proof-of-lock a re-proposer attaches.
    pub fn pol_info(&self) -> Option<(u32, BlockId)> {
        self.round_vote_sets
            .iter()
            .rev()
            .find_map(|(round, rvs)| {
                rvs.prevotes
                    .two_thirds_majority()
                    .filter(|bid| !bid.is_nil())
                    .map(|bid| (*round, bid))
            })
    }

    /// Record a peer's 2/3+ claim for the given (round, type).
    pub fn set_peer_maj23(
        &mut self,
        round: u32,
        vote_type: VoteType,
        peer_id: &str,
        block_id: BlockId,
    ) {
        self.ensure_round(round);
        let rvs = self
            .round_vote_sets
            .get_mut(&round)
            .expect("round ensured above");
        match vote_type {
            VoteType::Prevote => rvs.prevotes.set_peer_maj23(peer_id, block_id),
            VoteType::Precommit => rvs.precommits.set_peer_maj23(peer_id, block_id),
        }
    }
}
