//! What we believe each peer has.
//!
//! The gossip routines decide what to send by diffing our round state
//! against this view; the message receiver keeps it current. All access
//! goes through a short-critical-section mutex that is never held
//! across an await point.

use {
    log::debug,
    meridian_consensus_bft::{BitArray, PartSetHeader, Proposal, Step, VoteType},
    parking_lot::Mutex,
};

/// A peer's believed consensus position.
#[derive(Debug, Clone)]
pub struct PeerRoundState {
    /// Peer's height.
    pub height: u64,
    /// Peer's round.
    pub round: u32,
    /// Peer's step.
    pub step: Step,
    /// When the peer said its height started (their clock, seconds).
    pub start_time_secs: u64,
    /// Whether the peer has the current proposal.
    pub proposal: bool,
    /// Part-set header of the proposal the peer is collecting.
    pub proposal_block_parts_header: Option<PartSetHeader>,
    /// Which parts the peer holds.
    pub proposal_block_parts: Option<BitArray>,
    /// POL round advertised with the proposal.
    pub proposal_pol_round: Option<u32>,
    /// Prevote bitmap for that POL round.
    pub proposal_pol: Option<BitArray>,
    /// Who the peer has prevotes from (current round).
    pub prevotes: Option<BitArray>,
    /// Who the peer has precommits from (current round).
    pub precommits: Option<BitArray>,
    /// Round of the peer's last-height commit.
    pub last_commit_round: Option<u32>,
    /// Who the peer has last-height precommits from.
    pub last_commit: Option<BitArray>,
    /// Commit round the peer is catching up on, if it trails us.
    pub catchup_commit_round: Option<u32>,
    /// Precommit bitmap for that catch-up commit.
    pub catchup_commit: Option<BitArray>,
    /// Whether the peer holds the current round's prevote aggregate.
    pub prevote_maj23_sign_aggr: bool,
    /// Whether the peer holds the current round's precommit aggregate.
    pub precommit_maj23_sign_aggr: bool,
}

impl Default for PeerRoundState {
    fn default() -> Self {
        Self {
            height: 0,
            round: 0,
            step: Step::NewHeight,
            start_time_secs: 0,
            proposal: false,
            proposal_block_parts_header: None,
            proposal_block_parts: None,
            proposal_pol_round: None,
            proposal_pol: None,
            prevotes: None,
            precommits: None,
            last_commit_round: None,
            last_commit: None,
            catchup_commit_round: None,
            catchup_commit: None,
            prevote_maj23_sign_aggr: false,
            precommit_maj23_sign_aggr: false,
        }
    }
}

/// Thread-safe wrapper around one peer's round state.
#[derive(Debug)]
pub struct PeerState {
    /// Stable peer identifier.
    pub id: String,
    inner: Mutex<PeerRoundState>,
}

impl PeerState {
    /// Fresh state for a newly connected peer.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            inner: Mutex::new(PeerRoundState::default()),
        }
    }

    /// Snapshot the peer's state.
    pub fn get(&self) -> PeerRoundState {
        self.inner.lock().clone()
    }

    /// The peer's height.
    pub fn height(&self) -> u64 {
        self.inner.lock().height
    }

    /// Apply a `NewRoundStep` announcement, pruning per-round and
    /// per-height bookkeeping the step change invalidates.
    pub fn apply_new_round_step(
        &self,
        height: u64,
        round: u32,
        step: Step,
        seconds_since_start: u64,
        last_commit_round: Option<u32>,
    ) {
        let mut prs = self.inner.lock();
        let new_height = height != prs.height;
        let new_round = new_height || round != prs.round;

        if new_round {
            prs.proposal = false;
            prs.proposal_block_parts_header = None;
            prs.proposal_block_parts = None;
            prs.proposal_pol_round = None;
            prs.proposal_pol = None;
            prs.prevotes = None;
            prs.precommits = None;
            prs.prevote_maj23_sign_aggr = false;
            prs.precommit_maj23_sign_aggr = false;
        }
        if new_height {
            // Their current-round precommits become their last commit
            // when the heights are adjacent and the rounds line up.
            if height == prs.height + 1 && last_commit_round == Some(prs.round) {
                prs.last_commit = prs.precommits.take();
            } else {
                prs.last_commit = None;
            }
            prs.last_commit_round = last_commit_round;
            prs.catchup_commit_round = None;
            prs.catchup_commit = None;
        }
        prs.height = height;
        prs.round = round;
        prs.step = step;
        prs.start_time_secs = seconds_since_start;
        debug!("peer {} now at {height}/{round}/{step}", self.id);
    }

    /// Apply a `CommitStep` announcement.
    pub fn apply_commit_step(
        &self,
        height: u64,
        parts_header: PartSetHeader,
        parts: BitArray,
    ) {
        let mut prs = self.inner.lock();
        if prs.height != height {
            return;
        }
        prs.proposal_block_parts_header = Some(parts_header);
        prs.proposal_block_parts = Some(parts);
    }

    /// The peer told us (or we sent it) the proposal.
    pub fn set_has_proposal(&self, proposal: &Proposal) {
        let mut prs = self.inner.lock();
        if prs.height != proposal.height || prs.round != proposal.round {
            return;
        }
        if prs.proposal {
            return;
        }
        prs.proposal = true;
        prs.proposal_block_parts_header = Some(proposal.block_id.parts);
        if prs.proposal_block_parts.is_none() {
            prs.proposal_block_parts =
                Some(BitArray::new(proposal.block_id.parts.total as usize));
        }
        prs.proposal_pol_round = proposal.pol_round;
    }

    /// Mark one block part as held by the peer.
    pub fn set_has_part(&self, height: u64, round: u32, index: u32) {
        let mut prs = self.inner.lock();
        if prs.height != height || prs.round != round {
            return;
        }
        if let Some(parts) = prs.proposal_block_parts.as_mut() {
            parts.set(index as usize, true);
        }
    }

    /// Apply the prevote bitmap for the proposal's POL round.
    pub fn apply_proposal_pol(&self, height: u64, pol_round: u32, pol: BitArray) {
        let mut prs = self.inner.lock();
        if prs.height != height {
            return;
        }
        if prs.proposal_pol_round != Some(pol_round) {
            return;
        }
        prs.proposal_pol = Some(pol);
    }

    /// Mark that the peer holds a specific validator's vote.
    pub fn set_has_vote(
        &self,
        height: u64,
        round: u32,
        vote_type: VoteType,
        index: u32,
        num_validators: usize,
    ) {
        let mut prs = self.inner.lock();
        let bits = match (height, round, vote_type) {
            (h, r, VoteType::Prevote) if h == prs.height && r == prs.round => {
                Some(prs.prevotes.get_or_insert_with(|| BitArray::new(num_validators)))
            }
            (h, r, VoteType::Precommit) if h == prs.height && r == prs.round => {
                Some(prs.precommits.get_or_insert_with(|| BitArray::new(num_validators)))
            }
            (h, r, VoteType::Precommit)
                if h + 1 == prs.height && Some(r) == prs.last_commit_round =>
            {
                Some(prs.last_commit.get_or_insert_with(|| BitArray::new(num_validators)))
            }
            (h, r, VoteType::Precommit)
                if h == prs.height && Some(r) == prs.catchup_commit_round =>
            {
                Some(prs.catchup_commit.get_or_insert_with(|| BitArray::new(num_validators)))
            }
            _ => None,
        };
        if let Some(bits) = bits {
            bits.set(index as usize, true);
        }
    }

    /// The peer's vote bitmap for (height, round, type), if we track one.
    pub fn votes_bitmap(
        &self,
        height: u64,
        round: u32,
        vote_type: VoteType,
    ) -> Option<BitArray> {
        let prs = self.inner.lock();
        match (height, round, vote_type) {
            (h, r, VoteType::Prevote) if h == prs.height && r == prs.round => {
                prs.prevotes.clone()
            }
            (h, r, VoteType::Precommit) if h == prs.height && r == prs.round => {
                prs.precommits.clone()
            }
            (h, r, VoteType::Precommit)
                if h + 1 == prs.height && Some(r) == prs.last_commit_round =>
            {
                prs.last_commit.clone()
            }
            (h, r, VoteType::Precommit)
                if h == prs.height && Some(r) == prs.catchup_commit_round =>
            {
                prs.catchup_commit.clone()
            }
            _ => None,
        }
    }

    /// Merge a `VoteSetBits` response into the matching bitmap.
    pub fn apply_vote_set_bits(
        &self,
        height: u64,
        round: u32,
        vote_type: VoteType,
        votes: BitArray,
    ) {
        let mut prs = self.inner.lock();
        let slot = match vote_type {
            VoteType::Prevote if height == prs.height && round == prs.round => {
                &mut prs.prevotes
            }
            VoteType::Precommit if height == prs.height && round == prs.round => {
                &mut prs.precommits
            }
            _ => return,
        };
        match slot {
            Some(existing) => *existing = existing.or(&votes),
            None => *slot = Some(votes),
        }
    }

    /// Track which commit round a trailing peer is collecting, sizing
    /// the catch-up bitmap for it.
    pub fn ensure_catchup_commit(&self, height: u64, round: u32, num_validators: usize) {
        let mut prs = self.inner.lock();
        if prs.height != height {
            return;
        }
        if prs.catchup_commit_round == Some(round) {
            return;
        }
        prs.catchup_commit_round = Some(round);
        prs.catchup_commit = Some(BitArray::new(num_validators));
    }

    /// Mark that the peer holds the round's aggregate of `vote_type`.
    pub fn set_has_sign_aggr(&self, height: u64, round: u32, vote_type: VoteType) {
        let mut prs = self.inner.lock();
        if prs.height != height || prs.round != round {
            return;
        }
        match vote_type {
            VoteType::Prevote => prs.prevote_maj23_sign_aggr = true,
            VoteType::Precommit => prs.precommit_maj23_sign_aggr = true,
        }
    }
}
