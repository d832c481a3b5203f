//! The core consensus state machine.
//!
//! One logical owner drives the round state through
//! Propose → Prevote → Precommit → Commit, with locking, proof-of-lock
//! re-proposal, and BLS vote aggregation by the round's proposer. The
//! engine is deterministic: all I/O happens through the returned
//! [`EngineOutput`]s and the injected collaborator traits, so the same
//! input sequence always produces the same transitions, which is what
//! WAL replay relies on.
//!
//! Inputs arrive serialized through one queue (the reactor owns it); no
//! other code mutates round state. External readers clone a snapshot.

use {
    crate::{
        block::Block,
        config::ConsensusConfig,
        error::{ConsensusError, Result},
        events::ConsensusEvent,
        external::{BlockStore, VoteSigner},
        height_vote_set::HeightVoteSet,
        part_set::{Part, PartSet},
        sign_aggr::SignAggr,
        timeout::{TimeoutInfo, TimeoutScheduler},
        types::{Address, Hash},
        validator_set::{Validator, ValidatorSet},
        vote::{proposal_sign_bytes, vote_sign_bytes, BlockId, Proposal, Vote, VoteType},
        wal::{Wal, WalEntry},
    },
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::sync::Arc,
};

/// Steps within a round. `Commit` can be entered from any step once a
/// 2/3+ precommit aggregate for a concrete block id is observed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Step {
    /// Waiting out the post-commit gap before round 0.
    NewHeight,
    /// A round is starting.
    NewRound,
    /// Waiting for the proposer's block.
    Propose,
    /// Prevote cast; collecting prevotes.
    Prevote,
    /// 2/3+ prevotes seen but no single block id; waiting before
    /// precommitting nil.
    PrevoteWait,
    /// Precommit cast; collecting precommits.
    Precommit,
    /// 2/3+ precommits seen but no commit; waiting before the next round.
    PrecommitWait,
    /// A block id has a 2/3+ precommit aggregate; finalizing.
    Commit,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        write!(f, "{name}")
    }
}

/// An input to the state machine. Everything that can change round state
/// goes through this enum so the WAL can journal it verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineInput {
    /// A signed proposal for the current height.
    Proposal(Proposal),
    /// One part of the proposed block.
    BlockPart {
        /// Height the part belongs to.
        height: u64,
        /// Round the part belongs to.
        round: u32,
        /// The part itself.
        part: Part,
    },
    /// An individual vote (routed to the proposer by gossip).
    Vote(Vote),
    /// A 2/3+ aggregate built by the proposer.
    SignAggr(SignAggr),
    /// The candidate block the external producer returned to us (we are
    /// the proposer).
    CandidateBlock(Block),
    /// A timeout fired by the ticker.
    Timeout(TimeoutInfo),
}

/// An effect the reactor must carry out on the engine's behalf.
#[derive(Debug, Clone)]
pub enum EngineOutput {
    /// Broadcast our proposal on the data channel.
    SendProposal(Proposal),
    /// Send our vote to the round's proposer.
    SendVote(Vote),
    /// Broadcast a freshly built 2/3+ aggregate.
    SendSignAggr(SignAggr),
    /// Ask the external block producer for a candidate block.
    RequestBlock {
        /// Height to build at.
        height: u64,
        /// Round making the request.
        round: u32,
        /// Parent block id to extend.
        parent: BlockId,
    },
    /// Arm a timeout.
    ScheduleTimeout(TimeoutInfo),
    /// Publish a telemetry event.
    Event(ConsensusEvent),
    /// A block was finalized and persisted; the reactor feeds it to the
    /// executor and the epoch manager.
    Committed {
        /// Committed height.
        height: u64,
        /// The finalized block.
        block: Block,
        /// Its 2/3+ precommit aggregate.
        commit: SignAggr,
    },
}

/// Everything the machine knows about the height in progress.
#[derive(Clone)]
pub struct RoundState {
    /// Height being decided.
    pub height: u64,
    /// Current round.
    pub round: u32,
    /// Current step.
    pub step: Step,
    /// Wall-clock start of the height in milliseconds.
    pub start_time_ms: u64,
    /// The proposal for the current round, if received.
    pub proposal: Option<Proposal>,
    /// The proposed block once fully assembled and validated.
    pub proposal_block: Option<Block>,
    /// Parts of the proposed block gathered so far.
    pub proposal_block_parts: Option<PartSet>,
    /// Round we locked in, if any.
    pub locked_round: Option<u32>,
    /// The locked block.
    pub locked_block: Option<Block>,
    /// Its part set (for re-gossip).
    pub locked_block_parts: Option<PartSet>,
    /// Latest round with a 2/3+ prevote for a block we hold.
    pub valid_round: Option<u32>,
    /// That block (re-proposed with a proof-of-lock).
    pub valid_block: Option<Block>,
    /// Its part set.
    pub valid_block_parts: Option<PartSet>,
    /// Per-round vote tallies.
    pub votes: HeightVoteSet,
    /// Round the commit aggregate was formed in.
    pub commit_round: Option<u32>,
    /// Commit aggregate of the previous height, for catch-up gossip.
    pub last_commit: Option<SignAggr>,
    /// The prevote aggregate observed for the current round.
    pub prevote_maj23_sign_aggr: Option<SignAggr>,
    /// The precommit aggregate observed (the commit, once concrete).
    pub precommit_maj23_sign_aggr: Option<SignAggr>,
}

impl RoundState {
    fn new(
        chain_id: &str,
        height: u64,
        validators: Arc<ValidatorSet>,
        last_commit: Option<SignAggr>,
        start_time_ms: u64,
    ) -> Self {
        Self {
            height,
            round: 0,
            step: Step::NewHeight,
            start_time_ms,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: None,
            locked_block: None,
            locked_block_parts: None,
            valid_round: None,
            valid_block: None,
            valid_block_parts: None,
            votes: HeightVoteSet::new(chain_id, height, validators),
            commit_round: None,
            last_commit,
            prevote_maj23_sign_aggr: None,
            precommit_maj23_sign_aggr: None,
        }
    }
}

/// The consensus state machine.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    scheduler: TimeoutScheduler,
    chain_id: String,
    local_address: Address,
    signer: Arc<dyn VoteSigner>,
    store: Arc<dyn BlockStore>,
    validators: ValidatorSet,
    /// Height the validator rotation is current for.
    accum_height: u64,
    rs: RoundState,
    last_commit: Option<SignAggr>,
    wal: Option<Wal>,
    replay_mode: bool,
}

impl ConsensusEngine {
    /// Create an engine over a validator set whose rotation is positioned
    /// for `start_height` round 0.
    pub fn new(
        config: ConsensusConfig,
        chain_id: &str,
        validators: ValidatorSet,
        local_address: Address,
        signer: Arc<dyn VoteSigner>,
        store: Arc<dyn BlockStore>,
        start_height: u64,
    ) -> Self {
        let scheduler = TimeoutScheduler::new(config.clone());
        let rs = RoundState::new(
            chain_id,
            start_height,
            Arc::new(validators.clone()),
            None,
            0,
        );
        Self {
            config,
            scheduler,
            chain_id: chain_id.to_string(),
            local_address,
            signer,
            store,
            validators,
            accum_height: start_height,
            rs,
            last_commit: None,
            wal: None,
            replay_mode: false,
        }
    }

    /// Attach a WAL; subsequent inputs and step changes are journaled.
    pub fn attach_wal(&mut self, wal: Wal) {
        self.wal = Some(wal);
    }

    /// Toggle replay mode: inputs mutate state but outbound sends,
    /// timeout scheduling, and WAL writes are suppressed, so a replaying
    /// node cannot double-sign or re-gossip.
    pub fn set_replay_mode(&mut self, replay: bool) {
        self.replay_mode = replay;
    }

    /// Whether the engine is replaying.
    pub fn replay_mode(&self) -> bool {
        self.replay_mode
    }

    // -- Accessors --

    /// Current height.
    pub fn height(&self) -> u64 {
        self.rs.height
    }

    /// Current round.
    pub fn round(&self) -> u32 {
        self.rs.round
    }

    /// Current step.
    pub fn step(&self) -> Step {
        self.rs.step
    }

    /// The chain id.
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// The timing configuration.
    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Borrow the round state (the reactor clones snapshots from this).
    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    /// The validator set at the current height.
    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// The local validator address.
    pub fn local_address(&self) -> Address {
        self.local_address
    }

    /// Commit aggregate of the last finalized height.
    pub fn last_commit(&self) -> Option<&SignAggr> {
        self.last_commit.as_ref()
    }

    /// Replace the validator set at an epoch boundary. The new set's
    /// rotation is positioned for `start_height` round 0.
    pub fn update_validators(&mut self, validators: ValidatorSet, start_height: u64) {
        info!(
            "validator set updated: {} validators from height {start_height}",
            validators.len()
        );
        self.validators = validators;
        self.accum_height = start_height;
    }

    /// Proposer for (current height, `round`): the height's rotation
    /// advanced by `round` extra credits on a copy, so catch-up nodes and
    /// nodes that walked every round agree.
    pub fn proposer_for_round(&self, round: u32) -> Option<Validator> {
        if round == 0 {
            return self.validators.proposer().cloned();
        }
        let mut rotated = self.validators.clone();
        rotated.increment_accum(round);
        rotated.proposer().cloned()
    }

    /// Whether the local node proposes at (current height, `round`).
    pub fn is_proposer(&self, round: u32) -> bool {
        self.proposer_for_round(round)
            .map(|v| v.address == self.local_address)
            .unwrap_or(false)
    }

    /// Record a peer's 2/3+ claim so the query routine stops asking it.
    pub fn set_peer_maj23(
        &mut self,
        round: u32,
        vote_type: VoteType,
        peer_id: &str,
        block_id: BlockId,
    ) {
        if round > self.rs.round + 1 {
            return;
        }
        self.rs
            .votes
            .set_peer_maj23(round, vote_type, peer_id, block_id);
    }

    /// Our vote bitmap for the given block id, answering a
    /// `VoteSetMaj23` query.
    pub fn vote_set_bits(
        &self,
        round: u32,
        vote_type: VoteType,
        block_id: &BlockId,
    ) -> Option<crate::bit_array::BitArray> {
        let set = match vote_type {
            VoteType::Prevote => self.rs.votes.prevotes(round),
            VoteType::Precommit => self.rs.votes.precommits(round),
        }?;
        Some(set.votes_for(block_id))
    }

    // -- Entry points --

    /// Begin a height: rotate the proposer credit for any skipped
    /// heights, reset round state, and schedule the commit-gap timeout
    /// that opens round 0.
    pub fn start_height(&mut self, height: u64, now_ms: u64) -> Result<Vec<EngineOutput>> {
        let mut outputs = Vec::new();

        let skipped = height.saturating_sub(self.accum_height);
        if skipped > 0 {
            self.validators.increment_accum(skipped as u32);
            self.accum_height = height;
        }

        // Carry the persisted commit if we are resuming and lost the
        // in-memory copy.
        if self.last_commit.is_none() && height > 1 {
            self.last_commit = self.store.load_commit(height - 1);
        }

        self.rs = RoundState::new(
            &self.chain_id,
            height,
            Arc::new(self.validators.clone()),
            self.last_commit.clone(),
            now_ms,
        );
        info!("starting consensus for height {height}");
        self.record_step(&mut outputs);
        self.schedule(Step::NewHeight, 0, &mut outputs);
        Ok(self.seal(outputs))
    }

    /// Process one input from the queue.
    pub fn handle(&mut self, input: EngineInput, peer_id: &str) -> Result<Vec<EngineOutput>> {
        self.wal_message(peer_id, &input);

        let mut outputs = Vec::new();
        match input {
            EngineInput::Proposal(proposal) => {
                self.on_proposal(proposal, peer_id, &mut outputs)
            }
            EngineInput::BlockPart { height, round, part } => {
                self.on_block_part(height, round, part, peer_id, &mut outputs)
            }
            EngineInput::Vote(vote) => self.on_vote(vote, peer_id, &mut outputs),
            EngineInput::SignAggr(sign_aggr) => {
                self.on_sign_aggr(sign_aggr, peer_id, &mut outputs)
            }
            EngineInput::CandidateBlock(block) => {
                self.on_candidate_block(block, &mut outputs)
            }
            EngineInput::Timeout(info) => self.on_timeout(info, &mut outputs),
        }?;
        Ok(self.seal(outputs))
    }

    // -- Message handlers --

    fn on_proposal(
        &mut self,
        proposal: Proposal,
        peer_id: &str,
        outputs: &mut Vec<EngineOutput>,
    ) -> Result<()> {
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            debug!(
                "dropping proposal {}/{} at {}/{}",
                proposal.height, proposal.round, self.rs.height, self.rs.round
            );
            return Ok(());
        }
        if self.rs.proposal.is_some() {
            return Ok(()); // already have one
        }
        if let Some(pol_round) = proposal.pol_round {
            if pol_round >= proposal.round {
                self.reject(peer_id, "proposal POL round not before round", outputs);
                return Ok(());
            }
        }

        let Some(expected) = self.proposer_for_round(proposal.round) else {
            return Ok(());
        };
        let sign_bytes = proposal_sign_bytes(&self.chain_id, &proposal);
        if crate::keys::verify_single(&expected.pub_key, &sign_bytes, &proposal.signature)
            .is_err()
        {
            self.reject(peer_id, "proposal signature invalid", outputs);
            return Ok(());
        }

        debug!("received proposal {proposal} from {peer_id}");
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts =
                Some(PartSet::from_header(proposal.block_id.parts));
        }
        self.rs.proposal = Some(proposal);
        self.try_complete_proposal_block(outputs)
    }

    fn on_block_part(
        &mut self,
        height: u64,
        round: u32,
        part: Part,
        peer_id: &str,
        outputs: &mut Vec<EngineOutput>,
    ) -> Result<()> {
        if height != self.rs.height {
            return Ok(());
        }
        let _ = round;
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            debug!("block part before proposal from {peer_id}, dropping");
            return Ok(());
        };
        match parts.add_part(part) {
            Ok(true) => self.try_complete_proposal_block(outputs),
            Ok(false) => Ok(()), // duplicate
            Err(e) => {
                self.reject(peer_id, &format!("bad block part: {e}"), outputs);
                Ok(())
            }
        }
    }

    /// If all parts are in, decode and validate the block, then advance
    /// whichever step was waiting on it.
    fn try_complete_proposal_block(&mut self, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        if self.rs.proposal_block.is_some() {
            return Ok(());
        }
        let Some(parts) = &self.rs.proposal_block_parts else {
            return Ok(());
        };
        if !parts.is_complete() {
            return Ok(());
        }
        let bytes = parts.assemble().expect("complete part set assembles");
        let block = match Block::from_bytes(&bytes) {
            Ok(block) => block,
            Err(e) => {
                warn!("assembled proposal block does not decode: {e}");
                return Ok(());
            }
        };

        let parent_hash = self.parent_hash();
        if let Err(e) = block.validate_basic(
            &self.chain_id,
            self.rs.height,
            parent_hash,
            self.validators.hash(),
        ) {
            warn!("proposal block invalid: {e}");
            return Ok(());
        }
        if let Some(proposal) = &self.rs.proposal {
            if block.hash() != proposal.block_id.hash {
                warn!(
                    "assembled block hash {} does not match proposal {}",
                    block.hash(),
                    proposal.block_id.hash
                );
                return Ok(());
            }
        }

        info!(
            "have full proposal block {} at {}/{}",
            block.hash(),
            self.rs.height,
            self.rs.round
        );
        self.rs.proposal_block = Some(block);

        match self.rs.step {
            Step::Propose => self.enter_prevote(outputs),
            Step::Prevote | Step::PrevoteWait => self.check_prevotes(self.rs.round, outputs),
            Step::Commit => self.try_finalize(outputs),
            _ => Ok(()),
        }
    }

    fn on_vote(
        &mut self,
        vote: Vote,
        peer_id: &str,
        outputs: &mut Vec<EngineOutput>,
    ) -> Result<()> {
        if vote.height != self.rs.height {
            debug!(
                "dropping vote at height {} (current {})",
                vote.height, self.rs.height
            );
            return Ok(());
        }
        match self.rs.votes.add_vote(&vote) {
            Ok(true) => {
                outputs.push(EngineOutput::Event(ConsensusEvent::Vote {
                    height: vote.height,
                    round: vote.round,
                    vote_type: vote.vote_type,
                    validator_index: vote.validator_index,
                }));
            }
            Ok(false) => return Ok(()), // duplicate
            Err(ConsensusError::ConflictingVote(address, ..)) => {
                self.reject(
                    peer_id,
                    &format!("conflicting vote from {address}"),
                    outputs,
                );
                return Ok(());
            }
            Err(e) => {
                self.reject(peer_id, &format!("vote rejected: {e}"), outputs);
                return Ok(());
            }
        }

        if vote.round == self.rs.round {
            match vote.vote_type {
                VoteType::Prevote => self.check_prevotes(vote.round, outputs)?,
                VoteType::Precommit => self.check_precommits(vote.round, outputs)?,
            }
        } else if vote.round > self.rs.round {
            // 2/3+ of any kind at a future round drags us forward.
            let any = match vote.vote_type {
                VoteType::Prevote => self
                    .rs
                    .votes
                    .prevotes(vote.round)
                    .map(|s| s.has_two_thirds_any())
                    .unwrap_or(false),
                VoteType::Precommit => self
                    .rs
                    .votes
                    .precommits(vote.round)
                    .map(|s| s.has_two_thirds_any())
                    .unwrap_or(false),
            };
            if any {
                info!("2/3+ at future round {}, skipping ahead", vote.round);
                self.enter_new_round(vote.round, outputs)?;
            }
        }
        Ok(())
    }

    fn on_sign_aggr(
        &mut self,
        sign_aggr: SignAggr,
        peer_id: &str,
        outputs: &mut Vec<EngineOutput>,
    ) -> Result<()> {
        if sign_aggr.height != self.rs.height {
            debug!(
                "dropping sign aggregate at height {} (current {})",
                sign_aggr.height, self.rs.height
            );
            return Ok(());
        }
        if sign_aggr.bit_array.size() != self.validators.len()
            || sign_aggr.num_validators as usize != self.validators.len()
        {
            self.reject(peer_id, "sign aggregate bitmap width mismatch", outputs);
            return Ok(());
        }
        // Processed at most once per (round, type).
        let already = match sign_aggr.vote_type {
            VoteType::Prevote => self
                .rs
                .prevote_maj23_sign_aggr
                .as_ref()
                .map(|a| a.round == sign_aggr.round)
                .unwrap_or(false),
            VoteType::Precommit => self
                .rs
                .precommit_maj23_sign_aggr
                .as_ref()
                .map(|a| a.round == sign_aggr.round)
                .unwrap_or(false),
        };
        if already {
            return Ok(());
        }
        if let Err(e) = sign_aggr.verify(&self.chain_id, &self.validators) {
            self.reject(peer_id, &format!("sign aggregate invalid: {e}"), outputs);
            return Ok(());
        }

        info!("accepted {sign_aggr} from {peer_id}");
        match sign_aggr.vote_type {
            VoteType::Prevote => {
                if sign_aggr.round != self.rs.round {
                    debug!("prevote aggregate for round {} ignored", sign_aggr.round);
                    return Ok(());
                }
                self.rs.prevote_maj23_sign_aggr = Some(sign_aggr);
                // Behave as if we tallied 2/3+ prevotes ourselves.
                self.check_prevotes(self.rs.round, outputs)
            }
            VoteType::Precommit => {
                if sign_aggr.is_commit(&self.validators) {
                    // A commit-grade aggregate enters Commit from any step.
                    let round = sign_aggr.round;
                    self.enter_commit(round, sign_aggr, outputs)
                } else if sign_aggr.round == self.rs.round {
                    // Nil precommit aggregate: arm the round-advance wait.
                    self.rs.precommit_maj23_sign_aggr = Some(sign_aggr);
                    self.enter_precommit_wait(outputs)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn on_candidate_block(
        &mut self,
        block: Block,
        outputs: &mut Vec<EngineOutput>,
    ) -> Result<()> {
        if self.rs.step != Step::Propose
            || block.header.height != self.rs.height
            || self.rs.proposal.is_some()
            || !self.is_proposer(self.rs.round)
        {
            debug!("candidate block arrived too late, dropping");
            return Ok(());
        }
        self.propose_block(block, None, BlockId::nil(), outputs)
    }

    fn on_timeout(&mut self, info: TimeoutInfo, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        if info.height != self.rs.height {
            return Ok(()); // stale
        }
        match info.step {
            Step::NewHeight => {
                if self.rs.step == Step::NewHeight {
                    self.enter_new_round(0, outputs)?;
                }
                Ok(())
            }
            Step::Propose => {
                if info.round == self.rs.round && self.rs.step <= Step::Propose {
                    // No (complete) proposal in time: prevote nil.
                    self.enter_prevote(outputs)?;
                }
                Ok(())
            }
            Step::PrevoteWait => {
                if info.round == self.rs.round && self.rs.step == Step::PrevoteWait {
                    self.enter_precommit(self.rs.round, outputs)?;
                }
                Ok(())
            }
            Step::PrecommitWait => {
                if info.round == self.rs.round && self.rs.step == Step::PrecommitWait {
                    let next = self.rs.round + 1;
                    self.enter_new_round(next, outputs)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // -- Step transitions --

    fn enter_new_round(&mut self, round: u32, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        let from_new_height = self.rs.step == Step::NewHeight && round == 0;
        if !from_new_height && round <= self.rs.round {
            return Ok(());
        }
        info!("entering round {}/{round}", self.rs.height);
        self.rs.round = round;
        self.rs.step = Step::NewRound;
        self.rs.votes.set_round(round);
        if round != 0 {
            // The proposal fields belong to the previous round.
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
            self.rs.prevote_maj23_sign_aggr = None;
            self.rs.precommit_maj23_sign_aggr = None;
        }
        self.record_step(outputs);
        self.enter_propose(outputs)
    }

    fn enter_propose(&mut self, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        self.rs.step = Step::Propose;
        self.record_step(outputs);
        self.schedule(Step::Propose, self.rs.round, outputs);

        if !self.is_proposer(self.rs.round) {
            return Ok(());
        }

        if let (Some(valid_block), Some(valid_round)) =
            (self.rs.valid_block.clone(), self.rs.valid_round)
        {
            // Re-propose the block that already carries a proof-of-lock.
            let parts = match &self.rs.valid_block_parts {
                Some(parts) => parts.clone(),
                None => valid_block.make_part_set()?,
            };
            let pol_block_id = valid_block.block_id(*parts.header());
            info!("re-proposing valid block {} with POL round {valid_round}", pol_block_id);
            self.propose_block(valid_block, Some(valid_round), pol_block_id, outputs)
        } else {
            outputs.push(EngineOutput::RequestBlock {
                height: self.rs.height,
                round: self.rs.round,
                parent: BlockId {
                    hash: self.parent_hash(),
                    parts: Default::default(),
                },
            });
            Ok(())
        }
    }

    /// Sign and apply our own proposal, then broadcast it.
    fn propose_block(
        &mut self,
        block: Block,
        pol_round: Option<u32>,
        pol_block_id: BlockId,
        outputs: &mut Vec<EngineOutput>,
    ) -> Result<()> {
        let parts = block.make_part_set()?;
        let block_id = block.block_id(*parts.header());
        let mut proposal = Proposal {
            height: self.rs.height,
            round: self.rs.round,
            block_id,
            pol_round,
            pol_block_id,
            signature: Default::default(),
        };
        proposal.signature = self
            .signer
            .sign_proposal(&proposal_sign_bytes(&self.chain_id, &proposal));

        self.wal_message("local", &EngineInput::Proposal(proposal.clone()));
        self.rs.proposal = Some(proposal.clone());
        self.rs.proposal_block = Some(block);
        self.rs.proposal_block_parts = Some(parts);
        outputs.push(EngineOutput::SendProposal(proposal));

        // We hold the full block, so prevote immediately.
        self.enter_prevote(outputs)
    }

    fn enter_prevote(&mut self, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        if self.rs.step >= Step::Prevote {
            return Ok(());
        }
        self.rs.step = Step::Prevote;
        self.record_step(outputs);

        let block_id = if let (Some(locked), Some(parts)) =
            (&self.rs.locked_block, &self.rs.locked_block_parts)
        {
            // Lock safety: a locked validator prevotes its lock.
            locked.block_id(*parts.header())
        } else if self.rs.proposal_block.is_some() {
            // Validated against the proposal when the parts completed.
            self.rs
                .proposal
                .as_ref()
                .map(|p| p.block_id)
                .unwrap_or_else(BlockId::nil)
        } else {
            BlockId::nil()
        };

        self.sign_and_cast_vote(VoteType::Prevote, block_id, outputs)?;
        self.check_prevotes(self.rs.round, outputs)
    }

    fn enter_prevote_wait(&mut self, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        if self.rs.step >= Step::PrevoteWait {
            return Ok(());
        }
        self.rs.step = Step::PrevoteWait;
        self.record_step(outputs);
        self.schedule(Step::PrevoteWait, self.rs.round, outputs);
        Ok(())
    }

    fn enter_precommit(&mut self, round: u32, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        if self.rs.step >= Step::Precommit {
            return Ok(());
        }
        self.rs.step = Step::Precommit;
        self.record_step(outputs);

        let polka = self.prevote_polka(round);
        let vote_id = match polka {
            None => {
                // 2/3+ any without convergence: keep the lock, precommit
                // nil.
                BlockId::nil()
            }
            Some(bid) if bid.is_nil() => {
                // Nil polka unlocks.
                debug!("nil polka at round {round}, unlocking");
                self.rs.locked_round = None;
                self.rs.locked_block = None;
                self.rs.locked_block_parts = None;
                BlockId::nil()
            }
            Some(bid) => {
                let locked_matches = self
                    .rs
                    .locked_block
                    .as_ref()
                    .map(|b| b.hash() == bid.hash)
                    .unwrap_or(false);
                let proposal_matches = self
                    .rs
                    .proposal_block
                    .as_ref()
                    .map(|b| b.hash() == bid.hash)
                    .unwrap_or(false);

                if locked_matches {
                    // Re-lock at the newer round.
                    self.rs.locked_round = Some(round);
                    self.set_valid(round, bid);
                    bid
                } else if proposal_matches {
                    info!("locking on {} at round {round}", bid);
                    self.rs.locked_round = Some(round);
                    self.rs.locked_block = self.rs.proposal_block.clone();
                    self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                    self.set_valid(round, bid);
                    bid
                } else {
                    // 2/3+ prevoted a block we do not hold: that is
                    // unlock evidence for any stale lock, but we cannot
                    // precommit what we cannot validate.
                    debug!("polka for unseen block {}, unlocking", bid);
                    self.rs.locked_round = None;
                    self.rs.locked_block = None;
                    self.rs.locked_block_parts = None;
                    self.rs.proposal_block_parts =
                        Some(PartSet::from_header(bid.parts));
                    BlockId::nil()
                }
            }
        };

        self.sign_and_cast_vote(VoteType::Precommit, vote_id, outputs)?;
        self.check_precommits(self.rs.round, outputs)
    }

    fn enter_precommit_wait(&mut self, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        if self.rs.step >= Step::PrecommitWait {
            return Ok(());
        }
        self.rs.step = Step::PrecommitWait;
        self.record_step(outputs);
        self.schedule(Step::PrecommitWait, self.rs.round, outputs);
        Ok(())
    }

    fn enter_commit(
        &mut self,
        commit_round: u32,
        commit: SignAggr,
        outputs: &mut Vec<EngineOutput>,
    ) -> Result<()> {
        if self.rs.step == Step::Commit {
            return Ok(());
        }
        info!(
            "entering commit at {}/{commit_round} for {}",
            self.rs.height, commit.block_id
        );
        self.rs.step = Step::Commit;
        self.rs.commit_round = Some(commit_round);
        self.record_step(outputs);

        // Make sure we are collecting the right parts for the committed
        // block id.
        let committed_parts = commit.block_id.parts;
        let parts_match = self
            .rs
            .proposal_block_parts
            .as_ref()
            .map(|p| *p.header() == committed_parts)
            .unwrap_or(false);
        if !parts_match {
            let locked_matches = self
                .rs
                .locked_block_parts
                .as_ref()
                .map(|p| *p.header() == committed_parts)
                .unwrap_or(false);
            if locked_matches {
                self.rs.proposal_block = self.rs.locked_block.clone();
                self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
            } else {
                self.rs.proposal_block = None;
                self.rs.proposal_block_parts = Some(PartSet::from_header(committed_parts));
            }
        }

        self.rs.precommit_maj23_sign_aggr = Some(commit);
        self.try_finalize(outputs)
    }

    /// Persist the committed block once we hold it in full, then open the
    /// next height.
    fn try_finalize(&mut self, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        if self.rs.step != Step::Commit {
            return Ok(());
        }
        let Some(commit) = self.rs.precommit_maj23_sign_aggr.clone() else {
            return Ok(());
        };
        let Some(block) = self.rs.proposal_block.clone() else {
            debug!("commit pending: block parts incomplete");
            return Ok(());
        };
        if block.hash() != commit.block_id.hash {
            debug!("commit pending: held block does not match commit");
            return Ok(());
        }

        let height = self.rs.height;
        self.store.save_block(block.clone(), commit.clone())?;
        if let Some(wal) = self.wal.as_mut() {
            if !self.replay_mode {
                let _ = wal.end_height(height);
            }
        }
        info!(
            "finalized height {height} block {} in round {}",
            block.hash(),
            self.rs.commit_round.unwrap_or(0)
        );
        outputs.push(EngineOutput::Event(ConsensusEvent::FinalCommitted {
            height,
            block_hash: block.hash(),
            round: self.rs.commit_round.unwrap_or(0),
        }));
        outputs.push(EngineOutput::Committed {
            height,
            block,
            commit: commit.clone(),
        });

        self.last_commit = Some(commit);
        let next_outputs = self.start_height(height + 1, self.rs.start_time_ms)?;
        outputs.extend(next_outputs);
        Ok(())
    }

    // -- Tally checks --

    /// The 2/3+ prevote evidence for `round`: the locally tallied
    /// majority or an accepted prevote aggregate.
    fn prevote_polka(&self, round: u32) -> Option<BlockId> {
        if let Some(bid) = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|set| set.two_thirds_majority())
        {
            return Some(bid);
        }
        self.rs
            .prevote_maj23_sign_aggr
            .as_ref()
            .filter(|aggr| aggr.round == round && aggr.has_quorum(&self.validators))
            .map(|aggr| aggr.block_id)
    }

    /// The 2/3+ precommit evidence for `round`.
    fn precommit_maj23(&self, round: u32) -> Option<BlockId> {
        if let Some(bid) = self
            .rs
            .votes
            .precommits(round)
            .and_then(|set| set.two_thirds_majority())
        {
            return Some(bid);
        }
        self.rs
            .precommit_maj23_sign_aggr
            .as_ref()
            .filter(|aggr| aggr.round == round && aggr.has_quorum(&self.validators))
            .map(|aggr| aggr.block_id)
    }

    fn check_prevotes(&mut self, round: u32, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        if round != self.rs.round {
            return Ok(());
        }
        if let Some(bid) = self.prevote_polka(round) {
            if !bid.is_nil() {
                // Remember the latest known-good block.
                if self
                    .rs
                    .proposal_block
                    .as_ref()
                    .map(|b| b.hash() == bid.hash)
                    .unwrap_or(false)
                {
                    self.set_valid(round, bid);
                }
                // Only the proposer aggregates, and only once.
                self.maybe_broadcast_aggr(VoteType::Prevote, round, outputs)?;
            }
            if matches!(self.rs.step, Step::Prevote | Step::PrevoteWait) {
                self.enter_precommit(round, outputs)?;
            }
        } else if self
            .rs
            .votes
            .prevotes(round)
            .map(|set| set.has_two_thirds_any())
            .unwrap_or(false)
            && self.rs.step == Step::Prevote
        {
            self.enter_prevote_wait(outputs)?;
        }
        Ok(())
    }

    fn check_precommits(&mut self, round: u32, outputs: &mut Vec<EngineOutput>) -> Result<()> {
        if round != self.rs.round {
            return Ok(());
        }
        if let Some(bid) = self.precommit_maj23(round) {
            if bid.is_nil() {
                if matches!(self.rs.step, Step::Precommit) {
                    self.enter_precommit_wait(outputs)?;
                }
            } else {
                self.maybe_broadcast_aggr(VoteType::Precommit, round, outputs)?;
                let commit = match &self.rs.precommit_maj23_sign_aggr {
                    Some(aggr) if aggr.round == round && !aggr.block_id.is_nil() => {
                        aggr.clone()
                    }
                    _ => match self
                        .rs
                        .votes
                        .precommits(round)
                        .map(|set| set.make_sign_aggr())
                        .transpose()?
                        .flatten()
                    {
                        Some(aggr) => aggr,
                        None => return Ok(()),
                    },
                };
                self.enter_commit(round, commit, outputs)?;
            }
        } else if self
            .rs
            .votes
            .precommits(round)
            .map(|set| set.has_two_thirds_any())
            .unwrap_or(false)
            && self.rs.step == Step::Precommit
        {
            self.enter_precommit_wait(outputs)?;
        }
        Ok(())
    }

    /// Build and broadcast the aggregate for a vote set that reached
    /// quorum. Proposer only, at most once per (round, type).
    fn maybe_broadcast_aggr(
        &mut self,
        vote_type: VoteType,
        round: u32,
        outputs: &mut Vec<EngineOutput>,
    ) -> Result<()> {
        if !self.is_proposer(round) {
            return Ok(());
        }
        let slot = match vote_type {
            VoteType::Prevote => &self.rs.prevote_maj23_sign_aggr,
            VoteType::Precommit => &self.rs.precommit_maj23_sign_aggr,
        };
        if slot.as_ref().map(|a| a.round == round).unwrap_or(false) {
            return Ok(());
        }
        let set = match vote_type {
            VoteType::Prevote => self.rs.votes.prevotes(round),
            VoteType::Precommit => self.rs.votes.precommits(round),
        };
        let Some(aggr) = set.map(|s| s.make_sign_aggr()).transpose()?.flatten() else {
            return Ok(());
        };
        info!("proposer built {aggr}");
        self.wal_message("local", &EngineInput::SignAggr(aggr.clone()));
        match vote_type {
            VoteType::Prevote => self.rs.prevote_maj23_sign_aggr = Some(aggr.clone()),
            VoteType::Precommit => self.rs.precommit_maj23_sign_aggr = Some(aggr.clone()),
        }
        outputs.push(EngineOutput::SendSignAggr(aggr));
        Ok(())
    }

    // -- Helpers --

    fn set_valid(&mut self, round: u32, bid: BlockId) {
        if self
            .rs
            .proposal_block
            .as_ref()
            .map(|b| b.hash() == bid.hash)
            .unwrap_or(false)
        {
            self.rs.valid_round = Some(round);
            self.rs.valid_block = self.rs.proposal_block.clone();
            self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
        }
    }

    /// Sign our vote via the external signer and tally it locally. A
    /// signer refusal means no local vote this step; consensus carries on.
    fn sign_and_cast_vote(
        &mut self,
        vote_type: VoteType,
        block_id: BlockId,
        outputs: &mut Vec<EngineOutput>,
    ) -> Result<()> {
        let Some((index, _)) = self.validators.get_by_address(&self.local_address) else {
            return Ok(()); // observer node
        };
        let sign_bytes = vote_sign_bytes(
            &self.chain_id,
            self.rs.height,
            self.rs.round,
            vote_type,
            &block_id,
        );
        let signature = match self.signer.sign_vote(
            self.rs.height,
            self.rs.round,
            vote_type,
            &block_id,
            &sign_bytes,
        ) {
            Ok(signature) => signature,
            Err(e) => {
                warn!("signer refused {vote_type} at {}/{}: {e}", self.rs.height, self.rs.round);
                return Ok(());
            }
        };
        let vote = Vote {
            height: self.rs.height,
            round: self.rs.round,
            vote_type,
            block_id,
            validator_index: index as u32,
            signature,
        };
        self.wal_message("local", &EngineInput::Vote(vote.clone()));
        match self.rs.votes.add_vote(&vote) {
            Ok(_) => {}
            Err(e) => warn!("could not tally own vote: {e}"),
        }
        outputs.push(EngineOutput::Event(ConsensusEvent::Vote {
            height: vote.height,
            round: vote.round,
            vote_type,
            validator_index: vote.validator_index,
        }));
        outputs.push(EngineOutput::SendVote(vote));
        Ok(())
    }

    fn parent_hash(&self) -> Hash {
        if self.rs.height <= 1 {
            return Hash::default();
        }
        self.store
            .load_block(self.rs.height - 1)
            .map(|b| b.hash())
            .unwrap_or_default()
    }

    fn schedule(&mut self, step: Step, round: u32, outputs: &mut Vec<EngineOutput>) {
        let info = self.scheduler.schedule(self.rs.height, round, step);
        outputs.push(EngineOutput::ScheduleTimeout(info));
    }

    fn record_step(&mut self, outputs: &mut Vec<EngineOutput>) {
        if let Some(wal) = self.wal.as_mut() {
            if !self.replay_mode {
                let _ = wal.append(&WalEntry::RoundStep {
                    height: self.rs.height,
                    round: self.rs.round,
                    step: self.rs.step,
                });
            }
        }
        outputs.push(EngineOutput::Event(ConsensusEvent::NewRoundStep {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
        }));
    }

    fn reject(&mut self, peer_id: &str, reason: &str, outputs: &mut Vec<EngineOutput>) {
        warn!("rejecting message from {peer_id}: {reason}");
        outputs.push(EngineOutput::Event(ConsensusEvent::ValidationFailed {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        }));
    }

    fn wal_message(&mut self, peer_id: &str, input: &EngineInput) {
        if self.replay_mode {
            return;
        }
        if let Some(wal) = self.wal.as_mut() {
            let entry = match input {
                EngineInput::Timeout(info) => WalEntry::Timeout {
                    height: info.height,
                    round: info.round,
                    step: info.step,
                },
                other => WalEntry::Message {
                    peer_id: peer_id.to_string(),
                    input: other.clone(),
                },
            };
            let _ = wal.append(&entry);
        }
    }

    /// Drop network-facing outputs while replaying so a recovering node
    /// cannot re-broadcast or re-request anything.
    fn seal(&self, outputs: Vec<EngineOutput>) -> Vec<EngineOutput> {
        if !self.replay_mode {
            return outputs;
        }
        outputs
            .into_iter()
            .filter(|output| {
                matches!(
                    output,
                    EngineOutput::Event(_) | EngineOutput::Committed { .. }
                )
            })
            .collect()
    }
}
