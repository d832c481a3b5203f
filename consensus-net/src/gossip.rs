//! Per-peer gossip routines.
//!
//! Four cooperative tasks run for every connected peer, each diffing our
//! round state against the peer's believed state and sending exactly one
//! thing per iteration: a missing block part, the proposal and its POL
//! bitmap, a vote the proposer lacks (or a catch-up commit aggregate for
//! trailing peers), and the rate-limited 2/3-majority advertisements.
//! A routine with nothing to send sleeps briefly; all of them exit when
//! the peer disconnects or the reactor stops. No lock is ever held
//! across an await.

use {
    crate::{
        config::ConsensusNetConfig,
        message::{Channel, ConsensusWireMessage},
        peer_state::PeerState,
        reactor::{OutboundMessage, SharedRoundState, Target},
    },
    log::{debug, trace},
    meridian_consensus_bft::{BlockStore, Part, RoundState, SignAggr, VoteType},
    std::{sync::Arc, time::Duration},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
};

/// Everything one peer's gossip routines need.
pub struct GossipContext {
    /// The peer this context serves.
    pub peer: Arc<PeerState>,
    /// Snapshot of the machine's round state, refreshed by the reactor.
    pub state: SharedRoundState,
    /// Block store for catch-up sends.
    pub store: Arc<dyn BlockStore>,
    /// Outbound send queue.
    pub outbound: mpsc::Sender<OutboundMessage>,
    /// Networking configuration.
    pub config: ConsensusNetConfig,
    /// Cancelled when the peer drops or the reactor stops.
    pub cancel: CancellationToken,
    /// Peer id of the current round's proposer, when connected.
    pub proposer_peer: Arc<parking_lot::RwLock<Option<String>>>,
}

impl Clone for GossipContext {
    fn clone(&self) -> Self {
        Self {
            peer: Arc::clone(&self.peer),
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
            outbound: self.outbound.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            proposer_peer: Arc::clone(&self.proposer_peer),
        }
    }
}

impl GossipContext {
    async fn send(&self, channel: Channel, message: ConsensusWireMessage) -> bool {
        let out = OutboundMessage {
            target: Target::Peer(self.peer.id.clone()),
            channel,
            message,
        };
        self.outbound.send(out).await.is_ok()
    }

    /// Sleep the gossip interval; returns true when cancelled.
    async fn idle(&self) -> bool {
        sleep_or_cancel(&self.cancel, self.config.gossip_sleep()).await
    }
}

async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Spawn all four routines for one peer.
pub fn spawn_gossip_routines(ctx: GossipContext) {
    tokio::spawn(gossip_block_parts_routine(ctx.clone()));
    tokio::spawn(gossip_data_routine(ctx.clone()));
    tokio::spawn(gossip_votes_routine(ctx.clone()));
    tokio::spawn(query_maj23_routine(ctx));
}

// ---------------------------------------------------------------------------
// 1. Block parts
// ---------------------------------------------------------------------------

/// Send one random proposal part the peer is missing; for trailing
/// peers, serve parts of the committed block at their height.
pub async fn gossip_block_parts_routine(ctx: GossipContext) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        let next = pick_part(&ctx);
        match next {
            Some((height, round, part)) => {
                let index = part.index;
                if !ctx
                    .send(Channel::Data, ConsensusWireMessage::BlockPart { height, round, part })
                    .await
                {
                    return;
                }
                ctx.peer.set_has_part(height, round, index);
            }
            None => {
                if ctx.idle().await {
                    return;
                }
            }
        }
    }
}

fn pick_part(ctx: &GossipContext) -> Option<(u64, u32, Part)> {
    let guard = ctx.state.read();
    let rs = guard.as_ref()?;
    let prs = ctx.peer.get();
    let mut rng = rand::thread_rng();

    if rs.height == prs.height && rs.round == prs.round {
        let parts = rs.proposal_block_parts.as_ref()?;
        let peer_bits = prs.proposal_block_parts?;
        let missing = parts.bit_array().sub(&peer_bits);
        let index = missing.pick_random(&mut rng)?;
        let part = parts.get_part(index as u32)?.clone();
        trace!("sending part {index} to {}", ctx.peer.id);
        return Some((rs.height, rs.round, part));
    }

    // Peer trails us: serve the committed block at its height.
    if prs.height < rs.height {
        let header = prs.proposal_block_parts_header?;
        let block = ctx.store.load_block(prs.height)?;
        let parts = block.make_part_set().ok()?;
        if *parts.header() != header {
            debug!(
                "peer {} wants parts for a different part set at height {}",
                ctx.peer.id, prs.height
            );
            return None;
        }
        let peer_bits = prs.proposal_block_parts?;
        let missing = parts.bit_array().sub(&peer_bits);
        let index = missing.pick_random(&mut rng)?;
        let part = parts.get_part(index as u32)?.clone();
        return Some((prs.height, prs.round, part));
    }
    None
}

// ---------------------------------------------------------------------------
// 2. Proposal data
// ---------------------------------------------------------------------------

/// Send the proposal (then its POL bitmap) when the peer lacks it.
pub async fn gossip_data_routine(ctx: GossipContext) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        let next = pick_proposal(&ctx);
        match next {
            Some((proposal, pol)) => {
                let height = proposal.height;
                ctx.peer.set_has_proposal(&proposal);
                if !ctx
                    .send(Channel::Data, ConsensusWireMessage::Proposal(proposal))
                    .await
                {
                    return;
                }
                if let Some((pol_round, bits)) = pol {
                    if !ctx
                        .send(
                            Channel::Data,
                            ConsensusWireMessage::ProposalPol {
                                height,
                                pol_round,
                                pol: bits,
                            },
                        )
                        .await
                    {
                        return;
                    }
                }
            }
            None => {
                if ctx.idle().await {
                    return;
                }
            }
        }
    }
}

type ProposalToSend = (
    meridian_consensus_bft::Proposal,
    Option<(u32, meridian_consensus_bft::BitArray)>,
);

fn pick_proposal(ctx: &GossipContext) -> Option<ProposalToSend> {
    let guard = ctx.state.read();
    let rs = guard.as_ref()?;
    let prs = ctx.peer.get();
    if rs.height != prs.height || rs.round != prs.round || prs.proposal {
        return None;
    }
    let proposal = rs.proposal.clone()?;
    // Peers must see the proposal before its POL bitmap means anything.
    let pol = proposal.pol_round.and_then(|pol_round| {
        rs.votes
            .prevotes(pol_round)
            .map(|set| (pol_round, set.bit_array().clone()))
    });
    Some((proposal, pol))
}

// ---------------------------------------------------------------------------
// 3. Votes
// ---------------------------------------------------------------------------

/// Individual votes flow to the round's proposer (who aggregates them);
/// trailing peers get commit aggregates instead.
pub async fn gossip_votes_routine(ctx: GossipContext) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        let action = pick_vote_action(&ctx);
        match action {
            Some(VoteAction::SendVote { vote }) => {
                let (height, round, vote_type, index) =
                    (vote.height, vote.round, vote.vote_type, vote.validator_index);
                let num_validators = vote_set_width(&ctx);
                if !ctx.send(Channel::Vote, ConsensusWireMessage::Vote(vote)).await {
                    return;
                }
                ctx.peer
                    .set_has_vote(height, round, vote_type, index, num_validators);
            }
            Some(VoteAction::SendAggr { sign_aggr }) => {
                if !ctx
                    .send(Channel::Data, ConsensusWireMessage::Maj23SignAggr(sign_aggr))
                    .await
                {
                    return;
                }
                // Aggregates are idempotent on the receiver; back off so a
                // slow peer is not flooded while it catches up.
                if sleep_or_cancel(&ctx.cancel, ctx.config.gossip_sleep() * 5).await {
                    return;
                }
            }
            None => {
                if ctx.idle().await {
                    return;
                }
            }
        }
    }
}

enum VoteAction {
    SendVote { vote: meridian_consensus_bft::Vote },
    SendAggr { sign_aggr: SignAggr },
}

fn vote_set_width(ctx: &GossipContext) -> usize {
    ctx.state
        .read()
        .as_ref()
        .map(|rs| rs.votes.validators().len())
        .unwrap_or(0)
}

fn pick_vote_action(ctx: &GossipContext) -> Option<VoteAction> {
    let guard = ctx.state.read();
    let rs = guard.as_ref()?;
    let prs = ctx.peer.get();
    let mut rng = rand::thread_rng();

    if prs.height == rs.height {
        // Same height: push individual votes, but only to the proposer,
        // the one node that aggregates them.
        let is_proposer_peer = ctx
            .proposer_peer
            .read()
            .as_ref()
            .map(|id| *id == ctx.peer.id)
            .unwrap_or(false);
        if is_proposer_peer && prs.round == rs.round {
            for vote_type in [VoteType::Prevote, VoteType::Precommit] {
                let set = match vote_type {
                    VoteType::Prevote => rs.votes.prevotes(rs.round),
                    VoteType::Precommit => rs.votes.precommits(rs.round),
                }?;
                let ours = set.bit_array();
                let theirs = match vote_type {
                    VoteType::Prevote => prs.prevotes.clone(),
                    VoteType::Precommit => prs.precommits.clone(),
                }
                .unwrap_or_else(|| {
                    meridian_consensus_bft::BitArray::new(ours.size())
                });
                let missing = ours.sub(&theirs);
                if let Some(index) = missing.pick_random(&mut rng) {
                    if let Some(vote) = set.get(index as u32) {
                        return Some(VoteAction::SendVote { vote: vote.clone() });
                    }
                }
            }
        }
        return None;
    }

    if prs.height + 1 == rs.height {
        // One behind: our last commit finishes their height.
        let sign_aggr = rs.last_commit.clone()?;
        return Some(VoteAction::SendAggr { sign_aggr });
    }

    if prs.height + 2 <= rs.height {
        // Far behind: serve the stored commit for their height.
        let sign_aggr = ctx.store.load_commit(prs.height)?;
        return Some(VoteAction::SendAggr { sign_aggr });
    }
    None
}

// ---------------------------------------------------------------------------
// 4. Maj23 queries
// ---------------------------------------------------------------------------

/// Advertise any 2/3+ we have observed so peers can answer with
/// `VoteSetBits`. Rate-limited: this is a liveness fallback, not the
/// main vote path.
pub async fn query_maj23_routine(ctx: GossipContext) {
    loop {
        if sleep_or_cancel(&ctx.cancel, ctx.config.query_maj23_sleep()).await {
            return;
        }
        let claims = collect_maj23_claims(&ctx);
        for message in claims {
            if !ctx.send(Channel::State, message).await {
                return;
            }
        }
    }
}

fn collect_maj23_claims(ctx: &GossipContext) -> Vec<ConsensusWireMessage> {
    let guard = ctx.state.read();
    let Some(rs) = guard.as_ref() else {
        return Vec::new();
    };
    let prs = ctx.peer.get();
    if prs.height != rs.height {
        return Vec::new();
    }
    let mut claims = Vec::new();
    if let Some(block_id) = rs
        .votes
        .prevotes(rs.round)
        .and_then(|set| set.two_thirds_majority())
    {
        claims.push(ConsensusWireMessage::VoteSetMaj23 {
            height: rs.height,
            round: rs.round,
            vote_type: VoteType::Prevote,
            block_id,
        });
    }
    if let Some(block_id) = rs
        .votes
        .precommits(rs.round)
        .and_then(|set| set.two_thirds_majority())
    {
        claims.push(ConsensusWireMessage::VoteSetMaj23 {
            height: rs.height,
            round: rs.round,
            vote_type: VoteType::Precommit,
            block_id,
        });
    }
    claims
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
