//! The consensus reactor: owns the state-machine task and its queue.
//!
//! All round-state mutations flow through one mpsc queue consumed by one
//! task; peers, gossip routines, the timeout ticker, and the block
//! producer communicate with the machine only by enqueuing inputs and
//! reading the shared snapshot the reactor refreshes after every input.
//! Lock order is round-state → peer-state → store and is never inverted.

use {
    crate::{
        config::ConsensusNetConfig,
        gossip::{spawn_gossip_routines, GossipContext},
        message::{Channel, ConsensusWireMessage},
        peer_state::PeerState,
    },
    log::{debug, info, warn},
    meridian_consensus_bft::{
        BlockProducer, BlockStore, ConsensusEngine, ConsensusEvent, EngineInput,
        EngineOutput, EpochManager, RoundState, SystemClock, Clock,
    },
    parking_lot::RwLock,
    std::{collections::HashMap, sync::Arc},
    tokio::sync::{broadcast, mpsc},
    tokio_util::sync::CancellationToken,
};

/// Snapshot of the machine's round state, refreshed by the reactor after
/// every processed input. Readers may not mutate.
pub type SharedRoundState = Arc<RwLock<Option<RoundState>>>;

/// Where an outbound message goes.
#[derive(Debug, Clone)]
pub enum Target {
    /// One peer by id.
    Peer(String),
    /// Every connected peer.
    Broadcast,
}

/// A message the transport must deliver.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Destination.
    pub target: Target,
    /// Channel to send on.
    pub channel: Channel,
    /// The message.
    pub message: ConsensusWireMessage,
}

/// Inputs to the reactor task.
#[derive(Debug)]
pub enum ReactorInput {
    /// A decoded wire message from a peer.
    PeerMessage {
        /// Sending peer.
        peer_id: String,
        /// Channel it arrived on.
        channel: Channel,
        /// The message.
        message: ConsensusWireMessage,
    },
    /// A peer connected; spawn its gossip routines.
    PeerConnected {
        /// The peer's id.
        peer_id: String,
    },
    /// A peer disconnected; cancel its routines.
    PeerDisconnected {
        /// The peer's id.
        peer_id: String,
    },
    /// Begin consensus at a height (start-up or fast-sync handoff).
    Start {
        /// Height to start at.
        height: u64,
    },
    /// The block producer delivered a candidate block.
    CandidateBlock(meridian_consensus_bft::Block),
    /// A timeout fired.
    Timeout(meridian_consensus_bft::TimeoutInfo),
}

struct PeerEntry {
    state: Arc<PeerState>,
    cancel: CancellationToken,
}

/// Handle to a running reactor.
pub struct ReactorHandle {
    /// Enqueue inputs for the state-machine task.
    pub inbound: mpsc::Sender<ReactorInput>,
    /// Subscribe to telemetry events.
    pub events: broadcast::Sender<ConsensusEvent>,
    /// Read-only snapshot of the round state.
    pub state: SharedRoundState,
    /// Stops the reactor and every per-peer routine.
    pub cancel: CancellationToken,
}

impl ReactorHandle {
    /// Subscribe to the telemetry stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.events.subscribe()
    }

    /// Stop the reactor.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// The consensus reactor.
pub struct ConsensusReactor {
    engine: ConsensusEngine,
    producer: Arc<dyn BlockProducer>,
    store: Arc<dyn BlockStore>,
    epoch_manager: Option<EpochManager>,
    clock: Arc<dyn Clock>,
    config: ConsensusNetConfig,
    outbound: mpsc::Sender<OutboundMessage>,
    events: broadcast::Sender<ConsensusEvent>,
    state: SharedRoundState,
    peers: HashMap<String, PeerEntry>,
    proposer_peer: Arc<RwLock<Option<String>>>,
    /// Resolves a validator address to a connected peer id.
    peer_resolver: Arc<dyn Fn(&meridian_consensus_bft::Address) -> Option<String> + Send + Sync>,
    inbound_tx: mpsc::Sender<ReactorInput>,
    cancel: CancellationToken,
}

impl ConsensusReactor {
    /// Build a reactor and spawn its state-machine task.
    ///
    /// `peer_resolver` maps a validator address to the peer id it is
    /// connected as (the peer manager provides this), so votes can be
    /// routed to the proposer.
    pub fn spawn(
        engine: ConsensusEngine,
        producer: Arc<dyn BlockProducer>,
        store: Arc<dyn BlockStore>,
        epoch_manager: Option<EpochManager>,
        config: ConsensusNetConfig,
        outbound: mpsc::Sender<OutboundMessage>,
        peer_resolver: Arc<
            dyn Fn(&meridian_consensus_bft::Address) -> Option<String> + Send + Sync,
        >,
    ) -> ReactorHandle {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_size);
        let (events, _) = broadcast::channel(config.event_bus_capacity);
        let state: SharedRoundState = Arc::new(RwLock::new(None));
        let cancel = CancellationToken::new();

        let handle = ReactorHandle {
            inbound: inbound_tx.clone(),
            events: events.clone(),
            state: Arc::clone(&state),
            cancel: cancel.clone(),
        };

        let reactor = Self {
            engine,
            producer,
            store,
            epoch_manager,
            clock: Arc::new(SystemClock),
            config,
            outbound,
            events,
            state,
            peers: HashMap::new(),
            proposer_peer: Arc::new(RwLock::new(None)),
            peer_resolver,
            inbound_tx,
            cancel,
        };
        tokio::spawn(reactor.run(inbound_rx));
        handle
    }

    async fn run(mut self, mut inbound: mpsc::Receiver<ReactorInput>) {
        info!("consensus reactor running");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                input = inbound.recv() => {
                    let Some(input) = input else { break };
                    self.dispatch(input).await;
                }
            }
        }
        for entry in self.peers.values() {
            entry.cancel.cancel();
        }
        info!("consensus reactor stopped");
    }

    async fn dispatch(&mut self, input: ReactorInput) {
        match input {
            ReactorInput::Start { height } => {
                let now = self.clock.now_ms();
                match self.engine.start_height(height, now) {
                    Ok(outputs) => self.process_outputs(outputs).await,
                    Err(e) => warn!("start_height({height}) failed: {e}"),
                }
            }
            ReactorInput::PeerConnected { peer_id } => self.add_peer(&peer_id),
            ReactorInput::PeerDisconnected { peer_id } => self.remove_peer(&peer_id),
            ReactorInput::CandidateBlock(block) => {
                self.engine_input(EngineInput::CandidateBlock(block), "local")
                    .await;
            }
            ReactorInput::Timeout(info) => {
                self.engine_input(EngineInput::Timeout(info), "local").await;
            }
            ReactorInput::PeerMessage {
                peer_id,
                channel,
                message,
            } => {
                if message.channel() != channel {
                    warn!(
                        "dropping {} from {peer_id}: wrong channel",
                        message.kind()
                    );
                    return;
                }
                self.on_peer_message(peer_id, message).await;
            }
        }
    }

    async fn on_peer_message(&mut self, peer_id: String, message: ConsensusWireMessage) {
        let num_validators = self.engine.validators().len();
        let peer = self.peers.get(&peer_id).map(|e| Arc::clone(&e.state));
        match message {
            ConsensusWireMessage::NewRoundStep {
                height,
                round,
                step,
                seconds_since_start,
                last_commit_round,
            } => {
                if let Some(peer) = peer {
                    peer.apply_new_round_step(
                        height,
                        round,
                        step,
                        seconds_since_start,
                        last_commit_round,
                    );
                    // Trailing peers collect an old commit; size a
                    // catch-up bitmap for it.
                    if height < self.engine.height() {
                        if let Some(round) = last_commit_round {
                            peer.ensure_catchup_commit(height, round, num_validators);
                        }
                    }
                }
            }
            ConsensusWireMessage::CommitStep {
                height,
                parts_header,
                parts,
            } => {
                if let Some(peer) = peer {
                    peer.apply_commit_step(height, parts_header, parts);
                }
            }
            ConsensusWireMessage::HasVote {
                height,
                round,
                vote_type,
                index,
            } => {
                if let Some(peer) = peer {
                    peer.set_has_vote(height, round, vote_type, index, num_validators);
                }
            }
            ConsensusWireMessage::VoteSetMaj23 {
                height,
                round,
                vote_type,
                block_id,
            } => {
                if height != self.engine.height() {
                    return;
                }
                self.engine
                    .set_peer_maj23(round, vote_type, &peer_id, block_id);
                // Reveal which of those votes we hold.
                if let Some(votes) = self.engine.vote_set_bits(round, vote_type, &block_id)
                {
                    let response = ConsensusWireMessage::VoteSetBits {
                        height,
                        round,
                        vote_type,
                        block_id,
                        votes,
                    };
                    self.send(Target::Peer(peer_id), Channel::VoteSetBits, response)
                        .await;
                }
            }
            ConsensusWireMessage::VoteSetBits {
                height,
                round,
                vote_type,
                votes,
                ..
            } => {
                if let Some(peer) = peer {
                    peer.apply_vote_set_bits(height, round, vote_type, votes);
                }
            }
            ConsensusWireMessage::Proposal(proposal) => {
                if let Some(peer) = &peer {
                    peer.set_has_proposal(&proposal);
                }
                self.engine_input(EngineInput::Proposal(proposal), &peer_id)
                    .await;
            }
            ConsensusWireMessage::ProposalPol {
                height,
                pol_round,
                pol,
            } => {
                if let Some(peer) = peer {
                    peer.apply_proposal_pol(height, pol_round, pol);
                }
            }
            ConsensusWireMessage::BlockPart { height, round, part } => {
                if let Some(peer) = &peer {
                    peer.set_has_part(height, round, part.index);
                }
                self.engine_input(EngineInput::BlockPart { height, round, part }, &peer_id)
                    .await;
            }
            ConsensusWireMessage::Vote(vote) => {
                if let Some(peer) = &peer {
                    peer.set_has_vote(
                        vote.height,
                        vote.round,
                        vote.vote_type,
                        vote.validator_index,
                        num_validators,
                    );
                }
                self.engine_input(EngineInput::Vote(vote), &peer_id).await;
            }
            ConsensusWireMessage::Maj23SignAggr(sign_aggr) => {
                if let Some(peer) = &peer {
                    peer.set_has_sign_aggr(
                        sign_aggr.height,
                        sign_aggr.round,
                        sign_aggr.vote_type,
                    );
                }
                self.engine_input(EngineInput::SignAggr(sign_aggr), &peer_id)
                    .await;
            }
        }
    }

    /// Feed one input through the engine and carry out its outputs.
    async fn engine_input(&mut self, input: EngineInput, peer_id: &str) {
        match self.engine.handle(input, peer_id) {
            Ok(outputs) => self.process_outputs(outputs).await,
            Err(e) => warn!("engine rejected input from {peer_id}: {e}"),
        }
    }

    async fn process_outputs(&mut self, outputs: Vec<EngineOutput>) {
        for output in outputs {
            match output {
                EngineOutput::SendProposal(proposal) => {
                    self.send(
                        Target::Broadcast,
                        Channel::Data,
                        ConsensusWireMessage::Proposal(proposal),
                    )
                    .await;
                }
                EngineOutput::SendVote(vote) => {
                    // Individual votes go to the aggregating proposer;
                    // fall back to broadcast when we cannot resolve it.
                    let target = self
                        .proposer_peer
                        .read()
                        .clone()
                        .map(Target::Peer)
                        .unwrap_or(Target::Broadcast);
                    let message = ConsensusWireMessage::Vote(vote.clone());
                    self.send(target, Channel::Vote, message).await;
                    // Tell everyone the vote exists so gossip skips it.
                    self.send(
                        Target::Broadcast,
                        Channel::State,
                        ConsensusWireMessage::HasVote {
                            height: vote.height,
                            round: vote.round,
                            vote_type: vote.vote_type,
                            index: vote.validator_index,
                        },
                    )
                    .await;
                }
                EngineOutput::SendSignAggr(sign_aggr) => {
                    self.send(
                        Target::Broadcast,
                        Channel::Data,
                        ConsensusWireMessage::Maj23SignAggr(sign_aggr),
                    )
                    .await;
                }
                EngineOutput::RequestBlock { height, round, parent } => {
                    self.request_block(height, round, parent);
                }
                EngineOutput::ScheduleTimeout(info) => {
                    let inbound = self.inbound_tx.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(info.duration) => {
                                let _ = inbound.send(ReactorInput::Timeout(info)).await;
                            }
                        }
                    });
                }
                EngineOutput::Event(event) => {
                    if let ConsensusEvent::NewRoundStep { height, round, step } = &event {
                        self.on_step_change(*height, *round, *step).await;
                    }
                    let _ = self.events.send(event);
                }
                EngineOutput::Committed { height, block, commit } => {
                    debug!("committed height {height}");
                    let _ = commit;
                    self.on_committed(&block).await;
                }
            }
        }
        // Refresh the shared snapshot once per batch.
        *self.state.write() = Some(self.engine.round_state().clone());
    }

    async fn on_step_change(
        &mut self,
        height: u64,
        round: u32,
        step: meridian_consensus_bft::Step,
    ) {
        // Track the proposer's peer for vote routing.
        let proposer_peer = self
            .engine
            .proposer_for_round(round)
            .and_then(|v| (self.peer_resolver)(&v.address));
        *self.proposer_peer.write() = proposer_peer;

        let seconds_since_start = self
            .clock
            .now_ms()
            .saturating_sub(self.engine.round_state().start_time_ms)
            / 1000;
        let message = ConsensusWireMessage::NewRoundStep {
            height,
            round,
            step,
            seconds_since_start,
            last_commit_round: self.engine.last_commit().map(|c| c.round),
        };
        self.send(Target::Broadcast, Channel::State, message).await;
    }

    async fn on_committed(&mut self, block: &meridian_consensus_bft::Block) {
        let Some(epoch_manager) = self.epoch_manager.as_mut() else {
            return;
        };
        match epoch_manager.on_block_insert(block) {
            Ok(Some(transition)) => {
                let _ = self.events.send(ConsensusEvent::EpochTransition {
                    epoch_number: transition.epoch_number,
                    start_height: transition.start_height,
                });
                if transition.start_mining {
                    let _ = self.events.send(ConsensusEvent::StartMining {
                        address: self.engine.local_address(),
                    });
                }
                self.engine
                    .update_validators(transition.validators, transition.start_height);
            }
            Ok(None) => {}
            Err(e) => warn!("epoch pipeline error at height {}: {e}", block.header.height),
        }
    }

    /// Ask the producer for a candidate block off the reactor task; the
    /// result re-enters through the queue and is ignored if the step
    /// advanced meanwhile.
    fn request_block(
        &self,
        height: u64,
        round: u32,
        parent: meridian_consensus_bft::BlockId,
    ) {
        let producer = Arc::clone(&self.producer);
        let inbound = self.inbound_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            match tokio::task::spawn_blocking(move || producer.request_block(height, &parent))
                .await
            {
                Ok(Ok(block)) => {
                    let _ = inbound.send(ReactorInput::CandidateBlock(block)).await;
                }
                Ok(Err(e)) => warn!("block producer failed at {height}/{round}: {e}"),
                Err(e) => warn!("block producer task panicked: {e}"),
            }
        });
    }

    fn add_peer(&mut self, peer_id: &str) {
        if self.peers.contains_key(peer_id) {
            return;
        }
        info!("peer {peer_id} connected, spawning gossip routines");
        let state = Arc::new(PeerState::new(peer_id));
        let cancel = self.cancel.child_token();
        let ctx = GossipContext {
            peer: Arc::clone(&state),
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
            outbound: self.outbound.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
            proposer_peer: Arc::clone(&self.proposer_peer),
        };
        spawn_gossip_routines(ctx);
        self.peers
            .insert(peer_id.to_string(), PeerEntry { state, cancel });
    }

    fn remove_peer(&mut self, peer_id: &str) {
        if let Some(entry) = self.peers.remove(peer_id) {
            info!("peer {peer_id} disconnected, cancelling gossip routines");
            entry.cancel.cancel();
        }
    }

    async fn send(&self, target: Target, channel: Channel, message: ConsensusWireMessage) {
        let out = OutboundMessage {
            target,
            channel,
            message,
        };
        if self.outbound.send(out).await.is_err() {
            debug!("outbound queue closed");
        }
    }
}
