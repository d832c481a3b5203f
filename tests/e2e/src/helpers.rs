//! Shared harness for end-to-end consensus scenarios.
//!
//! Builds a network of real engines with real BLS keys, connected by a
//! deterministic in-process message queue. Outputs are absorbed into the
//! queue; timeouts are fired explicitly by each scenario, so every run is
//! reproducible.

use {
    meridian_consensus_bft::{
        Block, BlockHeader, BlockStore, ConsensusConfig, ConsensusEngine,
        ConsensusKeyPair, EngineInput, EngineOutput, Hash, LocalSigner, MemoryBlockStore,
        Step, TimeoutInfo, Validator, ValidatorSet,
    },
    std::{
        collections::{HashSet, VecDeque},
        sync::Arc,
        time::Duration,
    },
};

/// Initialise test logging once.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A queued delivery: destination validator index and input.
struct Delivery {
    dest: usize,
    input: EngineInput,
    from: String,
}

/// An in-process validator network with deterministic delivery.
pub struct TestNetwork {
    /// Signing keys, one per validator (set-index order).
    pub kps: Vec<ConsensusKeyPair>,
    /// The shared validator set.
    pub validators: ValidatorSet,
    /// One engine per validator.
    pub engines: Vec<ConsensusEngine>,
    /// Each engine's block store.
    pub stores: Vec<Arc<MemoryBlockStore>>,
    /// Validators that neither receive nor produce messages.
    pub offline: HashSet<usize>,
    queue: VecDeque<Delivery>,
    /// Timeouts scheduled by each engine, in schedule order.
    pub scheduled: Vec<Vec<TimeoutInfo>>,
}

impl TestNetwork {
    /// A network of `n` validators with equal voting power 10.
    pub fn new(n: usize) -> Self {
        Self::with_powers(&vec![10; n])
    }

    /// A network with the given voting powers.
    pub fn with_powers(powers: &[u64]) -> Self {
        let kps: Vec<ConsensusKeyPair> = (0..powers.len())
            .map(|i| ConsensusKeyPair::from_seed(&format!("e2e-net-{i}")))
            .collect();
        let validators = ValidatorSet::new(
            kps.iter()
                .zip(powers.iter())
                .map(|(kp, power)| Validator::new(kp.public().clone(), *power))
                .collect(),
        );
        // Reorder keys into validator-set (address) order so index i
        // everywhere means the same validator.
        let kps: Vec<ConsensusKeyPair> = validators
            .iter()
            .map(|v| {
                kps.iter()
                    .find(|kp| kp.address() == v.address)
                    .expect("key for validator")
                    .copy()
            })
            .collect();

        let mut engines = Vec::new();
        let mut stores = Vec::new();
        for kp in &kps {
            let store = Arc::new(MemoryBlockStore::new());
            engines.push(ConsensusEngine::new(
                ConsensusConfig::default(),
                "t",
                validators.clone(),
                kp.address(),
                Arc::new(LocalSigner::new(kp.copy())),
                Arc::clone(&store) as Arc<dyn BlockStore>,
                1,
            ));
            stores.push(store);
        }
        let n = engines.len();
        Self {
            kps,
            validators,
            engines,
            stores,
            offline: HashSet::new(),
            queue: VecDeque::new(),
            scheduled: vec![Vec::new(); n],
        }
    }

    /// The validator index proposing at (the current height of engine 0,
    /// `round`).
    pub fn proposer_index(&self, round: u32) -> usize {
        let address = self.engines[0]
            .proposer_for_round(round)
            .expect("non-empty set")
            .address;
        self.validators
            .get_by_address(&address)
            .expect("proposer in set")
            .0
    }

    /// Deterministic candidate block for a height: every proposer builds
    /// the same one, so re-proposals converge.
    pub fn make_block(&self, idx: usize, height: u64) -> Block {
        let parent_hash = if height <= 1 {
            Hash::default()
        } else {
            self.stores[idx]
                .load_block(height - 1)
                .map(|b| b.hash())
                .unwrap_or_default()
        };
        Block {
            header: BlockHeader {
                chain_id: "t".to_string(),
                height,
                time_ms: 1000 + height,
                parent_hash,
                validators_hash: self.engines[idx].validators().hash(),
                app_hash: Hash::default(),
                next_epoch: None,
            },
            data: height.to_le_bytes().to_vec(),
            last_commit: if height <= 1 {
                None
            } else {
                self.stores[idx].load_commit(height - 1)
            },
        }
    }

    /// Start every online engine at height 1 and fire the commit-gap
    /// timeout so they all sit in Propose.
    pub fn start_all(&mut self) {
        for idx in 0..self.engines.len() {
            if self.offline.contains(&idx) {
                continue;
            }
            let outputs = self.engines[idx].start_height(1, 0).unwrap();
            self.absorb(idx, outputs);
            self.fire_timeout(idx, Step::NewHeight);
        }
        self.deliver_all();
    }

    /// Fire the scheduled timeout of `step` kind matching engine `idx`'s
    /// current position, if the engine is online.
    pub fn fire_timeout(&mut self, idx: usize, step: Step) {
        if self.offline.contains(&idx) {
            return;
        }
        let info = TimeoutInfo {
            duration: Duration::ZERO,
            height: self.engines[idx].height(),
            round: self.engines[idx].round(),
            step,
        };
        let outputs = self.engines[idx]
            .handle(EngineInput::Timeout(info), "local")
            .unwrap();
        self.absorb(idx, outputs);
    }

    /// Fire a timeout on every online engine.
    pub fn fire_timeout_all(&mut self, step: Step) {
        for idx in 0..self.engines.len() {
            self.fire_timeout(idx, step);
        }
    }

    /// Absorb one engine's outputs into the queue: broadcasts fan out to
    /// every other online engine; block requests are answered with the
    /// deterministic candidate block.
    fn absorb(&mut self, src: usize, outputs: Vec<EngineOutput>) {
        let from = format!("v{src}");
        for output in outputs {
            match output {
                EngineOutput::SendProposal(proposal) => {
                    self.enqueue_broadcast(src, EngineInput::Proposal(proposal.clone()), &from);
                    // The proposer's part set travels with the proposal.
                    // The engine may already have committed and moved on
                    // (N=1), in which case nobody needs the parts.
                    let parts = self
                        .engines[src]
                        .round_state()
                        .proposal_block_parts
                        .clone()
                        .filter(|p| *p.header() == proposal.block_id.parts);
                    if let Some(parts) = parts {
                        for i in 0..parts.total() {
                            self.enqueue_broadcast(
                                src,
                                EngineInput::BlockPart {
                                    height: proposal.height,
                                    round: proposal.round,
                                    part: parts.get_part(i).unwrap().clone(),
                                },
                                &from,
                            );
                        }
                    }
                }
                EngineOutput::SendVote(vote) => {
                    self.enqueue_broadcast(src, EngineInput::Vote(vote), &from);
                }
                EngineOutput::SendSignAggr(sign_aggr) => {
                    self.enqueue_broadcast(src, EngineInput::SignAggr(sign_aggr), &from);
                }
                EngineOutput::RequestBlock { height, .. } => {
                    let block = self.make_block(src, height);
                    self.queue.push_back(Delivery {
                        dest: src,
                        input: EngineInput::CandidateBlock(block),
                        from: "local".to_string(),
                    });
                }
                EngineOutput::ScheduleTimeout(info) => {
                    self.scheduled[src].push(info);
                }
                EngineOutput::Event(_) => {}
                EngineOutput::Committed { .. } => {}
            }
        }
    }

    fn enqueue_broadcast(&mut self, src: usize, input: EngineInput, from: &str) {
        for dest in 0..self.engines.len() {
            if dest == src || self.offline.contains(&dest) {
                continue;
            }
            self.queue.push_back(Delivery {
                dest,
                input: input.clone(),
                from: from.to_string(),
            });
        }
    }

    /// Deliver queued messages until quiescent.
    pub fn deliver_all(&mut self) {
        while let Some(delivery) = self.queue.pop_front() {
            if self.offline.contains(&delivery.dest) {
                continue;
            }
            let outputs = self.engines[delivery.dest]
                .handle(delivery.input, &delivery.from)
                .unwrap();
            self.absorb(delivery.dest, outputs);
        }
    }

    /// Deliver queued messages only to the given destinations, dropping
    /// the rest (network partition).
    pub fn deliver_only_to(&mut self, allowed: &[usize]) {
        let allowed: HashSet<usize> = allowed.iter().copied().collect();
        self.deliver_filtered(|dest, _| allowed.contains(&dest));
    }

    /// Deliver queued messages, dropping any delivery the predicate
    /// rejects (lossy links, partial partitions).
    pub fn deliver_filtered<F: Fn(usize, &EngineInput) -> bool>(&mut self, keep: F) {
        let mut pending: VecDeque<Delivery> = std::mem::take(&mut self.queue);
        while let Some(delivery) = pending.pop_front() {
            if self.offline.contains(&delivery.dest)
                || !keep(delivery.dest, &delivery.input)
            {
                continue;
            }
            let outputs = self.engines[delivery.dest]
                .handle(delivery.input, &delivery.from)
                .unwrap();
            self.absorb(delivery.dest, outputs);
            pending.extend(self.queue.drain(..));
        }
    }

    /// Drop everything currently queued.
    pub fn drop_queued(&mut self) {
        self.queue.clear();
    }

    /// Heights committed by every online engine's store.
    pub fn committed_height(&self, idx: usize) -> u64 {
        self.stores[idx].current_height()
    }

    /// The committed block hash at `height` for engine `idx`.
    pub fn committed_hash(&self, idx: usize, height: u64) -> Option<Hash> {
        self.stores[idx].load_block(height).map(|b| b.hash())
    }
}
