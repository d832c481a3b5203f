//! Property-based tests for consensus safety invariants.
//!
//! Properties tested:
//! 1. Agreement: engines fed the same votes in any order commit the same
//!    block.
//! 2. Proposer rotation: accum is zero-sum and stake-proportional, and
//!    skipping rounds equals walking them.
//! 3. Lock discipline: a locked engine never prevotes another block
//!    without unlock evidence.

#[cfg(test)]
mod tests {
    use {
        meridian_consensus_bft::{
            proposal_sign_bytes, vote_sign_bytes, Block, BlockHeader, BlockId, BlockStore,
            ConsensusConfig, ConsensusEngine, ConsensusKeyPair, EngineInput, EngineOutput,
            Hash, LocalSigner, MemoryBlockStore, PartSet, Proposal, Step, TimeoutInfo,
            Validator, ValidatorSet, Vote, VoteType,
        },
        proptest::prelude::*,
        std::{sync::Arc, time::Duration},
    };

    // ── Helpers ──

    struct World {
        kps: Vec<ConsensusKeyPair>,
        validators: ValidatorSet,
    }

    impl World {
        fn new(powers: &[u64]) -> Self {
            let kps: Vec<ConsensusKeyPair> = (0..powers.len())
                .map(|i| ConsensusKeyPair::from_seed(&format!("cons-prop-{i}")))
                .collect();
            let validators = ValidatorSet::new(
                kps.iter()
                    .zip(powers.iter())
                    .map(|(kp, power)| Validator::new(kp.public().clone(), *power))
                    .collect(),
            );
            Self { kps, validators }
        }

        fn engine(&self, local_index: usize) -> (ConsensusEngine, Arc<MemoryBlockStore>) {
            let local = self.validators.get_by_index(local_index).unwrap().address;
            let kp = self
                .kps
                .iter()
                .find(|kp| kp.address() == local)
                .unwrap()
                .copy();
            let store = Arc::new(MemoryBlockStore::new());
            let engine = ConsensusEngine::new(
                ConsensusConfig::default(),
                "t",
                self.validators.clone(),
                local,
                Arc::new(LocalSigner::new(kp)),
                Arc::clone(&store) as Arc<dyn BlockStore>,
                1,
            );
            (engine, store)
        }

        fn keypair_for_index(&self, index: usize) -> &ConsensusKeyPair {
            let address = self.validators.get_by_index(index).unwrap().address;
            self.kps.iter().find(|kp| kp.address() == address).unwrap()
        }

        fn block(&self, height: u64) -> (Block, PartSet, BlockId) {
            let block = Block {
                header: BlockHeader {
                    chain_id: "t".to_string(),
                    height,
                    time_ms: 1000,
                    parent_hash: Hash::default(),
                    validators_hash: self.validators.hash(),
                    app_hash: Hash::default(),
                    next_epoch: None,
                },
                data: height.to_le_bytes().to_vec(),
                last_commit: None,
            };
            let parts = block.make_part_set().unwrap();
            let bid = block.block_id(*parts.header());
            (block, parts, bid)
        }

        fn proposal(&self, engine: &ConsensusEngine, bid: BlockId, round: u32) -> Proposal {
            let proposer = engine.proposer_for_round(round).unwrap();
            let kp = self
                .kps
                .iter()
                .find(|kp| kp.address() == proposer.address)
                .unwrap();
            let mut proposal = Proposal {
                height: 1,
                round,
                block_id: bid,
                pol_round: None,
                pol_block_id: BlockId::nil(),
                signature: Default::default(),
            };
            proposal.signature = kp.sign(&proposal_sign_bytes("t", &proposal));
            proposal
        }

        fn vote(&self, index: u32, round: u32, vote_type: VoteType, bid: BlockId) -> Vote {
            let msg = vote_sign_bytes("t", 1, round, vote_type, &bid);
            Vote {
                height: 1,
                round,
                vote_type,
                block_id: bid,
                validator_index: index,
                signature: self.keypair_for_index(index as usize).sign(&msg),
            }
        }
    }

    fn timeout(height: u64, round: u32, step: Step) -> EngineInput {
        EngineInput::Timeout(TimeoutInfo {
            duration: Duration::ZERO,
            height,
            round,
            step,
        })
    }

    fn committed_hash(outputs: &[EngineOutput]) -> Option<Hash> {
        outputs.iter().find_map(|o| match o {
            EngineOutput::Committed { block, .. } => Some(block.hash()),
            _ => None,
        })
    }

    /// Drive one engine to Propose, feed it the proposal/parts and a
    /// vote sequence; return the hash it committed, if any.
    fn run_engine(world: &World, local_index: usize, vote_order: &[usize]) -> Option<Hash> {
        let (mut engine, _store) = world.engine(local_index);
        engine.start_height(1, 0).unwrap();
        engine.handle(timeout(1, 0, Step::NewHeight), "local").unwrap();

        let (_, parts, bid) = world.block(1);
        let proposal = world.proposal(&engine, bid, 0);
        engine
            .handle(EngineInput::Proposal(proposal), "peer")
            .unwrap();
        let mut committed = None;
        for i in 0..parts.total() {
            let outputs = engine
                .handle(
                    EngineInput::BlockPart {
                        height: 1,
                        round: 0,
                        part: parts.get_part(i).unwrap().clone(),
                    },
                    "peer",
                )
                .unwrap();
            committed = committed.or(committed_hash(&outputs));
        }

        // Feed every other validator's prevote then precommit in the
        // given permutation.
        for &i in vote_order {
            if i == local_index {
                continue;
            }
            let outputs = engine
                .handle(
                    EngineInput::Vote(world.vote(i as u32, 0, VoteType::Prevote, bid)),
                    "peer",
                )
                .unwrap();
            committed = committed.or(committed_hash(&outputs));
        }
        for &i in vote_order {
            if i == local_index {
                continue;
            }
            let outputs = engine
                .handle(
                    EngineInput::Vote(world.vote(i as u32, 0, VoteType::Precommit, bid)),
                    "peer",
                )
                .unwrap();
            committed = committed.or(committed_hash(&outputs));
        }
        committed
    }

    // ── Agreement ──

    proptest! {
        /// Any delivery permutation, any local validator: all engines
        /// commit the same block at height 1.
        #[test]
        fn prop_agreement_under_vote_permutations(
            order in Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
            local in 0usize..4,
        ) {
            let world = World::new(&[10, 10, 10, 10]);
            let expected = {
                let (block, _, _) = world.block(1);
                block.hash()
            };
            let committed = run_engine(&world, local, &order);
            prop_assert_eq!(committed, Some(expected));
        }

        /// Unequal stakes change quorum arithmetic but never agreement.
        #[test]
        fn prop_agreement_with_weighted_stakes(
            order in Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
        ) {
            let world = World::new(&[40, 25, 20, 15]);
            let expected = {
                let (block, _, _) = world.block(1);
                block.hash()
            };
            let committed = run_engine(&world, 0, &order);
            prop_assert_eq!(committed, Some(expected));
        }
    }

    // ── Proposer rotation ──

    proptest! {
        #[test]
        fn prop_accum_zero_sum(
            powers in prop::collection::vec(1u64..1000, 1..12),
            rounds in 1u32..50,
        ) {
            let world = World::new(&powers);
            let mut vs = world.validators.clone();
            let before: i128 = vs.iter().map(|v| v.accum).sum();
            vs.increment_accum(rounds);
            let after: i128 = vs.iter().map(|v| v.accum).sum();
            prop_assert_eq!(before, after);
        }

        #[test]
        fn prop_skipping_rounds_equals_walking(
            powers in prop::collection::vec(1u64..100, 2..8),
            times in 1u32..30,
        ) {
            let world = World::new(&powers);
            let mut skipped = world.validators.clone();
            let mut walked = world.validators.clone();
            skipped.increment_accum(times);
            for _ in 0..times {
                walked.increment_accum(1);
            }
            prop_assert_eq!(
                skipped.proposer().map(|v| v.address),
                walked.proposer().map(|v| v.address)
            );
        }

        /// Over a full cycle of total/gcd rounds, each validator's
        /// proposer count is proportional to its power.
        #[test]
        fn prop_rotation_is_stake_fair(seed_power in 1u64..5) {
            let powers = [seed_power * 10, 10, 10, 10];
            let world = World::new(&powers);
            let mut vs = world.validators.clone();
            let total: u64 = powers.iter().sum();
            let rounds = total; // one full cycle with unit gcd 10 → 10·total picks
            let mut counts = std::collections::HashMap::new();
            for _ in 0..rounds {
                vs.increment_accum(1);
                *counts
                    .entry(vs.proposer().unwrap().address)
                    .or_insert(0u64) += 1;
            }
            // The heavy validator proposes at a share within one pick of
            // its stake share.
            let heavy = world
                .validators
                .iter()
                .max_by_key(|v| v.voting_power)
                .unwrap()
                .address;
            let expected = rounds * (seed_power * 10) / total;
            let got = counts.get(&heavy).copied().unwrap_or(0);
            prop_assert!(
                got + 1 >= expected && got <= expected + 1,
                "expected ~{expected}, got {got}"
            );
        }
    }

    // ── Lock discipline ──

    /// Once locked at round R, the engine prevotes its lock at every
    /// later round until unlock evidence arrives.
    #[test]
    fn test_lock_holds_across_rounds() {
        let world = World::new(&[10, 10, 10, 10]);
        // Pick a non-proposer local validator.
        let (probe, _) = world.engine(0);
        let proposer_address = probe.proposer_for_round(0).unwrap().address;
        let local_index = (0..4)
            .find(|i| {
                world.validators.get_by_index(*i).unwrap().address != proposer_address
            })
            .unwrap();

        let (mut engine, _store) = world.engine(local_index);
        engine.start_height(1, 0).unwrap();
        engine.handle(timeout(1, 0, Step::NewHeight), "local").unwrap();

        let (_, parts, bid) = world.block(1);
        let proposal = world.proposal(&engine, bid, 0);
        engine.handle(EngineInput::Proposal(proposal), "peer").unwrap();
        for i in 0..parts.total() {
            engine
                .handle(
                    EngineInput::BlockPart {
                        height: 1,
                        round: 0,
                        part: parts.get_part(i).unwrap().clone(),
                    },
                    "peer",
                )
                .unwrap();
        }
        // Quorum prevotes lock us at round 0.
        for i in (0..4).filter(|i| *i != local_index).take(2) {
            engine
                .handle(
                    EngineInput::Vote(world.vote(i as u32, 0, VoteType::Prevote, bid)),
                    "peer",
                )
                .unwrap();
        }
        assert_eq!(engine.round_state().locked_round, Some(0));

        // The round dies: nil precommits then the wait timeout.
        for i in (0..4).filter(|i| *i != local_index).take(2) {
            engine
                .handle(
                    EngineInput::Vote(world.vote(
                        i as u32,
                        0,
                        VoteType::Precommit,
                        BlockId::nil(),
                    )),
                    "peer",
                )
                .unwrap();
        }
        engine.handle(timeout(1, 0, Step::PrecommitWait), "local").unwrap();
        assert_eq!(engine.round(), 1);

        // Round 1 times out with no proposal: the prevote must still be
        // for the locked block, never nil.
        let outputs = engine.handle(timeout(1, 1, Step::Propose), "local").unwrap();
        let prevote = outputs
            .iter()
            .find_map(|o| match o {
                EngineOutput::SendVote(v) if v.vote_type == VoteType::Prevote => Some(v),
                _ => None,
            })
            .expect("a prevote is cast");
        assert_eq!(prevote.block_id.hash, bid.hash);
        assert_eq!(engine.round_state().locked_round, Some(0));
    }
}
