//! S3: a partitioned round fails without quorum; the next round
//! re-proposes and commits the same block.

#[cfg(test)]
mod tests {
    use crate::helpers::*;
    use meridian_consensus_bft::{BlockStore, EngineInput, Step, VoteType};

    /// Round 0 splits the network: the proposal reaches only half the
    /// validators, nobody gets 2/3 prevotes, everyone precommits nil,
    /// and round 1 commits the same block once the partition heals.
    #[test]
    fn test_partitioned_round_recovers_with_same_block() {
        init_logging();
        let mut net = TestNetwork::new(4);
        let proposer = net.proposer_index(0);
        let reached = (0..4).find(|i| *i != proposer).unwrap();
        let dark: Vec<usize> = (0..4)
            .filter(|i| *i != proposer && *i != reached)
            .collect();

        // Start everyone but withhold deliveries.
        for idx in 0..4 {
            let outputs = net.engines[idx].start_height(1, 0).unwrap();
            drop(outputs);
            net.fire_timeout(idx, Step::NewHeight);
        }
        // The proposal and its parts reach only one side of the
        // partition; votes still spread everywhere.
        let dark_set: std::collections::HashSet<usize> = dark.iter().copied().collect();
        net.deliver_filtered(|dest, input| {
            !(dark_set.contains(&dest)
                && matches!(
                    input,
                    EngineInput::Proposal(_) | EngineInput::BlockPart { .. }
                ))
        });
        assert_eq!(net.engines[reached].step(), Step::Prevote);

        // The dark side never saw a proposal and prevotes nil on
        // timeout.
        for &idx in &dark {
            assert_eq!(net.engines[idx].step(), Step::Propose);
            net.fire_timeout(idx, Step::Propose);
        }

        // Everyone now sees 20 power for the block, 20 for nil:
        // 2/3+ any, no single majority.
        net.deliver_all();
        net.fire_timeout_all(Step::PrevoteWait);
        net.deliver_all();
        net.fire_timeout_all(Step::PrecommitWait);
        net.deliver_all();

        // Round 1, full connectivity: the deterministic candidate block
        // is proposed again and commits.
        let expected = net.make_block(0, 1).hash();
        for idx in 0..4 {
            assert_eq!(net.committed_height(idx), 1, "v{idx} committed");
            assert_eq!(net.committed_hash(idx, 1), Some(expected));
            let commit = net.stores[idx].load_commit(1).unwrap();
            assert_eq!(commit.round, 1);
            assert!(commit.verify("t", &net.validators).is_ok());
        }
    }

    /// A validator that saw a polka re-proposes that block with a
    /// proof-of-lock when it becomes the next round's proposer.
    #[test]
    fn test_valid_block_reproposed_with_pol() {
        init_logging();
        let mut net = TestNetwork::new(4);
        let r0_proposer = net.proposer_index(0);
        let r1_proposer = net.proposer_index(1);
        assert_ne!(r0_proposer, r1_proposer);

        // Drive the round-1 proposer's engine directly.
        let outputs = net.engines[r1_proposer].start_height(1, 0).unwrap();
        drop(outputs);
        net.fire_timeout(r1_proposer, Step::NewHeight);
        net.drop_queued();

        // It receives the round-0 proposal and full block.
        let block = net.make_block(r1_proposer, 1);
        let parts = block.make_part_set().unwrap();
        let bid = block.block_id(*parts.header());
        let proposal = {
            use meridian_consensus_bft::{proposal_sign_bytes, BlockId, Proposal};
            let mut p = Proposal {
                height: 1,
                round: 0,
                block_id: bid,
                pol_round: None,
                pol_block_id: BlockId::nil(),
                signature: Default::default(),
            };
            p.signature = net.kps[r0_proposer].sign(&proposal_sign_bytes("t", &p));
            p
        };
        net.engines[r1_proposer]
            .handle(EngineInput::Proposal(proposal), "peer")
            .unwrap();
        for i in 0..parts.total() {
            net.engines[r1_proposer]
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

        // A polka for the block arrives: the engine locks and records it
        // as the valid block.
        use meridian_consensus_bft::{vote_sign_bytes, Vote};
        for idx in (0..4).filter(|i| *i != r1_proposer).take(2) {
            let msg = vote_sign_bytes("t", 1, 0, VoteType::Prevote, &bid);
            let vote = Vote {
                height: 1,
                round: 0,
                vote_type: VoteType::Prevote,
                block_id: bid,
                validator_index: idx as u32,
                signature: net.kps[idx].sign(&msg),
            };
            net.engines[r1_proposer]
                .handle(EngineInput::Vote(vote), "peer")
                .unwrap();
        }
        assert_eq!(net.engines[r1_proposer].round_state().locked_round, Some(0));
        assert_eq!(net.engines[r1_proposer].round_state().valid_round, Some(0));

        // The precommit phase dies; the round advances.
        use meridian_consensus_bft::BlockId;
        for idx in (0..4).filter(|i| *i != r1_proposer).take(3) {
            let msg = vote_sign_bytes("t", 1, 0, VoteType::Precommit, &BlockId::nil());
            let vote = Vote {
                height: 1,
                round: 0,
                vote_type: VoteType::Precommit,
                block_id: BlockId::nil(),
                validator_index: idx as u32,
                signature: net.kps[idx].sign(&msg),
            };
            net.engines[r1_proposer]
                .handle(EngineInput::Vote(vote), "peer")
                .unwrap();
        }
        net.fire_timeout(r1_proposer, Step::PrecommitWait);
        assert_eq!(net.engines[r1_proposer].round(), 1);

        // As round 1's proposer it re-proposes the valid block, carrying
        // the proof-of-lock round so locked peers may re-prevote it.
        let reproposal = net.engines[r1_proposer]
            .round_state()
            .proposal
            .clone()
            .expect("round-1 proposer re-proposed");
        assert_eq!(reproposal.round, 1);
        assert_eq!(reproposal.pol_round, Some(0));
        assert_eq!(reproposal.block_id.hash, bid.hash);
    }
}
