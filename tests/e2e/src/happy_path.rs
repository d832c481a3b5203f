//! S1: the happy path. Four equal validators, one round, one commit.

#[cfg(test)]
mod tests {
    use crate::helpers::*;
    use meridian_consensus_bft::{BlockStore, Step};

    #[test]
    fn test_four_validators_commit_in_round_zero() {
        init_logging();
        let mut net = TestNetwork::new(4);
        net.start_all();

        // The proposer's block cascades through prevotes, the prevote
        // aggregate, precommits, and the commit aggregate without a
        // single timeout.
        for idx in 0..4 {
            assert_eq!(net.engines[idx].height(), 2, "v{idx} moved to height 2");
            assert_eq!(net.committed_height(idx), 1, "v{idx} committed height 1");
        }

        // Agreement: all four stores hold the same block.
        let expected = net.committed_hash(0, 1).unwrap();
        for idx in 1..4 {
            assert_eq!(net.committed_hash(idx, 1), Some(expected));
        }

        // The stored commit is a verifying 2/3+ precommit aggregate over
        // the validator bitmap.
        for idx in 0..4 {
            let commit = net.stores[idx].load_commit(1).unwrap();
            assert_eq!(commit.height, 1);
            assert_eq!(commit.round, 0);
            assert_eq!(commit.bit_array.size(), 4);
            assert!(commit.verify("t", &net.validators).is_ok());
            assert!(
                net.validators
                    .tallied_voting_power(&commit.bit_array)
                    .unwrap()
                    >= net.validators.quorum()
            );
        }

        // Every engine carries the commit forward as last_commit.
        for idx in 0..4 {
            let last = net.engines[idx].last_commit().unwrap();
            assert_eq!(last.height, 1);
        }
    }

    #[test]
    fn test_consecutive_heights_commit() {
        init_logging();
        let mut net = TestNetwork::new(4);
        net.start_all();
        assert!(net.engines.iter().all(|e| e.height() == 2));

        // Open the next two heights by firing the commit-gap timeout.
        for _ in 0..2 {
            net.fire_timeout_all(Step::NewHeight);
            net.deliver_all();
        }
        for idx in 0..4 {
            assert_eq!(net.committed_height(idx), 3);
            assert_eq!(net.engines[idx].height(), 4);
        }

        // The chain links: each block's parent is the previous block.
        for height in 2..=3u64 {
            let parent = net.committed_hash(0, height - 1).unwrap();
            let block = net.stores[0].load_block(height).unwrap();
            assert_eq!(block.header.parent_hash, parent);
        }
    }

    #[test]
    fn test_single_validator_network() {
        init_logging();
        let mut net = TestNetwork::new(1);
        net.start_all();
        // N=1: own prevote and precommit are each quorum; commits happen
        // without any gossip at all.
        assert_eq!(net.committed_height(0), 1);
        net.fire_timeout_all(Step::NewHeight);
        net.deliver_all();
        assert_eq!(net.committed_height(0), 2);
    }
}
