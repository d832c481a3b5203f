//! S2: the proposer is silent; the round advances and the next proposer
//! commits.

#[cfg(test)]
mod tests {
    use crate::helpers::*;
    use meridian_consensus_bft::{BlockStore, Step};

    #[test]
    fn test_silent_proposer_round_advances_and_commits() {
        init_logging();
        let mut net = TestNetwork::new(4);
        let silent = net.proposer_index(0);
        net.offline.insert(silent);
        net.start_all();

        // Nothing arrives: every live validator times out the propose
        // step and prevotes nil.
        net.fire_timeout_all(Step::Propose);
        net.deliver_all();
        for idx in (0..4).filter(|i| *i != silent) {
            assert!(
                net.engines[idx].step() >= Step::Precommit,
                "v{idx} saw the nil polka and precommitted"
            );
        }

        // Nil precommits reach quorum; the wait fires; round 1 opens.
        net.deliver_all();
        net.fire_timeout_all(Step::PrecommitWait);
        net.deliver_all();
        for idx in (0..4).filter(|i| *i != silent) {
            assert_eq!(net.engines[idx].round(), 1, "v{idx} advanced to round 1");
        }

        // Round 1 has a live proposer; the height commits at round 1.
        let next_proposer = net.proposer_index(1);
        assert_ne!(next_proposer, silent, "rotation moved off the silent node");
        for idx in (0..4).filter(|i| *i != silent) {
            assert_eq!(net.committed_height(idx), 1, "v{idx} committed");
            let commit = net.stores[idx].load_commit(1).unwrap();
            assert_eq!(commit.round, 1, "commit happened in round 1");
        }
    }
}
