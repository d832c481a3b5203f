//! S6: a node far behind the tip catches up block by block, then hands
//! off to the consensus state machine within one height of the tip.

#[cfg(test)]
mod tests {
    use {
        crate::helpers::*,
        meridian_consensus_bft::{BlockStore, Step},
        meridian_consensus_net::{ConsensusNetConfig, FastSync, SyncMessage},
        std::sync::Arc,
    };

    /// Build a committed chain by running the validator network, then
    /// fast-sync a fresh store against it.
    #[test]
    fn test_catch_up_and_handoff() {
        init_logging();
        // The "network": four validators that have committed 8 heights.
        let mut net = TestNetwork::new(4);
        net.start_all();
        for _ in 0..7 {
            net.fire_timeout_all(Step::NewHeight);
            net.deliver_all();
        }
        let tip = net.committed_height(0);
        assert_eq!(tip, 8);

        // The syncing node: empty store, same validator set.
        let local_store = Arc::new(meridian_consensus_bft::MemoryBlockStore::new());
        let mut sync = FastSync::new(
            "t",
            net.validators.clone(),
            Arc::clone(&local_store) as Arc<dyn BlockStore>,
            ConsensusNetConfig::dev_default(),
        );

        // A status poll reveals the peer's height.
        sync.record_status("peer-0", tip);
        assert!(!sync.is_caught_up());

        // Serve requests straight from validator 0's store, the way the
        // block-sync channel would.
        let serving = FastSync::new(
            "t",
            net.validators.clone(),
            Arc::clone(&net.stores[0]) as Arc<dyn BlockStore>,
            ConsensusNetConfig::dev_default(),
        );
        let mut rounds = 0;
        while !sync.is_caught_up() {
            rounds += 1;
            assert!(rounds < 50, "sync must terminate");
            let requests = sync.next_requests();
            let mut progressed = false;
            for (height, peer, request) in requests {
                let SyncMessage::BlockRequest { height: req_height } = request else {
                    panic!("unexpected request kind");
                };
                assert_eq!(req_height, height);
                if let Some(SyncMessage::BlockResponse { height, block }) =
                    serving.serve_block_request(height)
                {
                    sync.handle_block_response(&peer, height, block).unwrap();
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        // Every height up to tip−1 is verified and saved; the tip itself
        // is one height away and belongs to consensus.
        assert!(sync.is_caught_up());
        assert_eq!(sync.local_height(), tip - 1);
        assert_eq!(local_store.current_height(), tip - 1);
        for height in 1..tip {
            let ours = local_store.load_block(height).unwrap().hash();
            let theirs = net.committed_hash(0, height).unwrap();
            assert_eq!(ours, theirs, "height {height} matches the network");
            // The stored commit verifies under the validator set.
            let commit = local_store.load_commit(height).unwrap();
            assert!(commit.verify("t", &net.validators).is_ok());
        }

        // Handoff: a consensus engine starts at tip over the synced
        // store, positioned by the skipped heights.
        use meridian_consensus_bft::{
            ConsensusConfig, ConsensusEngine, ConsensusKeyPair, LocalSigner,
        };
        let kp = ConsensusKeyPair::from_seed("fast-sync-observer");
        let mut engine = ConsensusEngine::new(
            ConsensusConfig::default(),
            "t",
            net.validators.clone(),
            kp.address(),
            Arc::new(LocalSigner::new(kp)),
            Arc::clone(&local_store) as Arc<dyn BlockStore>,
            1,
        );
        engine.start_height(tip, 0).unwrap();
        assert_eq!(engine.height(), tip);
        assert_eq!(engine.step(), Step::NewHeight);
        // Skipping straight to the tip rotated the proposer credit the
        // same way walking every height would have.
        let mut walked = net.validators.clone();
        for _ in 1..tip {
            walked.increment_accum(1);
        }
        assert_eq!(
            engine.proposer_for_round(0).unwrap().address,
            walked.proposer().unwrap().address,
        );
    }
}
