//! Epoch boundary: the validator set swaps at `end_height + 1` and
//! bitmap widths follow it.

#[cfg(test)]
mod tests {
    use {
        crate::helpers::init_logging,
        meridian_consensus_bft::{
            Block, BlockHeader, BlockStore, ConsensusConfig, ConsensusEngine,
            ConsensusKeyPair, EpochManager, Genesis, GenesisEpoch, GenesisValidator,
            Hash, LocalSigner, MemoryBlockStore, RewardScheme, Validator, ValidatorChange,
            ValidatorSet,
        },
        std::sync::Arc,
    };

    fn genesis(kps: &[ConsensusKeyPair]) -> Genesis {
        Genesis {
            chain_id: "t".to_string(),
            genesis_time_ms: 0,
            epoch: GenesisEpoch {
                number: 0,
                start_height: 1,
                end_height: 4,
                reveal_vote_end_height: 2,
                reward_per_block: 5,
                validators: kps
                    .iter()
                    .map(|kp| GenesisValidator {
                        pub_key: kp.public().clone(),
                        power: 10,
                    })
                    .collect(),
            },
            reward_scheme: RewardScheme::default(),
        }
    }

    fn block_at(height: u64) -> Block {
        Block {
            header: BlockHeader {
                chain_id: "t".to_string(),
                height,
                time_ms: 0,
                parent_hash: Hash::default(),
                validators_hash: Hash::default(),
                app_hash: Hash::default(),
                next_epoch: None,
            },
            data: vec![],
            last_commit: None,
        }
    }

    #[test]
    fn test_boundary_swaps_validator_set_and_bitmap_width() {
        init_logging();
        let kps: Vec<ConsensusKeyPair> = (0..4)
            .map(|i| ConsensusKeyPair::from_seed(&format!("epoch-e2e-{i}")))
            .collect();
        let mut manager =
            EpochManager::from_genesis(&genesis(&kps), kps[0].address(), None).unwrap();

        // A fifth validator reveals itself during the window.
        let newcomer = ConsensusKeyPair::from_seed("epoch-e2e-new");
        manager
            .record_reveal_vote(
                ValidatorChange {
                    pub_key: newcomer.public().clone(),
                    power: 10,
                },
                2,
            )
            .unwrap();

        // An engine running under epoch 0's set.
        let validators = manager.validators().clone();
        let store = Arc::new(MemoryBlockStore::new());
        let mut engine = ConsensusEngine::new(
            ConsensusConfig::default(),
            "t",
            validators.clone(),
            kps[0].address(),
            Arc::new(LocalSigner::new(kps[0].copy())),
            Arc::clone(&store) as Arc<dyn BlockStore>,
            1,
        );
        assert_eq!(engine.validators().len(), 4);

        // Blocks flow through the epoch pipeline. The window closes at
        // height 3; heights 3 and 4 still run under epoch 0.
        assert!(manager.on_block_insert(&block_at(3)).unwrap().is_none());
        assert!(manager.on_block_insert(&block_at(4)).unwrap().is_none());
        assert_eq!(manager.current().number, 0);
        assert_eq!(manager.validators().len(), 4);

        // Height 5 = end_height + 1: the new epoch is entered.
        let transition = manager
            .on_block_insert(&block_at(5))
            .unwrap()
            .expect("boundary transition");
        assert_eq!(transition.epoch_number, 1);
        assert_eq!(transition.start_height, 5);
        assert_eq!(transition.validators.len(), 5);

        // The engine picks up the new set from the boundary height, and
        // the bitmap width every aggregate must match follows it.
        engine.update_validators(transition.validators.clone(), 5);
        engine.start_height(5, 0).unwrap();
        assert_eq!(engine.validators().len(), 5);
        assert_eq!(engine.round_state().votes.validators().len(), 5);
        assert!(engine
            .validators()
            .has_address(&newcomer.address()));

        // Within the new epoch every height keeps the same set.
        assert!(manager.current().contains(5));
        assert!(manager.current().contains(8));
        assert_eq!(manager.epoch_number_for(6), Some(1));
    }

    #[test]
    fn test_validator_set_constant_within_epoch() {
        init_logging();
        let kps: Vec<ConsensusKeyPair> = (0..4)
            .map(|i| ConsensusKeyPair::from_seed(&format!("epoch-e2e-{i}")))
            .collect();
        let mut manager =
            EpochManager::from_genesis(&genesis(&kps), kps[0].address(), None).unwrap();
        let before = ValidatorSet::new(
            manager
                .validators()
                .iter()
                .map(|v| Validator::new(v.pub_key.clone(), v.voting_power))
                .collect(),
        )
        .hash();

        // No reveal votes: the drafted next epoch carries the same
        // roster forward.
        manager.on_block_insert(&block_at(3)).unwrap();
        manager.on_block_insert(&block_at(4)).unwrap();
        assert_eq!(manager.validators().hash(), before);
        let transition = manager
            .on_block_insert(&block_at(5))
            .unwrap()
            .expect("boundary transition");
        assert_eq!(transition.validators.len(), 4);
    }
}
