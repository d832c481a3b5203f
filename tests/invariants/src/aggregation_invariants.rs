//! Property-based tests for bitmaps, sign-bytes, and BLS aggregation.

#[cfg(test)]
mod tests {
    use {
        meridian_consensus_bft::{
            aggregate_signatures, verify_aggregate, vote_sign_bytes, BitArray, BlockId,
            BlsSignature, ConsensusKeyPair, Hash, PartSetHeader, PubKey, SignAggr,
            Validator, ValidatorSet, Vote, VoteType,
        },
        proptest::prelude::*,
    };

    // ── Helpers ──

    fn keypairs(n: usize) -> Vec<ConsensusKeyPair> {
        (0..n)
            .map(|i| ConsensusKeyPair::from_seed(&format!("aggr-prop-{i}")))
            .collect()
    }

    fn validator_set(kps: &[ConsensusKeyPair], powers: &[u64]) -> ValidatorSet {
        ValidatorSet::new(
            kps.iter()
                .zip(powers.iter())
                .map(|(kp, power)| Validator::new(kp.public().clone(), *power))
                .collect(),
        )
    }

    fn block_id(seed: u8) -> BlockId {
        BlockId {
            hash: Hash::hash_bytes(&[seed]),
            parts: PartSetHeader {
                total: 2,
                root: Hash::hash_bytes(&[seed, 0x77]),
            },
        }
    }

    // ── Bitmap laws ──

    proptest! {
        #[test]
        fn prop_bitmap_sub_disjoint_from_other(
            size in 1usize..100,
            ours in prop::collection::vec(any::<bool>(), 1..100),
            theirs in prop::collection::vec(any::<bool>(), 1..100),
        ) {
            let size = size.min(ours.len()).min(theirs.len());
            let mut a = BitArray::new(size);
            let mut b = BitArray::new(size);
            for i in 0..size {
                a.set(i, ours[i]);
                b.set(i, theirs[i]);
            }
            let diff = a.sub(&b);
            // The diff never contains anything the peer already has, and
            // unioned with theirs it covers ours.
            prop_assert!(diff.and(&b).is_empty());
            prop_assert_eq!(diff.or(&b).and(&a), a.clone());
            // num_true is consistent with the index list.
            prop_assert_eq!(diff.true_indices().len(), diff.num_true());
        }

        #[test]
        fn prop_bitmap_serde_roundtrip(
            size in 1usize..200,
            bits in prop::collection::vec(any::<bool>(), 1..200),
        ) {
            let size = size.min(bits.len());
            let mut ba = BitArray::new(size);
            for i in 0..size {
                ba.set(i, bits[i]);
            }
            let bytes = bincode::serialize(&ba).unwrap();
            let back: BitArray = bincode::deserialize(&bytes).unwrap();
            prop_assert_eq!(ba, back);
        }
    }

    // ── Sign-bytes round-trips ──

    proptest! {
        #[test]
        fn prop_vote_wire_roundtrip(
            height in 1u64..1_000_000,
            round in 0u32..100,
            seed in any::<u8>(),
            index in 0u32..64,
            is_precommit in any::<bool>(),
        ) {
            let kp = ConsensusKeyPair::from_seed("prop-voter");
            let vote_type = if is_precommit {
                VoteType::Precommit
            } else {
                VoteType::Prevote
            };
            let bid = block_id(seed);
            let vote = Vote {
                height,
                round,
                vote_type,
                block_id: bid,
                validator_index: index,
                signature: kp.sign(&vote_sign_bytes("t", height, round, vote_type, &bid)),
            };
            let bytes = bincode::serialize(&vote).unwrap();
            let back: Vote = bincode::deserialize(&bytes).unwrap();
            prop_assert_eq!(vote, back);
        }

        #[test]
        fn prop_sign_bytes_injective_in_coordinates(
            h1 in 1u64..10_000, h2 in 1u64..10_000,
            r1 in 0u32..50, r2 in 0u32..50,
        ) {
            let bid = block_id(1);
            let a = vote_sign_bytes("t", h1, r1, VoteType::Prevote, &bid);
            let b = vote_sign_bytes("t", h2, r2, VoteType::Prevote, &bid);
            if (h1, r1) != (h2, r2) {
                prop_assert_ne!(a, b);
            } else {
                prop_assert_eq!(a, b);
            }
        }
    }

    // ── Aggregation ──

    /// Aggregating then reading the bitmap back recovers the contributor
    /// set, and the aggregate verifies exactly for that set.
    #[test]
    fn test_aggregate_recovers_contributors() {
        let kps = keypairs(6);
        let vs = validator_set(&kps, &[10; 6]);
        let bid = block_id(9);
        let msg = vote_sign_bytes("t", 5, 0, VoteType::Precommit, &bid);

        for contributors in [vec![0usize, 1, 2, 3, 4], vec![0, 2, 4, 5], vec![1, 3, 5, 0]] {
            let mut bits = BitArray::new(6);
            let mut sigs: Vec<BlsSignature> = Vec::new();
            for &i in &contributors {
                bits.set(i, true);
                let address = vs.get_by_index(i).unwrap().address;
                let kp = kps.iter().find(|kp| kp.address() == address).unwrap();
                sigs.push(kp.sign(&msg));
            }
            let aggr = SignAggr::new(
                5,
                0,
                VoteType::Precommit,
                6,
                bid,
                bits.clone(),
                aggregate_signatures(sigs).unwrap(),
            );
            // Bitmap recovers the contributor set.
            let mut recovered = aggr.bit_array.true_indices();
            recovered.sort();
            let mut expected = contributors.clone();
            expected.sort();
            assert_eq!(recovered, expected);
            // And the whole aggregate verifies.
            assert!(aggr.verify("t", &vs).is_ok());
        }
    }

    /// Flipping any verification input invalidates the aggregate.
    #[test]
    fn test_aggregate_tamper_matrix() {
        let kps = keypairs(4);
        let vs = validator_set(&kps, &[10; 4]);
        let bid = block_id(3);
        let msg = vote_sign_bytes("t", 5, 0, VoteType::Precommit, &bid);

        let mut bits = BitArray::new(4);
        let mut sigs: Vec<BlsSignature> = Vec::new();
        let mut pks: Vec<PubKey> = Vec::new();
        for i in 0..3 {
            bits.set(i, true);
            let address = vs.get_by_index(i).unwrap().address;
            let kp = kps.iter().find(|kp| kp.address() == address).unwrap();
            sigs.push(kp.sign(&msg));
            pks.push(kp.public().clone());
        }
        let aggregate = aggregate_signatures(sigs.clone()).unwrap();

        // The honest aggregate verifies; power 30 >= quorum 27.
        assert!(verify_aggregate(&aggregate, &pks, &msg).is_ok());
        assert_eq!(vs.tallied_voting_power(&bits).unwrap(), 30);
        assert!(vs.tallied_voting_power(&bits).unwrap() >= vs.quorum());

        // Any flipped message bit fails the pairing.
        let mut tampered = msg.clone();
        tampered[0] ^= 0x01;
        assert!(verify_aggregate(&aggregate, &pks, &tampered).is_err());

        // Any substituted signature fails.
        let outsider = ConsensusKeyPair::from_seed("aggr-prop-outsider");
        let mut bad_sigs = sigs.clone();
        bad_sigs[1] = outsider.sign(&msg);
        let bad_aggregate = aggregate_signatures(bad_sigs).unwrap();
        assert!(verify_aggregate(&bad_aggregate, &pks, &msg).is_err());

        // A wrong pubkey set fails.
        let mut bad_pks = pks.clone();
        bad_pks[0] = outsider.public().clone();
        assert!(verify_aggregate(&aggregate, &bad_pks, &msg).is_err());
    }

    proptest! {
        /// Every strict subset below quorum is rejected by the full
        /// SignAggr check even when the pairing itself is valid.
        #[test]
        fn prop_subquorum_aggregates_rejected(mask in 0u8..16) {
            let kps = keypairs(4);
            let vs = validator_set(&kps, &[10; 4]);
            let bid = block_id(8);
            let msg = vote_sign_bytes("t", 2, 1, VoteType::Prevote, &bid);

            let contributors: Vec<usize> =
                (0..4).filter(|i| mask & (1 << i) != 0).collect();
            prop_assume!(!contributors.is_empty());

            let mut bits = BitArray::new(4);
            let mut sigs: Vec<BlsSignature> = Vec::new();
            for &i in &contributors {
                bits.set(i, true);
                let address = vs.get_by_index(i).unwrap().address;
                let kp = kps.iter().find(|kp| kp.address() == address).unwrap();
                sigs.push(kp.sign(&msg));
            }
            let aggr = SignAggr::new(
                2,
                1,
                VoteType::Prevote,
                4,
                bid,
                bits,
                aggregate_signatures(sigs).unwrap(),
            );
            let tallied = contributors.len() as u64 * 10;
            if tallied >= vs.quorum() {
                prop_assert!(aggr.verify("t", &vs).is_ok());
            } else {
                prop_assert!(aggr.verify("t", &vs).is_err());
            }
        }
    }
}
