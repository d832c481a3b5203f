//! Validator sets: sorted rosters, accum-based proposer rotation, quorum
//! arithmetic, and bitmap-driven aggregate operations.
//!
//! Validators are kept sorted by address ascending, so every replica
//! agrees on the index each validator occupies and bitmap positions are
//! stable for all rounds of a height. The proposer rotates by a
//! deterministic weighted round-robin over the `accum` credit.

use {
    crate::{
        bit_array::BitArray,
        error::{ConsensusError, Result},
        keys::{self, PubKey},
        sign_aggr::SignAggr,
        types::{Address, Hash},
        vote::{vote_sign_bytes, BlockId},
    },
    fastcrypto::traits::ToFromBytes,
    log::debug,
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
};

/// A single validator: identity, key, weight, and proposer-selection
/// credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    /// Address derived from the BLS public key.
    pub address: Address,
    /// BLS public key used for vote verification and aggregation.
    pub pub_key: PubKey,
    /// Stake-derived voting power.
    pub voting_power: u64,
    /// Proposer-selection credit. Increases by `voting_power` each round;
    /// debited by total voting power when chosen as proposer.
    pub accum: i128,
}

impl Validator {
    /// Create a validator with zero accum.
    pub fn new(pub_key: PubKey, voting_power: u64) -> Self {
        Self {
            address: keys::derive_address(&pub_key),
            pub_key,
            voting_power,
            accum: 0,
        }
    }
}

/// A change to apply to a validator set: `power == 0` removes, a new
/// public key adds, an existing one updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorChange {
    /// The validator's BLS public key.
    pub pub_key: PubKey,
    /// New voting power; zero removes the validator.
    pub power: u64,
}

/// An address-sorted set of validators for one height range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<Address>,
    #[serde(skip)]
    index_by_address: HashMap<Address, usize>,
}

impl ValidatorSet {
    /// Build a set from validators, sorting by address and rotating the
    /// proposer once so a fresh set has a well-defined proposer.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.retain(|v| v.voting_power > 0);
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        let mut set = Self {
            validators,
            proposer: None,
            index_by_address: HashMap::new(),
        };
        set.rebuild_index();
        if !set.validators.is_empty() {
            set.increment_accum(1);
        }
        set
    }

    fn rebuild_index(&mut self) {
        self.index_by_address = self
            .validators
            .iter()
            .enumerate()
            .map(|(i, v)| (v.address, i))
            .collect();
    }

    /// Restore the address index after deserialization.
    pub fn init_after_deserialize(&mut self) {
        self.rebuild_index();
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// True when the set has no validators.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// All validators in address order.
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Iterator over validators in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    /// Sum of all voting powers.
    pub fn total_voting_power(&self) -> u64 {
        self.validators.iter().map(|v| v.voting_power).sum()
    }

    /// Strictly-more-than-two-thirds threshold: `2·total/3 + 1`.
    pub fn quorum(&self) -> u64 {
        self.total_voting_power() * 2 / 3 + 1
    }

    /// Whether an address belongs to the set.
    pub fn has_address(&self, address: &Address) -> bool {
        self.index_by_address.contains_key(address)
    }

    /// Look up a validator and its index by address.
    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.index_by_address
            .get(address)
            .map(|&i| (i, &self.validators[i]))
    }

    /// Look up a validator by its index in address order.
    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    /// The current proposer, valid until the next `increment_accum`.
    pub fn proposer(&self) -> Option<&Validator> {
        let address = self.proposer?;
        self.get_by_address(&address).map(|(_, v)| v)
    }

    /// Advance the weighted round-robin by `times` rounds.
    ///
    /// Each round adds every validator's voting power to its accum, then
    /// the largest accum (ties broken by address ascending) becomes the
    /// proposer and is debited the total voting power. Summed over the
    /// set, accum is unchanged.
    pub fn increment_accum(&mut self, times: u32) {
        if self.validators.is_empty() || times == 0 {
            return;
        }
        let total = self.total_voting_power() as i128;
        for validator in &mut self.validators {
            validator.accum += validator.voting_power as i128 * times as i128;
        }
        for round in 0..times {
            let most = self
                .validators
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.accum
                        .cmp(&b.accum)
                        // On equal accum the lower address wins.
                        .then_with(|| b.address.cmp(&a.address))
                })
                .map(|(i, _)| i)
                .expect("non-empty validator set");
            if round == times - 1 {
                self.proposer = Some(self.validators[most].address);
            }
            self.validators[most].accum -= total;
        }
    }

    /// Apply a batch of validator changes, then invalidate the proposer.
    pub fn apply_changes(&mut self, changes: &[ValidatorChange]) -> Result<()> {
        for change in changes {
            let address = keys::derive_address(&change.pub_key);
            match self.index_by_address.get(&address).copied() {
                Some(i) if change.power == 0 => {
                    debug!("removing validator {address}");
                    self.validators.remove(i);
                }
                Some(i) => {
                    debug!("updating validator {address} to power {}", change.power);
                    self.validators[i].voting_power = change.power;
                }
                None if change.power == 0 => {
                    return Err(ConsensusError::UnknownValidator(address));
                }
                None => {
                    debug!("adding validator {address} with power {}", change.power);
                    self.validators
                        .push(Validator::new(change.pub_key.clone(), change.power));
                    self.validators.sort_by(|a, b| a.address.cmp(&b.address));
                }
            }
            self.rebuild_index();
        }
        self.proposer = None;
        Ok(())
    }

    /// Public keys of the validators selected by the bitmap, in index
    /// order. Errors on width mismatch.
    pub fn bitmap_pub_keys(&self, bits: &BitArray) -> Result<Vec<PubKey>> {
        if bits.size() != self.len() {
            return Err(ConsensusError::BitmapMismatch {
                bitmap: bits.size(),
                validators: self.len(),
            });
        }
        Ok(bits
            .true_indices()
            .into_iter()
            .map(|i| self.validators[i].pub_key.clone())
            .collect())
    }

    /// Sum of voting powers of the validators selected by the bitmap.
    pub fn tallied_voting_power(&self, bits: &BitArray) -> Result<u64> {
        if bits.size() != self.len() {
            return Err(ConsensusError::BitmapMismatch {
                bitmap: bits.size(),
                validators: self.len(),
            });
        }
        Ok(bits
            .true_indices()
            .into_iter()
            .map(|i| self.validators[i].voting_power)
            .sum())
    }

    /// Verify that a 2/3+ precommit aggregate commits `block_id` at
    /// `height` under this set: bitmap width, aggregate pairing over the
    /// canonical sign-bytes, and quorum tally.
    pub fn verify_commit(
        &self,
        chain_id: &str,
        block_id: &BlockId,
        height: u64,
        commit: &SignAggr,
    ) -> Result<()> {
        if commit.height != height {
            return Err(ConsensusError::InvalidSignature(format!(
                "commit height {} does not match {}",
                commit.height, height
            )));
        }
        if commit.block_id != *block_id {
            return Err(ConsensusError::InvalidSignature(format!(
                "commit block id {} does not match {}",
                commit.block_id, block_id
            )));
        }
        let pub_keys = self.bitmap_pub_keys(&commit.bit_array)?;
        let msg = vote_sign_bytes(
            chain_id,
            commit.height,
            commit.round,
            commit.vote_type,
            &commit.block_id,
        );
        keys::verify_aggregate(&commit.signature, &pub_keys, &msg)?;

        let tallied = self.tallied_voting_power(&commit.bit_array)?;
        let quorum = self.quorum();
        if tallied < quorum {
            return Err(ConsensusError::InsufficientVotingPower { tallied, quorum });
        }
        Ok(())
    }

    /// Deterministic hash over the roster (addresses, keys, powers).
    pub fn hash(&self) -> Hash {
        let mut slices: Vec<Vec<u8>> = Vec::with_capacity(self.validators.len());
        for validator in &self.validators {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(validator.address.as_ref());
            bytes.extend_from_slice(validator.pub_key.as_bytes());
            bytes.extend_from_slice(&validator.voting_power.to_le_bytes());
            slices.push(bytes);
        }
        let refs: Vec<&[u8]> = slices.iter().map(|s| s.as_slice()).collect();
        Hash::hashv(&refs)
    }
}
