//! The genesis document: chain id, initial epoch, and reward scheme.
//!
//! Stored as JSON so operators can inspect and hand-edit it. Every
//! replica must load a byte-identical document or the validator-set
//! hashes will diverge at height 1.

use {
    crate::{
        error::{ConsensusError, Result},
        keys::PubKey,
        validator_set::{Validator, ValidatorSet},
    },
    serde::{Deserialize, Serialize},
    std::path::Path,
};

/// One validator in the genesis roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// BLS public key.
    pub pub_key: PubKey,
    /// Initial voting power.
    pub power: u64,
}

/// The initial epoch parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisEpoch {
    /// Epoch number (normally zero).
    pub number: u64,
    /// First height of the epoch.
    pub start_height: u64,
    /// Last height of the epoch.
    pub end_height: u64,
    /// Height after which reveal votes no longer count.
    pub reveal_vote_end_height: u64,
    /// Block reward during the epoch.
    pub reward_per_block: u64,
    /// The initial validator roster.
    pub validators: Vec<GenesisValidator>,
}

/// Long-horizon reward parameters consensus carries but does not
/// interpret; the execution layer consumes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardScheme {
    /// Total reward budget over the scheme's lifetime.
    pub total_reward: u64,
    /// Reward paid out during the first year.
    pub reward_first_year: u64,
    /// Number of epochs per year.
    pub epoch_count_per_year: u64,
    /// Yearly decay of the reward rate, in basis points.
    pub decay_rate_bps: u64,
}

impl Default for RewardScheme {
    fn default() -> Self {
        Self {
            total_reward: 80_000_000,
            reward_first_year: 8_000_000,
            epoch_count_per_year: 4380,
            decay_rate_bps: 1100,
        }
    }
}

/// The genesis document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genesis {
    /// Chain identifier; part of every sign-bytes domain.
    pub chain_id: String,
    /// Genesis wall-clock time in milliseconds.
    pub genesis_time_ms: u64,
    /// The initial epoch.
    pub epoch: GenesisEpoch,
    /// The reward scheme.
    pub reward_scheme: RewardScheme,
}

impl Genesis {
    /// Load and validate a genesis document from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let genesis: Genesis = serde_json::from_str(&json)?;
        genesis.validate()?;
        Ok(genesis)
    }

    /// Write the document as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Structural validation.
    pub fn validate(&self) -> Result<()> {
        if self.chain_id.is_empty() {
            return Err(ConsensusError::InvalidGenesis("empty chain id".to_string()));
        }
        if self.epoch.validators.is_empty() {
            return Err(ConsensusError::InvalidGenesis(
                "no genesis validators".to_string(),
            ));
        }
        if self.epoch.start_height > self.epoch.end_height {
            return Err(ConsensusError::InvalidGenesis(format!(
                "epoch heights inverted: {} > {}",
                self.epoch.start_height, self.epoch.end_height
            )));
        }
        if !(self.epoch.start_height..=self.epoch.end_height)
            .contains(&self.epoch.reveal_vote_end_height)
        {
            return Err(ConsensusError::InvalidGenesis(
                "reveal-vote window outside the epoch".to_string(),
            ));
        }
        if self.epoch.validators.iter().all(|v| v.power == 0) {
            return Err(ConsensusError::InvalidGenesis(
                "all genesis validators have zero power".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the initial validator set.
    pub fn validator_set(&self) -> Result<ValidatorSet> {
        let set = ValidatorSet::new(
            self.epoch
                .validators
                .iter()
                .map(|v| Validator::new(v.pub_key.clone(), v.power))
                .collect(),
        );
        if set.is_empty() {
            return Err(ConsensusError::InvalidGenesis(
                "genesis validator set is empty".to_string(),
            ));
        }
        Ok(set)
    }
}
