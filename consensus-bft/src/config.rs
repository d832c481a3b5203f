//! Consensus timing configuration.
//!
//! Each timeout kind escalates linearly with the round number
//! (`base + round · delta`) so later rounds tolerate slower proposers and
//! network delays. The commit timeout is the gap between finalizing a
//! block and starting the next height's round 0.

use {serde::{Deserialize, Serialize}, std::time::Duration};

/// Configuration for the consensus state machine.
///
/// All values are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Base wait for a proposal before prevoting nil.
    pub propose_timeout_base_ms: u64,
    /// Additional propose wait per round.
    pub propose_timeout_delta_ms: u64,

    /// Base wait in PrevoteWait before precommitting nil.
    pub prevote_timeout_base_ms: u64,
    /// Additional prevote wait per round.
    pub prevote_timeout_delta_ms: u64,

    /// Base wait in PrecommitWait before advancing the round.
    pub precommit_timeout_base_ms: u64,
    /// Additional precommit wait per round.
    pub precommit_timeout_delta_ms: u64,

    /// Wait after a commit before starting the next height (time for the
    /// next proposer to gather transactions).
    pub commit_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            propose_timeout_base_ms: 3000,
            propose_timeout_delta_ms: 500,
            prevote_timeout_base_ms: 1000,
            prevote_timeout_delta_ms: 500,
            precommit_timeout_base_ms: 1000,
            precommit_timeout_delta_ms: 500,
            commit_timeout_ms: 1000,
        }
    }
}

impl ConsensusConfig {
    /// Propose timeout for the given round.
    pub fn propose_timeout(&self, round: u32) -> Duration {
        Duration::from_millis(
            self.propose_timeout_base_ms + self.propose_timeout_delta_ms * round as u64,
        )
    }

    /// Prevote-wait timeout for the given round.
    pub fn prevote_timeout(&self, round: u32) -> Duration {
        Duration::from_millis(
            self.prevote_timeout_base_ms + self.prevote_timeout_delta_ms * round as u64,
        )
    }

    /// Precommit-wait timeout for the given round.
    pub fn precommit_timeout(&self, round: u32) -> Duration {
        Duration::from_millis(
            self.precommit_timeout_base_ms + self.precommit_timeout_delta_ms * round as u64,
        )
    }

    /// Post-commit gap before the next height begins.
    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.propose_timeout_base_ms == 0 {
            return Err(ConfigError::ZeroTimeout("propose"));
        }
        if self.prevote_timeout_base_ms == 0 {
            return Err(ConfigError::ZeroTimeout("prevote"));
        }
        if self.precommit_timeout_base_ms == 0 {
            return Err(ConfigError::ZeroTimeout("precommit"));
        }
        Ok(())
    }
}

/// Errors in consensus configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A base timeout was configured as zero.
    #[error("{0} timeout base must be > 0")]
    ZeroTimeout(&'static str),
}
