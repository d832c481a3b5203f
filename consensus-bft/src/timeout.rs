//! Timeout descriptors for the consensus state machine.
//!
//! Every timeout is tagged with the (height, round, step) it was scheduled
//! for; when it fires, the machine compares the tag against its current
//! position and ignores stale ticks. The reactor's ticker task owns the
//! actual timers and feeds fired timeouts back through the input queue.

use {
    crate::{config::ConsensusConfig, engine::Step},
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

/// A scheduled (or fired) timeout, tagged with its target position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    /// How long to wait before firing.
    pub duration: Duration,
    /// Height the timeout belongs to.
    pub height: u64,
    /// Round the timeout belongs to.
    pub round: u32,
    /// Step the machine was in when scheduling.
    pub step: Step,
}

impl TimeoutInfo {
    /// Whether this fired timeout still matches the machine's position.
    pub fn matches(&self, height: u64, round: u32, step: Step) -> bool {
        self.height == height && self.round == round && self.step == step
    }
}

impl std::fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Timeout{{{:?} {}/{}/{:?}}}",
            self.duration, self.height, self.round, self.step
        )
    }
}

/// Computes tagged timeouts from the configured base+delta schedule.
#[derive(Debug, Clone)]
pub struct TimeoutScheduler {
    config: ConsensusConfig,
}

impl TimeoutScheduler {
    /// Scheduler over the given configuration.
    pub fn new(config: ConsensusConfig) -> Self {
        Self { config }
    }

    /// The escalated duration for a timeout scheduled at `step` in
    /// `round`. Steps that never time out map to zero.
    pub fn duration_for(&self, step: Step, round: u32) -> Duration {
        match step {
            Step::NewHeight => self.config.commit_timeout(),
            Step::Propose => self.config.propose_timeout(round),
            Step::PrevoteWait => self.config.prevote_timeout(round),
            Step::PrecommitWait => self.config.precommit_timeout(round),
            Step::NewRound | Step::Prevote | Step::Precommit | Step::Commit => Duration::ZERO,
        }
    }

    /// Tagged timeout for the machine position (height, round, step).
    pub fn schedule(&self, height: u64, round: u32, step: Step) -> TimeoutInfo {
        TimeoutInfo {
            duration: self.duration_for(step, round),
            height,
            round,
            step,
        }
    }
}
