//! Crash recovery: height reconciliation and WAL replay.
//!
//! On startup three heights must be reconciled: `app_height` (what the
//! execution engine last applied), `store_height` (the last persisted
//! block), and `state_height` (the last `#ENDHEIGHT` the state machine
//! journaled). The invariants are `app_height <= store_height` and
//! `state_height ∈ {store_height, store_height − 1}`; anything else means
//! the disk state is torn beyond what replay can fix, and we halt.

use {
    crate::{
        engine::{ConsensusEngine, EngineInput},
        error::{ConsensusError, Result},
        external::{BlockExecutor, BlockStore},
        timeout::TimeoutInfo,
        wal::{Wal, WalEntry},
    },
    log::{info, warn},
    std::time::Duration,
};

/// What the handshake did to bring the node back in sync.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Blocks re-applied to the execution engine.
    pub replayed_blocks: u64,
    /// WAL entries fed back into the state machine.
    pub wal_entries: usize,
}

/// Reconcile the three persisted heights, re-applying blocks to the app
/// and replaying the WAL tail into `engine` as needed.
///
/// # Panics
///
/// Panics when the height invariants are violated: that state is
/// unreachable through any crash point and means the disk is corrupt.
pub fn handshake(
    app_height: u64,
    state_height: u64,
    store: &dyn BlockStore,
    executor: &dyn BlockExecutor,
    engine: &mut ConsensusEngine,
    wal: &mut Wal,
) -> Result<HandshakeOutcome> {
    let store_height = store.current_height();
    info!(
        "handshake: app={app_height} store={store_height} state={state_height}"
    );

    if app_height > store_height {
        panic!(
            "height invariant violated: app height {app_height} ahead of store {store_height}"
        );
    }
    if state_height > store_height {
        panic!(
            "height invariant violated: state height {state_height} ahead of store {store_height}"
        );
    }
    if store_height > state_height + 1 {
        panic!(
            "height invariant violated: store {store_height} more than one ahead of state {state_height}"
        );
    }

    let mut outcome = HandshakeOutcome::default();

    // Blocks the store has but the app never executed: replay them to the
    // executor directly, bypassing consensus.
    for height in app_height + 1..=store_height {
        let block = store.load_block(height).ok_or_else(|| {
            ConsensusError::HeightInvariant(format!("store is missing block {height}"))
        })?;
        let commit = store.load_commit(height).ok_or_else(|| {
            ConsensusError::HeightInvariant(format!("store is missing commit {height}"))
        })?;
        executor.apply_block(&block, &commit)?;
        outcome.replayed_blocks += 1;
    }
    if outcome.replayed_blocks > 0 {
        info!(
            "replayed {} blocks to the app ({} → {store_height})",
            outcome.replayed_blocks,
            app_height + 1
        );
    }

    // The state machine journaled into a height it never finished:
    // re-execute its WAL tail so it resumes exactly where it crashed.
    if store_height == state_height || store_height == state_height + 1 {
        outcome.wal_entries = replay_wal(engine, wal, state_height)?;
    }

    Ok(outcome)
}

/// Feed every WAL entry after `state_height`'s marker into the engine
/// with outbound traffic suppressed.
pub fn replay_wal(
    engine: &mut ConsensusEngine,
    wal: &mut Wal,
    state_height: u64,
) -> Result<usize> {
    let entries = wal.entries_since(state_height)?;
    if entries.is_empty() {
        return Ok(0);
    }
    info!(
        "replaying {} WAL entries since height {state_height}",
        entries.len()
    );

    engine.set_replay_mode(true);
    let mut replayed = 0usize;
    let mut started = false;
    for entry in &entries {
        match entry {
            WalEntry::RoundStep { height, .. } => {
                if !started {
                    engine.start_height(*height, 0)?;
                    started = true;
                }
                // Later step records are derived state; the message and
                // timeout entries below regenerate them.
            }
            WalEntry::Message { peer_id, input } => {
                if !started {
                    engine.start_height(state_height + 1, 0)?;
                    started = true;
                }
                if let Err(e) = engine.handle(input.clone(), peer_id) {
                    warn!("WAL replay: entry dropped: {e}");
                }
            }
            WalEntry::Timeout { height, round, step } => {
                if !started {
                    engine.start_height(state_height + 1, 0)?;
                    started = true;
                }
                let input = EngineInput::Timeout(TimeoutInfo {
                    duration: Duration::ZERO,
                    height: *height,
                    round: *round,
                    step: *step,
                });
                if let Err(e) = engine.handle(input, "local") {
                    warn!("WAL replay: timeout dropped: {e}");
                }
            }
        }
        replayed += 1;
    }
    engine.set_replay_mode(false);
    info!(
        "WAL replay done: engine at {}/{}/{}",
        engine.height(),
        engine.round(),
        engine.step()
    );
    Ok(replayed)
}
