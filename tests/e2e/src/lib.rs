//! Meridian End-to-End Consensus Scenarios
//!
//! Drives full validator networks in process, with deterministic
//! message delivery, through the protocol's defining scenarios:
//! happy-path commits, silent proposers, locking across rounds,
//! crash recovery via WAL replay, fast-sync handoff, and epoch
//! boundaries.

pub mod helpers;

pub mod epoch_boundary;
pub mod fast_sync;
pub mod happy_path;
pub mod lock_and_repropose;
pub mod round_advance;
pub mod wal_replay;
