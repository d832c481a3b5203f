//! Meridian Property-Based Invariant Tests
//!
//! Uses proptest to verify the consensus core's quantified invariants:
//! - Agreement: no two engines commit different blocks at a height
//! - Proposer rotation: accum is zero-sum and stake-proportional
//! - Aggregation: bitmap laws and tamper resistance
//! - Encoding: sign-bytes and wire round-trips

pub mod aggregation_invariants;
pub mod consensus_invariants;
