//! Meridian Consensus Networking Layer
//!
//! Peer-to-peer plumbing for the BFT consensus core:
//!
//! - **Wire protocol** — a closed, tag-byte message catalogue over four
//!   logical channels (state, data, vote, vote-set-bits) plus a
//!   block-sync channel, length-prefixed and bincode-encoded.
//! - **Reactor** — one task owns the state machine and its input queue;
//!   everything else (peers, timers, the block producer) communicates by
//!   enqueuing inputs and reading round-state snapshots.
//! - **Gossip** — four cooperative routines per peer reconcile consensus
//!   state by diffing bitmaps: block parts, proposal data, votes to the
//!   aggregating proposer, and rate-limited 2/3-majority queries.
//! - **Fast-sync** — height-ordered block download verifying each block
//!   with the commit aggregate carried by its successor, handing off to
//!   consensus within one height of the tip.
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]       | `ConsensusNetConfig` defaults and dev overrides |
//! | [`message`]      | Wire types, channels, framing |
//! | [`peer_manager`] | Peer lifecycle and liveness |
//! | [`peer_state`]   | Per-peer believed round state |
//! | [`gossip`]       | The four per-peer gossip routines |
//! | [`reactor`]      | The engine-owning task and dispatch |
//! | [`sync`]         | Fast-sync catch-up protocol |
//! | [`transport`]    | TCP listener, framed send/broadcast |
//! | [`error`]        | Crate-wide error enum |

pub mod config;
pub mod error;
pub mod gossip;
pub mod message;
pub mod peer_manager;
pub mod peer_state;
pub mod reactor;
pub mod sync;
pub mod transport;

pub use config::ConsensusNetConfig;
pub use error::{ConsensusNetError, Result};
pub use gossip::{GossipContext, spawn_gossip_routines};
pub use message::{
    decode_frame, encode_consensus, encode_sync, Channel, ConsensusWireMessage,
    SyncMessage, WireMessage,
};
pub use peer_manager::{PeerConnection, PeerInfo, PeerManager};
pub use peer_state::{PeerRoundState, PeerState};
pub use reactor::{
    ConsensusReactor, OutboundMessage, ReactorHandle, ReactorInput, SharedRoundState,
    Target,
};
pub use sync::FastSync;
pub use transport::{
    broadcast_consensus, send_consensus, send_on_stream, send_sync, InboundFrame,
    TransportHandle, TransportListener,
};
