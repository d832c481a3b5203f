//! Networking configuration.

use std::{net::SocketAddr, time::Duration};

/// Configuration for the consensus networking layer.
#[derive(Debug, Clone)]
pub struct ConsensusNetConfig {
    /// Address the transport listener binds to.
    pub bind_addr: SocketAddr,
    /// Hard cap on a single wire message, header included.
    pub max_message_size: usize,
    /// Maximum number of tracked peers.
    pub max_peers: usize,
    /// Seconds of silence before a peer is considered stale.
    pub peer_timeout_secs: u64,
    /// Sleep between gossip-routine iterations with nothing to send.
    pub gossip_sleep_ms: u64,
    /// Rate limit between `VoteSetMaj23` queries per peer.
    pub peer_query_maj23_sleep_ms: u64,
    /// Depth of the reactor's inbound queue.
    pub inbound_queue_size: usize,
    /// Depth of the outbound send queue.
    pub outbound_queue_size: usize,
    /// Capacity of the telemetry event bus.
    pub event_bus_capacity: usize,
    /// Interval between fast-sync status polls.
    pub sync_status_tick_ms: u64,
    /// Timeout before a fast-sync block request is retried elsewhere.
    pub sync_request_timeout_ms: u64,
    /// Maximum concurrent fast-sync block requests.
    pub max_sync_requests: usize,
}

impl Default for ConsensusNetConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:26656".parse().expect("static addr parses"),
            max_message_size: 1_048_576,
            max_peers: 50,
            peer_timeout_secs: 30,
            gossip_sleep_ms: 100,
            peer_query_maj23_sleep_ms: 2000,
            inbound_queue_size: 1000,
            outbound_queue_size: 1000,
            event_bus_capacity: 256,
            sync_status_tick_ms: 1000,
            sync_request_timeout_ms: 3000,
            max_sync_requests: 16,
        }
    }
}

impl ConsensusNetConfig {
    /// Localhost defaults with an OS-assigned port, for tests.
    pub fn dev_default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().expect("static addr parses"),
            peer_timeout_secs: 5,
            ..Self::default()
        }
    }

    /// Gossip idle sleep as a `Duration`.
    pub fn gossip_sleep(&self) -> Duration {
        Duration::from_millis(self.gossip_sleep_ms)
    }

    /// Maj23 query rate limit as a `Duration`.
    pub fn query_maj23_sleep(&self) -> Duration {
        Duration::from_millis(self.peer_query_maj23_sleep_ms)
    }
}
