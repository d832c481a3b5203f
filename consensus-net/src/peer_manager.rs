//! Peer tracking and connection management.
//!
//! The [`PeerManager`] is the single source of truth for who we are
//! talking to: connection state, liveness metadata, and whether the peer
//! is a validator in the current epoch. The transport layer consults it
//! before sending and updates it on every received message.

use {
    crate::{
        config::ConsensusNetConfig,
        error::{ConsensusNetError, Result},
    },
    log::{debug, info, warn},
    meridian_consensus_bft::Address,
    std::{
        collections::{HashMap, HashSet},
        net::SocketAddr,
        time::Instant,
    },
};

/// Static identity of a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    /// Stable peer id (derived from its listen identity).
    pub id: String,
    /// Network address the peer is reachable on.
    pub addr: SocketAddr,
    /// The peer's validator address, when it is a validator.
    pub validator_address: Option<Address>,
}

/// Per-peer connection bookkeeping.
#[derive(Debug, Clone)]
pub struct PeerConnection {
    /// Static identity and network address.
    pub info: PeerInfo,
    /// Wall-clock time of the last message received from this peer.
    pub last_seen: Instant,
    /// Messages we have sent to this peer.
    pub messages_sent: u64,
    /// Messages we have received from this peer.
    pub messages_received: u64,
    /// Whether we believe the connection is currently alive.
    pub is_connected: bool,
}

impl PeerConnection {
    /// Fresh record for a newly-discovered peer.
    pub fn new(info: PeerInfo) -> Self {
        Self {
            info,
            last_seen: Instant::now(),
            messages_sent: 0,
            messages_received: 0,
            is_connected: false,
        }
    }

    /// Record an inbound message.
    pub fn record_received(&mut self) {
        self.messages_received = self.messages_received.saturating_add(1);
        self.last_seen = Instant::now();
    }

    /// Record an outbound message.
    pub fn record_sent(&mut self) {
        self.messages_sent = self.messages_sent.saturating_add(1);
    }

    /// Seconds since we last heard from this peer.
    pub fn silence_secs(&self) -> u64 {
        self.last_seen.elapsed().as_secs()
    }
}

/// Manages the set of peers on the consensus network.
///
/// Designed to live behind a mutex; the holders keep their critical
/// sections short.
#[derive(Debug)]
pub struct PeerManager {
    peers: HashMap<String, PeerConnection>,
    /// Validator addresses active in the current epoch.
    active_validators: HashSet<Address>,
    config: ConsensusNetConfig,
}

impl PeerManager {
    /// Empty manager.
    pub fn new(config: ConsensusNetConfig) -> Self {
        Self {
            peers: HashMap::new(),
            active_validators: HashSet::new(),
            config,
        }
    }

    /// Total number of known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of connected peers.
    pub fn connected_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected).count()
    }

    // ── Peer lifecycle ──────────────────────────────────────────────────

    /// Register a newly-discovered peer; re-announcements update in
    /// place.
    pub fn add_peer(&mut self, info: PeerInfo) -> Result<()> {
        if let Some(existing) = self.peers.get_mut(&info.id) {
            debug!("updating existing peer {}", info.id);
            existing.info = info;
            return Ok(());
        }
        if self.peers.len() >= self.config.max_peers {
            return Err(ConsensusNetError::MaxPeersReached(self.config.max_peers));
        }
        info!("adding peer {}", info.id);
        self.peers.insert(info.id.clone(), PeerConnection::new(info));
        Ok(())
    }

    /// Drop a peer entirely.
    pub fn remove_peer(&mut self, id: &str) {
        if self.peers.remove(id).is_some() {
            info!("removed peer {id}");
        }
    }

    /// Mark a peer connected.
    pub fn mark_connected(&mut self, id: &str) -> Result<()> {
        let conn = self
            .peers
            .get_mut(id)
            .ok_or_else(|| ConsensusNetError::UnknownPeer(id.to_string()))?;
        conn.is_connected = true;
        conn.last_seen = Instant::now();
        Ok(())
    }

    /// Mark a peer disconnected.
    pub fn mark_disconnected(&mut self, id: &str) {
        if let Some(conn) = self.peers.get_mut(id) {
            conn.is_connected = false;
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// A peer's connection record.
    pub fn get_peer(&self, id: &str) -> Option<&PeerConnection> {
        self.peers.get(id)
    }

    /// Mutable access to a peer's record.
    pub fn get_peer_mut(&mut self, id: &str) -> Option<&mut PeerConnection> {
        self.peers.get_mut(id)
    }

    /// All connected peers.
    pub fn connected_peers(&self) -> impl Iterator<Item = (&String, &PeerConnection)> {
        self.peers.iter().filter(|(_, v)| v.is_connected)
    }

    /// Connected peers that are validators this epoch.
    pub fn connected_validators(&self) -> impl Iterator<Item = (&String, &PeerConnection)> {
        self.peers.iter().filter(|(_, v)| {
            v.is_connected
                && v.info
                    .validator_address
                    .map(|a| self.active_validators.contains(&a))
                    .unwrap_or(false)
        })
    }

    /// Ids of all connected peers.
    pub fn connected_peer_ids(&self) -> Vec<String> {
        self.connected_peers().map(|(id, _)| id.clone()).collect()
    }

    /// The connected peer whose validator address matches, if any. The
    /// votes gossip routine uses this to find the proposer's peer.
    pub fn peer_for_validator(&self, address: &Address) -> Option<String> {
        self.peers
            .iter()
            .find(|(_, v)| {
                v.is_connected && v.info.validator_address == Some(*address)
            })
            .map(|(id, _)| id.clone())
    }

    // ── Validator set management ────────────────────────────────────────

    /// Replace the active validator set at an epoch boundary.
    pub fn update_active_validators(&mut self, validators: HashSet<Address>) {
        info!(
            "validator set update: {} → {} validators",
            self.active_validators.len(),
            validators.len()
        );
        self.active_validators = validators;
    }

    // ── Liveness ────────────────────────────────────────────────────────

    /// Disconnect peers silent for longer than the configured timeout.
    /// Returns the ids that were disconnected.
    pub fn evict_stale_peers(&mut self) -> Vec<String> {
        let timeout = self.config.peer_timeout_secs;
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, v)| v.is_connected && v.silence_secs() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            warn!("evicting stale peer {id} (silent >{timeout}s)");
            if let Some(conn) = self.peers.get_mut(id) {
                conn.is_connected = false;
            }
        }
        stale
    }
}
