//! Fast-sync: height-ordered block catch-up.
//!
//! A node far behind the network downloads blocks instead of running
//! rounds: request the next heights from peers, verify each block with
//! the commit aggregate carried in its successor's `last_commit`, save
//! it, advance. Peer heights come from periodic status polls; when the
//! local height is within one of the best peer, the caller hands off to
//! the consensus state machine.

use {
    crate::{
        config::ConsensusNetConfig,
        error::{ConsensusNetError, Result},
        message::SyncMessage,
    },
    log::{debug, info, warn},
    meridian_consensus_bft::{Block, BlockStore, ValidatorSet},
    std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
        time::Instant,
    },
};

/// An outstanding block request.
#[derive(Debug, Clone)]
struct PendingRequest {
    peer: String,
    sent_at: Instant,
    attempts: u32,
}

/// Height-ordered block catch-up over the peer set.
pub struct FastSync {
    chain_id: String,
    validators: ValidatorSet,
    store: Arc<dyn BlockStore>,
    config: ConsensusNetConfig,
    /// Last height heard from each peer.
    peer_heights: HashMap<String, u64>,
    /// Downloaded blocks not yet verified and saved.
    pool: BTreeMap<u64, Block>,
    /// Heights with a request in flight.
    pending: HashMap<u64, PendingRequest>,
    /// Highest verified-and-saved height.
    local_height: u64,
    max_retries: u32,
}

impl FastSync {
    /// Start a catch-up session from the store's current height.
    pub fn new(
        chain_id: &str,
        validators: ValidatorSet,
        store: Arc<dyn BlockStore>,
        config: ConsensusNetConfig,
    ) -> Self {
        let local_height = store.current_height();
        Self {
            chain_id: chain_id.to_string(),
            validators,
            store,
            config,
            peer_heights: HashMap::new(),
            pool: BTreeMap::new(),
            pending: HashMap::new(),
            local_height,
            max_retries: 5,
        }
    }

    /// Our verified height.
    pub fn local_height(&self) -> u64 {
        self.local_height
    }

    /// Record a peer's advertised height (status responses and
    /// heartbeats feed this).
    pub fn record_status(&mut self, peer: &str, height: u64) {
        let entry = self.peer_heights.entry(peer.to_string()).or_insert(0);
        if height > *entry {
            *entry = height;
        }
    }

    /// Forget a disconnected peer.
    pub fn remove_peer(&mut self, peer: &str) {
        self.peer_heights.remove(peer);
    }

    /// The highest height any peer has advertised.
    pub fn max_peer_height(&self) -> u64 {
        self.peer_heights.values().copied().max().unwrap_or(0)
    }

    /// Within one height of the best peer: time to switch to consensus.
    pub fn is_caught_up(&self) -> bool {
        let best = self.max_peer_height();
        best == 0 || self.local_height + 1 >= best
    }

    /// The next block requests to dispatch, bounded by the concurrency
    /// limit. Requests target peers that claim the height, round-robin
    /// by request count.
    pub fn next_requests(&mut self) -> Vec<(u64, String, SyncMessage)> {
        let best = self.max_peer_height();
        let mut requests = Vec::new();
        // The block after a height is what verifies it, so the window
        // runs to the tip itself.
        let want_from = self.local_height + 1;
        let want_to = best;
        let mut height = want_from;
        while height <= want_to && self.pending.len() + requests.len() < self.config.max_sync_requests
        {
            if !self.pool.contains_key(&height) && !self.pending.contains_key(&height) {
                if let Some(peer) = self.pick_peer(height) {
                    requests.push((height, peer, SyncMessage::BlockRequest { height }));
                }
            }
            height += 1;
        }
        for (height, peer, _) in &requests {
            self.pending.insert(
                *height,
                PendingRequest {
                    peer: peer.clone(),
                    sent_at: Instant::now(),
                    attempts: 1,
                },
            );
        }
        if !requests.is_empty() {
            debug!(
                "dispatching {} block requests from height {want_from}",
                requests.len()
            );
        }
        requests
    }

    fn pick_peer(&self, height: u64) -> Option<String> {
        // Any peer that claims the height; prefer the least-loaded.
        let mut candidates: Vec<&String> = self
            .peer_heights
            .iter()
            .filter(|(_, h)| **h >= height)
            .map(|(p, _)| p)
            .collect();
        candidates.sort();
        let loads: HashMap<&String, usize> =
            self.pending
                .values()
                .fold(HashMap::new(), |mut acc, req| {
                    *acc.entry(&req.peer).or_insert(0) += 1;
                    acc
                });
        candidates
            .into_iter()
            .min_by_key(|p| loads.get(*p).copied().unwrap_or(0))
            .cloned()
    }

    /// Accept a block response and advance as far as verification
    /// allows. Returns the new local height.
    pub fn handle_block_response(&mut self, peer: &str, height: u64, block: Block) -> Result<u64> {
        match self.pending.get(&height) {
            Some(req) if req.peer == peer => {
                self.pending.remove(&height);
            }
            Some(_) => {
                warn!("block {height} from unexpected peer {peer}");
            }
            None => {
                debug!("unsolicited block {height} from {peer}");
            }
        }
        if block.header.height != height {
            return Err(ConsensusNetError::BlockNotAvailable(height));
        }
        if height > self.local_height {
            self.pool.insert(height, block);
        }
        self.try_advance()?;
        Ok(self.local_height)
    }

    /// Verify and save every pooled block whose successor we also hold:
    /// block H is valid iff block H+1's `last_commit` verifies against
    /// our validator set over H's block id.
    fn try_advance(&mut self) -> Result<()> {
        loop {
            let height = self.local_height + 1;
            let (Some(block), Some(next)) = (self.pool.get(&height), self.pool.get(&(height + 1)))
            else {
                return Ok(());
            };
            let Some(commit) = next.last_commit.clone() else {
                warn!("block {} carries no commit for {height}, refetching", height + 1);
                self.pool.remove(&(height + 1));
                return Ok(());
            };
            if commit.block_id.hash != block.hash() {
                warn!("commit in block {} does not cover block {height}", height + 1);
                self.pool.remove(&height);
                self.pool.remove(&(height + 1));
                return Ok(());
            }
            if let Err(e) =
                self.validators
                    .verify_commit(&self.chain_id, &commit.block_id, height, &commit)
            {
                warn!("commit for block {height} failed verification: {e}");
                self.pool.remove(&height);
                self.pool.remove(&(height + 1));
                return Ok(());
            }

            let block = self.pool.remove(&height).expect("checked above");
            self.store.save_block(block, commit)?;
            self.local_height = height;
            info!("fast-sync advanced to height {height}");
        }
    }

    /// Retry requests whose peers went quiet; drop heights that
    /// exhausted their retries (they will be re-requested next tick).
    pub fn retry_timed_out(&mut self) -> Vec<(u64, String, SyncMessage)> {
        let timeout_ms = self.config.sync_request_timeout_ms as u128;
        let timed_out: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, req)| req.sent_at.elapsed().as_millis() > timeout_ms)
            .map(|(h, _)| *h)
            .collect();

        let mut retries = Vec::new();
        for height in timed_out {
            let Some(req) = self.pending.remove(&height) else {
                continue;
            };
            if req.attempts >= self.max_retries {
                warn!("giving up on block {height} after {} attempts", req.attempts);
                continue;
            }
            if let Some(peer) = self.pick_peer(height) {
                self.pending.insert(
                    height,
                    PendingRequest {
                        peer: peer.clone(),
                        sent_at: Instant::now(),
                        attempts: req.attempts + 1,
                    },
                );
                debug!(
                    "retrying block {height} with {peer} (attempt {})",
                    req.attempts + 1
                );
                retries.push((height, peer, SyncMessage::BlockRequest { height }));
            }
        }
        retries
    }

    /// Serve a peer's block request from our store.
    pub fn serve_block_request(&self, height: u64) -> Option<SyncMessage> {
        let mut block = self.store.load_block(height)?;
        // Stitch the stored commit of `height` into the next block's
        // slot when the block predates it; responders always carry the
        // commit the requester needs for the previous height.
        if block.last_commit.is_none() && height > 1 {
            block.last_commit = self.store.load_commit(height - 1);
        }
        Some(SyncMessage::BlockResponse { height, block })
    }
}
