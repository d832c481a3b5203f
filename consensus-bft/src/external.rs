//! External collaborator interfaces.
//!
//! The consensus core never touches the execution environment, the chain
//! database, or raw keys directly; it talks to these traits. The signer
//! owns double-sign protection: the state machine treats a refusal as "no
//! local vote was cast" and carries on.

use {
    crate::{
        block::Block,
        error::Result as ConsensusResult,
        keys::{BlsSignature, ConsensusKeyPair},
        sign_aggr::SignAggr,
        types::Hash,
        validator_set::ValidatorChange,
        vote::{BlockId, VoteType},
    },
    parking_lot::Mutex,
    thiserror::Error,
};

/// Produces candidate blocks for the proposer. May block; the caller
/// abandons the result if the step advances.
pub trait BlockProducer: Send + Sync {
    /// Assemble a candidate block extending `parent` at `height`.
    fn request_block(&self, height: u64, parent: &BlockId) -> ConsensusResult<Block>;
}

/// Result of applying a committed block to the execution environment.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Post-state commitment.
    pub app_hash: Hash,
    /// Validator diffs the execution produced, if any.
    pub validator_changes: Vec<ValidatorChange>,
}

/// Applies committed blocks. Must be deterministic and idempotent for the
/// same input.
pub trait BlockExecutor: Send + Sync {
    /// Execute `block` under its `commit` and return the post-state.
    fn apply_block(&self, block: &Block, commit: &SignAggr) -> ConsensusResult<ApplyResult>;
}

/// Persistent block storage. Single-writer (the state machine),
/// multi-reader.
pub trait BlockStore: Send + Sync {
    /// The block committed at `height`, if stored.
    fn load_block(&self, height: u64) -> Option<Block>;
    /// The commit aggregate stored with `height`.
    fn load_commit(&self, height: u64) -> Option<SignAggr>;
    /// Persist a committed block with its 2/3+ precommit aggregate.
    fn save_block(&self, block: Block, commit: SignAggr) -> ConsensusResult<()>;
    /// Highest stored height; zero when empty.
    fn current_height(&self) -> u64;
}

/// Wall clock, injectable for tests.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Why the signer declined to sign.
#[derive(Error, Debug)]
pub enum SignerError {
    /// The request conflicts with a vote already signed at the same
    /// (height, round, type). Non-fatal: the node just casts no vote.
    #[error("refusing to double-sign at height {height} round {round}: already signed {signed}")]
    Refused {
        /// Height of the conflicting request.
        height: u64,
        /// Round of the conflicting request.
        round: u32,
        /// The block id signed previously.
        signed: BlockId,
    },
}

/// Signs canonical vote bytes and refuses contradictory requests.
pub trait VoteSigner: Send + Sync {
    /// Sign `sign_bytes` for the vote at (height, round, type, block id).
    fn sign_vote(
        &self,
        height: u64,
        round: u32,
        vote_type: VoteType,
        block_id: &BlockId,
        sign_bytes: &[u8],
    ) -> Result<BlsSignature, SignerError>;

    /// Sign a proposal's canonical bytes (no double-sign bookkeeping; a
    /// proposer signs at most one proposal per round by construction).
    fn sign_proposal(&self, sign_bytes: &[u8]) -> BlsSignature;
}

/// The last vote this signer produced.
#[derive(Debug, Clone, Copy, PartialEq)]
struct LastSigned {
    height: u64,
    round: u32,
    vote_type: VoteType,
    block_id: BlockId,
}

/// In-process signer holding the validator key and the last-signed record
/// that backs double-sign protection.
pub struct LocalSigner {
    keypair: ConsensusKeyPair,
    last_signed: Mutex<Option<LastSigned>>,
}

impl LocalSigner {
    /// Wrap a key pair with a fresh last-signed record.
    pub fn new(keypair: ConsensusKeyPair) -> Self {
        Self {
            keypair,
            last_signed: Mutex::new(None),
        }
    }

    /// The public key of the wrapped key pair.
    pub fn public(&self) -> &crate::keys::PubKey {
        self.keypair.public()
    }
}

impl VoteSigner for LocalSigner {
    fn sign_vote(
        &self,
        height: u64,
        round: u32,
        vote_type: VoteType,
        block_id: &BlockId,
        sign_bytes: &[u8],
    ) -> Result<BlsSignature, SignerError> {
        let mut last = self.last_signed.lock();
        if let Some(prev) = *last {
            let same_slot =
                prev.height == height && prev.round == round && prev.vote_type == vote_type;
            if same_slot && prev.block_id != *block_id {
                return Err(SignerError::Refused {
                    height,
                    round,
                    signed: prev.block_id,
                });
            }
            // Regressions in height/round are also contradictions: the WAL
            // replay path re-signs the same votes, never older slots with
            // new content.
            if prev.height > height
                || (prev.height == height && prev.round > round && !same_slot)
            {
                return Err(SignerError::Refused {
                    height,
                    round,
                    signed: prev.block_id,
                });
            }
        }
        *last = Some(LastSigned {
            height,
            round,
            vote_type,
            block_id: *block_id,
        });
        Ok(self.keypair.sign(sign_bytes))
    }

    fn sign_proposal(&self, sign_bytes: &[u8]) -> BlsSignature {
        self.keypair.sign(sign_bytes)
    }
}

/// In-memory block store used by tests and fast-sync harnesses.
#[derive(Default)]
pub struct MemoryBlockStore {
    inner: Mutex<std::collections::BTreeMap<u64, (Block, SignAggr)>>,
}

impl MemoryBlockStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn load_block(&self, height: u64) -> Option<Block> {
        self.inner.lock().get(&height).map(|(b, _)| b.clone())
    }

    fn load_commit(&self, height: u64) -> Option<SignAggr> {
        self.inner.lock().get(&height).map(|(_, c)| c.clone())
    }

    fn save_block(&self, block: Block, commit: SignAggr) -> ConsensusResult<()> {
        self.inner.lock().insert(block.header.height, (block, commit));
        Ok(())
    }

    fn current_height(&self) -> u64 {
        self.inner
            .lock()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }
}
