//! Epoch lifecycle: validator-set transitions at boundary heights.
//!
//! Epochs are fixed block ranges sharing one validator set and reward
//! rate, so bitmap widths are stable between boundaries. The next epoch's
//! set is drafted when the reveal-vote window closes, promoted when a
//! block header carries the matching descriptor, and entered at
//! `end_height + 1`. All mutable epoch state is owned here; callers see
//! read-only snapshots.

use {
    crate::{
        block::Block,
        error::{ConsensusError, Result},
        genesis::Genesis,
        keys::PubKey,
        types::Address,
        validator_set::{Validator, ValidatorChange, ValidatorSet},
    },
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs::OpenOptions,
        io::Write,
        path::{Path, PathBuf},
    },
};

/// Where an epoch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochStatus {
    /// The epoch currently governing consensus.
    Active,
    /// Drafted next epoch matched a block header but is not yet saved.
    VotedNotSaved,
    /// Persisted to the epoch DB.
    Saved,
    /// Promoted to the active epoch at the boundary.
    Entered,
}

/// One validator entry in a header-embedded epoch descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochValidator {
    /// The validator's BLS public key.
    pub pub_key: PubKey,
    /// Voting power for the epoch.
    pub voting_power: u64,
}

/// Compact epoch announcement embedded in block headers during the
/// transition pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochDescriptor {
    /// Epoch number being announced.
    pub number: u64,
    /// First height it will govern.
    pub start_height: u64,
    /// Last height it will govern.
    pub end_height: u64,
    /// Block reward during the epoch.
    pub reward_per_block: u64,
    /// The full roster.
    pub validators: Vec<EpochValidator>,
}

/// A contiguous height range governed by one validator set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epoch {
    /// Epoch number, starting at zero for genesis.
    pub number: u64,
    /// First height in the epoch.
    pub start_height: u64,
    /// Last height in the epoch.
    pub end_height: u64,
    /// Block reward during the epoch.
    pub reward_per_block: u64,
    /// Height after which reveal votes no longer count.
    pub reveal_vote_end_height: u64,
    /// Lifecycle position.
    pub status: EpochStatus,
    /// The governing validator set.
    pub validators: ValidatorSet,
    /// The drafted/promoted next epoch, if any.
    pub next_epoch: Option<Box<Epoch>>,
}

impl Epoch {
    /// Whether `height` falls inside this epoch.
    pub fn contains(&self, height: u64) -> bool {
        (self.start_height..=self.end_height).contains(&height)
    }

    /// Whether `height` is within the reveal-vote window.
    pub fn in_reveal_window(&self, height: u64) -> bool {
        height >= self.start_height && height <= self.reveal_vote_end_height
    }

    fn descriptor(&self) -> EpochDescriptor {
        EpochDescriptor {
            number: self.number,
            start_height: self.start_height,
            end_height: self.end_height,
            reward_per_block: self.reward_per_block,
            validators: self
                .validators
                .iter()
                .map(|v| EpochValidator {
                    pub_key: v.pub_key.clone(),
                    voting_power: v.voting_power,
                })
                .collect(),
        }
    }
}

/// Result of entering a new epoch at a boundary block.
#[derive(Debug, Clone)]
pub struct EpochTransition {
    /// The epoch just entered.
    pub epoch_number: u64,
    /// First height the new set governs.
    pub start_height: u64,
    /// The new validator set for the consensus engine.
    pub validators: ValidatorSet,
    /// True when the local node is in the new set but was not in the
    /// old one, meaning it should start consensus.
    pub start_mining: bool,
}

/// One accepted validator change, journaled to the `.val` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ValJournalEntry {
    epoch: u64,
    height: u64,
    change: ValidatorChange,
}

/// Owns the epoch lifecycle and its persistence.
pub struct EpochManager {
    current: Epoch,
    local_address: Address,
    /// Directory holding `epoch-<n>.json` records; `None` disables
    /// persistence (tests).
    db_dir: Option<PathBuf>,
    /// Path of the append-only validator-change journal.
    val_journal: Option<PathBuf>,
    /// Reveal votes accepted during the current window.
    pending_changes: Vec<ValidatorChange>,
}

impl EpochManager {
    /// Build the manager from a genesis document.
    pub fn from_genesis(
        genesis: &Genesis,
        local_address: Address,
        db_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let validators = genesis.validator_set()?;
        let epoch = Epoch {
            number: genesis.epoch.number,
            start_height: genesis.epoch.start_height,
            end_height: genesis.epoch.end_height,
            reward_per_block: genesis.epoch.reward_per_block,
            reveal_vote_end_height: genesis.epoch.reveal_vote_end_height,
            status: EpochStatus::Active,
            validators,
            next_epoch: None,
        };
        let val_journal = db_dir.as_ref().map(|d| d.join("validators.val"));
        if let Some(dir) = &db_dir {
            std::fs::create_dir_all(dir)?;
        }
        let manager = Self {
            current: epoch,
            local_address,
            db_dir,
            val_journal,
            pending_changes: Vec::new(),
        };
        manager.save_epoch(&manager.current)?;
        Ok(manager)
    }

    /// Read-only view of the active epoch.
    pub fn current(&self) -> &Epoch {
        &self.current
    }

    /// The validator set governing the active epoch.
    pub fn validators(&self) -> &ValidatorSet {
        &self.current.validators
    }

    /// The epoch number that governs `height`, when known.
    pub fn epoch_number_for(&self, height: u64) -> Option<u64> {
        if self.current.contains(height) {
            return Some(self.current.number);
        }
        self.current
            .next_epoch
            .as_ref()
            .filter(|next| next.contains(height))
            .map(|next| next.number)
    }

    /// Accept a reveal vote while the window is open; journal it.
    pub fn record_reveal_vote(&mut self, change: ValidatorChange, height: u64) -> Result<()> {
        if !self.current.in_reveal_window(height) {
            return Err(ConsensusError::Epoch(format!(
                "reveal window for epoch {} closed at {}",
                self.current.number, self.current.reveal_vote_end_height
            )));
        }
        self.journal_change(&change, height)?;
        self.pending_changes.push(change);
        Ok(())
    }

    /// At `reveal_vote_end_height + 1`, dry-run the pending changes over
    /// the current set to draft the next epoch. Returns whether a draft
    /// was produced.
    pub fn close_reveal_window(&mut self, height: u64) -> Result<bool> {
        if height != self.current.reveal_vote_end_height + 1 {
            return Ok(false);
        }
        if self.current.next_epoch.is_some() {
            return Ok(false);
        }
        let mut next_validators = self.current.validators.clone();
        let changes = std::mem::take(&mut self.pending_changes);
        if let Err(e) = next_validators.apply_changes(&changes) {
            warn!("next-epoch draft dropped invalid change: {e}");
        }
        let epoch_len = self.current.end_height - self.current.start_height + 1;
        let next = Epoch {
            number: self.current.number + 1,
            start_height: self.current.end_height + 1,
            end_height: self.current.end_height + epoch_len,
            reward_per_block: self.current.reward_per_block,
            reveal_vote_end_height: self.current.end_height + epoch_len
                - (self.current.end_height - self.current.reveal_vote_end_height),
            status: EpochStatus::Active,
            validators: ValidatorSet::new(
                next_validators
                    .iter()
                    .map(|v| Validator::new(v.pub_key.clone(), v.voting_power))
                    .collect(),
            ),
            next_epoch: None,
        };
        info!(
            "drafted epoch {} ({} validators) at height {height}",
            next.number,
            next.validators.len()
        );
        self.current.next_epoch = Some(Box::new(next));
        Ok(true)
    }

    /// Feed every inserted block through the epoch pipeline.
    ///
    /// Promotes a header-embedded descriptor for epoch `current + 1`,
    /// and performs the epoch entry at `end_height + 1`. Returns the
    /// transition when one happened.
    pub fn on_block_insert(&mut self, block: &Block) -> Result<Option<EpochTransition>> {
        let height = block.header.height;
        self.close_reveal_window(height)?;

        if let Some(descriptor) = &block.header.next_epoch {
            if descriptor.number == self.current.number + 1 {
                self.promote_descriptor(descriptor)?;
            } else {
                debug!(
                    "ignoring header epoch descriptor {} (current {})",
                    descriptor.number, self.current.number
                );
            }
        }

        if height == self.current.end_height + 1 {
            return self.enter_new_epoch(height).map(Some);
        }
        Ok(None)
    }

    /// The descriptor this node would embed in a block header at
    /// `height`, if the pipeline has a draft ready.
    pub fn descriptor_to_embed(&self, height: u64) -> Option<EpochDescriptor> {
        self.current
            .next_epoch
            .as_ref()
            .filter(|next| next.status == EpochStatus::Active && height > self.current.reveal_vote_end_height)
            .map(|next| next.descriptor())
    }

    fn promote_descriptor(&mut self, descriptor: &EpochDescriptor) -> Result<()> {
        let validators = ValidatorSet::new(
            descriptor
                .validators
                .iter()
                .map(|v| Validator::new(v.pub_key.clone(), v.voting_power))
                .collect(),
        );
        if validators.is_empty() {
            return Err(ConsensusError::Epoch(
                "header epoch descriptor has no validators".to_string(),
            ));
        }
        let promoted = Epoch {
            number: descriptor.number,
            start_height: descriptor.start_height,
            end_height: descriptor.end_height,
            reward_per_block: descriptor.reward_per_block,
            reveal_vote_end_height: descriptor.start_height
                + (self.current.reveal_vote_end_height - self.current.start_height),
            status: EpochStatus::VotedNotSaved,
            validators,
            next_epoch: None,
        };
        info!(
            "promoted next epoch {} from block header (status voted-not-saved)",
            promoted.number
        );
        self.current.next_epoch = Some(Box::new(promoted));
        Ok(())
    }

    /// Promote `next_epoch` to active at the boundary and persist it.
    fn enter_new_epoch(&mut self, height: u64) -> Result<EpochTransition> {
        let Some(mut next) = self.current.next_epoch.take() else {
            return Err(ConsensusError::Epoch(format!(
                "no next epoch prepared at boundary height {height}"
            )));
        };
        if next.start_height != height {
            return Err(ConsensusError::Epoch(format!(
                "next epoch starts at {} but boundary is {height}",
                next.start_height
            )));
        }

        let was_validator = self.current.validators.has_address(&self.local_address);
        next.status = EpochStatus::Saved;
        self.save_epoch(&next)?;
        next.status = EpochStatus::Entered;

        info!(
            "entering epoch {} at height {height} ({} validators)",
            next.number,
            next.validators.len()
        );
        self.current = *next;
        self.current.status = EpochStatus::Active;
        self.pending_changes.clear();
        self.save_epoch(&self.current)?;

        let is_validator = self.current.validators.has_address(&self.local_address);
        Ok(EpochTransition {
            epoch_number: self.current.number,
            start_height: self.current.start_height,
            validators: self.current.validators.clone(),
            start_mining: is_validator && !was_validator,
        })
    }

    // -- Persistence --

    fn save_epoch(&self, epoch: &Epoch) -> Result<()> {
        let Some(dir) = &self.db_dir else {
            return Ok(());
        };
        let path = dir.join(format!("epoch-{}.json", epoch.number));
        let json = serde_json::to_string_pretty(epoch)?;
        std::fs::write(&path, json)?;
        debug!("saved epoch {} to {}", epoch.number, path.display());
        Ok(())
    }

    /// Load a persisted epoch record.
    pub fn load_epoch(&self, number: u64) -> Result<Option<Epoch>> {
        let Some(dir) = &self.db_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("epoch-{number}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)?;
        let mut epoch: Epoch = serde_json::from_str(&json)?;
        epoch.validators.init_after_deserialize();
        if let Some(next) = epoch.next_epoch.as_mut() {
            next.validators.init_after_deserialize();
        }
        Ok(Some(epoch))
    }

    fn journal_change(&self, change: &ValidatorChange, height: u64) -> Result<()> {
        let Some(path) = &self.val_journal else {
            return Ok(());
        };
        let entry = ValJournalEntry {
            epoch: self.current.number,
            height,
            change: change.clone(),
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let line = serde_json::to_string(&entry)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Read back the validator-change journal (operator tooling, tests).
    pub fn read_val_journal(path: &Path) -> Result<Vec<(u64, u64, ValidatorChange)>> {
        let content = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for line in content.lines().filter(|l| !l.is_empty()) {
            let entry: ValJournalEntry = serde_json::from_str(line)?;
            entries.push((entry.epoch, entry.height, entry.change));
        }
        Ok(entries)
    }
}
