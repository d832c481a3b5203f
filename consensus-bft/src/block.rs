//! The block shape the consensus core proposes, gossips, and commits.
//!
//! Execution, state roots, and transaction semantics live behind the
//! external executor; consensus sees an opaque payload plus the header
//! fields it needs for chaining, validator-set tracking, and epoch
//! transitions. The previous height's commit aggregate rides in
//! `last_commit` so peers and fast-sync can verify the chain backwards.

use {
    crate::{
        epoch::EpochDescriptor,
        error::{ConsensusError, Result},
        part_set::PartSet,
        sign_aggr::SignAggr,
        types::Hash,
        vote::{BlockId, PartSetHeader},
    },
    serde::{Deserialize, Serialize},
};

/// Consensus-visible block header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Chain this block belongs to.
    pub chain_id: String,
    /// Block height.
    pub height: u64,
    /// Proposal wall-clock time in milliseconds.
    pub time_ms: u64,
    /// Hash of the previous committed block; zero at the first height.
    pub parent_hash: Hash,
    /// Hash of the validator set that governs this height.
    pub validators_hash: Hash,
    /// Post-state commitment reported by the executor for the parent.
    pub app_hash: Hash,
    /// Next-epoch descriptor embedded at epoch-pipeline heights.
    pub next_epoch: Option<EpochDescriptor>,
}

/// A proposed or committed block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Header fields consensus inspects.
    pub header: BlockHeader,
    /// Opaque transaction payload; the executor decodes it.
    pub data: Vec<u8>,
    /// The 2/3+ precommit aggregate for the previous height; `None` only
    /// at the first height after genesis.
    pub last_commit: Option<SignAggr>,
}

impl Block {
    /// Deterministic hash over the header.
    pub fn hash(&self) -> Hash {
        let bytes =
            bincode::serialize(&self.header).expect("block header encoding cannot fail");
        Hash::hash_bytes(&bytes)
    }

    /// Serialized form used for part-set chunking and storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode a block from its serialized form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Block> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Chunk this block into a part set for gossip.
    pub fn make_part_set(&self) -> Result<PartSet> {
        Ok(PartSet::from_data(&self.to_bytes()?))
    }

    /// This block's id under the given part-set header.
    pub fn block_id(&self, parts: PartSetHeader) -> BlockId {
        BlockId {
            hash: self.hash(),
            parts,
        }
    }

    /// Structural checks that need no execution: chain id, height, and
    /// parent linkage.
    pub fn validate_basic(
        &self,
        chain_id: &str,
        expected_height: u64,
        parent_hash: Hash,
        validators_hash: Hash,
    ) -> Result<()> {
        if self.header.chain_id != chain_id {
            return Err(ConsensusError::InvalidBlock(format!(
                "chain id {} != {chain_id}",
                self.header.chain_id
            )));
        }
        if self.header.height != expected_height {
            return Err(ConsensusError::InvalidBlock(format!(
                "height {} != expected {expected_height}",
                self.header.height
            )));
        }
        if self.header.parent_hash != parent_hash {
            return Err(ConsensusError::InvalidBlock(format!(
                "parent hash {} != expected {parent_hash}",
                self.header.parent_hash
            )));
        }
        if self.header.validators_hash != validators_hash {
            return Err(ConsensusError::InvalidBlock(format!(
                "validators hash {} != expected {validators_hash}",
                self.header.validators_hash
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(height: u64) -> Block {
        Block {
            header: BlockHeader {
                chain_id: "t".to_string(),
                height,
                time_ms: 1_700_000_000_000,
                parent_hash: Hash::hash_bytes(b"parent"),
                validators_hash: Hash::hash_bytes(b"validators"),
                app_hash: Hash::hash_bytes(b"app"),
                next_epoch: None,
            },
            data: vec![1, 2, 3, 4],
            last_commit: None,
        }
    }

    #[test]
    fn test_hash_covers_header() {
        let a = sample_block(1);
        let mut b = sample_block(1);
        assert_eq!(a.hash(), b.hash());
        b.header.height = 2;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_bytes_roundtrip() {
        let block = sample_block(3);
        let bytes = block.to_bytes().unwrap();
        let back = Block::from_bytes(&bytes).unwrap();
        assert_eq!(block, back);
    }

    #[test]
    fn test_part_set_roundtrip() {
        let mut block = sample_block(3);
        block.data = (0..200_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let ps = block.make_part_set().unwrap();
        assert!(ps.total() > 1);
        let back = Block::from_bytes(&ps.assemble().unwrap()).unwrap();
        assert_eq!(block, back);
    }

    #[test]
    fn test_validate_basic() {
        let block = sample_block(5);
        let parent = block.header.parent_hash;
        let vals = block.header.validators_hash;
        assert!(block.validate_basic("t", 5, parent, vals).is_ok());
        assert!(block.validate_basic("other", 5, parent, vals).is_err());
        assert!(block.validate_basic("t", 6, parent, vals).is_err());
        assert!(block
            .validate_basic("t", 5, Hash::hash_bytes(b"wrong"), vals)
            .is_err());
        assert!(block
            .validate_basic("t", 5, parent, Hash::hash_bytes(b"wrong"))
            .is_err());
    }
}
