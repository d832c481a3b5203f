//! Block part sets: chunking, Merkle commitments, and reassembly.
//!
//! A proposed block is serialized and split into fixed-size parts so peers
//! can gossip it piecewise. The part-set header commits to the chunks via
//! a Merkle root; every part carries a proof, so a peer can verify each
//! chunk independently before it has the whole block.

use {
    crate::{
        bit_array::BitArray,
        error::{ConsensusError, Result},
        types::Hash,
        vote::PartSetHeader,
    },
    serde::{Deserialize, Serialize},
};

/// Size of each block part in bytes (the last part may be shorter).
pub const PART_SIZE: usize = 65536;

/// One fixed-size slice of a serialized block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    /// Position of this part within the set.
    pub index: u32,
    /// Raw chunk bytes.
    pub bytes: Vec<u8>,
    /// Merkle branch from this part's leaf hash up to the set root.
    pub proof: Vec<Hash>,
}

impl Part {
    /// Leaf hash of this part's bytes.
    pub fn leaf_hash(&self) -> Hash {
        Hash::hash_bytes(&self.bytes)
    }

    /// Verify this part's Merkle proof against the set header.
    pub fn verify(&self, header: &PartSetHeader) -> Result<()> {
        if self.index >= header.total {
            return Err(ConsensusError::InvalidPart(format!(
                "part index {} out of range (total {})",
                self.index, header.total
            )));
        }
        let computed = fold_proof(
            self.leaf_hash(),
            self.index as usize,
            header.total as usize,
            &self.proof,
        );
        if computed != header.root {
            return Err(ConsensusError::InvalidPart(format!(
                "part {} proof does not match root {}",
                self.index, header.root
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Merkle tree over leaf hashes
// ---------------------------------------------------------------------------

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    Hash::hashv(&[left.as_ref(), right.as_ref()])
}

/// Root over the given leaves. Odd nodes are promoted unchanged.
fn merkle_root(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => Hash::default(),
        1 => leaves[0],
        _ => {
            let mut level: Vec<Hash> = leaves.to_vec();
            while level.len() > 1 {
                let mut next = Vec::with_capacity(level.len().div_ceil(2));
                for pair in level.chunks(2) {
                    if pair.len() == 2 {
                        next.push(hash_pair(&pair[0], &pair[1]));
                    } else {
                        next.push(pair[0]);
                    }
                }
                level = next;
            }
            level[0]
        }
    }
}

/// Sibling branch for the leaf at `index`, bottom-up. Levels where the node
/// has no sibling contribute nothing; `fold_proof` mirrors the promotion.
fn merkle_proof(leaves: &[Hash], index: usize) -> Vec<Hash> {
    let mut proof = Vec::new();
    let mut level: Vec<Hash> = leaves.to_vec();
    let mut pos = index;
    while level.len() > 1 {
        let sibling = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
        if sibling < level.len() {
            proof.push(level[sibling]);
        }
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                next.push(hash_pair(&pair[0], &pair[1]));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
        pos /= 2;
    }
    proof
}

/// Recompute the root from a leaf and its proof by replaying the level
/// widths; levels where the node was promoted consume no proof entry.
/// Returns the zero hash on a malformed proof so the comparison fails.
fn fold_proof(leaf: Hash, index: usize, total: usize, proof: &[Hash]) -> Hash {
    let mut acc = leaf;
    let mut pos = index;
    let mut width = total.max(1);
    let mut siblings = proof.iter();
    while width > 1 {
        let sibling_pos = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
        if sibling_pos < width {
            match siblings.next() {
                Some(sibling) => {
                    acc = if pos % 2 == 0 {
                        hash_pair(&acc, sibling)
                    } else {
                        hash_pair(sibling, &acc)
                    };
                }
                None => return Hash::default(),
            }
        }
        pos /= 2;
        width = width.div_ceil(2);
    }
    if siblings.next().is_some() {
        return Hash::default();
    }
    acc
}

// ---------------------------------------------------------------------------
// Part set
// ---------------------------------------------------------------------------

/// A block's part set: either built complete from local block bytes (the
/// proposer) or assembled incrementally from gossip (everyone else).
#[derive(Debug, Clone)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    bit_array: BitArray,
    count: u32,
}

impl PartSet {
    /// Chunk serialized block bytes into a complete part set.
    pub fn from_data(data: &[u8]) -> PartSet {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(PART_SIZE).collect()
        };
        let leaves: Vec<Hash> = chunks.iter().map(|c| Hash::hash_bytes(c)).collect();
        let root = merkle_root(&leaves);
        let total = chunks.len() as u32;

        let parts: Vec<Option<Part>> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                Some(Part {
                    index: i as u32,
                    bytes: chunk.to_vec(),
                    proof: merkle_proof(&leaves, i),
                })
            })
            .collect();

        let mut bit_array = BitArray::new(total as usize);
        for i in 0..total as usize {
            bit_array.set(i, true);
        }

        PartSet {
            header: PartSetHeader { total, root },
            parts,
            bit_array,
            count: total,
        }
    }

    /// An empty part set awaiting gossiped parts for the given header.
    pub fn from_header(header: PartSetHeader) -> PartSet {
        PartSet {
            header,
            parts: vec![None; header.total as usize],
            bit_array: BitArray::new(header.total as usize),
            count: 0,
        }
    }

    /// The header this set is committed to.
    pub fn header(&self) -> &PartSetHeader {
        &self.header
    }

    /// Which parts we hold.
    pub fn bit_array(&self) -> &BitArray {
        &self.bit_array
    }

    /// Total number of parts.
    pub fn total(&self) -> u32 {
        self.header.total
    }

    /// Number of parts currently held.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// True once every part is present.
    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    /// Whether part `index` is present.
    pub fn has(&self, index: u32) -> bool {
        self.bit_array.get(index as usize)
    }

    /// The part at `index`, if present.
    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    /// Add a gossiped part after verifying its proof.
    ///
    /// Returns `Ok(false)` for duplicates.
    pub fn add_part(&mut self, part: Part) -> Result<bool> {
        part.verify(&self.header)?;
        let index = part.index as usize;
        if self.bit_array.get(index) {
            return Ok(false);
        }
        self.parts[index] = Some(part);
        self.bit_array.set(index, true);
        self.count += 1;
        Ok(true)
    }

    /// Concatenate all parts back into the serialized block bytes.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::with_capacity(self.count as usize * PART_SIZE);
        for part in self.parts.iter().flatten() {
            out.extend_from_slice(&part.bytes);
        }
        Some(out)
    }
}
