//! Fixed-width bitmaps over validator indices.
//!
//! Every signature aggregate and every peer vote view is a [`BitArray`]
//! whose width equals the validator-set size at that height. Widths are
//! stable within an epoch, so set operations (`and`, `or`, `sub`) between
//! local and peer bitmaps are well defined and drive the gossip diffing.

use {
    rand::Rng,
    serde::{Deserialize, Serialize},
    std::fmt,
};

const WORD_BITS: usize = 64;

/// A fixed-width bit array indexed by validator position.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitArray {
    bits: usize,
    elems: Vec<u64>,
}

impl BitArray {
    /// Create an all-zero bit array of the given width.
    pub fn new(bits: usize) -> Self {
        let words = bits.div_ceil(WORD_BITS);
        Self {
            bits,
            elems: vec![0u64; words],
        }
    }

    /// The width of the array in bits.
    pub fn size(&self) -> usize {
        self.bits
    }

    /// Read bit `index`. Out-of-range reads return false.
    pub fn get(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        self.elems[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    /// Write bit `index`. Returns false (and does nothing) when the index
    /// is out of range.
    pub fn set(&mut self, index: usize, value: bool) -> bool {
        if index >= self.bits {
            return false;
        }
        let mask = 1u64 << (index % WORD_BITS);
        if value {
            self.elems[index / WORD_BITS] |= mask;
        } else {
            self.elems[index / WORD_BITS] &= !mask;
        }
        true
    }

    /// Number of set bits.
    pub fn num_true(&self) -> usize {
        self.elems.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True when no bit is set.
    pub fn is_empty(&self) -> bool {
        self.elems.iter().all(|w| *w == 0)
    }

    /// True when every bit is set.
    pub fn is_full(&self) -> bool {
        self.num_true() == self.bits
    }

    /// Indices of all set bits, ascending.
    pub fn true_indices(&self) -> Vec<usize> {
        (0..self.bits).filter(|i| self.get(*i)).collect()
    }

    /// Bitwise intersection. Widths must match; mismatched widths yield an
    /// empty array of our width (the caller treats it as "nothing to do").
    pub fn and(&self, other: &BitArray) -> BitArray {
        if self.bits != other.bits {
            return BitArray::new(self.bits);
        }
        let mut out = self.clone();
        for (w, o) in out.elems.iter_mut().zip(other.elems.iter()) {
            *w &= o;
        }
        out
    }

    /// Bitwise union. Widths must match; mismatched widths yield a copy of
    /// `self`.
    pub fn or(&self, other: &BitArray) -> BitArray {
        if self.bits != other.bits {
            return self.clone();
        }
        let mut out = self.clone();
        for (w, o) in out.elems.iter_mut().zip(other.elems.iter()) {
            *w |= o;
        }
        out
    }

    /// Bits set in `self` but not in `other`: the gossip "what the peer is
    /// missing" diff.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        if self.bits != other.bits {
            return self.clone();
        }
        let mut out = self.clone();
        for (w, o) in out.elems.iter_mut().zip(other.elems.iter()) {
            *w &= !o;
        }
        out
    }

    /// Bitwise complement within the array width.
    pub fn not(&self) -> BitArray {
        let mut out = BitArray::new(self.bits);
        for i in 0..self.bits {
            out.set(i, !self.get(i));
        }
        out
    }

    /// Pick a uniformly random set bit, if any. Used by the block-parts
    /// gossip routine to spread distinct parts across peers.
    pub fn pick_random<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        let trues = self.true_indices();
        if trues.is_empty() {
            return None;
        }
        Some(trues[rng.gen_range(0..trues.len())])
    }

    /// Overwrite this array with the contents of `other` when widths match.
    /// Peers advertise complete bitmaps; stale local views are replaced
    /// wholesale.
    pub fn update(&mut self, other: &BitArray) -> bool {
        if self.bits != other.bits {
            return false;
        }
        self.elems.copy_from_slice(&other.elems);
        true
    }
}

impl fmt::Display for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.bits {
            write!(f, "{}", if self.get(i) { 'x' } else { '_' })?;
        }
        Ok(())
    }
}

impl fmt::Debug for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BA{{{}:{}}}", self.bits, self)
    }
}
