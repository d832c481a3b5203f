//! BLS12-381 key management and signature aggregation.
//!
//! Validators authenticate votes with BLS signatures so that a commit is a
//! single constant-size aggregate over a validator bitmap instead of N
//! individual signatures. Aggregation and verification go through
//! `fastcrypto`; this module wraps key handling and exposes the three
//! aggregate operations the rest of the core uses.

use {
    crate::{
        error::{ConsensusError, Result},
        types::{Address, ADDRESS_LEN},
    },
    fastcrypto::{
        bls12381::min_sig::{
            BLS12381AggregateSignature, BLS12381KeyPair, BLS12381PublicKey, BLS12381Signature,
        },
        traits::{AggregateAuthenticator, KeyPair, Signer, ToFromBytes, VerifyingKey},
    },
    rand::{rngs::StdRng, SeedableRng},
    sha2::{Digest, Sha256},
};

/// A validator's BLS public key.
pub type PubKey = BLS12381PublicKey;

/// An individual BLS signature over canonical sign-bytes.
pub type BlsSignature = BLS12381Signature;

/// A BLS aggregate over the signatures of the bitmap-selected validators.
pub type AggregateSignature = BLS12381AggregateSignature;

/// Domain-separation prefix for deterministic key derivation.
const KEY_SEED_PREFIX: &[u8] = b"MERIDIAN_CONSENSUS_KEY_V1:";

/// A consensus signing key pair.
pub struct ConsensusKeyPair {
    inner: BLS12381KeyPair,
}

impl ConsensusKeyPair {
    /// Generate a fresh key pair from the given rng.
    pub fn generate<R: fastcrypto::traits::AllowedRng>(rng: &mut R) -> Self {
        Self {
            inner: BLS12381KeyPair::generate(rng),
        }
    }

    /// Derive a key pair deterministically from a string seed.
    ///
    /// The same seed always produces the same key pair, which is what test
    /// networks and tooling rely on to agree on a shared validator set.
    pub fn from_seed(seed: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_SEED_PREFIX);
        hasher.update(seed.as_bytes());
        let seed_bytes: [u8; 32] = hasher.finalize().into();
        let mut rng = StdRng::from_seed(seed_bytes);
        Self {
            inner: BLS12381KeyPair::generate(&mut rng),
        }
    }

    /// The public half of this key pair.
    pub fn public(&self) -> &PubKey {
        self.inner.public()
    }

    /// The validator address derived from the public key.
    pub fn address(&self) -> Address {
        derive_address(self.public())
    }

    /// Sign a message.
    pub fn sign(&self, msg: &[u8]) -> BlsSignature {
        self.inner.sign(msg)
    }

    /// Duplicate the key pair (BLS key pairs are not `Clone`).
    pub fn copy(&self) -> Self {
        Self {
            inner: self.inner.copy(),
        }
    }
}

impl std::fmt::Debug for ConsensusKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConsensusKeyPair({})", self.address())
    }
}

/// Derive a 20-byte address from a BLS public key: the first 20 bytes of
/// sha256 over the serialized key.
pub fn derive_address(pub_key: &PubKey) -> Address {
    let digest = Sha256::digest(pub_key.as_bytes());
    let mut addr = [0u8; ADDRESS_LEN];
    addr.copy_from_slice(&digest[..ADDRESS_LEN]);
    Address::new(addr)
}

/// Verify an individual signature against a single public key.
pub fn verify_single(pub_key: &PubKey, msg: &[u8], signature: &BlsSignature) -> Result<()> {
    pub_key
        .verify(msg, signature)
        .map_err(|e| ConsensusError::InvalidSignature(e.to_string()))
}

/// Aggregate individual signatures into one group sum.
pub fn aggregate_signatures(signatures: Vec<BlsSignature>) -> Result<AggregateSignature> {
    if signatures.is_empty() {
        return Err(ConsensusError::AggregationFailed(
            "no signatures to aggregate".to_string(),
        ));
    }
    AggregateSignature::aggregate(signatures.iter())
        .map_err(|e| ConsensusError::AggregationFailed(e.to_string()))
}

/// Pairing-check an aggregate signature against the public keys of every
/// contributing validator over the canonical message bytes.
pub fn verify_aggregate(
    aggregate: &AggregateSignature,
    pub_keys: &[PubKey],
    msg: &[u8],
) -> Result<()> {
    if pub_keys.is_empty() {
        return Err(ConsensusError::InvalidSignature(
            "empty public key set".to_string(),
        ));
    }
    aggregate
        .verify(pub_keys, msg)
        .map_err(|e| ConsensusError::InvalidSignature(e.to_string()))
}
