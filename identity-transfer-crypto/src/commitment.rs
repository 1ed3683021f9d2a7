// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hash-based commitment scheme.
//!
//! A commitment fixes a value without revealing it. It is computed over a 256-bit random nonce
//! and the value and additionally bound to a `tag` (for example the identity the committed value
//! belongs to):
//!
//! ```text
//! decommitment = nonce || value
//! commitment   = SHA256(len(tag) || tag || decommitment)
//! ```
//!
//! Opening a commitment recomputes the digest and compares it in constant time. The value is only
//! returned for the exact decommitment and tag used when committing.
use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::rng::{Rng, RngError};
use crate::sha2::{SHA256_DIGEST_SIZE, sha2_256};

pub const NONCE_SIZE: usize = 32;

#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment(#[serde(with = "serde_bytes")] [u8; SHA256_DIGEST_SIZE]);

impl Commitment {
    pub fn as_bytes(&self) -> &[u8; SHA256_DIGEST_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Commitment")
            .field(&hex::encode(self.0))
            .finish()
    }
}

/// Opening information for a [`Commitment`]. Revealing it reveals the committed value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decommitment(#[serde(with = "serde_bytes")] Vec<u8>);

impl Decommitment {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Decommitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Decommitment").field(&"***").finish()
    }
}

fn digest(tag: &[u8], decommitment: &[u8]) -> [u8; SHA256_DIGEST_SIZE] {
    let tag_len = (tag.len() as u64).to_be_bytes();
    sha2_256(&[&tag_len, tag, decommitment])
}

/// Commits to `value` under `tag`.
pub fn commit(
    rng: &Rng,
    tag: &[u8],
    value: &[u8],
) -> Result<(Commitment, Decommitment), CommitmentError> {
    let nonce: [u8; NONCE_SIZE] = rng.random_array()?;
    let mut decommitment = Vec::with_capacity(NONCE_SIZE + value.len());
    decommitment.extend_from_slice(&nonce);
    decommitment.extend_from_slice(value);
    let commitment = Commitment(digest(tag, &decommitment));
    Ok((commitment, Decommitment(decommitment)))
}

/// Checks `decommitment` against `commitment` and `tag` and returns the committed value.
pub fn open(
    commitment: &Commitment,
    tag: &[u8],
    decommitment: &Decommitment,
) -> Result<Vec<u8>, CommitmentError> {
    if decommitment.0.len() < NONCE_SIZE {
        return Err(CommitmentError::DecommitmentTooShort(decommitment.0.len()));
    }
    let expected = digest(tag, &decommitment.0);
    if !bool::from(expected.ct_eq(&commitment.0)) {
        return Err(CommitmentError::Mismatch);
    }
    Ok(decommitment.0[NONCE_SIZE..].to_vec())
}

#[derive(Debug, Error)]
pub enum CommitmentError {
    #[error("decommitment does not open the commitment")]
    Mismatch,

    #[error("decommitment of {0} bytes is too short")]
    DecommitmentTooShort(usize),

    #[error(transparent)]
    Rng(#[from] RngError),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::Rng;

    use super::{CommitmentError, Decommitment, commit, open};

    #[test]
    fn open_with_decommitment() {
        let rng = Rng::from_seed([4; 32]);
        let (commitment, decommitment) = commit(&rng, b"identity", b"seed").unwrap();
        assert_eq!(open(&commitment, b"identity", &decommitment).unwrap(), b"seed");
    }

    #[test]
    fn commitment_is_hiding() {
        let rng = Rng::from_seed([4; 32]);
        let (commitment_1, _) = commit(&rng, b"identity", b"seed").unwrap();
        let (commitment_2, _) = commit(&rng, b"identity", b"seed").unwrap();
        assert_ne!(commitment_1, commitment_2);
    }

    #[test]
    fn commitment_is_binding() {
        let rng = Rng::from_seed([4; 32]);
        let (commitment, decommitment) = commit(&rng, b"identity", b"seed").unwrap();

        // Any modified decommitment fails to open.
        let mut tampered = decommitment.as_bytes().to_vec();
        *tampered.last_mut().unwrap() ^= 1;
        assert_matches!(
            open(&commitment, b"identity", &Decommitment::from_bytes(tampered)),
            Err(CommitmentError::Mismatch)
        );

        // Decommitments of other commitments fail as well.
        let (_, other_decommitment) = commit(&rng, b"identity", b"seed").unwrap();
        assert_matches!(
            open(&commitment, b"identity", &other_decommitment),
            Err(CommitmentError::Mismatch)
        );

        // Tag is part of the commitment.
        assert_matches!(
            open(&commitment, b"another identity", &decommitment),
            Err(CommitmentError::Mismatch)
        );

        assert_matches!(
            open(&commitment, b"identity", &Decommitment::from_bytes(vec![0; 8])),
            Err(CommitmentError::DecommitmentTooShort(8))
        );
    }
}
