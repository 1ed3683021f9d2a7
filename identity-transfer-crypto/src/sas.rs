// SPDX-License-Identifier: MIT OR Apache-2.0

//! Short authentication string (SAS) and the seeds it is computed from.
//!
//! The SAS mixes a seed from each device with the target device's ephemeral identity:
//!
//! ```text
//! k   = seed_a XOR SHA256(seed_b || identity_b)
//! okm = HKDF-SHA256(ikm = k, info = "sas")[..16]
//! sas = okm as big-endian integer mod 10^digits, zero-padded
//! ```
//!
//! The source device commits to `seed_a` before it learns `seed_b`, and the target derives
//! `seed_b` from that commitment with [`derive_seed`]. Neither side can steer the result towards
//! a SAS of its choosing.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commitment::Commitment;
use crate::hkdf::{HkdfError, hkdf};
use crate::identity::CryptoIdentity;
use crate::rng::{Rng, RngError};
use crate::secret::Secret;
use crate::sha2::sha2_256;

pub const SEED_SIZE: usize = 32;

pub const MAC_KEY_SIZE: usize = 32;

/// Largest supported number of SAS digits.
pub const MAX_SAS_DIGITS: usize = 19;

const SEED_INFO: &[u8] = b"owned-identity-transfer-seed";

const SAS_INFO: &[u8] = b"sas";

/// Random 256-bit value contributed by one device to the SAS.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed(Secret<SEED_SIZE>);

impl Seed {
    pub fn random(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(Secret::from_bytes(rng.random_array()?)))
    }

    pub fn from_bytes(bytes: [u8; SEED_SIZE]) -> Self {
        Self(Secret::from_bytes(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SasError> {
        let bytes: [u8; SEED_SIZE] = bytes
            .try_into()
            .map_err(|_| SasError::InvalidSeedLength(bytes.len()))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SEED_SIZE] {
        self.0.as_bytes()
    }
}

/// Secret key the target device uses to derive its seed. It never leaves the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacKey(Secret<MAC_KEY_SIZE>);

impl MacKey {
    pub fn random(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(Secret::from_bytes(rng.random_array()?)))
    }
}

/// Derives the target device's seed from the source's commitment.
///
/// The same commitment and key always give the same seed, a new transfer attempt with a fresh
/// commitment gives an unrelated one.
pub fn derive_seed(commitment: &Commitment, mac_key: &MacKey) -> Result<Seed, SasError> {
    let bytes = hkdf::<SEED_SIZE>(mac_key.0.as_bytes(), commitment.as_bytes(), SEED_INFO)?;
    Ok(Seed::from_bytes(bytes))
}

/// Computes a SAS of `digits` decimal digits.
pub fn compute_sas(
    seed_a: &Seed,
    seed_b: &Seed,
    identity_b: &CryptoIdentity,
    digits: usize,
) -> Result<String, SasError> {
    if digits == 0 || digits > MAX_SAS_DIGITS {
        return Err(SasError::InvalidDigits(digits));
    }

    let mask = sha2_256(&[seed_b.as_bytes(), &identity_b.to_bytes()]);
    let mut mixed = [0u8; SEED_SIZE];
    for (out, (a, b)) in mixed.iter_mut().zip(seed_a.as_bytes().iter().zip(mask.iter())) {
        *out = a ^ b;
    }

    let okm = hkdf::<16>(&[], &mixed, SAS_INFO)?;
    let modulus = 10u128.pow(digits as u32);
    let value = u128::from_be_bytes(okm) % modulus;
    Ok(format!("{value:0digits$}"))
}

#[derive(Debug, Error)]
pub enum SasError {
    #[error("sas can not have {0} digits")]
    InvalidDigits(usize),

    #[error("seed must be 32 bytes, got {0}")]
    InvalidSeedLength(usize),

    #[error(transparent)]
    Hkdf(#[from] HkdfError),
}
