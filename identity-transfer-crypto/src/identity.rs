// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public identities of devices and owned identities.
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hpke::{self, HpkeError};
use crate::rng::{Rng, RngError};
use crate::x25519::{PUBLIC_KEY_SIZE, PublicKey, SecretKey};

const IDENTITY_VERSION: u8 = 0x01;

/// Public part of an identity: whatever is needed to encrypt a payload to its holder.
///
/// The owned identity being transferred and the target device's ephemeral identity are both
/// represented by this type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CryptoIdentity {
    encryption_key: PublicKey,
}

impl CryptoIdentity {
    pub fn from_public_key(encryption_key: PublicKey) -> Self {
        Self { encryption_key }
    }

    pub fn encryption_key(&self) -> &PublicKey {
        &self.encryption_key
    }

    /// Canonical byte representation, used as commitment tag and as SAS input.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + PUBLIC_KEY_SIZE);
        bytes.push(IDENTITY_VERSION);
        bytes.extend_from_slice(self.encryption_key.as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        match bytes.split_first() {
            Some((&IDENTITY_VERSION, key)) => {
                let key: [u8; PUBLIC_KEY_SIZE] = key
                    .try_into()
                    .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
                Ok(Self::from_public_key(PublicKey::from_bytes(key)))
            }
            Some((version, _)) => Err(IdentityError::UnknownVersion(*version)),
            None => Err(IdentityError::InvalidLength(0)),
        }
    }

    /// Encrypts a payload which only the holder of this identity can read.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, HpkeError> {
        hpke::seal(&self.encryption_key, plaintext)
    }
}

impl fmt::Display for CryptoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// Identity together with its secret key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    secret_key: SecretKey,
    identity: CryptoIdentity,
}

impl IdentityKeyPair {
    pub fn generate(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self::from_secret_key(SecretKey::from_bytes(
            rng.random_array()?,
        )))
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let identity = CryptoIdentity::from_public_key(secret_key.public_key());
        Self {
            secret_key,
            identity,
        }
    }

    pub fn identity(&self) -> &CryptoIdentity {
        &self.identity
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Decrypts a payload sealed to this identity.
    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, HpkeError> {
        hpke::open(&self.secret_key, envelope)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unknown identity encoding version {0}")]
    UnknownVersion(u8),

    #[error("invalid identity length {0}")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::Rng;

    use super::{CryptoIdentity, IdentityError, IdentityKeyPair};

    #[test]
    fn bytes_representation() {
        let rng = Rng::from_seed([2; 32]);
        let key_pair = IdentityKeyPair::generate(&rng).unwrap();

        let bytes = key_pair.identity().to_bytes();
        assert_eq!(bytes.len(), 33);
        assert_eq!(
            CryptoIdentity::from_bytes(&bytes).unwrap(),
            *key_pair.identity()
        );

        assert_matches!(
            CryptoIdentity::from_bytes(&bytes[..20]),
            Err(IdentityError::InvalidLength(20))
        );
        assert_matches!(
            CryptoIdentity::from_bytes(&[0x07, 1, 2]),
            Err(IdentityError::UnknownVersion(0x07))
        );
    }

    #[test]
    fn seal_to_identity() {
        let rng = Rng::from_seed([2; 32]);
        let key_pair = IdentityKeyPair::generate(&rng).unwrap();
        let stranger = IdentityKeyPair::generate(&rng).unwrap();

        let envelope = key_pair.identity().seal(b"device name").unwrap();
        assert_eq!(key_pair.open(&envelope).unwrap(), b"device name");
        assert!(stranger.open(&envelope).is_err());
    }
}
