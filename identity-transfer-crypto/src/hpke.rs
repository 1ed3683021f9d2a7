// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hybrid Public Key Encryption (HPKE) with DHKEM-X25519, HKDF SHA256 and ChaCha20Poly1305 AEAD
//! parameters.
//!
//! Every payload relayed between the two devices is sealed to the receiver with the
//! [`TRANSFER_INFO`] label, so ciphertexts can not be replayed into another protocol using the
//! same keys.
//!
//! <https://www.rfc-editor.org/rfc/rfc9180>
use hpke_rs::{Hpke, HpkePrivateKey, HpkePublicKey, Mode};
use hpke_rs_crypto::types::{AeadAlgorithm, KdfAlgorithm, KemAlgorithm};
use hpke_rs_rust_crypto::HpkeRustCrypto;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use crate::x25519::{PublicKey, SecretKey};

/// Context label every transfer payload is bound to.
pub const TRANSFER_INFO: &[u8] = b"owned-identity-transfer";

fn hpke() -> Hpke<HpkeRustCrypto> {
    Hpke::<HpkeRustCrypto>::new(
        Mode::Base,
        KemAlgorithm::DhKem25519,
        KdfAlgorithm::HkdfSha256,
        AeadAlgorithm::ChaCha20Poly1305,
    )
}

/// Encapsulated key and encrypted payload, as sent over the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpkeCiphertext {
    #[serde(with = "serde_bytes")]
    pub kem_output: Vec<u8>,

    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl HpkeCiphertext {
    pub fn to_bytes(&self) -> Result<Vec<u8>, HpkeError> {
        Ok(encode_cbor(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HpkeError> {
        Ok(decode_cbor(bytes)?)
    }
}

pub fn hpke_seal(
    public_key: &PublicKey,
    info: &[u8],
    plaintext: &[u8],
) -> Result<HpkeCiphertext, HpkeError> {
    // `hpke-rs` draws its own randomness for the encapsulation.
    let mut hpke = hpke();
    let pk_r = HpkePublicKey::new(public_key.as_bytes().to_vec());
    let (kem_output, ciphertext) = hpke
        .seal(&pk_r, info, &[], plaintext, None, None, None)
        .map_err(HpkeError::Encryption)?;
    Ok(HpkeCiphertext {
        kem_output,
        ciphertext,
    })
}

pub fn hpke_open(
    input: &HpkeCiphertext,
    secret_key: &SecretKey,
    info: &[u8],
) -> Result<Vec<u8>, HpkeError> {
    let sk_r = HpkePrivateKey::new(secret_key.as_bytes().to_vec());
    hpke()
        .open(
            &input.kem_output,
            &sk_r,
            info,
            &[],
            &input.ciphertext,
            None,
            None,
            None,
        )
        .map_err(HpkeError::Decryption)
}

/// Seals `plaintext` to `public_key` and returns the encoded envelope.
pub fn seal(public_key: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, HpkeError> {
    hpke_seal(public_key, TRANSFER_INFO, plaintext)?.to_bytes()
}

/// Decodes an envelope produced by [`seal`] and decrypts it with `secret_key`.
pub fn open(secret_key: &SecretKey, envelope: &[u8]) -> Result<Vec<u8>, HpkeError> {
    let ciphertext = HpkeCiphertext::from_bytes(envelope)?;
    hpke_open(&ciphertext, secret_key, TRANSFER_INFO)
}

#[derive(Debug, Error)]
pub enum HpkeError {
    #[error("could not encrypt with hpke: {0:?}")]
    Encryption(hpke_rs::HpkeError),

    #[error("could not decrypt with hpke: {0:?}")]
    Decryption(hpke_rs::HpkeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
