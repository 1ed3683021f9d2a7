// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic building blocks for moving an owned identity from one device to another.
//!
//! The transfer protocol never trusts the relay server it runs over. Both devices authenticate
//! each other with a short authentication string (SAS) which is derived from a commit-then-reveal
//! handshake:
//!
//! 1. The source device draws a random seed and sends a [`commitment`] to it, bound to the
//!    identity which is about to be transferred.
//! 2. The target device answers with its own seed, derived deterministically from the commitment
//!    and a secret MAC key so it can not be chosen after seeing the source's seed.
//! 3. The source reveals its seed by sending the decommitment, after which both devices compute
//!    the same [`sas`] and a human compares them.
//!
//! Every payload travelling through the relay is sealed with [`hpke`] to the receiver's
//! [`identity`] key.
pub mod cbor;
pub mod commitment;
pub mod hkdf;
pub mod hpke;
pub mod identity;
pub mod rng;
pub mod sas;
mod secret;
pub mod sha2;
pub mod x25519;

pub use commitment::{Commitment, CommitmentError, Decommitment, commit, open};
pub use identity::{CryptoIdentity, IdentityKeyPair};
pub use rng::{Rng, RngError};
pub use sas::{MacKey, SasError, Seed, compute_sas, derive_seed};
