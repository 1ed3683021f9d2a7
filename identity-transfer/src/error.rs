// SPDX-License-Identifier: MIT OR Apache-2.0

use identity_transfer_crypto::hpke::HpkeError;
use identity_transfer_crypto::{CommitmentError, RngError, SasError};
use thiserror::Error;

use crate::payload::PayloadError;
use crate::relay::RelayFailure;
use crate::restoration::RestorationError;
use crate::types::TypeError;

/// Error type of delegate implementations once it crossed into the protocol.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) fn boxed<E>(err: E) -> BoxError
where
    E: std::error::Error + Send + Sync + 'static,
{
    Box::new(err)
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Relay(#[from] RelayFailure),

    #[error("could not decode payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("could not decrypt payload: {0}")]
    Decryption(BoxError),

    #[error("could not encrypt payload: {0}")]
    Encryption(HpkeError),

    #[error("entered sas does not match")]
    IncorrectSas,

    #[error("keycloak transfer proof is invalid")]
    InvalidKeycloakProof,

    #[error("connection id in payload does not match the relay connection")]
    ConnectionIdMismatch,

    #[error("identity is already owned on this device")]
    IdentityAlreadyOwned,

    #[error("transferred identity has no keycloak configuration")]
    MissingKeycloakConfiguration,

    #[error("could not open commitment: {0}")]
    Commitment(#[from] CommitmentError),

    #[error(transparent)]
    Sas(#[from] SasError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("identity store failed: {0}")]
    IdentityStore(BoxError),

    #[error("sync snapshot delegate failed: {0}")]
    SyncSnapshot(BoxError),

    #[error(transparent)]
    Restoration(#[from] RestorationError),

    #[error("could not persist protocol state: {0}")]
    StateStore(BoxError),
}

impl TransferError {
    /// Failures indicating an attack or a mistake of the user rather than a transient problem.
    ///
    /// They end the attempt for good, starting over requires a new protocol instance.
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            TransferError::IncorrectSas
                | TransferError::InvalidKeycloakProof
                | TransferError::ConnectionIdMismatch
                | TransferError::IdentityAlreadyOwned
                | TransferError::Commitment(CommitmentError::Mismatch)
        )
    }
}
