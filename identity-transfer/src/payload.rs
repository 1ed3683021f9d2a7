// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cleartexts of the payloads relayed between source and target device.
//!
//! Except for the target's ephemeral identity every payload is sealed to the receiver before it
//! is handed to the relay. Structured payloads are encoded as CBOR. The response the target waits
//! for after displaying the SAS can be one of two things, so it carries a leading tag byte:
//!
//! | Tag    | Body                                  |
//! |--------|---------------------------------------|
//! | `0x00` | CBOR encoded [`SnapshotContainer`]    |
//! | `0x01` | CBOR encoded [`KeycloakConfiguration`] |
use identity_transfer_crypto::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use identity_transfer_crypto::identity::IdentityError;
use identity_transfer_crypto::{Commitment, CryptoIdentity, Decommitment, Seed};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    ConnectionId, DeviceUid, KeycloakConfiguration, KeycloakTransferProof, SyncSnapshot,
};

const SNAPSHOT_TAG: u8 = 0x00;

const KEYCLOAK_CONFIGURATION_TAG: u8 = 0x01;

/// CBOR encoding shared by all structured payloads.
pub trait Payload: Serialize + DeserializeOwned {
    fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(encode_cbor(self)?)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(decode_cbor(bytes)?)
    }
}

/// Ephemeral identity the target device announces to the source.
///
/// Sent in the clear, it is only a public key.
pub fn encode_ephemeral_identity(identity: &CryptoIdentity) -> Vec<u8> {
    identity.to_bytes()
}

pub fn decode_ephemeral_identity(bytes: &[u8]) -> Result<CryptoIdentity, PayloadError> {
    Ok(CryptoIdentity::from_bytes(bytes)?)
}

/// First encrypted message from source to target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferredIdentityPayload {
    pub source_connection_id: ConnectionId,
    pub transferred_identity: CryptoIdentity,
    pub commitment: Commitment,
}

impl Payload for TransferredIdentityPayload {}

/// Target's answer to the commitment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSeedPayload {
    pub device_name: String,
    pub seed: Seed,
}

impl Payload for TargetSeedPayload {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecommitmentPayload(pub Decommitment);

impl Payload for DecommitmentPayload {}

/// Snapshot of the transferred identity, optionally naming one of its devices which should stay
/// active after the transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotContainer {
    pub snapshot: SyncSnapshot,
    pub device_uid_to_keep_active: Option<DeviceUid>,
}

/// What the source device sends once the SAS was confirmed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotResponse {
    Snapshot(SnapshotContainer),

    /// The identity is bound to a Keycloak server and the user needs to authenticate on the
    /// target device first.
    KeycloakConfiguration(KeycloakConfiguration),
}

impl SnapshotResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        let (tag, body) = match self {
            SnapshotResponse::Snapshot(container) => (SNAPSHOT_TAG, encode_cbor(container)?),
            SnapshotResponse::KeycloakConfiguration(configuration) => {
                (KEYCLOAK_CONFIGURATION_TAG, encode_cbor(configuration)?)
            }
        };
        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(tag);
        bytes.extend(body);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PayloadError> {
        match bytes.split_first() {
            Some((&SNAPSHOT_TAG, body)) => Ok(Self::Snapshot(decode_cbor(body)?)),
            Some((&KEYCLOAK_CONFIGURATION_TAG, body)) => {
                Ok(Self::KeycloakConfiguration(decode_cbor(body)?))
            }
            Some((tag, _)) => Err(PayloadError::UnknownTag(*tag)),
            None => Err(PayloadError::Empty),
        }
    }
}

/// Keycloak proof relayed from target to source, the signature as plain UTF-8.
pub fn encode_keycloak_proof(proof: &KeycloakTransferProof) -> Vec<u8> {
    proof.signature.as_bytes().to_vec()
}

pub fn decode_keycloak_proof(bytes: &[u8]) -> Result<KeycloakTransferProof, PayloadError> {
    let signature = String::from_utf8(bytes.to_vec()).map_err(|_| PayloadError::InvalidUtf8)?;
    Ok(KeycloakTransferProof { signature })
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("payload is empty")]
    Empty,

    #[error("unknown payload tag {0:#04x}")]
    UnknownTag(u8),

    #[error("keycloak proof signature is not valid utf-8")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use identity_transfer_crypto::{IdentityKeyPair, Rng, Seed, commit};

    use crate::types::{
        ConnectionId, DeviceUid, KeycloakConfiguration, KeycloakTransferProof, SnapshotNode,
        SyncSnapshot,
    };

    use super::{
        Payload, PayloadError, SnapshotContainer, SnapshotResponse, TargetSeedPayload,
        TransferredIdentityPayload, decode_ephemeral_identity, decode_keycloak_proof,
        encode_ephemeral_identity, encode_keycloak_proof,
    };

    #[test]
    fn transferred_identity_payload() {
        let rng = Rng::from_seed([1; 32]);
        let identity = *IdentityKeyPair::generate(&rng).unwrap().identity();
        let (commitment, _) = commit(&rng, &identity.to_bytes(), b"seed").unwrap();

        let payload = TransferredIdentityPayload {
            source_connection_id: ConnectionId::new("source-connection"),
            transferred_identity: identity,
            commitment,
        };
        let bytes = payload.to_bytes().unwrap();
        assert_eq!(TransferredIdentityPayload::from_bytes(&bytes).unwrap(), payload);

        // Payloads of a different shape are rejected.
        assert!(TargetSeedPayload::from_bytes(&bytes).is_err());
    }

    #[test]
    fn ephemeral_identity_and_proof() {
        let rng = Rng::from_seed([2; 32]);
        let identity = *IdentityKeyPair::generate(&rng).unwrap().identity();
        let bytes = encode_ephemeral_identity(&identity);
        assert_eq!(decode_ephemeral_identity(&bytes).unwrap(), identity);

        let proof = KeycloakTransferProof {
            signature: "eyJhbGciOiJFZERTQSJ9.c2ln".into(),
        };
        assert_eq!(decode_keycloak_proof(&encode_keycloak_proof(&proof)).unwrap(), proof);
        assert_matches!(decode_keycloak_proof(&[0xc3, 0x28]), Err(PayloadError::InvalidUtf8));
    }

    #[test]
    fn target_seed_payload() {
        let rng = Rng::from_seed([3; 32]);
        let payload = TargetSeedPayload {
            device_name: "Office laptop".into(),
            seed: Seed::random(&rng).unwrap(),
        };
        let bytes = payload.to_bytes().unwrap();
        assert_eq!(TargetSeedPayload::from_bytes(&bytes).unwrap(), payload);
    }

    #[test]
    fn snapshot_response_is_tagged() {
        let snapshot = SnapshotResponse::Snapshot(SnapshotContainer {
            snapshot: SyncSnapshot {
                identity_node: SnapshotNode::new(vec![1, 2, 3]),
                app_node: SnapshotNode::new(vec![4, 5]),
            },
            device_uid_to_keep_active: Some(DeviceUid::from_bytes([9; 32])),
        });
        let bytes = snapshot.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(SnapshotResponse::from_bytes(&bytes).unwrap(), snapshot);

        let configuration = SnapshotResponse::KeycloakConfiguration(KeycloakConfiguration {
            server_url: "https://keycloak.example.org/realms/staff".into(),
            client_id: "messenger".into(),
            client_secret: None,
            jwks: Some("{\"keys\":[]}".into()),
        });
        let bytes = configuration.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(SnapshotResponse::from_bytes(&bytes).unwrap(), configuration);

        assert_matches!(SnapshotResponse::from_bytes(&[]), Err(PayloadError::Empty));
        assert_matches!(
            SnapshotResponse::from_bytes(&[0x02, 0xa0]),
            Err(PayloadError::UnknownTag(0x02))
        );
        // A keycloak configuration body does not decode as a snapshot.
        let mut mislabeled = bytes.clone();
        mislabeled[0] = 0x00;
        assert_matches!(
            SnapshotResponse::from_bytes(&mislabeled),
            Err(PayloadError::Decode(_))
        );
    }
}
