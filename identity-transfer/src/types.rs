// SPDX-License-Identifier: MIT OR Apache-2.0

//! Values exchanged between the two devices, the relay and the host application.
use std::fmt;

use identity_transfer_crypto::cbor::{EncodeError, encode_cbor};
use identity_transfer_crypto::{CryptoIdentity, Rng, RngError};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Identifier of one protocol run, used to correlate relay responses and events.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolInstanceId(#[serde(with = "serde_bytes")] [u8; 32]);

impl ProtocolInstanceId {
    pub fn random(rng: &Rng) -> Result<Self, RngError> {
        Ok(Self(rng.random_array()?))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ProtocolInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ProtocolInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProtocolInstanceId")
            .field(&hex::encode(&self.0[..8]))
            .finish()
    }
}

/// Short numeric code issued by the relay which the user types into the target device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionNumber(String);

impl SessionNumber {
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(TypeError::InvalidSessionNumber(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle the relay assigned to one side's websocket connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full short authentication string, both halves concatenated.
///
/// The user reads the SAS off the target device and types it into the source device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSas(String);

impl FullSas {
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        if value.is_empty() || value.len() % 2 != 0 || !value.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(TypeError::InvalidSas(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Both halves for display, in the order they are shown to the user.
    pub fn halves(&self) -> (&str, &str) {
        self.0.split_at(self.0.len() / 2)
    }

    /// Compares user input against this SAS without leaking timing information about the
    /// matching prefix.
    ///
    /// Leading and trailing whitespace of the input is ignored, anything else has to match
    /// exactly.
    pub fn matches(&self, entered: &str) -> bool {
        let entered = entered.trim();
        entered.len() == self.0.len() && bool::from(entered.as_bytes().ct_eq(self.0.as_bytes()))
    }
}

impl fmt::Display for FullSas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one of the owned identity's devices.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceUid(#[serde(with = "serde_bytes")] [u8; 32]);

impl DeviceUid {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceUid({self})")
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(#[serde(with = "serde_bytes")] [u8; 32]);

impl GroupId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", hex::encode(self.0))
    }
}

/// Group of an owned identity as known to the identity store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: GroupId,

    /// Groups managed by a Keycloak server are synchronised by it and never re-downloaded from
    /// their members.
    pub keycloak_managed: bool,
}

/// Server-side details needed to fetch a profile picture.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoDetails {
    pub label: String,

    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
}

/// Profile picture referenced by restored data but not yet present on this device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingPhoto {
    /// Picture of the owned identity itself or of one of its contacts.
    Identity {
        identity: CryptoIdentity,
        details: PhotoDetails,
    },
    Group {
        group_id: GroupId,
        details: PhotoDetails,
    },
}

/// Owned identity active on this device, reported to the network layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedDevice {
    pub identity: CryptoIdentity,
    pub current_device_uid: DeviceUid,
}

/// Opaque node of a sync snapshot.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode(#[serde(with = "serde_bytes")] Vec<u8>);

impl SnapshotNode {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SnapshotNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotNode({} bytes)", self.0.len())
    }
}

/// Everything the target device needs to become a full device of the transferred identity.
///
/// The identity node carries keys, contacts and groups and is restored by the engine, the app
/// node carries application data and is handed to the application layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub identity_node: SnapshotNode,
    pub app_node: SnapshotNode,
}

/// Keycloak server the transferred identity is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeycloakConfiguration {
    pub server_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub jwks: Option<String>,
}

/// Values the Keycloak server signs to prove the user authenticated during this transfer.
///
/// Binding the signature to the session number and SAS keeps a proof from one transfer from
/// being replayed in another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeycloakTransferProofElements {
    pub session_number: SessionNumber,
    pub sas: FullSas,
}

impl KeycloakTransferProofElements {
    /// Canonical bytes covered by the signature.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        encode_cbor(self)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeycloakTransferProof {
    pub signature: String,
}

/// Proof together with the Keycloak session the user just opened on the target device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeycloakTransferProofAndAuthState {
    pub proof: KeycloakTransferProof,

    #[serde(with = "serde_bytes")]
    pub raw_auth_state: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("session number must be a non-empty string of digits, got \"{0}\"")]
    InvalidSessionNumber(String),

    #[error("sas must be an even number of digits, got \"{0}\"")]
    InvalidSas(String),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{FullSas, SessionNumber, TypeError};

    #[test]
    fn session_number_digits_only() {
        assert!(SessionNumber::new("123456789012").is_ok());
        assert_matches!(SessionNumber::new(""), Err(TypeError::InvalidSessionNumber(_)));
        assert_matches!(
            SessionNumber::new("1234-5678"),
            Err(TypeError::InvalidSessionNumber(_))
        );
    }

    #[test]
    fn sas_halves_and_matching() {
        let sas = FullSas::new("12345678").unwrap();
        assert_eq!(sas.halves(), ("1234", "5678"));
        assert!(sas.matches("12345678"));
        assert!(sas.matches(" 12345678\n"));
        // Only surrounding whitespace is ignored.
        assert!(!sas.matches("1234 5678"));
        assert!(!sas.matches("12345679"));
        assert!(!sas.matches("1234567"));
        assert!(!sas.matches(""));

        assert_matches!(FullSas::new("123"), Err(TypeError::InvalidSas(_)));
        assert_matches!(FullSas::new("12ab"), Err(TypeError::InvalidSas(_)));
    }
}
