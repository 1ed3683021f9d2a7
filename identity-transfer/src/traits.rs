// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capabilities the host application provides to the transfer protocol.
//!
//! Synchronous methods are called from inside a protocol step and become part of its atomic
//! unit of work: writes of the [`IdentityStore`] are committed together with the protocol state
//! or rolled back. Asynchronous methods are only called after a step committed.
use std::error::Error;

use async_trait::async_trait;
use identity_transfer_crypto::CryptoIdentity;

use crate::types::{
    DeviceUid, GroupId, GroupSummary, KeycloakConfiguration, KeycloakTransferProof,
    KeycloakTransferProofElements, MissingPhoto, OwnedDevice, PhotoDetails, SnapshotNode,
    SyncSnapshot,
};

/// Access to owned identities, contacts and groups.
pub trait IdentityStore {
    type Error: Error + Send + Sync + 'static;

    fn is_owned(&self, identity: &CryptoIdentity) -> Result<bool, Self::Error>;

    /// Decrypts a payload sealed to an owned identity with its secret key.
    fn decrypt_for_owned_identity(
        &self,
        owned_identity: &CryptoIdentity,
        envelope: &[u8],
    ) -> Result<Vec<u8>, Self::Error>;

    /// Keycloak server the owned identity is bound to, if any.
    fn keycloak_configuration(
        &self,
        owned_identity: &CryptoIdentity,
    ) -> Result<Option<KeycloakConfiguration>, Self::Error>;

    /// Checks a proof the Keycloak server issued for the given elements.
    fn verify_keycloak_signature(
        &self,
        owned_identity: &CryptoIdentity,
        elements: &KeycloakTransferProofElements,
        proof: &KeycloakTransferProof,
    ) -> Result<bool, Self::Error>;

    /// Restores an owned identity with its contacts and groups from a snapshot and registers
    /// this device under `device_name`.
    fn restore_snapshot_node(
        &self,
        owned_identity: &CryptoIdentity,
        node: &SnapshotNode,
        device_name: &str,
    ) -> Result<(), Self::Error>;

    fn save_keycloak_auth_state(
        &self,
        owned_identity: &CryptoIdentity,
        raw_auth_state: &[u8],
    ) -> Result<(), Self::Error>;

    fn missing_photos(&self, owned_identity: &CryptoIdentity)
    -> Result<Vec<MissingPhoto>, Self::Error>;

    fn groups(&self, owned_identity: &CryptoIdentity) -> Result<Vec<GroupSummary>, Self::Error>;

    fn contacts(&self, owned_identity: &CryptoIdentity)
    -> Result<Vec<CryptoIdentity>, Self::Error>;

    fn active_owned_identities(&self) -> Result<Vec<OwnedDevice>, Self::Error>;

    /// Makes the writes of the current step permanent.
    ///
    /// Called after every step, once its new protocol state was persisted. Until then the writes
    /// have to stay revertible with [`IdentityStore::rollback`].
    fn commit(&self) -> Result<(), Self::Error>;

    /// Discards all writes since the last commit, called when a step failed or its protocol state
    /// could not be persisted.
    fn rollback(&self) -> Result<(), Self::Error>;
}

/// Protocol run by the engine after a restore to catch up with the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChildProtocol {
    DownloadIdentityPhoto {
        owned_identity: CryptoIdentity,
        identity: CryptoIdentity,
        details: PhotoDetails,
    },
    DownloadGroupPhoto {
        owned_identity: CryptoIdentity,
        group_id: GroupId,
        details: PhotoDetails,
    },
    GroupReDownload {
        owned_identity: CryptoIdentity,
        group_id: GroupId,
    },
    OwnedDeviceDiscovery {
        owned_identity: CryptoIdentity,
    },
    ContactDeviceDiscovery {
        owned_identity: CryptoIdentity,
        contact: CryptoIdentity,
    },
}

impl ChildProtocol {
    pub fn kind(&self) -> &'static str {
        match self {
            ChildProtocol::DownloadIdentityPhoto { .. } => "download identity photo",
            ChildProtocol::DownloadGroupPhoto { .. } => "download group photo",
            ChildProtocol::GroupReDownload { .. } => "group re-download",
            ChildProtocol::OwnedDeviceDiscovery { .. } => "owned device discovery",
            ChildProtocol::ContactDeviceDiscovery { .. } => "contact device discovery",
        }
    }
}

/// Initial message of a child protocol, ready to be posted on the internal channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildProtocolMessage {
    pub protocol: ChildProtocol,
    pub body: Vec<u8>,
}

/// Starts other protocols of the engine.
pub trait ProtocolStarter {
    type Error: Error + Send + Sync + 'static;

    /// Prepares the initial message, called inside the step.
    fn initial_message(&self, protocol: ChildProtocol)
    -> Result<ChildProtocolMessage, Self::Error>;

    /// Posts a prepared message, called once the step committed.
    fn post(&self, message: ChildProtocolMessage) -> Result<(), Self::Error>;
}

/// Network layer of the engine.
#[async_trait]
pub trait NetworkFetch: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    /// Tells the network layer which owned identities are now active on this device.
    async fn update_owned_identities(&self, identities: Vec<OwnedDevice>)
    -> Result<(), Self::Error>;
}

/// Produces and consumes sync snapshots.
#[async_trait]
pub trait SyncSnapshotDelegate: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    /// Snapshot of everything belonging to an owned identity, taken on the source device.
    fn sync_snapshot(&self, owned_identity: &CryptoIdentity) -> Result<SyncSnapshot, Self::Error>;

    /// Hands the application part of a snapshot to the application layer.
    async fn apply_app_node(
        &self,
        owned_identity: &CryptoIdentity,
        node: SnapshotNode,
    ) -> Result<(), Self::Error>;

    /// Asks the server to keep the given device of the owned identity active, usually the
    /// source device when the account allows only a limited number of devices.
    async fn request_keep_device_active(
        &self,
        owned_identity: &CryptoIdentity,
        device_uid: DeviceUid,
    ) -> Result<(), Self::Error>;
}
