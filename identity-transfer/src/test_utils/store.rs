// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use identity_transfer_crypto::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use identity_transfer_crypto::hpke::HpkeError;
use identity_transfer_crypto::{CryptoIdentity, IdentityKeyPair, Rng, RngError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::traits::{IdentityStore, SyncSnapshotDelegate};
use crate::types::{
    DeviceUid, GroupSummary, KeycloakConfiguration, KeycloakTransferProof,
    KeycloakTransferProofElements, MissingPhoto, OwnedDevice, SnapshotNode, SyncSnapshot,
};

/// Operation of [`MemoryIdentityStore`] which can be made to fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum StoreFailure {
    Restore,
    SaveAuthState,
    MissingPhotos,
    Groups,
    Contacts,
    ActiveOwnedIdentities,
    SyncSnapshot,
    ApplyAppNode,
    KeepDeviceActive,
    Commit,
}

/// Keycloak server an owned identity is bound to, with the key it signs transfer proofs with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct KeycloakBinding {
    configuration: KeycloakConfiguration,
    verifying_key: [u8; 32],
}

/// Identity part of a sync snapshot as produced by [`MemoryIdentityStore`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityNode {
    key_pair: IdentityKeyPair,
    contacts: Vec<CryptoIdentity>,
    groups: Vec<GroupSummary>,
    missing_photos: Vec<MissingPhoto>,
    keycloak: Option<KeycloakBinding>,
}

impl IdentityNode {
    pub fn identity(&self) -> CryptoIdentity {
        *self.key_pair.identity()
    }

    pub fn to_snapshot_node(&self) -> Result<SnapshotNode, EncodeError> {
        Ok(SnapshotNode::new(encode_cbor(self)?))
    }

    pub fn from_snapshot_node(node: &SnapshotNode) -> Result<Self, DecodeError> {
        decode_cbor(node.as_bytes())
    }
}

#[derive(Clone, Debug)]
struct OwnedIdentity {
    node: IdentityNode,
    device_name: Option<String>,
    auth_state: Option<Vec<u8>>,
    app_data: Vec<u8>,
    kept_active: Vec<DeviceUid>,
}

impl OwnedIdentity {
    fn new(node: IdentityNode) -> Self {
        Self {
            node,
            device_name: None,
            auth_state: None,
            app_data: Vec::new(),
            kept_active: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    owned: HashMap<CryptoIdentity, OwnedIdentity>,

    /// Committed value of every identity written since the last commit.
    uncommitted: HashMap<CryptoIdentity, Option<OwnedIdentity>>,

    failures: HashSet<StoreFailure>,
}

impl StoreInner {
    fn touch(&mut self, identity: &CryptoIdentity) {
        if !self.uncommitted.contains_key(identity) {
            let committed = self.owned.get(identity).cloned();
            self.uncommitted.insert(*identity, committed);
        }
    }
}

/// Identity store and sync snapshot delegate of one device.
#[derive(Debug)]
pub struct MemoryIdentityStore {
    device_uid: DeviceUid,
    inner: Mutex<StoreInner>,
}

impl MemoryIdentityStore {
    pub fn new(device_uid: DeviceUid) -> Self {
        Self {
            device_uid,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn device_uid(&self) -> DeviceUid {
        self.device_uid
    }

    /// Makes every later call of the operation fail.
    pub fn fail_on(&self, failure: StoreFailure) {
        self.inner.lock().unwrap().failures.insert(failure);
    }

    pub fn create_owned_identity(&self, rng: &Rng) -> Result<CryptoIdentity, MemoryStoreError> {
        let key_pair = IdentityKeyPair::generate(rng)?;
        let identity = *key_pair.identity();
        self.lock()?.owned.insert(
            identity,
            OwnedIdentity::new(IdentityNode {
                key_pair,
                contacts: Vec::new(),
                groups: Vec::new(),
                missing_photos: Vec::new(),
                keycloak: None,
            }),
        );
        Ok(identity)
    }

    pub fn add_contact(
        &self,
        owned_identity: &CryptoIdentity,
        rng: &Rng,
    ) -> Result<CryptoIdentity, MemoryStoreError> {
        let contact = *IdentityKeyPair::generate(rng)?.identity();
        self.with_owned(owned_identity, |owned| owned.node.contacts.push(contact))?;
        Ok(contact)
    }

    pub fn add_group(
        &self,
        owned_identity: &CryptoIdentity,
        group: GroupSummary,
    ) -> Result<(), MemoryStoreError> {
        self.with_owned(owned_identity, |owned| owned.node.groups.push(group))
    }

    pub fn add_missing_photo(
        &self,
        owned_identity: &CryptoIdentity,
        photo: MissingPhoto,
    ) -> Result<(), MemoryStoreError> {
        self.with_owned(owned_identity, |owned| owned.node.missing_photos.push(photo))
    }

    /// Binds the owned identity to a Keycloak server signing with `verifying_key`.
    pub fn set_keycloak(
        &self,
        owned_identity: &CryptoIdentity,
        configuration: KeycloakConfiguration,
        verifying_key: VerifyingKey,
    ) -> Result<(), MemoryStoreError> {
        self.with_owned(owned_identity, |owned| {
            owned.node.keycloak = Some(KeycloakBinding {
                configuration,
                verifying_key: verifying_key.to_bytes(),
            })
        })
    }

    pub fn set_app_data(
        &self,
        owned_identity: &CryptoIdentity,
        app_data: Vec<u8>,
    ) -> Result<(), MemoryStoreError> {
        self.with_owned(owned_identity, |owned| owned.app_data = app_data)
    }

    pub fn identity_node(
        &self,
        owned_identity: &CryptoIdentity,
    ) -> Result<IdentityNode, MemoryStoreError> {
        self.with_owned(owned_identity, |owned| owned.node.clone())
    }

    /// Adds an owned identity as if it had been transferred before.
    pub fn import_identity_node(&self, node: IdentityNode) -> Result<(), MemoryStoreError> {
        self.lock()?
            .owned
            .insert(node.identity(), OwnedIdentity::new(node));
        Ok(())
    }

    /// True when no transfer step left writes behind which were neither committed nor rolled back.
    pub fn is_settled(&self) -> bool {
        self.inner.lock().unwrap().uncommitted.is_empty()
    }

    pub fn owns(&self, identity: &CryptoIdentity) -> bool {
        self.inner.lock().unwrap().owned.contains_key(identity)
    }

    pub fn device_name(&self, identity: &CryptoIdentity) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.owned.get(identity)?.device_name.clone()
    }

    pub fn auth_state(&self, identity: &CryptoIdentity) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.owned.get(identity)?.auth_state.clone()
    }

    pub fn app_data(&self, identity: &CryptoIdentity) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.owned.get(identity).map(|owned| owned.app_data.clone())
    }

    /// Devices the server was asked to keep active for the identity.
    pub fn kept_active(&self, identity: &CryptoIdentity) -> Vec<DeviceUid> {
        let inner = self.inner.lock().unwrap();
        inner
            .owned
            .get(identity)
            .map(|owned| owned.kept_active.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>, MemoryStoreError> {
        self.inner.lock().map_err(|_| MemoryStoreError::LockPoisoned)
    }

    fn check(&self, failure: StoreFailure) -> Result<(), MemoryStoreError> {
        if self.lock()?.failures.contains(&failure) {
            return Err(MemoryStoreError::Injected(failure));
        }
        Ok(())
    }

    fn with_owned<T>(
        &self,
        identity: &CryptoIdentity,
        f: impl FnOnce(&mut OwnedIdentity) -> T,
    ) -> Result<T, MemoryStoreError> {
        let mut inner = self.lock()?;
        let owned = inner
            .owned
            .get_mut(identity)
            .ok_or(MemoryStoreError::UnknownIdentity(*identity))?;
        Ok(f(owned))
    }
}

impl IdentityStore for MemoryIdentityStore {
    type Error = MemoryStoreError;

    fn is_owned(&self, identity: &CryptoIdentity) -> Result<bool, Self::Error> {
        Ok(self.lock()?.owned.contains_key(identity))
    }

    fn decrypt_for_owned_identity(
        &self,
        owned_identity: &CryptoIdentity,
        envelope: &[u8],
    ) -> Result<Vec<u8>, Self::Error> {
        let key_pair = self.with_owned(owned_identity, |owned| owned.node.key_pair.clone())?;
        Ok(key_pair.open(envelope)?)
    }

    fn keycloak_configuration(
        &self,
        owned_identity: &CryptoIdentity,
    ) -> Result<Option<KeycloakConfiguration>, Self::Error> {
        self.with_owned(owned_identity, |owned| {
            owned
                .node
                .keycloak
                .as_ref()
                .map(|binding| binding.configuration.clone())
        })
    }

    fn verify_keycloak_signature(
        &self,
        owned_identity: &CryptoIdentity,
        elements: &KeycloakTransferProofElements,
        proof: &KeycloakTransferProof,
    ) -> Result<bool, Self::Error> {
        let Some(binding) =
            self.with_owned(owned_identity, |owned| owned.node.keycloak.clone())?
        else {
            return Ok(false);
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&binding.verifying_key) else {
            return Ok(false);
        };
        let Ok(signature) = hex::decode(&proof.signature) else {
            return Ok(false);
        };
        let Ok(signature) = Signature::from_slice(&signature) else {
            return Ok(false);
        };
        let message = elements.to_bytes()?;
        Ok(verifying_key.verify(&message, &signature).is_ok())
    }

    fn restore_snapshot_node(
        &self,
        owned_identity: &CryptoIdentity,
        node: &SnapshotNode,
        device_name: &str,
    ) -> Result<(), Self::Error> {
        self.check(StoreFailure::Restore)?;
        let node = IdentityNode::from_snapshot_node(node)?;
        if node.identity() != *owned_identity {
            return Err(MemoryStoreError::IdentityMismatch);
        }
        let mut owned = OwnedIdentity::new(node);
        owned.device_name = Some(device_name.to_string());
        let mut inner = self.lock()?;
        inner.touch(owned_identity);
        inner.owned.insert(*owned_identity, owned);
        Ok(())
    }

    fn save_keycloak_auth_state(
        &self,
        owned_identity: &CryptoIdentity,
        raw_auth_state: &[u8],
    ) -> Result<(), Self::Error> {
        self.check(StoreFailure::SaveAuthState)?;
        let mut inner = self.lock()?;
        inner.touch(owned_identity);
        let owned = inner
            .owned
            .get_mut(owned_identity)
            .ok_or(MemoryStoreError::UnknownIdentity(*owned_identity))?;
        owned.auth_state = Some(raw_auth_state.to_vec());
        Ok(())
    }

    fn missing_photos(
        &self,
        owned_identity: &CryptoIdentity,
    ) -> Result<Vec<MissingPhoto>, Self::Error> {
        self.check(StoreFailure::MissingPhotos)?;
        self.with_owned(owned_identity, |owned| owned.node.missing_photos.clone())
    }

    fn groups(&self, owned_identity: &CryptoIdentity) -> Result<Vec<GroupSummary>, Self::Error> {
        self.check(StoreFailure::Groups)?;
        self.with_owned(owned_identity, |owned| owned.node.groups.clone())
    }

    fn contacts(
        &self,
        owned_identity: &CryptoIdentity,
    ) -> Result<Vec<CryptoIdentity>, Self::Error> {
        self.check(StoreFailure::Contacts)?;
        self.with_owned(owned_identity, |owned| owned.node.contacts.clone())
    }

    fn active_owned_identities(&self) -> Result<Vec<OwnedDevice>, Self::Error> {
        self.check(StoreFailure::ActiveOwnedIdentities)?;
        Ok(self
            .lock()?
            .owned
            .keys()
            .map(|identity| OwnedDevice {
                identity: *identity,
                current_device_uid: self.device_uid,
            })
            .collect())
    }

    fn commit(&self) -> Result<(), Self::Error> {
        self.check(StoreFailure::Commit)?;
        self.lock()?.uncommitted.clear();
        Ok(())
    }

    fn rollback(&self) -> Result<(), Self::Error> {
        let mut inner = self.lock()?;
        let uncommitted = std::mem::take(&mut inner.uncommitted);
        for (identity, committed) in uncommitted {
            match committed {
                Some(owned) => inner.owned.insert(identity, owned),
                None => inner.owned.remove(&identity),
            };
        }
        Ok(())
    }
}

#[async_trait]
impl SyncSnapshotDelegate for MemoryIdentityStore {
    type Error = MemoryStoreError;

    fn sync_snapshot(&self, owned_identity: &CryptoIdentity) -> Result<SyncSnapshot, Self::Error> {
        self.check(StoreFailure::SyncSnapshot)?;
        let (node, app_data) = self.with_owned(owned_identity, |owned| {
            (owned.node.clone(), owned.app_data.clone())
        })?;
        Ok(SyncSnapshot {
            identity_node: node.to_snapshot_node()?,
            app_node: SnapshotNode::new(app_data),
        })
    }

    async fn apply_app_node(
        &self,
        owned_identity: &CryptoIdentity,
        node: SnapshotNode,
    ) -> Result<(), Self::Error> {
        self.check(StoreFailure::ApplyAppNode)?;
        self.with_owned(owned_identity, |owned| {
            owned.app_data = node.as_bytes().to_vec()
        })
    }

    async fn request_keep_device_active(
        &self,
        owned_identity: &CryptoIdentity,
        device_uid: DeviceUid,
    ) -> Result<(), Self::Error> {
        self.check(StoreFailure::KeepDeviceActive)?;
        self.with_owned(owned_identity, |owned| owned.kept_active.push(device_uid))
    }
}

#[derive(Debug, Error)]
pub enum MemoryStoreError {
    #[error("{0:?} failed on purpose")]
    Injected(StoreFailure),

    #[error("identity {0} is not owned")]
    UnknownIdentity(CryptoIdentity),

    #[error("snapshot belongs to another identity")]
    IdentityMismatch,

    #[error(transparent)]
    Hpke(#[from] HpkeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("identity store lock poisoned")]
    LockPoisoned,
}

/// Key of a Keycloak server, used to sign transfer proofs in tests.
pub fn keycloak_signing_key(rng: &Rng) -> SigningKey {
    SigningKey::from_bytes(&rng.random_array().unwrap())
}

/// Signs the elements the way the Keycloak server does after the user authenticated.
pub fn sign_transfer_proof(
    signing_key: &SigningKey,
    elements: &KeycloakTransferProofElements,
) -> KeycloakTransferProof {
    let signature = signing_key.sign(&elements.to_bytes().unwrap());
    KeycloakTransferProof {
        signature: hex::encode(signature.to_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use identity_transfer_crypto::Rng;

    use crate::traits::IdentityStore;
    use crate::types::{
        DeviceUid, FullSas, KeycloakConfiguration, KeycloakTransferProofElements, SessionNumber,
    };

    use super::{MemoryIdentityStore, keycloak_signing_key, sign_transfer_proof};

    #[test]
    fn restore_is_undone_by_rollback() {
        let rng = Rng::from_seed([2; 32]);
        let source = MemoryIdentityStore::new(DeviceUid::from_bytes([1; 32]));
        let owned_identity = source.create_owned_identity(&rng).unwrap();
        let node = source
            .identity_node(&owned_identity)
            .unwrap()
            .to_snapshot_node()
            .unwrap();

        let target = MemoryIdentityStore::new(DeviceUid::from_bytes([2; 32]));
        target
            .restore_snapshot_node(&owned_identity, &node, "Tablet")
            .unwrap();
        target
            .save_keycloak_auth_state(&owned_identity, b"auth")
            .unwrap();
        assert!(target.owns(&owned_identity));
        assert!(!target.is_settled());

        target.rollback().unwrap();
        assert!(!target.owns(&owned_identity));
        assert!(target.is_settled());

        target
            .restore_snapshot_node(&owned_identity, &node, "Tablet")
            .unwrap();
        target.commit().unwrap();
        assert!(target.is_settled());

        // A rollback only reverts what came after the last commit.
        target
            .save_keycloak_auth_state(&owned_identity, b"auth")
            .unwrap();
        target.rollback().unwrap();
        assert!(target.owns(&owned_identity));
        assert_eq!(target.device_name(&owned_identity).as_deref(), Some("Tablet"));
        assert_eq!(target.auth_state(&owned_identity), None);
    }

    #[test]
    fn verifies_keycloak_proofs() {
        let rng = Rng::from_seed([1; 32]);
        let store = MemoryIdentityStore::new(DeviceUid::from_bytes([1; 32]));
        let owned_identity = store.create_owned_identity(&rng).unwrap();
        let signing_key = keycloak_signing_key(&rng);
        let elements = KeycloakTransferProofElements {
            session_number: SessionNumber::new("12345678").unwrap(),
            sas: FullSas::new("87654321").unwrap(),
        };
        let proof = sign_transfer_proof(&signing_key, &elements);

        // Without a Keycloak binding no proof is valid.
        assert!(
            !store
                .verify_keycloak_signature(&owned_identity, &elements, &proof)
                .unwrap()
        );

        store
            .set_keycloak(
                &owned_identity,
                KeycloakConfiguration {
                    server_url: "https://keycloak.example.org/realms/staff".into(),
                    client_id: "messenger".into(),
                    client_secret: None,
                    jwks: None,
                },
                signing_key.verifying_key(),
            )
            .unwrap();
        assert!(
            store
                .verify_keycloak_signature(&owned_identity, &elements, &proof)
                .unwrap()
        );

        let other_key = keycloak_signing_key(&rng);
        let forged = sign_transfer_proof(&other_key, &elements);
        assert!(
            !store
                .verify_keycloak_signature(&owned_identity, &elements, &forged)
                .unwrap()
        );
    }
}
