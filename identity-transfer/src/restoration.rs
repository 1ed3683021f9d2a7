// SPDX-License-Identifier: MIT OR Apache-2.0

//! Restores a received snapshot on the target device.
//!
//! Only restoring the identity itself is essential. Everything after that helps the new device
//! catch up (photos, groups, devices of the identity and its contacts) and is done on a
//! best-effort basis: failures are collected and reported, they never undo the restore.
use identity_transfer_crypto::CryptoIdentity;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::{FollowUp, StepContext};
use crate::error::{BoxError, boxed};
use crate::traits::{ChildProtocol, IdentityStore, ProtocolStarter};
use crate::types::{MissingPhoto, SnapshotNode};

/// What to restore.
#[derive(Clone, Copy, Debug)]
pub struct RestorationRequest<'a> {
    pub transferred_identity: &'a CryptoIdentity,
    pub identity_node: &'a SnapshotNode,
    pub device_name: &'a str,
    pub raw_auth_state: Option<&'a [u8]>,
}

#[derive(Debug)]
pub enum RestorationOutcome {
    Success,

    /// The identity could not be restored, nothing else was attempted.
    DefinitiveError(RestorationError),

    /// The identity was restored but some of the follow-up work failed.
    NonDefinitiveErrors(Vec<RestorationError>),
}

pub struct RestorationHelper<'a, I, P> {
    identity_store: &'a I,
    protocol_starter: &'a P,
}

impl<'a, I, P> RestorationHelper<'a, I, P>
where
    I: IdentityStore,
    P: ProtocolStarter,
{
    pub fn new(identity_store: &'a I, protocol_starter: &'a P) -> Self {
        Self {
            identity_store,
            protocol_starter,
        }
    }

    pub fn perform_restoration(
        &self,
        ctx: &mut StepContext,
        request: RestorationRequest<'_>,
    ) -> RestorationOutcome {
        let owned_identity = request.transferred_identity;

        if let Err(err) = self.identity_store.restore_snapshot_node(
            owned_identity,
            request.identity_node,
            request.device_name,
        ) {
            return RestorationOutcome::DefinitiveError(RestorationError::RestoreIdentity(boxed(
                err,
            )));
        }
        debug!(%owned_identity, "restored identity from snapshot");

        let mut results = Vec::new();

        if let Some(raw_auth_state) = request.raw_auth_state {
            results.push(
                self.identity_store
                    .save_keycloak_auth_state(owned_identity, raw_auth_state)
                    .map_err(|err| RestorationError::SaveAuthState(boxed(err))),
            );
        }

        self.download_missing_photos(ctx, owned_identity, &mut results);
        self.re_download_groups(ctx, owned_identity, &mut results);
        results.push(self.start(ctx, ChildProtocol::OwnedDeviceDiscovery {
            owned_identity: *owned_identity,
        }));
        self.discover_contact_devices(ctx, owned_identity, &mut results);

        // The network layer learns about the new identity once the restore is committed.
        results.push(
            self.identity_store
                .active_owned_identities()
                .map(|identities| ctx.follow_up(FollowUp::UpdateOwnedIdentities(identities)))
                .map_err(|err| RestorationError::IdentityStore(boxed(err))),
        );

        let errors: Vec<RestorationError> = results
            .into_iter()
            .filter_map(Result::err)
            .inspect(|err| warn!(%owned_identity, "best-effort restoration step failed: {err}"))
            .collect();

        if errors.is_empty() {
            RestorationOutcome::Success
        } else {
            RestorationOutcome::NonDefinitiveErrors(errors)
        }
    }

    fn start(
        &self,
        ctx: &mut StepContext,
        protocol: ChildProtocol,
    ) -> Result<(), RestorationError> {
        let kind = protocol.kind();
        let message = self
            .protocol_starter
            .initial_message(protocol)
            .map_err(|err| RestorationError::StartProtocol {
                kind,
                error: boxed(err),
            })?;
        ctx.post_child_protocol_message(message);
        Ok(())
    }

    fn download_missing_photos(
        &self,
        ctx: &mut StepContext,
        owned_identity: &CryptoIdentity,
        results: &mut Vec<Result<(), RestorationError>>,
    ) {
        let photos = match self.identity_store.missing_photos(owned_identity) {
            Ok(photos) => photos,
            Err(err) => {
                results.push(Err(RestorationError::IdentityStore(boxed(err))));
                return;
            }
        };

        for photo in photos {
            let protocol = match photo {
                MissingPhoto::Identity { identity, details } => {
                    ChildProtocol::DownloadIdentityPhoto {
                        owned_identity: *owned_identity,
                        identity,
                        details,
                    }
                }
                MissingPhoto::Group { group_id, details } => ChildProtocol::DownloadGroupPhoto {
                    owned_identity: *owned_identity,
                    group_id,
                    details,
                },
            };
            results.push(self.start(ctx, protocol));
        }
    }

    fn re_download_groups(
        &self,
        ctx: &mut StepContext,
        owned_identity: &CryptoIdentity,
        results: &mut Vec<Result<(), RestorationError>>,
    ) {
        match self.identity_store.groups(owned_identity) {
            Ok(groups) => {
                for group in groups.into_iter().filter(|group| !group.keycloak_managed) {
                    results.push(self.start(ctx, ChildProtocol::GroupReDownload {
                        owned_identity: *owned_identity,
                        group_id: group.group_id,
                    }));
                }
            }
            Err(err) => results.push(Err(RestorationError::IdentityStore(boxed(err)))),
        }
    }

    fn discover_contact_devices(
        &self,
        ctx: &mut StepContext,
        owned_identity: &CryptoIdentity,
        results: &mut Vec<Result<(), RestorationError>>,
    ) {
        match self.identity_store.contacts(owned_identity) {
            Ok(contacts) => {
                for contact in contacts {
                    results.push(self.start(ctx, ChildProtocol::ContactDeviceDiscovery {
                        owned_identity: *owned_identity,
                        contact,
                    }));
                }
            }
            Err(err) => results.push(Err(RestorationError::IdentityStore(boxed(err)))),
        }
    }
}

/// Returns the first error of a sequence of best-effort results.
pub fn first_error<E>(results: impl IntoIterator<Item = Result<(), E>>) -> Option<E> {
    results.into_iter().find_map(Result::err)
}

#[derive(Debug, Error)]
pub enum RestorationError {
    #[error("could not restore identity from snapshot: {0}")]
    RestoreIdentity(BoxError),

    #[error("could not save keycloak auth state: {0}")]
    SaveAuthState(BoxError),

    #[error("identity store failed during restoration: {0}")]
    IdentityStore(BoxError),

    #[error("could not start {kind} protocol: {error}")]
    StartProtocol { kind: &'static str, error: BoxError },
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use identity_transfer_crypto::Rng;

    use crate::context::{FollowUp, StepContext};
    use crate::test_utils::{
        IdentityNode, MemoryIdentityStore, MemoryProtocolStarter, StoreFailure,
    };
    use crate::traits::ChildProtocol;
    use crate::types::{
        DeviceUid, GroupId, GroupSummary, MissingPhoto, PhotoDetails, ProtocolInstanceId,
    };

    use super::{
        RestorationError, RestorationHelper, RestorationOutcome, RestorationRequest, first_error,
    };

    fn snapshot_node(rng: &Rng, source: &MemoryIdentityStore) -> IdentityNode {
        let owned_identity = source.create_owned_identity(rng).unwrap();
        source.add_contact(&owned_identity, rng).unwrap();
        source.add_contact(&owned_identity, rng).unwrap();
        source
            .add_group(&owned_identity, GroupSummary {
                group_id: GroupId::from_bytes([1; 32]),
                keycloak_managed: false,
            })
            .unwrap();
        source
            .add_group(&owned_identity, GroupSummary {
                group_id: GroupId::from_bytes([2; 32]),
                keycloak_managed: true,
            })
            .unwrap();
        source
            .add_missing_photo(&owned_identity, MissingPhoto::Identity {
                identity: owned_identity,
                details: PhotoDetails {
                    label: "avatar".into(),
                    key: vec![7; 16],
                },
            })
            .unwrap();
        source.identity_node(&owned_identity).unwrap()
    }

    #[test]
    fn restores_and_starts_follow_up_protocols() {
        let rng = Rng::from_seed([1; 32]);
        let source = MemoryIdentityStore::new(DeviceUid::from_bytes([1; 32]));
        let target = MemoryIdentityStore::new(DeviceUid::from_bytes([2; 32]));
        let starter = MemoryProtocolStarter::default();
        let node = snapshot_node(&rng, &source);
        let owned_identity = node.identity();
        let encoded = node.to_snapshot_node().unwrap();

        let mut ctx = StepContext::new(ProtocolInstanceId::random(&rng).unwrap(), &rng);
        let outcome = RestorationHelper::new(&target, &starter).perform_restoration(
            &mut ctx,
            RestorationRequest {
                transferred_identity: &owned_identity,
                identity_node: &encoded,
                device_name: "Tablet",
                raw_auth_state: Some(&b"keycloak session"[..]),
            },
        );
        assert_matches!(outcome, RestorationOutcome::Success);
        assert!(target.owns(&owned_identity));
        assert_eq!(
            target.auth_state(&owned_identity).as_deref(),
            Some(&b"keycloak session"[..])
        );

        let effects = ctx.commit();
        let kinds: Vec<&str> = effects
            .child_protocol_messages
            .iter()
            .map(|message| message.protocol.kind())
            .collect();
        assert_eq!(kinds, vec![
            "download identity photo",
            // Keycloak managed groups are skipped.
            "group re-download",
            "owned device discovery",
            "contact device discovery",
            "contact device discovery",
        ]);
        assert_matches!(
            effects.follow_ups.as_slice(),
            [FollowUp::UpdateOwnedIdentities(identities)] if identities.len() == 1
        );
    }

    #[test]
    fn failing_restore_is_definitive() {
        let rng = Rng::from_seed([2; 32]);
        let source = MemoryIdentityStore::new(DeviceUid::from_bytes([1; 32]));
        let target = MemoryIdentityStore::new(DeviceUid::from_bytes([2; 32]));
        target.fail_on(StoreFailure::Restore);
        let starter = MemoryProtocolStarter::default();
        let node = snapshot_node(&rng, &source);
        let encoded = node.to_snapshot_node().unwrap();

        let mut ctx = StepContext::new(ProtocolInstanceId::random(&rng).unwrap(), &rng);
        let outcome = RestorationHelper::new(&target, &starter).perform_restoration(
            &mut ctx,
            RestorationRequest {
                transferred_identity: &node.identity(),
                identity_node: &encoded,
                device_name: "Tablet",
                raw_auth_state: None,
            },
        );
        assert_matches!(
            outcome,
            RestorationOutcome::DefinitiveError(RestorationError::RestoreIdentity(_))
        );
        assert!(ctx.commit().is_empty());
    }

    #[test]
    fn best_effort_failures_are_collected() {
        let rng = Rng::from_seed([3; 32]);
        let source = MemoryIdentityStore::new(DeviceUid::from_bytes([1; 32]));
        let target = MemoryIdentityStore::new(DeviceUid::from_bytes([2; 32]));
        target.fail_on(StoreFailure::Contacts);
        let starter = MemoryProtocolStarter::default();
        starter.fail_on("group re-download");
        let node = snapshot_node(&rng, &source);
        let encoded = node.to_snapshot_node().unwrap();

        let mut ctx = StepContext::new(ProtocolInstanceId::random(&rng).unwrap(), &rng);
        let outcome = RestorationHelper::new(&target, &starter).perform_restoration(
            &mut ctx,
            RestorationRequest {
                transferred_identity: &node.identity(),
                identity_node: &encoded,
                device_name: "Tablet",
                raw_auth_state: None,
            },
        );

        let RestorationOutcome::NonDefinitiveErrors(errors) = outcome else {
            panic!("expected non-definitive errors");
        };
        assert_eq!(errors.len(), 2);
        assert_matches!(
            &errors[0],
            RestorationError::StartProtocol {
                kind: "group re-download",
                ..
            }
        );
        assert_matches!(&errors[1], RestorationError::IdentityStore(_));

        // The identity is restored anyway and the remaining protocols were started.
        assert!(target.owns(&node.identity()));
        let effects = ctx.commit();
        assert!(effects.child_protocol_messages.iter().any(|message| matches!(
            message.protocol,
            ChildProtocol::OwnedDeviceDiscovery { .. }
        )));
    }

    #[test]
    fn first_error_of_results() {
        assert_eq!(first_error::<&str>(vec![Ok(()), Ok(())]), None);
        assert_eq!(first_error(vec![Ok(()), Err("a"), Err("b")]), Some("a"));
        assert_eq!(first_error::<&str>(Vec::new()), None);
    }
}
