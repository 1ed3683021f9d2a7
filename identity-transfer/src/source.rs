// SPDX-License-Identifier: MIT OR Apache-2.0

//! State machine of the device giving away a copy of its owned identity.
//!
//! ```text
//! Initial
//!   └─ Initiate ─────────────► WaitingForSessionNumber
//!        └─ SessionNumber ───► WaitingForTargetConnection
//!             └─ Target ─────► WaitingForTargetSeed        (commitment sent)
//!                  └─ Seed ──► WaitingForSasInput          (decommitment sent)
//!                       └─ SAS ──► Final                   (snapshot sent)
//!                       └─ SAS ──► WaitingForKeycloakAuthenticationProof
//!                                    └─ Proof ──► Final    (snapshot sent)
//! ```
//!
//! Every waiting state accepts `Abort`, which closes the relay connection and ends the protocol.
use identity_transfer_crypto::{CryptoIdentity, Decommitment, Seed, commit, compute_sas};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::context::StepContext;
use crate::error::{TransferError, boxed};
use crate::events::TransferEvent;
use crate::payload::{
    DecommitmentPayload, Payload, SnapshotContainer, SnapshotResponse, TargetSeedPayload,
    TransferredIdentityPayload, decode_ephemeral_identity, decode_keycloak_proof,
};
use crate::relay::{OutgoingQuery, RelayResult, Reply, ServerQuery};
use crate::traits::{IdentityStore, SyncSnapshotDelegate};
use crate::types::{ConnectionId, DeviceUid, FullSas, KeycloakTransferProofElements, SessionNumber};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceState {
    Initial,
    WaitingForSessionNumber,
    WaitingForTargetConnection(WaitingForTargetConnection),
    WaitingForTargetSeed(WaitingForTargetSeed),
    WaitingForSasInput(WaitingForSasInput),
    WaitingForKeycloakAuthenticationProof(WaitingForKeycloakAuthenticationProof),
    Final,
}

impl SourceState {
    pub fn name(&self) -> &'static str {
        match self {
            SourceState::Initial => "initial",
            SourceState::WaitingForSessionNumber => "waiting_for_session_number",
            SourceState::WaitingForTargetConnection(_) => "waiting_for_target_connection",
            SourceState::WaitingForTargetSeed(_) => "waiting_for_target_seed",
            SourceState::WaitingForSasInput(_) => "waiting_for_sas_input",
            SourceState::WaitingForKeycloakAuthenticationProof(_) => {
                "waiting_for_keycloak_authentication_proof"
            }
            SourceState::Final => "final",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, SourceState::Final)
    }

    /// Relay query the state waits on, issued again when a persisted state is resumed.
    pub fn pending_query(&self) -> Option<OutgoingQuery> {
        let (query, reply) = match self {
            SourceState::WaitingForSessionNumber => {
                (ServerQuery::SourceGetSessionNumber, Reply::SourceSessionNumber)
            }
            SourceState::WaitingForTargetConnection(_) => (
                ServerQuery::SourceWaitForTargetConnection,
                Reply::SourceTargetConnection,
            ),
            SourceState::WaitingForTargetSeed(waiting) => (
                ServerQuery::TransferWait {
                    connection_id: waiting.target_connection_id.clone(),
                },
                Reply::SourceTargetSeed,
            ),
            SourceState::WaitingForKeycloakAuthenticationProof(waiting) => (
                ServerQuery::TransferWait {
                    connection_id: waiting.target_connection_id.clone(),
                },
                Reply::SourceKeycloakProof,
            ),
            // Waiting on the user, not on the relay.
            SourceState::Initial | SourceState::WaitingForSasInput(_) | SourceState::Final => {
                return None;
            }
        };
        Some(OutgoingQuery { query, reply })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForTargetConnection {
    pub source_connection_id: ConnectionId,
    pub session_number: SessionNumber,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForTargetSeed {
    pub session_number: SessionNumber,
    pub target_connection_id: ConnectionId,
    pub target_ephemeral_identity: CryptoIdentity,
    pub seed_source_for_sas: Seed,
    pub decommitment: Decommitment,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForSasInput {
    pub session_number: SessionNumber,
    pub target_connection_id: ConnectionId,
    pub target_ephemeral_identity: CryptoIdentity,
    pub full_sas: FullSas,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForKeycloakAuthenticationProof {
    pub target_connection_id: ConnectionId,
    pub target_ephemeral_identity: CryptoIdentity,
    pub device_uid_to_keep_active: Option<DeviceUid>,
    pub proof_elements: KeycloakTransferProofElements,
}

/// What the user typed on the source device after reading the SAS off the target device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SasEntry {
    pub entered_sas: String,

    /// The identity is bound to a Keycloak server which needs to approve the transfer.
    pub is_transfer_restricted: bool,

    pub device_uid_to_keep_active: Option<DeviceUid>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionNumberResponse {
    pub source_connection_id: ConnectionId,
    pub session_number: SessionNumber,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetConnectionResponse {
    pub target_connection_id: ConnectionId,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceMessage {
    Initiate,
    SessionNumber(RelayResult<SessionNumberResponse>),
    TargetConnection(RelayResult<TargetConnectionResponse>),
    TargetSeed(RelayResult<Vec<u8>>),
    SasEntered(SasEntry),
    KeycloakProof(RelayResult<Vec<u8>>),
    Abort,
}

impl SourceMessage {
    pub fn name(&self) -> &'static str {
        match self {
            SourceMessage::Initiate => "initiate",
            SourceMessage::SessionNumber(_) => "session_number",
            SourceMessage::TargetConnection(_) => "target_connection",
            SourceMessage::TargetSeed(_) => "target_seed",
            SourceMessage::SasEntered(_) => "sas_entered",
            SourceMessage::KeycloakProof(_) => "keycloak_proof",
            SourceMessage::Abort => "abort",
        }
    }
}

/// Input of the SAS check. The check runs once the user entered the SAS and, for transfers
/// restricted by a Keycloak server, a second time once the proof of authentication arrived.
enum SasCheck<'s> {
    LocalSasEntry {
        state: &'s WaitingForSasInput,
        entry: SasEntry,
    },
    AuthProofReceived {
        state: &'s WaitingForKeycloakAuthenticationProof,
        response: RelayResult<Vec<u8>>,
    },
}

/// Source side of a transfer of `owned_identity`.
pub struct SourceProtocol<'a, I, Y> {
    owned_identity: &'a CryptoIdentity,
    identity_store: &'a I,
    sync_snapshot: &'a Y,
    config: &'a Config,
}

impl<'a, I, Y> SourceProtocol<'a, I, Y>
where
    I: IdentityStore,
    Y: SyncSnapshotDelegate,
{
    pub fn new(
        owned_identity: &'a CryptoIdentity,
        identity_store: &'a I,
        sync_snapshot: &'a Y,
        config: &'a Config,
    ) -> Self {
        Self {
            owned_identity,
            identity_store,
            sync_snapshot,
            config,
        }
    }

    /// Runs one step and returns the next state.
    ///
    /// A failing step reports the error through the context and leaves the state as it was.
    /// Messages the current state does not expect are ignored.
    pub fn process(
        &self,
        state: SourceState,
        message: SourceMessage,
        ctx: &mut StepContext,
    ) -> SourceState {
        let message_name = message.name();
        let result = match (&state, message) {
            (SourceState::Initial, SourceMessage::Initiate) => self.initiate(ctx),
            (SourceState::WaitingForSessionNumber, SourceMessage::SessionNumber(response)) => {
                self.on_session_number(ctx, response)
            }
            (
                SourceState::WaitingForTargetConnection(waiting),
                SourceMessage::TargetConnection(response),
            ) => self.on_target_connection(ctx, waiting, response),
            (SourceState::WaitingForTargetSeed(waiting), SourceMessage::TargetSeed(response)) => {
                self.on_target_seed(ctx, waiting, response)
            }
            (SourceState::WaitingForSasInput(waiting), SourceMessage::SasEntered(entry)) => {
                self.check_sas(ctx, SasCheck::LocalSasEntry {
                    state: waiting,
                    entry,
                })
            }
            (
                SourceState::WaitingForKeycloakAuthenticationProof(waiting),
                SourceMessage::KeycloakProof(response),
            ) => self.check_sas(ctx, SasCheck::AuthProofReceived {
                state: waiting,
                response,
            }),
            (SourceState::Final, SourceMessage::Abort) => Ok(SourceState::Final),
            (SourceState::Initial, SourceMessage::Abort) => Ok(SourceState::Final),
            (_, SourceMessage::Abort) => {
                ctx.send_query(ServerQuery::CloseWebsocketConnection, Reply::Discard);
                Ok(SourceState::Final)
            }
            (_, _) => {
                debug!(
                    instance = %ctx.instance_id(),
                    state = state.name(),
                    message = message_name,
                    "ignore unexpected message on source"
                );
                return state;
            }
        };

        match result {
            Ok(next) => {
                debug!(
                    instance = %ctx.instance_id(),
                    from = state.name(),
                    to = next.name(),
                    "source step"
                );
                next
            }
            Err(err) => {
                debug!(
                    instance = %ctx.instance_id(),
                    state = state.name(),
                    message = message_name,
                    "source step failed: {err}"
                );
                ctx.fail(err);
                state
            }
        }
    }

    fn initiate(&self, ctx: &mut StepContext) -> Result<SourceState, TransferError> {
        ctx.send_query(ServerQuery::SourceGetSessionNumber, Reply::SourceSessionNumber);
        Ok(SourceState::WaitingForSessionNumber)
    }

    fn on_session_number(
        &self,
        ctx: &mut StepContext,
        response: RelayResult<SessionNumberResponse>,
    ) -> Result<SourceState, TransferError> {
        let SessionNumberResponse {
            source_connection_id,
            session_number,
        } = response?;

        ctx.notify(TransferEvent::SessionNumberReady {
            instance_id: ctx.instance_id(),
            session_number: session_number.clone(),
        });
        ctx.send_query(
            ServerQuery::SourceWaitForTargetConnection,
            Reply::SourceTargetConnection,
        );

        Ok(SourceState::WaitingForTargetConnection(
            WaitingForTargetConnection {
                source_connection_id,
                session_number,
            },
        ))
    }

    fn on_target_connection(
        &self,
        ctx: &mut StepContext,
        waiting: &WaitingForTargetConnection,
        response: RelayResult<TargetConnectionResponse>,
    ) -> Result<SourceState, TransferError> {
        let TargetConnectionResponse {
            target_connection_id,
            payload,
        } = response?;
        let target_ephemeral_identity = decode_ephemeral_identity(&payload)?;

        // Commit to our seed before learning anything about the target's seed.
        let seed_source_for_sas = Seed::random(ctx.rng())?;
        let (commitment, decommitment) = commit(
            ctx.rng(),
            &self.owned_identity.to_bytes(),
            seed_source_for_sas.as_bytes(),
        )?;

        let cleartext = TransferredIdentityPayload {
            source_connection_id: waiting.source_connection_id.clone(),
            transferred_identity: *self.owned_identity,
            commitment,
        }
        .to_bytes()?;
        let payload = target_ephemeral_identity
            .seal(&cleartext)
            .map_err(TransferError::Encryption)?;

        ctx.send_query(
            ServerQuery::TransferRelay {
                connection_id: target_connection_id.clone(),
                payload,
                then_close_websocket: false,
            },
            Reply::SourceTargetSeed,
        );

        Ok(SourceState::WaitingForTargetSeed(WaitingForTargetSeed {
            session_number: waiting.session_number.clone(),
            target_connection_id,
            target_ephemeral_identity,
            seed_source_for_sas,
            decommitment,
        }))
    }

    fn on_target_seed(
        &self,
        ctx: &mut StepContext,
        waiting: &WaitingForTargetSeed,
        response: RelayResult<Vec<u8>>,
    ) -> Result<SourceState, TransferError> {
        let envelope = response?;
        let cleartext = self.decrypt(&envelope)?;
        let TargetSeedPayload {
            device_name: target_device_name,
            seed: seed_target_for_sas,
        } = TargetSeedPayload::from_bytes(&cleartext)?;

        let payload = waiting
            .target_ephemeral_identity
            .seal(&DecommitmentPayload(waiting.decommitment.clone()).to_bytes()?)
            .map_err(TransferError::Encryption)?;
        ctx.send_query(
            ServerQuery::TransferRelay {
                connection_id: waiting.target_connection_id.clone(),
                payload,
                then_close_websocket: false,
            },
            Reply::Discard,
        );

        let full_sas = FullSas::new(compute_sas(
            &waiting.seed_source_for_sas,
            &seed_target_for_sas,
            &waiting.target_ephemeral_identity,
            self.config.full_sas_digits(),
        )?)?;

        ctx.notify(TransferEvent::WaitingForSasOnSource {
            instance_id: ctx.instance_id(),
            expected_sas: full_sas.clone(),
            target_device_name,
        });

        Ok(SourceState::WaitingForSasInput(WaitingForSasInput {
            session_number: waiting.session_number.clone(),
            target_connection_id: waiting.target_connection_id.clone(),
            target_ephemeral_identity: waiting.target_ephemeral_identity,
            full_sas,
        }))
    }

    fn check_sas(
        &self,
        ctx: &mut StepContext,
        check: SasCheck<'_>,
    ) -> Result<SourceState, TransferError> {
        match check {
            SasCheck::LocalSasEntry { state, entry } => {
                if !state.full_sas.matches(&entry.entered_sas) {
                    return Err(TransferError::IncorrectSas);
                }

                if !entry.is_transfer_restricted {
                    self.send_snapshot(
                        ctx,
                        &state.target_connection_id,
                        &state.target_ephemeral_identity,
                        entry.device_uid_to_keep_active,
                    )?;
                    return Ok(SourceState::Final);
                }

                let configuration = self
                    .identity_store
                    .keycloak_configuration(self.owned_identity)
                    .map_err(|err| TransferError::IdentityStore(boxed(err)))?
                    .ok_or(TransferError::MissingKeycloakConfiguration)?;
                let payload = state
                    .target_ephemeral_identity
                    .seal(&SnapshotResponse::KeycloakConfiguration(configuration).to_bytes()?)
                    .map_err(TransferError::Encryption)?;

                // The target answers with the proof once the user authenticated there.
                ctx.send_query(
                    ServerQuery::TransferRelay {
                        connection_id: state.target_connection_id.clone(),
                        payload,
                        then_close_websocket: false,
                    },
                    Reply::SourceKeycloakProof,
                );

                Ok(SourceState::WaitingForKeycloakAuthenticationProof(
                    WaitingForKeycloakAuthenticationProof {
                        target_connection_id: state.target_connection_id.clone(),
                        target_ephemeral_identity: state.target_ephemeral_identity,
                        device_uid_to_keep_active: entry.device_uid_to_keep_active,
                        proof_elements: KeycloakTransferProofElements {
                            session_number: state.session_number.clone(),
                            sas: state.full_sas.clone(),
                        },
                    },
                ))
            }
            SasCheck::AuthProofReceived { state, response } => {
                let envelope = response?;
                let proof = decode_keycloak_proof(&self.decrypt(&envelope)?)?;

                let is_valid = self
                    .identity_store
                    .verify_keycloak_signature(self.owned_identity, &state.proof_elements, &proof)
                    .map_err(|err| TransferError::IdentityStore(boxed(err)))?;
                if !is_valid {
                    return Err(TransferError::InvalidKeycloakProof);
                }

                self.send_snapshot(
                    ctx,
                    &state.target_connection_id,
                    &state.target_ephemeral_identity,
                    state.device_uid_to_keep_active,
                )?;
                Ok(SourceState::Final)
            }
        }
    }

    fn send_snapshot(
        &self,
        ctx: &mut StepContext,
        target_connection_id: &ConnectionId,
        target_ephemeral_identity: &CryptoIdentity,
        device_uid_to_keep_active: Option<DeviceUid>,
    ) -> Result<(), TransferError> {
        let snapshot = self
            .sync_snapshot
            .sync_snapshot(self.owned_identity)
            .map_err(|err| TransferError::SyncSnapshot(boxed(err)))?;
        let cleartext = SnapshotResponse::Snapshot(SnapshotContainer {
            snapshot,
            device_uid_to_keep_active,
        })
        .to_bytes()?;
        let payload = target_ephemeral_identity
            .seal(&cleartext)
            .map_err(TransferError::Encryption)?;

        ctx.send_query(
            ServerQuery::TransferRelay {
                connection_id: target_connection_id.clone(),
                payload,
                then_close_websocket: true,
            },
            Reply::Discard,
        );
        ctx.notify(TransferEvent::ProtocolFinishedOnSource {
            instance_id: ctx.instance_id(),
        });
        Ok(())
    }

    fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, TransferError> {
        self.identity_store
            .decrypt_for_owned_identity(self.owned_identity, envelope)
            .map_err(|err| TransferError::Decryption(boxed(err)))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use identity_transfer_crypto::{CryptoIdentity, IdentityKeyPair, Rng};

    use crate::config::Config;
    use crate::context::{Effects, StepContext};
    use crate::error::TransferError;
    use crate::events::TransferEvent;
    use crate::payload::{
        Payload, SnapshotResponse, TargetSeedPayload, TransferredIdentityPayload,
        encode_ephemeral_identity, encode_keycloak_proof,
    };
    use crate::relay::{OutgoingQuery, RelayFailure, Reply, ServerQuery};
    use crate::test_utils::{MemoryIdentityStore, keycloak_signing_key, sign_transfer_proof};
    use crate::types::{
        ConnectionId, DeviceUid, KeycloakConfiguration, KeycloakTransferProof,
        ProtocolInstanceId, SessionNumber,
    };

    use super::{
        SasEntry, SessionNumberResponse, SourceMessage, SourceProtocol, SourceState,
        TargetConnectionResponse,
    };

    struct Harness {
        rng: Rng,
        instance_id: ProtocolInstanceId,
        config: Config,
        store: MemoryIdentityStore,
        owned_identity: CryptoIdentity,
        ephemeral: IdentityKeyPair,
    }

    impl Harness {
        fn new(seed: u8) -> Self {
            let rng = Rng::from_seed([seed; 32]);
            let store = MemoryIdentityStore::new(DeviceUid::from_bytes([seed; 32]));
            let owned_identity = store.create_owned_identity(&rng).unwrap();
            let ephemeral = IdentityKeyPair::generate(&rng).unwrap();
            Self {
                instance_id: ProtocolInstanceId::random(&rng).unwrap(),
                rng,
                config: Config::default(),
                store,
                owned_identity,
                ephemeral,
            }
        }

        fn step(&self, state: SourceState, message: SourceMessage) -> (SourceState, Effects) {
            let protocol =
                SourceProtocol::new(&self.owned_identity, &self.store, &self.store, &self.config);
            let mut ctx = StepContext::new(self.instance_id, &self.rng);
            let next = protocol.process(state, message, &mut ctx);
            (next, ctx.commit())
        }

        /// Drives the protocol up to the SAS input and returns the expected SAS.
        fn until_sas_input(&self) -> (SourceState, String) {
            let (mut visited, expected_sas) = self.visit_until_sas_input();
            (visited.pop().unwrap(), expected_sas)
        }

        /// Like `until_sas_input` but returns every state passed on the way.
        fn visit_until_sas_input(&self) -> (Vec<SourceState>, String) {
            let mut visited = Vec::new();
            let (state, _) = self.step(SourceState::Initial, SourceMessage::Initiate);
            visited.push(state.clone());
            let (state, _) = self.step(
                state,
                SourceMessage::SessionNumber(Ok(SessionNumberResponse {
                    source_connection_id: ConnectionId::new("source"),
                    session_number: SessionNumber::new("12345678").unwrap(),
                })),
            );
            visited.push(state.clone());
            let (state, effects) = self.step(
                state,
                SourceMessage::TargetConnection(Ok(TargetConnectionResponse {
                    target_connection_id: ConnectionId::new("target"),
                    payload: encode_ephemeral_identity(self.ephemeral.identity()),
                })),
            );

            let [query] = effects.queries.as_slice() else {
                panic!("expected one query");
            };
            let ServerQuery::TransferRelay { payload, .. } = &query.query else {
                panic!("expected relayed commitment");
            };
            let cleartext = self.ephemeral.open(payload).unwrap();
            let commitment = TransferredIdentityPayload::from_bytes(&cleartext)
                .unwrap()
                .commitment;
            let seed = identity_transfer_crypto::derive_seed(
                &commitment,
                &identity_transfer_crypto::MacKey::random(&self.rng).unwrap(),
            )
            .unwrap();
            let seed_payload = self
                .owned_identity
                .seal(
                    &TargetSeedPayload {
                        device_name: "Tablet".into(),
                        seed,
                    }
                    .to_bytes()
                    .unwrap(),
                )
                .unwrap();

            visited.push(state.clone());
            let (state, effects) = self.step(state, SourceMessage::TargetSeed(Ok(seed_payload)));
            let [TransferEvent::WaitingForSasOnSource { expected_sas, .. }] =
                effects.events.as_slice()
            else {
                panic!("expected sas event");
            };
            let expected_sas = expected_sas.to_string();
            visited.push(state);
            (visited, expected_sas)
        }
    }

    #[test]
    fn session_number_is_announced() {
        let harness = Harness::new(1);

        let (state, effects) = harness.step(SourceState::Initial, SourceMessage::Initiate);
        assert_eq!(state, SourceState::WaitingForSessionNumber);
        assert_eq!(effects.queries[0].query, ServerQuery::SourceGetSessionNumber);

        let (state, effects) = harness.step(
            state,
            SourceMessage::SessionNumber(Ok(SessionNumberResponse {
                source_connection_id: ConnectionId::new("c-1"),
                session_number: SessionNumber::new("123456789012").unwrap(),
            })),
        );
        assert_matches!(state, SourceState::WaitingForTargetConnection(_));
        assert_matches!(
            effects.events.as_slice(),
            [TransferEvent::SessionNumberReady { session_number, .. }]
                if session_number.as_str() == "123456789012"
        );
        assert_eq!(effects.queries[0].reply, Reply::SourceTargetConnection);
    }

    #[test]
    fn relay_failure_keeps_state() {
        let harness = Harness::new(2);
        let (state, effects) = harness.step(
            SourceState::WaitingForSessionNumber,
            SourceMessage::SessionNumber(Err(RelayFailure)),
        );
        assert_eq!(state, SourceState::WaitingForSessionNumber);
        assert!(effects.queries.is_empty());
        assert_matches!(
            effects.events.as_slice(),
            [TransferEvent::ProtocolFailed {
                error: TransferError::Relay(RelayFailure),
                ..
            }]
        );
    }

    #[test]
    fn wrong_sas_sends_nothing() {
        let harness = Harness::new(3);
        let (state, expected_sas) = harness.until_sas_input();
        let wrong_sas = if expected_sas == "00000000" {
            "11111111"
        } else {
            "00000000"
        };

        let (next, effects) = harness.step(
            state.clone(),
            SourceMessage::SasEntered(SasEntry {
                entered_sas: wrong_sas.into(),
                is_transfer_restricted: false,
                device_uid_to_keep_active: None,
            }),
        );
        assert_eq!(next, state);
        assert!(effects.queries.is_empty());
        assert_matches!(
            effects.events.as_slice(),
            [TransferEvent::ProtocolFailed { error, .. }] if error.is_security_violation()
        );
    }

    #[test]
    fn correct_sas_sends_snapshot_and_closes() {
        let harness = Harness::new(4);
        let (state, expected_sas) = harness.until_sas_input();

        let (next, effects) = harness.step(
            state,
            SourceMessage::SasEntered(SasEntry {
                entered_sas: expected_sas,
                is_transfer_restricted: false,
                device_uid_to_keep_active: Some(DeviceUid::from_bytes([4; 32])),
            }),
        );
        assert_eq!(next, SourceState::Final);
        let [query] = effects.queries.as_slice() else {
            panic!("expected one query");
        };
        let ServerQuery::TransferRelay {
            connection_id,
            payload,
            then_close_websocket,
        } = &query.query
        else {
            panic!("expected relayed snapshot");
        };
        assert_eq!(connection_id.as_str(), "target");
        assert!(then_close_websocket);

        let cleartext = harness.ephemeral.open(payload).unwrap();
        assert_matches!(
            SnapshotResponse::from_bytes(&cleartext).unwrap(),
            SnapshotResponse::Snapshot(container)
                if container.device_uid_to_keep_active == Some(DeviceUid::from_bytes([4; 32]))
        );
        assert_matches!(
            effects.events.as_slice(),
            [TransferEvent::ProtocolFinishedOnSource { .. }]
        );
    }

    #[test]
    fn restricted_transfer_requires_valid_proof() {
        let harness = Harness::new(5);
        let signing_key = keycloak_signing_key(&harness.rng);
        let configuration = KeycloakConfiguration {
            server_url: "https://keycloak.example.org/realms/staff".into(),
            client_id: "messenger".into(),
            client_secret: None,
            jwks: None,
        };
        harness
            .store
            .set_keycloak(
                &harness.owned_identity,
                configuration.clone(),
                signing_key.verifying_key(),
            )
            .unwrap();
        let (state, expected_sas) = harness.until_sas_input();

        let (state, effects) = harness.step(
            state,
            SourceMessage::SasEntered(SasEntry {
                entered_sas: expected_sas.clone(),
                is_transfer_restricted: true,
                device_uid_to_keep_active: None,
            }),
        );
        let SourceState::WaitingForKeycloakAuthenticationProof(waiting) = &state else {
            panic!("expected to wait for proof, got {}", state.name());
        };
        assert_eq!(waiting.proof_elements.sas.as_str(), expected_sas);
        let ServerQuery::TransferRelay { payload, .. } = &effects.queries[0].query else {
            panic!("expected relayed keycloak configuration");
        };
        assert_eq!(
            SnapshotResponse::from_bytes(&harness.ephemeral.open(payload).unwrap()).unwrap(),
            SnapshotResponse::KeycloakConfiguration(configuration)
        );

        // A proof over other elements, e.g. replayed from another transfer, is rejected.
        let mut other_elements = waiting.proof_elements.clone();
        other_elements.session_number = SessionNumber::new("99999999").unwrap();
        let replayed = sign_transfer_proof(&signing_key, &other_elements);
        let envelope = harness
            .owned_identity
            .seal(&encode_keycloak_proof(&replayed))
            .unwrap();
        let (next, effects) =
            harness.step(state.clone(), SourceMessage::KeycloakProof(Ok(envelope)));
        assert_eq!(next, state);
        assert!(effects.queries.is_empty());
        assert_matches!(
            effects.events.as_slice(),
            [TransferEvent::ProtocolFailed {
                error: TransferError::InvalidKeycloakProof,
                ..
            }]
        );

        // Garbage signature.
        let garbage = KeycloakTransferProof {
            signature: "not a signature".into(),
        };
        let envelope = harness
            .owned_identity
            .seal(&encode_keycloak_proof(&garbage))
            .unwrap();
        let (next, _) = harness.step(state.clone(), SourceMessage::KeycloakProof(Ok(envelope)));
        assert_eq!(next, state);

        let proof = sign_transfer_proof(&signing_key, &waiting.proof_elements);
        let envelope = harness
            .owned_identity
            .seal(&encode_keycloak_proof(&proof))
            .unwrap();
        let (next, effects) = harness.step(state, SourceMessage::KeycloakProof(Ok(envelope)));
        assert_eq!(next, SourceState::Final);
        let ServerQuery::TransferRelay {
            then_close_websocket,
            ..
        } = &effects.queries[0].query
        else {
            panic!("expected relayed snapshot");
        };
        assert!(then_close_websocket);
    }

    #[test]
    fn restricted_transfer_without_configuration_fails() {
        let harness = Harness::new(6);
        let (state, expected_sas) = harness.until_sas_input();
        let (next, effects) = harness.step(
            state.clone(),
            SourceMessage::SasEntered(SasEntry {
                entered_sas: expected_sas,
                is_transfer_restricted: true,
                device_uid_to_keep_active: None,
            }),
        );
        assert_eq!(next, state);
        assert_matches!(
            effects.events.as_slice(),
            [TransferEvent::ProtocolFailed {
                error: TransferError::MissingKeycloakConfiguration,
                ..
            }]
        );
    }

    #[test]
    fn abort_from_every_state() {
        let harness = Harness::new(7);
        let signing_key = keycloak_signing_key(&harness.rng);
        harness
            .store
            .set_keycloak(
                &harness.owned_identity,
                KeycloakConfiguration {
                    server_url: "https://keycloak.example.org/realms/staff".into(),
                    client_id: "messenger".into(),
                    client_secret: None,
                    jwks: None,
                },
                signing_key.verifying_key(),
            )
            .unwrap();
        let (mut states, expected_sas) = harness.visit_until_sas_input();
        let (waiting_for_proof, _) = harness.step(
            states.last().unwrap().clone(),
            SourceMessage::SasEntered(SasEntry {
                entered_sas: expected_sas,
                is_transfer_restricted: true,
                device_uid_to_keep_active: None,
            }),
        );
        states.push(waiting_for_proof);

        let names: Vec<_> = states.iter().map(SourceState::name).collect();
        assert_eq!(
            names,
            [
                "waiting_for_session_number",
                "waiting_for_target_connection",
                "waiting_for_target_seed",
                "waiting_for_sas_input",
                "waiting_for_keycloak_authentication_proof",
            ]
        );

        for state in states {
            let name = state.name();
            let (next, effects) = harness.step(state, SourceMessage::Abort);
            assert_eq!(next, SourceState::Final, "abort from {name}");
            let [query] = effects.queries.as_slice() else {
                panic!("expected exactly one query when aborting from {name}");
            };
            assert_eq!(query.query, ServerQuery::CloseWebsocketConnection);
            assert_eq!(query.reply, Reply::Discard);
            assert!(effects.events.is_empty());
        }

        // Aborting twice is harmless.
        let (next, effects) = harness.step(SourceState::Final, SourceMessage::Abort);
        assert_eq!(next, SourceState::Final);
        assert!(effects.is_empty());

        let (next, effects) = harness.step(SourceState::Initial, SourceMessage::Abort);
        assert_eq!(next, SourceState::Final);
        assert!(effects.is_empty());
    }

    #[test]
    fn waiting_states_repeat_their_relay_query() {
        let harness = Harness::new(10);
        let (states, _) = harness.visit_until_sas_input();
        let queries: Vec<_> = states.iter().map(SourceState::pending_query).collect();
        assert_eq!(queries, vec![
            Some(OutgoingQuery {
                query: ServerQuery::SourceGetSessionNumber,
                reply: Reply::SourceSessionNumber,
            }),
            Some(OutgoingQuery {
                query: ServerQuery::SourceWaitForTargetConnection,
                reply: Reply::SourceTargetConnection,
            }),
            Some(OutgoingQuery {
                query: ServerQuery::TransferWait {
                    connection_id: ConnectionId::new("target"),
                },
                reply: Reply::SourceTargetSeed,
            }),
            // The SAS comes from the user.
            None,
        ]);
    }

    #[test]
    fn unexpected_messages_are_ignored() {
        let harness = Harness::new(8);
        let (state, effects) = harness.step(
            SourceState::WaitingForSessionNumber,
            SourceMessage::TargetSeed(Ok(vec![1, 2, 3])),
        );
        assert_eq!(state, SourceState::WaitingForSessionNumber);
        assert!(effects.is_empty());

        let (state, effects) = harness.step(SourceState::Final, SourceMessage::Initiate);
        assert_eq!(state, SourceState::Final);
        assert!(effects.is_empty());
    }

    #[test]
    fn seed_for_other_identity_fails_decryption() {
        let harness = Harness::new(9);
        let (state, _) = harness.step(SourceState::Initial, SourceMessage::Initiate);
        let (state, _) = harness.step(
            state,
            SourceMessage::SessionNumber(Ok(SessionNumberResponse {
                source_connection_id: ConnectionId::new("source"),
                session_number: SessionNumber::new("12345678").unwrap(),
            })),
        );
        let (state, _) = harness.step(
            state,
            SourceMessage::TargetConnection(Ok(TargetConnectionResponse {
                target_connection_id: ConnectionId::new("target"),
                payload: encode_ephemeral_identity(harness.ephemeral.identity()),
            })),
        );

        // Sealed to the ephemeral identity instead of the transferred one.
        let envelope = harness.ephemeral.identity().seal(b"seed").unwrap();
        let (next, effects) = harness.step(state.clone(), SourceMessage::TargetSeed(Ok(envelope)));
        assert_eq!(next, state);
        assert_matches!(
            effects.events.as_slice(),
            [TransferEvent::ProtocolFailed {
                error: TransferError::Decryption(_),
                ..
            }]
        );
    }
}
