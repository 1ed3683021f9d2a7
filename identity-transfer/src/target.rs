// SPDX-License-Identifier: MIT OR Apache-2.0

//! State machine of the device receiving a copy of an owned identity.
//!
//! The target never learns anything secret before the user compared the SAS: it announces an
//! ephemeral identity, answers the source's commitment with its own seed and only receives the
//! snapshot once the user entered the SAS on the source device.
use identity_transfer_crypto::{
    Commitment, CryptoIdentity, IdentityKeyPair, MacKey, Seed, compute_sas, derive_seed, open,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Config;
use crate::context::{FollowUp, StepContext};
use crate::error::{TransferError, boxed};
use crate::events::TransferEvent;
use crate::payload::{
    DecommitmentPayload, Payload, SnapshotContainer, SnapshotResponse, TargetSeedPayload,
    TransferredIdentityPayload, encode_ephemeral_identity, encode_keycloak_proof,
};
use crate::relay::{OutgoingQuery, RelayFailure, RelayResult, Reply, ServerQuery};
use crate::restoration::{RestorationHelper, RestorationOutcome, RestorationRequest};
use crate::traits::{IdentityStore, ProtocolStarter};
use crate::types::{
    ConnectionId, FullSas, KeycloakTransferProofAndAuthState, KeycloakTransferProofElements,
    SessionNumber,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetState {
    Initial,
    WaitingForTransferredIdentity(WaitingForTransferredIdentity),
    WaitingForDecommitment(WaitingForDecommitment),
    WaitingForSnapshot(WaitingForSnapshot),
    WaitingForKeycloakAuthenticationProofMessageToSend(
        WaitingForKeycloakAuthenticationProofMessageToSend,
    ),
    Final,
}

impl TargetState {
    pub fn name(&self) -> &'static str {
        match self {
            TargetState::Initial => "initial",
            TargetState::WaitingForTransferredIdentity(_) => "waiting_for_transferred_identity",
            TargetState::WaitingForDecommitment(_) => "waiting_for_decommitment",
            TargetState::WaitingForSnapshot(_) => "waiting_for_snapshot",
            TargetState::WaitingForKeycloakAuthenticationProofMessageToSend(_) => {
                "waiting_for_keycloak_authentication_proof_message_to_send"
            }
            TargetState::Final => "final",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, TargetState::Final)
    }

    /// Relay query the state waits on, issued again when a persisted state is resumed.
    ///
    /// A target still waiting for the transferred identity announces its ephemeral identity once
    /// more. The relay refuses it when the session was claimed already, the user is then asked
    /// for a new session number.
    pub fn pending_query(&self) -> Option<OutgoingQuery> {
        let (query, reply) = match self {
            TargetState::WaitingForTransferredIdentity(waiting) => (
                ServerQuery::TargetSendEphemeralIdentity {
                    session_number: waiting.session_number.clone(),
                    payload: encode_ephemeral_identity(waiting.ephemeral.identity()),
                },
                Reply::TargetTransferredIdentity,
            ),
            TargetState::WaitingForDecommitment(waiting) => (
                ServerQuery::TransferWait {
                    connection_id: waiting.other_connection_id.clone(),
                },
                Reply::TargetDecommitment,
            ),
            TargetState::WaitingForSnapshot(waiting) => (
                ServerQuery::TransferWait {
                    connection_id: waiting.other_connection_id.clone(),
                },
                Reply::TargetSnapshot,
            ),
            TargetState::Initial
            | TargetState::WaitingForKeycloakAuthenticationProofMessageToSend(_)
            | TargetState::Final => return None,
        };
        Some(OutgoingQuery { query, reply })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForTransferredIdentity {
    pub device_name: String,
    pub session_number: SessionNumber,
    pub ephemeral: IdentityKeyPair,
    pub mac_key: MacKey,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForDecommitment {
    pub device_name: String,
    pub session_number: SessionNumber,
    pub ephemeral: IdentityKeyPair,
    pub transferred_identity: CryptoIdentity,
    pub other_connection_id: ConnectionId,
    pub commitment: Commitment,
    pub seed_target_for_sas: Seed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForSnapshot {
    pub device_name: String,
    pub session_number: SessionNumber,
    pub ephemeral: IdentityKeyPair,
    pub transferred_identity: CryptoIdentity,
    pub other_connection_id: ConnectionId,
    pub full_sas: FullSas,

    /// Keycloak session opened on this device, present once a restricted transfer was approved.
    pub raw_auth_state: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingForKeycloakAuthenticationProofMessageToSend {
    pub device_name: String,
    pub session_number: SessionNumber,
    pub ephemeral: IdentityKeyPair,
    pub transferred_identity: CryptoIdentity,
    pub other_connection_id: ConnectionId,
    pub full_sas: FullSas,
}

/// Outcome of announcing the ephemeral identity under a session number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EphemeralIdentityResponse {
    Accepted {
        other_connection_id: ConnectionId,
        payload: Vec<u8>,
    },
    IncorrectSessionNumber,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetMessage {
    Initiate {
        device_name: String,
        session_number: SessionNumber,
    },

    /// The user entered another session number after the relay rejected the previous one.
    SessionNumberEntered(SessionNumber),

    TransferredIdentity(EphemeralIdentityResponse),
    Decommitment(RelayResult<Vec<u8>>),
    Snapshot(RelayResult<Vec<u8>>),
    KeycloakProof(KeycloakTransferProofAndAuthState),
    Abort,
}

impl TargetMessage {
    pub fn name(&self) -> &'static str {
        match self {
            TargetMessage::Initiate { .. } => "initiate",
            TargetMessage::SessionNumberEntered(_) => "session_number_entered",
            TargetMessage::TransferredIdentity(_) => "transferred_identity",
            TargetMessage::Decommitment(_) => "decommitment",
            TargetMessage::Snapshot(_) => "snapshot",
            TargetMessage::KeycloakProof(_) => "keycloak_proof",
            TargetMessage::Abort => "abort",
        }
    }
}

pub struct TargetProtocol<'a, I, P> {
    identity_store: &'a I,
    protocol_starter: &'a P,
    config: &'a Config,
}

impl<'a, I, P> TargetProtocol<'a, I, P>
where
    I: IdentityStore,
    P: ProtocolStarter,
{
    pub fn new(identity_store: &'a I, protocol_starter: &'a P, config: &'a Config) -> Self {
        Self {
            identity_store,
            protocol_starter,
            config,
        }
    }

    /// Runs one step and returns the next state.
    ///
    /// A failing step reports the error through the context and leaves the state as it was.
    /// Messages the current state does not expect are ignored.
    pub fn process(
        &self,
        state: TargetState,
        message: TargetMessage,
        ctx: &mut StepContext,
    ) -> TargetState {
        let message_name = message.name();
        let result = match (&state, message) {
            (
                TargetState::Initial,
                TargetMessage::Initiate {
                    device_name,
                    session_number,
                },
            ) => self.initiate(ctx, device_name, session_number),
            (
                TargetState::WaitingForTransferredIdentity(waiting),
                TargetMessage::SessionNumberEntered(session_number),
            ) => self.retry_session_number(ctx, waiting, session_number),
            (
                TargetState::WaitingForTransferredIdentity(waiting),
                TargetMessage::TransferredIdentity(response),
            ) => self.on_transferred_identity(ctx, waiting, response),
            (
                TargetState::WaitingForDecommitment(waiting),
                TargetMessage::Decommitment(response),
            ) => self.on_decommitment(ctx, waiting, response),
            (TargetState::WaitingForSnapshot(waiting), TargetMessage::Snapshot(response)) => {
                self.on_snapshot_response(ctx, waiting, response)
            }
            (
                TargetState::WaitingForKeycloakAuthenticationProofMessageToSend(waiting),
                TargetMessage::KeycloakProof(proof),
            ) => self.send_keycloak_proof(ctx, waiting, proof),
            (TargetState::Final, TargetMessage::Abort) => Ok(TargetState::Final),
            (TargetState::Initial, TargetMessage::Abort) => Ok(TargetState::Final),
            (_, TargetMessage::Abort) => {
                ctx.send_query(ServerQuery::CloseWebsocketConnection, Reply::Discard);
                Ok(TargetState::Final)
            }
            (_, _) => {
                debug!(
                    instance = %ctx.instance_id(),
                    state = state.name(),
                    message = message_name,
                    "ignore unexpected message on target"
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
                    "target step"
                );
                next
            }
            Err(err) => {
                debug!(
                    instance = %ctx.instance_id(),
                    state = state.name(),
                    message = message_name,
                    "target step failed: {err}"
                );
                ctx.fail(err);
                state
            }
        }
    }

    fn initiate(
        &self,
        ctx: &mut StepContext,
        device_name: String,
        session_number: SessionNumber,
    ) -> Result<TargetState, TransferError> {
        let ephemeral = IdentityKeyPair::generate(ctx.rng())?;
        let mac_key = MacKey::random(ctx.rng())?;

        ctx.send_query(
            ServerQuery::TargetSendEphemeralIdentity {
                session_number: session_number.clone(),
                payload: encode_ephemeral_identity(ephemeral.identity()),
            },
            Reply::TargetTransferredIdentity,
        );

        Ok(TargetState::WaitingForTransferredIdentity(
            WaitingForTransferredIdentity {
                device_name,
                session_number,
                ephemeral,
                mac_key,
            },
        ))
    }

    fn retry_session_number(
        &self,
        ctx: &mut StepContext,
        waiting: &WaitingForTransferredIdentity,
        session_number: SessionNumber,
    ) -> Result<TargetState, TransferError> {
        ctx.send_query(
            ServerQuery::TargetSendEphemeralIdentity {
                session_number: session_number.clone(),
                payload: encode_ephemeral_identity(waiting.ephemeral.identity()),
            },
            Reply::TargetTransferredIdentity,
        );

        Ok(TargetState::WaitingForTransferredIdentity(
            WaitingForTransferredIdentity {
                session_number,
                ..waiting.clone()
            },
        ))
    }

    fn on_transferred_identity(
        &self,
        ctx: &mut StepContext,
        waiting: &WaitingForTransferredIdentity,
        response: EphemeralIdentityResponse,
    ) -> Result<TargetState, TransferError> {
        let (other_connection_id, envelope) = match response {
            EphemeralIdentityResponse::Accepted {
                other_connection_id,
                payload,
            } => (other_connection_id, payload),
            EphemeralIdentityResponse::IncorrectSessionNumber => {
                ctx.notify(TransferEvent::IncorrectSessionNumberEntered {
                    instance_id: ctx.instance_id(),
                });
                return Ok(TargetState::WaitingForTransferredIdentity(waiting.clone()));
            }
            EphemeralIdentityResponse::Failed => {
                return Err(RelayFailure.into());
            }
        };

        let cleartext = waiting
            .ephemeral
            .open(&envelope)
            .map_err(|err| TransferError::Decryption(boxed(err)))?;
        let TransferredIdentityPayload {
            source_connection_id,
            transferred_identity,
            commitment,
        } = TransferredIdentityPayload::from_bytes(&cleartext)?;

        if source_connection_id != other_connection_id {
            return Err(TransferError::ConnectionIdMismatch);
        }

        let is_owned = self
            .identity_store
            .is_owned(&transferred_identity)
            .map_err(|err| TransferError::IdentityStore(boxed(err)))?;
        if is_owned {
            return Err(TransferError::IdentityAlreadyOwned);
        }

        let seed_target_for_sas = derive_seed(&commitment, &waiting.mac_key)?;
        let payload = transferred_identity
            .seal(
                &TargetSeedPayload {
                    device_name: waiting.device_name.clone(),
                    seed: seed_target_for_sas.clone(),
                }
                .to_bytes()?,
            )
            .map_err(TransferError::Encryption)?;

        // The source answers the seed with its decommitment.
        ctx.send_query(
            ServerQuery::TransferRelay {
                connection_id: other_connection_id.clone(),
                payload,
                then_close_websocket: false,
            },
            Reply::TargetDecommitment,
        );

        Ok(TargetState::WaitingForDecommitment(WaitingForDecommitment {
            device_name: waiting.device_name.clone(),
            session_number: waiting.session_number.clone(),
            ephemeral: waiting.ephemeral.clone(),
            transferred_identity,
            other_connection_id,
            commitment,
            seed_target_for_sas,
        }))
    }

    fn on_decommitment(
        &self,
        ctx: &mut StepContext,
        waiting: &WaitingForDecommitment,
        response: RelayResult<Vec<u8>>,
    ) -> Result<TargetState, TransferError> {
        let envelope = response?;
        let cleartext = waiting
            .ephemeral
            .open(&envelope)
            .map_err(|err| TransferError::Decryption(boxed(err)))?;
        let DecommitmentPayload(decommitment) = DecommitmentPayload::from_bytes(&cleartext)?;

        let seed_source_for_sas = Seed::from_slice(&open(
            &waiting.commitment,
            &waiting.transferred_identity.to_bytes(),
            &decommitment,
        )?)?;
        let full_sas = FullSas::new(compute_sas(
            &seed_source_for_sas,
            &waiting.seed_target_for_sas,
            waiting.ephemeral.identity(),
            self.config.full_sas_digits(),
        )?)?;

        ctx.notify(TransferEvent::SasReady {
            instance_id: ctx.instance_id(),
            sas: full_sas.clone(),
        });
        ctx.send_query(
            ServerQuery::TransferWait {
                connection_id: waiting.other_connection_id.clone(),
            },
            Reply::TargetSnapshot,
        );

        Ok(TargetState::WaitingForSnapshot(WaitingForSnapshot {
            device_name: waiting.device_name.clone(),
            session_number: waiting.session_number.clone(),
            ephemeral: waiting.ephemeral.clone(),
            transferred_identity: waiting.transferred_identity,
            other_connection_id: waiting.other_connection_id.clone(),
            full_sas,
            raw_auth_state: None,
        }))
    }

    fn on_snapshot_response(
        &self,
        ctx: &mut StepContext,
        waiting: &WaitingForSnapshot,
        response: RelayResult<Vec<u8>>,
    ) -> Result<TargetState, TransferError> {
        let envelope = response?;
        let cleartext = waiting
            .ephemeral
            .open(&envelope)
            .map_err(|err| TransferError::Decryption(boxed(err)))?;

        match SnapshotResponse::from_bytes(&cleartext)? {
            SnapshotResponse::Snapshot(container) => self.restore(ctx, waiting, container),
            SnapshotResponse::KeycloakConfiguration(configuration) => {
                ctx.notify(TransferEvent::KeycloakAuthenticationRequired {
                    instance_id: ctx.instance_id(),
                    configuration,
                    proof_elements: KeycloakTransferProofElements {
                        session_number: waiting.session_number.clone(),
                        sas: waiting.full_sas.clone(),
                    },
                });
                Ok(TargetState::WaitingForKeycloakAuthenticationProofMessageToSend(
                    WaitingForKeycloakAuthenticationProofMessageToSend {
                        device_name: waiting.device_name.clone(),
                        session_number: waiting.session_number.clone(),
                        ephemeral: waiting.ephemeral.clone(),
                        transferred_identity: waiting.transferred_identity,
                        other_connection_id: waiting.other_connection_id.clone(),
                        full_sas: waiting.full_sas.clone(),
                    },
                ))
            }
        }
    }

    fn restore(
        &self,
        ctx: &mut StepContext,
        waiting: &WaitingForSnapshot,
        container: SnapshotContainer,
    ) -> Result<TargetState, TransferError> {
        ctx.notify(TransferEvent::ProcessingReceivedSnapshot {
            instance_id: ctx.instance_id(),
        });

        let SnapshotContainer {
            snapshot,
            device_uid_to_keep_active,
        } = container;
        let outcome = RestorationHelper::new(self.identity_store, self.protocol_starter)
            .perform_restoration(ctx, RestorationRequest {
                transferred_identity: &waiting.transferred_identity,
                identity_node: &snapshot.identity_node,
                device_name: &waiting.device_name,
                raw_auth_state: waiting.raw_auth_state.as_deref(),
            });
        let errors = match outcome {
            RestorationOutcome::Success => Vec::new(),
            RestorationOutcome::DefinitiveError(err) => return Err(err.into()),
            RestorationOutcome::NonDefinitiveErrors(errors) => {
                errors.into_iter().map(TransferError::from).collect()
            }
        };

        ctx.send_query(ServerQuery::CloseWebsocketConnection, Reply::Discard);
        ctx.follow_up(FollowUp::CompleteTransfer {
            transferred_identity: waiting.transferred_identity,
            app_node: snapshot.app_node,
            device_uid_to_keep_active,
            errors,
        });

        Ok(TargetState::Final)
    }

    fn send_keycloak_proof(
        &self,
        ctx: &mut StepContext,
        waiting: &WaitingForKeycloakAuthenticationProofMessageToSend,
        proof: KeycloakTransferProofAndAuthState,
    ) -> Result<TargetState, TransferError> {
        let KeycloakTransferProofAndAuthState {
            proof,
            raw_auth_state,
        } = proof;
        let payload = waiting
            .transferred_identity
            .seal(&encode_keycloak_proof(&proof))
            .map_err(TransferError::Encryption)?;

        // The source answers a valid proof with the snapshot.
        ctx.send_query(
            ServerQuery::TransferRelay {
                connection_id: waiting.other_connection_id.clone(),
                payload,
                then_close_websocket: false,
            },
            Reply::TargetSnapshot,
        );

        Ok(TargetState::WaitingForSnapshot(WaitingForSnapshot {
            device_name: waiting.device_name.clone(),
            session_number: waiting.session_number.clone(),
            ephemeral: waiting.ephemeral.clone(),
            transferred_identity: waiting.transferred_identity,
            other_connection_id: waiting.other_connection_id.clone(),
            full_sas: waiting.full_sas.clone(),
            raw_auth_state: Some(raw_auth_state),
        }))
    }
}
