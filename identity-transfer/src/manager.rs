// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runs transfer protocol instances on behalf of the host application.
//!
//! All instances are driven by a single actor task which processes commands from the application
//! and responses from the relay one at a time. After every step the new protocol state is
//! persisted with the [`StateStore`] and the step's writes to the [`IdentityStore`] are committed,
//! before any of the step's effects leave the actor: relay queries, child protocol messages,
//! events and follow-up work. If either of the two fails the step is undone as a whole.
//!
//! Protocol states found in the [`StateStore`] on start are resumed, every waiting state asks the
//! relay again for what it was waiting on.
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};

use identity_transfer_crypto::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use identity_transfer_crypto::{CryptoIdentity, Rng, RngError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::config::Config;
use crate::context::{Effects, FollowUp, StepContext};
use crate::error::{BoxError, TransferError, boxed};
use crate::events::TransferEvent;
use crate::relay::{
    OutgoingQuery, RelayFailure, RelayTransport, Reply, ServerQuery, ServerResponse,
};
use crate::restoration::first_error;
use crate::source::{
    SasEntry, SessionNumberResponse, SourceMessage, SourceProtocol, SourceState,
    TargetConnectionResponse,
};
use crate::target::{EphemeralIdentityResponse, TargetMessage, TargetProtocol, TargetState};
use crate::traits::{IdentityStore, NetworkFetch, ProtocolStarter, SyncSnapshotDelegate};
use crate::types::{KeycloakTransferProofAndAuthState, ProtocolInstanceId, SessionNumber};

/// Persisted state of one protocol instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolState {
    Source {
        owned_identity: CryptoIdentity,
        state: SourceState,
    },
    Target {
        state: TargetState,
    },
}

impl ProtocolState {
    pub fn is_final(&self) -> bool {
        match self {
            ProtocolState::Source { state, .. } => state.is_final(),
            ProtocolState::Target { state } => state.is_final(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolState::Source { state, .. } => state.name(),
            ProtocolState::Target { state } => state.name(),
        }
    }

    fn pending_query(&self) -> Option<OutgoingQuery> {
        match self {
            ProtocolState::Source { state, .. } => state.pending_query(),
            ProtocolState::Target { state } => state.pending_query(),
        }
    }
}

/// Storage of protocol states, written after every step and before its effects are carried out.
pub trait StateStore {
    type Error: Error + Send + Sync + 'static;

    fn save_state(
        &self,
        instance_id: ProtocolInstanceId,
        state: &ProtocolState,
    ) -> Result<(), Self::Error>;

    /// Called once the instance reached its final state.
    fn remove_state(&self, instance_id: ProtocolInstanceId) -> Result<(), Self::Error>;

    /// Every saved and not yet removed state, read once when the manager starts.
    fn load_states(&self) -> Result<Vec<(ProtocolInstanceId, ProtocolState)>, Self::Error>;
}

impl<T> StateStore for Arc<T>
where
    T: StateStore + ?Sized,
{
    type Error = T::Error;

    fn save_state(
        &self,
        instance_id: ProtocolInstanceId,
        state: &ProtocolState,
    ) -> Result<(), Self::Error> {
        self.as_ref().save_state(instance_id, state)
    }

    fn remove_state(&self, instance_id: ProtocolInstanceId) -> Result<(), Self::Error> {
        self.as_ref().remove_state(instance_id)
    }

    fn load_states(&self) -> Result<Vec<(ProtocolInstanceId, ProtocolState)>, Self::Error> {
        self.as_ref().load_states()
    }
}

/// Keeps CBOR encoded protocol states in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<ProtocolInstanceId, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(
        &self,
        instance_id: &ProtocolInstanceId,
    ) -> Result<Option<ProtocolState>, MemoryStateStoreError> {
        let states = self
            .states
            .lock()
            .map_err(|_| MemoryStateStoreError::LockPoisoned)?;
        states
            .get(instance_id)
            .map(|bytes| decode_cbor(bytes).map_err(MemoryStateStoreError::from))
            .transpose()
    }

    pub fn len(&self) -> usize {
        self.states.lock().map(|states| states.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateStore for MemoryStateStore {
    type Error = MemoryStateStoreError;

    fn save_state(
        &self,
        instance_id: ProtocolInstanceId,
        state: &ProtocolState,
    ) -> Result<(), Self::Error> {
        let bytes = encode_cbor(state)?;
        self.states
            .lock()
            .map_err(|_| MemoryStateStoreError::LockPoisoned)?
            .insert(instance_id, bytes);
        Ok(())
    }

    fn remove_state(&self, instance_id: ProtocolInstanceId) -> Result<(), Self::Error> {
        self.states
            .lock()
            .map_err(|_| MemoryStateStoreError::LockPoisoned)?
            .remove(&instance_id);
        Ok(())
    }

    fn load_states(&self) -> Result<Vec<(ProtocolInstanceId, ProtocolState)>, Self::Error> {
        let states = self
            .states
            .lock()
            .map_err(|_| MemoryStateStoreError::LockPoisoned)?;
        states
            .iter()
            .map(|(instance_id, bytes)| Ok((*instance_id, decode_cbor(bytes)?)))
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum MemoryStateStoreError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("state store lock poisoned")]
    LockPoisoned,
}

/// Capabilities of the host application used by the protocols.
pub struct Delegates<I, P, N, Y> {
    pub identity_store: Arc<I>,
    pub protocol_starter: Arc<P>,
    pub network_fetch: Arc<N>,
    pub sync_snapshot: Arc<Y>,
}

impl<I, P, N, Y> Clone for Delegates<I, P, N, Y> {
    fn clone(&self) -> Self {
        Self {
            identity_store: self.identity_store.clone(),
            protocol_starter: self.protocol_starter.clone(),
            network_fetch: self.network_fetch.clone(),
            sync_snapshot: self.sync_snapshot.clone(),
        }
    }
}

#[derive(Debug)]
enum ToTransferActor {
    InitiateOnSource {
        instance_id: ProtocolInstanceId,
        owned_identity: CryptoIdentity,
    },
    InitiateOnTarget {
        instance_id: ProtocolInstanceId,
        device_name: String,
        session_number: SessionNumber,
    },
    EnterSessionNumber {
        instance_id: ProtocolInstanceId,
        session_number: SessionNumber,
    },
    SubmitSas {
        instance_id: ProtocolInstanceId,
        entry: SasEntry,
    },
    SubmitKeycloakProof {
        instance_id: ProtocolInstanceId,
        proof: KeycloakTransferProofAndAuthState,
    },
    Abort {
        instance_id: ProtocolInstanceId,
    },
}

#[derive(Debug)]
enum ProtocolMessage {
    Source(SourceMessage),
    Target(TargetMessage),
}

/// Turns a relay response into the message the waiting state expects.
///
/// Responses of an unexpected kind become relay failures of that message.
fn route_response(reply: Reply, response: ServerResponse) -> Option<ProtocolMessage> {
    let message = match (reply, response) {
        (Reply::Discard, _) => return None,
        (
            Reply::SourceSessionNumber,
            ServerResponse::SessionNumber {
                source_connection_id,
                session_number,
            },
        ) => ProtocolMessage::Source(SourceMessage::SessionNumber(Ok(SessionNumberResponse {
            source_connection_id,
            session_number,
        }))),
        (Reply::SourceSessionNumber, _) => {
            ProtocolMessage::Source(SourceMessage::SessionNumber(Err(RelayFailure)))
        }
        (
            Reply::SourceTargetConnection,
            ServerResponse::TargetConnection {
                target_connection_id,
                payload,
            },
        ) => ProtocolMessage::Source(SourceMessage::TargetConnection(Ok(
            TargetConnectionResponse {
                target_connection_id,
                payload,
            },
        ))),
        (Reply::SourceTargetConnection, _) => {
            ProtocolMessage::Source(SourceMessage::TargetConnection(Err(RelayFailure)))
        }
        (Reply::SourceTargetSeed, response) => {
            ProtocolMessage::Source(SourceMessage::TargetSeed(payload(response)))
        }
        (Reply::SourceKeycloakProof, response) => {
            ProtocolMessage::Source(SourceMessage::KeycloakProof(payload(response)))
        }
        (Reply::TargetTransferredIdentity, response) => {
            let response = match response {
                ServerResponse::EphemeralIdentityAccepted {
                    other_connection_id,
                    payload,
                } => EphemeralIdentityResponse::Accepted {
                    other_connection_id,
                    payload,
                },
                ServerResponse::IncorrectSessionNumber => {
                    EphemeralIdentityResponse::IncorrectSessionNumber
                }
                _ => EphemeralIdentityResponse::Failed,
            };
            ProtocolMessage::Target(TargetMessage::TransferredIdentity(response))
        }
        (Reply::TargetDecommitment, response) => {
            ProtocolMessage::Target(TargetMessage::Decommitment(payload(response)))
        }
        (Reply::TargetSnapshot, response) => {
            ProtocolMessage::Target(TargetMessage::Snapshot(payload(response)))
        }
    };
    Some(message)
}

fn payload(response: ServerResponse) -> Result<Vec<u8>, RelayFailure> {
    match response {
        ServerResponse::Payload(payload) => Ok(payload),
        _ => Err(RelayFailure),
    }
}

/// Handle to the transfer actor.
///
/// The actor stops once every handle was dropped.
#[derive(Clone, Debug)]
pub struct TransferManager {
    actor_tx: mpsc::Sender<ToTransferActor>,
    rng: Arc<Rng>,
}

impl TransferManager {
    /// Spawns the actor on the current tokio runtime and returns the receiving end of its events.
    ///
    /// Protocol instances left in the state store by an earlier manager continue where they
    /// stopped.
    pub fn spawn<R, I, P, N, Y, S>(
        config: Config,
        relay: Arc<R>,
        delegates: Delegates<I, P, N, Y>,
        state_store: S,
        rng: Arc<Rng>,
    ) -> Result<(Self, mpsc::Receiver<TransferEvent>), ManagerError>
    where
        R: RelayTransport + 'static,
        I: IdentityStore + Send + Sync + 'static,
        P: ProtocolStarter + Send + Sync + 'static,
        N: NetworkFetch + 'static,
        Y: SyncSnapshotDelegate + 'static,
        S: StateStore + Send + Sync + 'static,
    {
        let protocols: HashMap<_, _> = state_store
            .load_states()
            .map_err(|err| ManagerError::StateStore(boxed(err)))?
            .into_iter()
            .collect();

        let (actor_tx, inbox) = mpsc::channel(config.inbound_channel_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity);

        let actor = TransferActor {
            config,
            relay,
            delegates,
            state_store,
            rng: rng.clone(),
            protocols,
            inbox,
            pending_queries: JoinSet::new(),
            events_tx,
        };
        tokio::task::spawn(actor.run());

        Ok((Self { actor_tx, rng }, events_rx))
    }

    /// Starts giving away `owned_identity`. A [`TransferEvent::SessionNumberReady`] follows.
    pub async fn initiate_on_source(
        &self,
        owned_identity: CryptoIdentity,
    ) -> Result<ProtocolInstanceId, ManagerError> {
        let instance_id = ProtocolInstanceId::random(&self.rng)?;
        self.send(ToTransferActor::InitiateOnSource {
            instance_id,
            owned_identity,
        })
        .await?;
        Ok(instance_id)
    }

    /// Starts receiving an identity using the session number shown on the source device.
    pub async fn initiate_on_target(
        &self,
        device_name: impl Into<String>,
        session_number: SessionNumber,
    ) -> Result<ProtocolInstanceId, ManagerError> {
        let instance_id = ProtocolInstanceId::random(&self.rng)?;
        self.send(ToTransferActor::InitiateOnTarget {
            instance_id,
            device_name: device_name.into(),
            session_number,
        })
        .await?;
        Ok(instance_id)
    }

    /// Tries another session number after [`TransferEvent::IncorrectSessionNumberEntered`].
    pub async fn enter_session_number(
        &self,
        instance_id: ProtocolInstanceId,
        session_number: SessionNumber,
    ) -> Result<(), ManagerError> {
        self.send(ToTransferActor::EnterSessionNumber {
            instance_id,
            session_number,
        })
        .await
    }

    pub async fn submit_sas(
        &self,
        instance_id: ProtocolInstanceId,
        entry: SasEntry,
    ) -> Result<(), ManagerError> {
        self.send(ToTransferActor::SubmitSas { instance_id, entry })
            .await
    }

    pub async fn submit_keycloak_proof(
        &self,
        instance_id: ProtocolInstanceId,
        proof: KeycloakTransferProofAndAuthState,
    ) -> Result<(), ManagerError> {
        self.send(ToTransferActor::SubmitKeycloakProof { instance_id, proof })
            .await
    }

    /// Ends the protocol instance. Aborting an instance which already ended does nothing.
    pub async fn abort(&self, instance_id: ProtocolInstanceId) -> Result<(), ManagerError> {
        self.send(ToTransferActor::Abort { instance_id }).await
    }

    async fn send(&self, msg: ToTransferActor) -> Result<(), ManagerError> {
        self.actor_tx
            .send(msg)
            .await
            .map_err(|_| ManagerError::Stopped)
    }
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("transfer manager stopped")]
    Stopped,

    #[error("could not load protocol states: {0}")]
    StateStore(BoxError),
}

struct TransferActor<R, I, P, N, Y, S> {
    config: Config,
    relay: Arc<R>,
    delegates: Delegates<I, P, N, Y>,
    state_store: S,
    rng: Arc<Rng>,
    protocols: HashMap<ProtocolInstanceId, ProtocolState>,
    inbox: mpsc::Receiver<ToTransferActor>,

    /// Relay queries in flight. They are aborted together with the actor, a response nobody
    /// processes anymore stays with the relay.
    pending_queries: JoinSet<(ProtocolInstanceId, Reply, ServerResponse)>,

    events_tx: mpsc::Sender<TransferEvent>,
}

impl<R, I, P, N, Y, S> TransferActor<R, I, P, N, Y, S>
where
    R: RelayTransport + 'static,
    I: IdentityStore + Send + Sync + 'static,
    P: ProtocolStarter + Send + Sync + 'static,
    N: NetworkFetch + 'static,
    Y: SyncSnapshotDelegate + 'static,
    S: StateStore + Send + Sync + 'static,
{
    async fn run(mut self) {
        self.resume();

        loop {
            tokio::select! {
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    self.on_actor_message(msg).await;
                },
                Some(result) = self.pending_queries.join_next(), if !self.pending_queries.is_empty() => {
                    match result {
                        Ok((instance_id, reply, response)) => {
                            self.on_relay_response(instance_id, reply, response).await;
                        }
                        Err(err) => warn!("relay task failed: {err}"),
                    }
                },
            }
        }
        debug!("transfer actor stopped");
    }

    /// Asks the relay again for what the loaded protocol states wait on.
    fn resume(&mut self) {
        let pending: Vec<_> = self
            .protocols
            .iter()
            .filter_map(|(instance_id, state)| {
                debug!(instance = %instance_id, state = state.name(), "resume protocol");
                Some((*instance_id, state.pending_query()?))
            })
            .collect();
        for (instance_id, OutgoingQuery { query, reply }) in pending {
            self.execute_query(instance_id, query, reply);
        }
    }

    async fn on_relay_response(
        &mut self,
        instance_id: ProtocolInstanceId,
        reply: Reply,
        response: ServerResponse,
    ) {
        trace!(instance = %instance_id, ?reply, "relay responded");
        if let Some(message) = route_response(reply, response) {
            self.handle(instance_id, message).await;
        }
    }

    async fn on_actor_message(&mut self, msg: ToTransferActor) {
        let (instance_id, message) = match msg {
            ToTransferActor::InitiateOnSource {
                instance_id,
                owned_identity,
            } => {
                if !self.register(instance_id, ProtocolState::Source {
                    owned_identity,
                    state: SourceState::Initial,
                }) {
                    return;
                }
                (instance_id, ProtocolMessage::Source(SourceMessage::Initiate))
            }
            ToTransferActor::InitiateOnTarget {
                instance_id,
                device_name,
                session_number,
            } => {
                if !self.register(instance_id, ProtocolState::Target {
                    state: TargetState::Initial,
                }) {
                    return;
                }
                (
                    instance_id,
                    ProtocolMessage::Target(TargetMessage::Initiate {
                        device_name,
                        session_number,
                    }),
                )
            }
            ToTransferActor::EnterSessionNumber {
                instance_id,
                session_number,
            } => (
                instance_id,
                ProtocolMessage::Target(TargetMessage::SessionNumberEntered(session_number)),
            ),
            ToTransferActor::SubmitSas { instance_id, entry } => (
                instance_id,
                ProtocolMessage::Source(SourceMessage::SasEntered(entry)),
            ),
            ToTransferActor::SubmitKeycloakProof { instance_id, proof } => (
                instance_id,
                ProtocolMessage::Target(TargetMessage::KeycloakProof(proof)),
            ),
            ToTransferActor::Abort { instance_id } => {
                let message = match self.protocols.get(&instance_id) {
                    Some(ProtocolState::Source { .. }) => {
                        ProtocolMessage::Source(SourceMessage::Abort)
                    }
                    Some(ProtocolState::Target { .. }) => {
                        ProtocolMessage::Target(TargetMessage::Abort)
                    }
                    None => {
                        debug!(instance = %instance_id, "abort of finished protocol");
                        return;
                    }
                };
                (instance_id, message)
            }
        };
        self.handle(instance_id, message).await;
    }

    async fn handle(&mut self, instance_id: ProtocolInstanceId, message: ProtocolMessage) {
        let span = debug_span!("transfer", instance = %instance_id);
        let effects = span.in_scope(|| self.process(instance_id, message));
        if let Some(effects) = effects {
            self.flush(instance_id, effects).instrument(span).await;
        }
    }

    fn register(&mut self, instance_id: ProtocolInstanceId, state: ProtocolState) -> bool {
        if self.protocols.contains_key(&instance_id) {
            warn!(instance = %instance_id, "protocol instance already exists");
            return false;
        }
        self.protocols.insert(instance_id, state);
        true
    }

    /// Runs one step and commits its outcome. Returns the effects to carry out.
    fn process(
        &mut self,
        instance_id: ProtocolInstanceId,
        message: ProtocolMessage,
    ) -> Option<Effects> {
        let Some(current) = self.protocols.get(&instance_id) else {
            debug!(?message, "message for unknown protocol instance");
            return None;
        };

        let mut ctx = StepContext::new(instance_id, &self.rng);
        let next = match (current.clone(), message) {
            (
                ProtocolState::Source {
                    owned_identity,
                    state,
                },
                ProtocolMessage::Source(message),
            ) => {
                let protocol = SourceProtocol::new(
                    &owned_identity,
                    self.delegates.identity_store.as_ref(),
                    self.delegates.sync_snapshot.as_ref(),
                    &self.config,
                );
                let state = protocol.process(state, message, &mut ctx);
                ProtocolState::Source {
                    owned_identity,
                    state,
                }
            }
            (ProtocolState::Target { state }, ProtocolMessage::Target(message)) => {
                let protocol = TargetProtocol::new(
                    self.delegates.identity_store.as_ref(),
                    self.delegates.protocol_starter.as_ref(),
                    &self.config,
                );
                ProtocolState::Target {
                    state: protocol.process(state, message, &mut ctx),
                }
            }
            (current, message) => {
                debug!(state = current.name(), ?message, "message for the other role");
                return None;
            }
        };
        let effects = ctx.commit();
        if effects.failed {
            self.rollback_identity_store();
            return Some(effects);
        }

        let persisted = if next.is_final() {
            self.state_store.remove_state(instance_id)
        } else {
            self.state_store.save_state(instance_id, &next)
        };
        if let Err(err) = persisted {
            warn!("could not persist protocol state: {err}");
            self.rollback_identity_store();
            return Some(Self::failed(
                instance_id,
                TransferError::StateStore(boxed(err)),
            ));
        }

        if let Err(err) = self.delegates.identity_store.commit() {
            warn!("could not commit identity store: {err}");
            self.rollback_identity_store();
            // Put the previous state back so that store and instance agree again. Initial states
            // are never persisted.
            let restored = match current {
                ProtocolState::Source {
                    state: SourceState::Initial,
                    ..
                }
                | ProtocolState::Target {
                    state: TargetState::Initial,
                } => self.state_store.remove_state(instance_id),
                current => self.state_store.save_state(instance_id, current),
            };
            if let Err(err) = restored {
                warn!("could not restore previous protocol state: {err}");
            }
            return Some(Self::failed(
                instance_id,
                TransferError::IdentityStore(boxed(err)),
            ));
        }

        trace!(state = next.name(), "committed protocol state");
        if next.is_final() {
            self.protocols.remove(&instance_id);
        } else {
            self.protocols.insert(instance_id, next);
        }
        Some(effects)
    }

    fn rollback_identity_store(&self) {
        if let Err(err) = self.delegates.identity_store.rollback() {
            warn!("could not roll back identity store: {err}");
        }
    }

    /// Effects of a step which was undone, nothing of it leaves the actor.
    fn failed(instance_id: ProtocolInstanceId, error: TransferError) -> Effects {
        let mut effects = Effects {
            failed: true,
            ..Effects::default()
        };
        effects.events.push(TransferEvent::ProtocolFailed { instance_id, error });
        effects
    }

    async fn flush(&mut self, instance_id: ProtocolInstanceId, effects: Effects) {
        let Effects {
            queries,
            child_protocol_messages,
            events,
            follow_ups,
            ..
        } = effects;

        for message in child_protocol_messages {
            let kind = message.protocol.kind();
            if let Err(err) = self.delegates.protocol_starter.post(message) {
                warn!(kind, "could not post child protocol message: {err}");
            }
        }

        for OutgoingQuery { query, reply } in queries {
            self.execute_query(instance_id, query, reply);
        }

        for event in events {
            if self.events_tx.send(event).await.is_err() {
                debug!("event receiver dropped");
            }
        }

        for follow_up in follow_ups {
            self.spawn_follow_up(instance_id, follow_up);
        }
    }

    fn execute_query(
        &mut self,
        instance_id: ProtocolInstanceId,
        query: ServerQuery,
        reply: Reply,
    ) {
        let relay = self.relay.clone();
        let span = debug_span!("relay", instance = %instance_id, query = query.name());

        self.pending_queries.spawn(
            async move {
                let response = relay.execute(instance_id, query).await;
                (instance_id, reply, response)
            }
            .instrument(span),
        );
    }

    fn spawn_follow_up(&self, instance_id: ProtocolInstanceId, follow_up: FollowUp) {
        let span = debug_span!("follow_up", instance = %instance_id);
        match follow_up {
            FollowUp::UpdateOwnedIdentities(identities) => {
                let network_fetch = self.delegates.network_fetch.clone();
                tokio::task::spawn(
                    async move {
                        if let Err(err) = network_fetch.update_owned_identities(identities).await {
                            warn!("could not update owned identities: {err}");
                        }
                    }
                    .instrument(span),
                );
            }
            FollowUp::CompleteTransfer {
                transferred_identity,
                app_node,
                device_uid_to_keep_active,
                mut errors,
            } => {
                let sync_snapshot = self.delegates.sync_snapshot.clone();
                let events_tx = self.events_tx.clone();
                tokio::task::spawn(
                    async move {
                        if let Err(err) =
                            sync_snapshot.apply_app_node(&transferred_identity, app_node).await
                        {
                            warn!("could not apply app node: {err}");
                            errors.push(TransferError::SyncSnapshot(boxed(err)));
                        }

                        if let Some(device_uid) = device_uid_to_keep_active {
                            if let Err(err) = sync_snapshot
                                .request_keep_device_active(&transferred_identity, device_uid)
                                .await
                            {
                                warn!(%device_uid, "could not keep device active: {err}");
                                errors.push(TransferError::SyncSnapshot(boxed(err)));
                            }
                        }

                        let event = TransferEvent::SuccessfulTransfer {
                            instance_id,
                            transferred_identity,
                            post_transfer_error: first_error(errors.into_iter().map(Err)),
                        };
                        if events_tx.send(event).await.is_err() {
                            debug!("event receiver dropped");
                        }
                    }
                    .instrument(span),
                );
            }
        }
    }
}
