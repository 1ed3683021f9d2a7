// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use identity_transfer_crypto::Rng;
use tokio::sync::oneshot;
use tracing::trace;

use crate::relay::{RelayTransport, ServerQuery, ServerResponse};
use crate::types::{ConnectionId, ProtocolInstanceId, SessionNumber};

const SESSION_NUMBER_DIGITS: usize = 8;

/// Transfer relay server living in memory, shared by both devices of a test.
///
/// Every protocol instance owns at most one connection. Payloads relayed to a connection are
/// queued until its owner waits for them, a new wait replaces an older one. A payload leaves the
/// queue only once a waiter picks it up, so nothing is lost when a waiter goes away.
#[derive(Debug)]
pub struct MemoryRelay {
    rng: Arc<Rng>,
    inner: Mutex<RelayInner>,
}

#[derive(Debug, Default)]
struct RelayInner {
    next_connection: u64,
    sessions: HashMap<SessionNumber, Session>,
    mailboxes: HashMap<ConnectionId, Mailbox>,
    connections: HashMap<ProtocolInstanceId, ConnectionId>,
}

#[derive(Debug)]
struct Session {
    source_connection_id: ConnectionId,
    waiting_source: Option<oneshot::Sender<ServerResponse>>,
    pending_target: Option<ServerResponse>,
    claimed: bool,
}

#[derive(Debug, Default)]
struct Mailbox {
    queued: VecDeque<Vec<u8>>,

    /// Woken once a payload is queued.
    waiter: Option<oneshot::Sender<()>>,
}

/// Registered wait for the next payload of a connection.
struct Waiting {
    connection_id: ConnectionId,
    rx: oneshot::Receiver<()>,
}

enum Outcome {
    Ready(ServerResponse),
    TargetConnection(oneshot::Receiver<ServerResponse>),
    Payload(Waiting),
    FirstPayload {
        other_connection_id: ConnectionId,
        waiting: Waiting,
    },
}

impl MemoryRelay {
    pub fn new(rng: Arc<Rng>) -> Self {
        Self {
            rng,
            inner: Mutex::new(RelayInner::default()),
        }
    }

    async fn receive(&self, waiting: Waiting) -> Option<Vec<u8>> {
        waiting.rx.await.ok()?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .mailboxes
            .get_mut(&waiting.connection_id)?
            .queued
            .pop_front()
    }

    /// Connections which were opened and not closed yet.
    pub fn open_connections(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    fn handle(&self, instance_id: ProtocolInstanceId, query: ServerQuery) -> Outcome {
        let mut inner = self.inner.lock().unwrap();
        match query {
            ServerQuery::SourceGetSessionNumber => {
                let session_number = loop {
                    let Ok(digits) = self.rng.random_digits(SESSION_NUMBER_DIGITS) else {
                        return Outcome::Ready(ServerResponse::Failed);
                    };
                    let Ok(session_number) = SessionNumber::new(digits) else {
                        return Outcome::Ready(ServerResponse::Failed);
                    };
                    if !inner.sessions.contains_key(&session_number) {
                        break session_number;
                    }
                };
                let source_connection_id = inner.open(instance_id);
                inner.sessions.insert(session_number.clone(), Session {
                    source_connection_id: source_connection_id.clone(),
                    waiting_source: None,
                    pending_target: None,
                    claimed: false,
                });
                Outcome::Ready(ServerResponse::SessionNumber {
                    source_connection_id,
                    session_number,
                })
            }
            ServerQuery::SourceWaitForTargetConnection => {
                let Some(own) = inner.connections.get(&instance_id).cloned() else {
                    return Outcome::Ready(ServerResponse::Failed);
                };
                let Some(session) = inner
                    .sessions
                    .values_mut()
                    .find(|session| session.source_connection_id == own)
                else {
                    return Outcome::Ready(ServerResponse::Failed);
                };
                if let Some(response) = session.pending_target.take() {
                    return Outcome::Ready(response);
                }
                let (tx, rx) = oneshot::channel();
                session.waiting_source = Some(tx);
                Outcome::TargetConnection(rx)
            }
            ServerQuery::TargetSendEphemeralIdentity {
                session_number,
                payload,
            } => {
                let is_open = inner
                    .sessions
                    .get(&session_number)
                    .is_some_and(|session| !session.claimed);
                if !is_open {
                    return Outcome::Ready(ServerResponse::IncorrectSessionNumber);
                }

                let target_connection_id = inner.open(instance_id);
                let Some(session) = inner.sessions.get_mut(&session_number) else {
                    return Outcome::Ready(ServerResponse::IncorrectSessionNumber);
                };
                session.claimed = true;
                let other_connection_id = session.source_connection_id.clone();
                let response = ServerResponse::TargetConnection {
                    target_connection_id: target_connection_id.clone(),
                    payload,
                };
                match session.waiting_source.take() {
                    Some(tx) => {
                        if let Err(response) = tx.send(response) {
                            session.pending_target = Some(response);
                        }
                    }
                    None => session.pending_target = Some(response),
                }

                match inner.wait(&target_connection_id) {
                    Some(waiting) => Outcome::FirstPayload {
                        other_connection_id,
                        waiting,
                    },
                    None => Outcome::Ready(ServerResponse::Failed),
                }
            }
            ServerQuery::TransferRelay {
                connection_id,
                payload,
                then_close_websocket,
            } => {
                let Some(own) = inner.connections.get(&instance_id).cloned() else {
                    return Outcome::Ready(ServerResponse::Failed);
                };
                let Some(mailbox) = inner.mailboxes.get_mut(&connection_id) else {
                    return Outcome::Ready(ServerResponse::Failed);
                };
                mailbox.deliver(payload);

                if then_close_websocket {
                    inner.close(instance_id);
                    return Outcome::Ready(ServerResponse::Ack);
                }
                match inner.wait(&own) {
                    Some(waiting) => Outcome::Payload(waiting),
                    None => Outcome::Ready(ServerResponse::Failed),
                }
            }
            ServerQuery::TransferWait { .. } => {
                let Some(own) = inner.connections.get(&instance_id).cloned() else {
                    return Outcome::Ready(ServerResponse::Failed);
                };
                match inner.wait(&own) {
                    Some(waiting) => Outcome::Payload(waiting),
                    None => Outcome::Ready(ServerResponse::Failed),
                }
            }
            ServerQuery::CloseWebsocketConnection => {
                inner.close(instance_id);
                Outcome::Ready(ServerResponse::Ack)
            }
        }
    }
}

impl RelayInner {
    fn open(&mut self, instance_id: ProtocolInstanceId) -> ConnectionId {
        self.next_connection += 1;
        let connection_id = ConnectionId::new(format!("connection-{}", self.next_connection));
        self.mailboxes
            .insert(connection_id.clone(), Mailbox::default());
        self.connections.insert(instance_id, connection_id.clone());
        connection_id
    }

    fn wait(&mut self, connection_id: &ConnectionId) -> Option<Waiting> {
        let mailbox = self.mailboxes.get_mut(connection_id)?;
        let (tx, rx) = oneshot::channel();
        if mailbox.queued.is_empty() {
            mailbox.waiter = Some(tx);
        } else {
            let _ = tx.send(());
        }
        Some(Waiting {
            connection_id: connection_id.clone(),
            rx,
        })
    }

    /// Drops the connection of the instance. Everybody waiting on it gets a failure.
    fn close(&mut self, instance_id: ProtocolInstanceId) {
        let Some(connection_id) = self.connections.remove(&instance_id) else {
            return;
        };
        self.mailboxes.remove(&connection_id);
        self.sessions
            .retain(|_, session| session.source_connection_id != connection_id);
    }
}

impl Mailbox {
    fn deliver(&mut self, payload: Vec<u8>) {
        self.queued.push_back(payload);
        if let Some(tx) = self.waiter.take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn execute(&self, instance_id: ProtocolInstanceId, query: ServerQuery) -> ServerResponse {
        trace!(instance = %instance_id, query = query.name(), "memory relay");
        match self.handle(instance_id, query) {
            Outcome::Ready(response) => response,
            Outcome::TargetConnection(rx) => rx.await.unwrap_or(ServerResponse::Failed),
            Outcome::Payload(waiting) => match self.receive(waiting).await {
                Some(payload) => ServerResponse::Payload(payload),
                None => ServerResponse::Failed,
            },
            Outcome::FirstPayload {
                other_connection_id,
                waiting,
            } => match self.receive(waiting).await {
                Some(payload) => ServerResponse::EphemeralIdentityAccepted {
                    other_connection_id,
                    payload,
                },
                None => ServerResponse::Failed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use identity_transfer_crypto::Rng;

    use crate::relay::{RelayTransport, ServerQuery, ServerResponse};
    use crate::types::{ConnectionId, ProtocolInstanceId, SessionNumber};

    use super::MemoryRelay;

    #[tokio::test]
    async fn relays_between_source_and_target() {
        let rng = Arc::new(Rng::from_seed([1; 32]));
        let relay = Arc::new(MemoryRelay::new(rng.clone()));
        let source = ProtocolInstanceId::random(&rng).unwrap();
        let target = ProtocolInstanceId::random(&rng).unwrap();

        let ServerResponse::SessionNumber { session_number, .. } = relay
            .execute(source, ServerQuery::SourceGetSessionNumber)
            .await
        else {
            panic!("expected session number");
        };
        assert_eq!(session_number.as_str().len(), 8);

        assert_eq!(
            relay
                .execute(target, ServerQuery::TargetSendEphemeralIdentity {
                    session_number: SessionNumber::new("1").unwrap(),
                    payload: vec![],
                })
                .await,
            ServerResponse::IncorrectSessionNumber
        );

        let target_task = tokio::spawn({
            let relay = relay.clone();
            async move {
                relay
                    .execute(target, ServerQuery::TargetSendEphemeralIdentity {
                        session_number,
                        payload: b"ephemeral".to_vec(),
                    })
                    .await
            }
        });

        let ServerResponse::TargetConnection {
            target_connection_id,
            payload,
        } = relay
            .execute(source, ServerQuery::SourceWaitForTargetConnection)
            .await
        else {
            panic!("expected target connection");
        };
        assert_eq!(payload, b"ephemeral");

        let source_task = tokio::spawn({
            let relay = relay.clone();
            async move {
                relay
                    .execute(source, ServerQuery::TransferRelay {
                        connection_id: target_connection_id,
                        payload: b"commitment".to_vec(),
                        then_close_websocket: false,
                    })
                    .await
            }
        });

        let ServerResponse::EphemeralIdentityAccepted {
            other_connection_id,
            payload,
        } = target_task.await.unwrap()
        else {
            panic!("expected accepted identity");
        };
        assert_eq!(payload, b"commitment");

        assert_eq!(
            relay
                .execute(target, ServerQuery::TransferRelay {
                    connection_id: other_connection_id,
                    payload: b"seed".to_vec(),
                    then_close_websocket: true,
                })
                .await,
            ServerResponse::Ack
        );
        assert_eq!(
            source_task.await.unwrap(),
            ServerResponse::Payload(b"seed".to_vec())
        );
        // Closing the target connection left the source connection open.
        assert_eq!(relay.open_connections(), 1);
        assert_matches!(
            relay.execute(source, ServerQuery::CloseWebsocketConnection).await,
            ServerResponse::Ack
        );
        assert_eq!(relay.open_connections(), 0);
    }

    #[tokio::test]
    async fn payload_outlives_cancelled_wait() {
        let rng = Arc::new(Rng::from_seed([2; 32]));
        let relay = Arc::new(MemoryRelay::new(rng.clone()));
        let source = ProtocolInstanceId::random(&rng).unwrap();
        let target = ProtocolInstanceId::random(&rng).unwrap();

        let ServerResponse::SessionNumber { session_number, .. } = relay
            .execute(source, ServerQuery::SourceGetSessionNumber)
            .await
        else {
            panic!("expected session number");
        };
        let target_task = tokio::spawn({
            let relay = relay.clone();
            async move {
                relay
                    .execute(target, ServerQuery::TargetSendEphemeralIdentity {
                        session_number,
                        payload: vec![],
                    })
                    .await
            }
        });
        let ServerResponse::TargetConnection {
            target_connection_id,
            ..
        } = relay
            .execute(source, ServerQuery::SourceWaitForTargetConnection)
            .await
        else {
            panic!("expected target connection");
        };

        // The source waits for the seed, then goes away before it arrives.
        let source_task = tokio::spawn({
            let relay = relay.clone();
            async move {
                relay
                    .execute(source, ServerQuery::TransferRelay {
                        connection_id: target_connection_id.clone(),
                        payload: b"commitment".to_vec(),
                        then_close_websocket: false,
                    })
                    .await
            }
        });
        let ServerResponse::EphemeralIdentityAccepted {
            other_connection_id,
            ..
        } = target_task.await.unwrap()
        else {
            panic!("expected accepted identity");
        };
        source_task.abort();
        assert!(source_task.await.unwrap_err().is_cancelled());

        let seed_task = tokio::spawn({
            let relay = relay.clone();
            async move {
                relay
                    .execute(target, ServerQuery::TransferRelay {
                        connection_id: other_connection_id,
                        payload: b"seed".to_vec(),
                        then_close_websocket: false,
                    })
                    .await
            }
        });

        assert_eq!(
            relay
                .execute(source, ServerQuery::TransferWait {
                    connection_id: ConnectionId::new("unused"),
                })
                .await,
            ServerResponse::Payload(b"seed".to_vec())
        );
        seed_task.abort();
    }
}
