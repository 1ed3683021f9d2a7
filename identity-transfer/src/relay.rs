// SPDX-License-Identifier: MIT OR Apache-2.0

//! Requests to the transfer relay server and their responses.
//!
//! Steps never talk to the relay directly. They queue an [`OutgoingQuery`] which is executed
//! after the step committed, and the response re-enters the state machine as a message. The
//! [`Reply`] attached to a query decides which message that is.
use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ConnectionId, ProtocolInstanceId, SessionNumber};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerQuery {
    /// Open a connection on the source device and obtain a session number for it.
    SourceGetSessionNumber,

    /// Wait until a target device connected with the session number.
    SourceWaitForTargetConnection,

    /// Connect the target device using the session number the user entered and announce its
    /// ephemeral identity.
    TargetSendEphemeralIdentity {
        session_number: SessionNumber,
        payload: Vec<u8>,
    },

    /// Forward a payload to the other device. Unless the connection is closed afterwards the
    /// response is the next payload the other device sends.
    TransferRelay {
        connection_id: ConnectionId,
        payload: Vec<u8>,
        then_close_websocket: bool,
    },

    /// Wait for the next payload of the other device.
    TransferWait { connection_id: ConnectionId },

    CloseWebsocketConnection,
}

impl ServerQuery {
    pub fn name(&self) -> &'static str {
        match self {
            ServerQuery::SourceGetSessionNumber => "source_get_session_number",
            ServerQuery::SourceWaitForTargetConnection => "source_wait_for_target_connection",
            ServerQuery::TargetSendEphemeralIdentity { .. } => "target_send_ephemeral_identity",
            ServerQuery::TransferRelay { .. } => "transfer_relay",
            ServerQuery::TransferWait { .. } => "transfer_wait",
            ServerQuery::CloseWebsocketConnection => "close_websocket_connection",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerResponse {
    SessionNumber {
        source_connection_id: ConnectionId,
        session_number: SessionNumber,
    },
    TargetConnection {
        target_connection_id: ConnectionId,
        payload: Vec<u8>,
    },
    EphemeralIdentityAccepted {
        other_connection_id: ConnectionId,
        payload: Vec<u8>,
    },
    IncorrectSessionNumber,
    Payload(Vec<u8>),
    Ack,
    Failed,
}

/// Protocol message a server response is delivered as.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    SourceSessionNumber,
    SourceTargetConnection,
    SourceTargetSeed,
    SourceKeycloakProof,
    TargetTransferredIdentity,
    TargetDecommitment,
    TargetSnapshot,

    /// Nobody waits for the response.
    Discard,
}

/// Query queued by a step, executed once the step committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingQuery {
    pub query: ServerQuery,
    pub reply: Reply,
}

/// The relay did not answer the request or answered with something unexpected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
#[error("relay server request failed")]
pub struct RelayFailure;

pub type RelayResult<T> = Result<T, RelayFailure>;

/// Connection to the transfer relay server.
///
/// Implementations map every transport level problem to [`ServerResponse::Failed`], the state
/// machines treat it as a protocol failure.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn execute(&self, instance_id: ProtocolInstanceId, query: ServerQuery)
    -> ServerResponse;
}
