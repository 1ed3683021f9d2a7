// SPDX-License-Identifier: MIT OR Apache-2.0

//! Unit of work of a single protocol step.
//!
//! A step never performs side effects directly. It records them on the [`StepContext`] and they
//! are carried out only after the new protocol state was persisted. When the step fails all
//! recorded effects are dropped.
use identity_transfer_crypto::{CryptoIdentity, Rng};

use crate::error::TransferError;
use crate::events::TransferEvent;
use crate::relay::{OutgoingQuery, Reply, ServerQuery};
use crate::traits::ChildProtocolMessage;
use crate::types::{DeviceUid, OwnedDevice, ProtocolInstanceId, SnapshotNode};

/// Work detached from the protocol, run in the background after commit.
#[derive(Debug)]
pub enum FollowUp {
    /// Report the owned identities active on this device to the network layer.
    UpdateOwnedIdentities(Vec<OwnedDevice>),

    /// Finish a transfer on the target device: apply the application part of the snapshot, ask
    /// the server to keep a device active, then report success together with the first error of
    /// all best-effort work.
    CompleteTransfer {
        transferred_identity: CryptoIdentity,
        app_node: SnapshotNode,
        device_uid_to_keep_active: Option<DeviceUid>,
        errors: Vec<TransferError>,
    },
}

/// Everything a committed step asks for.
#[derive(Debug, Default)]
pub struct Effects {
    pub queries: Vec<OutgoingQuery>,
    pub child_protocol_messages: Vec<ChildProtocolMessage>,
    pub events: Vec<TransferEvent>,
    pub follow_ups: Vec<FollowUp>,

    /// The step failed, its writes to the identity store are rolled back.
    pub failed: bool,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
            && self.child_protocol_messages.is_empty()
            && self.events.is_empty()
            && self.follow_ups.is_empty()
    }
}

pub struct StepContext<'a> {
    instance_id: ProtocolInstanceId,
    rng: &'a Rng,
    effects: Effects,
}

impl<'a> StepContext<'a> {
    pub fn new(instance_id: ProtocolInstanceId, rng: &'a Rng) -> Self {
        Self {
            instance_id,
            rng,
            effects: Effects::default(),
        }
    }

    pub fn instance_id(&self) -> ProtocolInstanceId {
        self.instance_id
    }

    pub fn rng(&self) -> &Rng {
        self.rng
    }

    pub fn send_query(&mut self, query: ServerQuery, reply: Reply) {
        self.effects.queries.push(OutgoingQuery { query, reply });
    }

    pub fn post_child_protocol_message(&mut self, message: ChildProtocolMessage) {
        self.effects.child_protocol_messages.push(message);
    }

    pub fn notify(&mut self, event: TransferEvent) {
        self.effects.events.push(event);
    }

    pub fn follow_up(&mut self, follow_up: FollowUp) {
        self.effects.follow_ups.push(follow_up);
    }

    /// Drops everything recorded so far.
    pub(crate) fn rollback(&mut self) {
        self.effects = Effects::default();
    }

    /// Records a failure of the current step in place of anything it recorded before.
    pub(crate) fn fail(&mut self, error: TransferError) {
        self.rollback();
        self.effects.failed = true;
        self.notify(TransferEvent::ProtocolFailed {
            instance_id: self.instance_id,
            error,
        });
    }

    pub fn commit(self) -> Effects {
        self.effects
    }
}
