// SPDX-License-Identifier: MIT OR Apache-2.0

use identity_transfer_crypto::CryptoIdentity;

use crate::error::TransferError;
use crate::types::{
    FullSas, KeycloakConfiguration, KeycloakTransferProofElements, ProtocolInstanceId,
    SessionNumber,
};

/// Events emitted to the host application, always after the step causing them committed.
#[derive(Debug)]
pub enum TransferEvent {
    /// Source device: show the session number so the user can enter it on the target device.
    SessionNumberReady {
        instance_id: ProtocolInstanceId,
        session_number: SessionNumber,
    },

    /// A step failed and the protocol stayed in the state it was in.
    ProtocolFailed {
        instance_id: ProtocolInstanceId,
        error: TransferError,
    },

    /// Target device: the relay does not know the session number, the user may try again.
    IncorrectSessionNumberEntered { instance_id: ProtocolInstanceId },

    /// Target device: show the SAS which the user needs to enter on the source device.
    SasReady {
        instance_id: ProtocolInstanceId,
        sas: FullSas,
    },

    /// Source device: ask the user for the SAS shown on the target device.
    WaitingForSasOnSource {
        instance_id: ProtocolInstanceId,
        expected_sas: FullSas,
        target_device_name: String,
    },

    /// Source device: the snapshot was handed to the relay, nothing left to do.
    ProtocolFinishedOnSource { instance_id: ProtocolInstanceId },

    /// Target device: the user needs to authenticate against the Keycloak server and submit the
    /// resulting proof.
    KeycloakAuthenticationRequired {
        instance_id: ProtocolInstanceId,
        configuration: KeycloakConfiguration,
        proof_elements: KeycloakTransferProofElements,
    },

    /// Target device: the snapshot arrived and is being restored.
    ProcessingReceivedSnapshot { instance_id: ProtocolInstanceId },

    /// Target device: the identity was restored. Some synchronisation work after the restore is
    /// best-effort, the first of its failures is reported here.
    SuccessfulTransfer {
        instance_id: ProtocolInstanceId,
        transferred_identity: CryptoIdentity,
        post_transfer_error: Option<TransferError>,
    },
}

impl TransferEvent {
    pub fn instance_id(&self) -> ProtocolInstanceId {
        match self {
            TransferEvent::SessionNumberReady { instance_id, .. }
            | TransferEvent::ProtocolFailed { instance_id, .. }
            | TransferEvent::IncorrectSessionNumberEntered { instance_id }
            | TransferEvent::SasReady { instance_id, .. }
            | TransferEvent::WaitingForSasOnSource { instance_id, .. }
            | TransferEvent::ProtocolFinishedOnSource { instance_id }
            | TransferEvent::KeycloakAuthenticationRequired { instance_id, .. }
            | TransferEvent::ProcessingReceivedSnapshot { instance_id }
            | TransferEvent::SuccessfulTransfer { instance_id, .. } => *instance_id,
        }
    }
}
