// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transfer of an owned identity from one device of a user to another.
//!
//! The two devices never talk directly. A relay server pairs them through a short session
//! number which the user reads off the source device and enters on the target device. Every
//! payload sent through the relay is encrypted, either to an ephemeral identity of the target
//! device or to the transferred identity itself, so the relay learns nothing it could abuse.
//!
//! Before the source device hands out the identity the user confirms a short authentication
//! string (SAS) shown on the target device. The SAS is derived from seeds both devices committed
//! to before seeing the other one, which keeps a relay in the middle from steering it. Identities
//! bound to a Keycloak server can additionally require the user to authenticate on the target
//! device before the transfer is allowed.
//!
//! Both sides are synchronous state machines ([`source`] and [`target`]). A [`TransferManager`]
//! drives any number of them, persists their states and talks to the relay and the host
//! application on their behalf.
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod manager;
pub mod payload;
pub mod relay;
pub mod restoration;
pub mod source;
pub mod target;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
pub mod traits;
pub mod types;

pub use config::Config;
pub use error::TransferError;
pub use events::TransferEvent;
pub use manager::{
    Delegates, ManagerError, MemoryStateStore, ProtocolState, StateStore, TransferManager,
};
pub use relay::{RelayTransport, ServerQuery, ServerResponse};
pub use source::SasEntry;
pub use traits::{IdentityStore, NetworkFetch, ProtocolStarter, SyncSnapshotDelegate};
pub use types::{
    ConnectionId, DeviceUid, FullSas, KeycloakConfiguration, KeycloakTransferProof,
    KeycloakTransferProofAndAuthState, KeycloakTransferProofElements, ProtocolInstanceId,
    SessionNumber,
};
