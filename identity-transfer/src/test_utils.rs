// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory relay and host delegates for running transfers in tests.
mod relay;
mod store;

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use crate::manager::{MemoryStateStore, ProtocolState, StateStore};
use crate::traits::{ChildProtocol, ChildProtocolMessage, NetworkFetch, ProtocolStarter};
use crate::types::{OwnedDevice, ProtocolInstanceId};

pub use relay::MemoryRelay;
pub use store::{
    IdentityNode, MemoryIdentityStore, MemoryStoreError, StoreFailure, keycloak_signing_key,
    sign_transfer_proof,
};

/// Records every child protocol message posted to it.
#[derive(Debug, Default)]
pub struct MemoryProtocolStarter {
    posted: Mutex<Vec<ChildProtocolMessage>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl MemoryProtocolStarter {
    /// Makes preparing protocols of the given kind fail.
    pub fn fail_on(&self, kind: &'static str) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub fn posted(&self) -> Vec<ChildProtocolMessage> {
        self.posted.lock().unwrap().clone()
    }
}

impl ProtocolStarter for MemoryProtocolStarter {
    type Error = StartFailure;

    fn initial_message(
        &self,
        protocol: ChildProtocol,
    ) -> Result<ChildProtocolMessage, Self::Error> {
        let kind = protocol.kind();
        if self.failing.lock().map_err(|_| StartFailure(kind))?.contains(kind) {
            return Err(StartFailure(kind));
        }
        Ok(ChildProtocolMessage {
            protocol,
            body: kind.as_bytes().to_vec(),
        })
    }

    fn post(&self, message: ChildProtocolMessage) -> Result<(), Self::Error> {
        let kind = message.protocol.kind();
        self.posted
            .lock()
            .map_err(|_| StartFailure(kind))?
            .push(message);
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("could not start {0} protocol")]
pub struct StartFailure(pub &'static str);

/// Remembers which owned identities the network layer was told about.
#[derive(Debug, Default)]
pub struct MemoryNetworkFetch {
    updates: Mutex<Vec<Vec<OwnedDevice>>>,
}

impl MemoryNetworkFetch {
    pub fn updates(&self) -> Vec<Vec<OwnedDevice>> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkFetch for MemoryNetworkFetch {
    type Error = std::convert::Infallible;

    async fn update_owned_identities(
        &self,
        identities: Vec<OwnedDevice>,
    ) -> Result<(), Self::Error> {
        self.updates.lock().unwrap().push(identities);
        Ok(())
    }
}

/// State store whose writes can be made to fail.
#[derive(Debug, Default)]
pub struct FlakyStateStore {
    failing_saves: AtomicBool,
    failing_removals: AtomicBool,
    inner: MemoryStateStore,
}

impl FlakyStateStore {
    pub fn fail_saves(&self, failing: bool) {
        self.failing_saves.store(failing, Ordering::SeqCst);
    }

    pub fn fail_removals(&self, failing: bool) {
        self.failing_removals.store(failing, Ordering::SeqCst);
    }

    /// States which were written successfully.
    pub fn inner(&self) -> &MemoryStateStore {
        &self.inner
    }
}

impl StateStore for FlakyStateStore {
    type Error = DiskFull;

    fn save_state(
        &self,
        instance_id: ProtocolInstanceId,
        state: &ProtocolState,
    ) -> Result<(), Self::Error> {
        if self.failing_saves.load(Ordering::SeqCst) {
            return Err(DiskFull);
        }
        self.inner.save_state(instance_id, state).map_err(|_| DiskFull)
    }

    fn remove_state(&self, instance_id: ProtocolInstanceId) -> Result<(), Self::Error> {
        if self.failing_removals.load(Ordering::SeqCst) {
            return Err(DiskFull);
        }
        self.inner.remove_state(instance_id).map_err(|_| DiskFull)
    }

    fn load_states(&self) -> Result<Vec<(ProtocolInstanceId, ProtocolState)>, Self::Error> {
        self.inner.load_states().map_err(|_| DiskFull)
    }
}

#[derive(Debug, Error)]
#[error("disk full")]
pub struct DiskFull;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}
