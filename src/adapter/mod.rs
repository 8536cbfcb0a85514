//! Adapter traits and the per-service context
//!
//! An adapter is a live driver instance bound to exactly one external
//! service (one IP, one hub). Several adapters may service the same physical
//! device over different transports; the prioritizer arbitrates between
//! them. Factories create adapters when the scanner matches one of their
//! service descriptions.
//!
//! Adapters talk back to the server through a `ServiceContext`: heartbeats
//! and terminal statuses go to the status channel, and small pieces of state
//! (auth tokens, certificate pins) persist through the context's data store,
//! namespaced per adapter name. Once the server kills a context, all of its
//! operations fail with `ContextDead`.

pub mod demo;
pub mod gateway;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::differ::DeviceUpdate;
use crate::error::{Error, Result};
use crate::scanner::ServiceDescription;
use crate::store::Store;
use crate::types::{ExternalComponentID, Intent};

/// Capacity of each adapter's update channel.
pub const UPDATE_CHAN_CAP: usize = 100;

const STATUS_CHAN_CAP: usize = 10;

/// Statuses an adapter reports through its context. `Handling` doubles as
/// the keep-alive heartbeat; anything else ends supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    /// The context pointed at a service this adapter does not control.
    IncorrectService,
    /// The adapter is handling the service (heartbeat).
    Handling,
    /// The adapter finished handling the service.
    Done,
    /// The adapter hit an unrecoverable error.
    Errored,
}

/// A live driver instance responsible for two-way sync with one service.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Take the adapter's update stream. May be taken exactly once; the
    /// events are produced by the adapter's embedded differ.
    fn take_updates(&self) -> Option<mpsc::Receiver<DeviceUpdate>>;

    /// Translate the intent into vendor commands and transmit them.
    async fn enact_intent(&self, target: ExternalComponentID, intent: Intent) -> Result<()>;

    /// Ask the adapter to stop at its next suspension point.
    fn stop(&self);
}

/// Creates adapters for IPv4 services matching a description.
pub trait AdapterFactory: Send + Sync {
    /// The factory's name, used for logging and to namespace context data.
    fn name(&self) -> &str;

    /// The service description the scanner probes for.
    fn ipv4_description(&self) -> ServiceDescription;

    /// Spawn a new adapter to handle the context. The adapter starts
    /// serving immediately.
    fn handle_ipv4(&self, context: ServiceContext) -> Arc<dyn Adapter>;
}

struct ContextInner {
    addr: Ipv4Addr,
    port: Option<u16>,
    adapter_name: String,
    store: Arc<Store>,
    status: Mutex<Option<mpsc::Sender<AdapterStatus>>>,
}

/// Describes, and grants access to, a particular IPv4 service.
#[derive(Clone)]
pub struct ServiceContext {
    inner: Arc<ContextInner>,
}

/// Build a context bound to the given address. The returned receiver gets
/// every status the adapter sends until the context is killed.
pub fn build_context(
    addr: Ipv4Addr,
    port: Option<u16>,
    store: Arc<Store>,
    adapter_name: impl Into<String>,
) -> (ServiceContext, mpsc::Receiver<AdapterStatus>) {
    let (tx, rx) = mpsc::channel(STATUS_CHAN_CAP);
    let context = ServiceContext {
        inner: Arc::new(ContextInner {
            addr,
            port,
            adapter_name: adapter_name.into(),
            store,
            status: Mutex::new(Some(tx)),
        }),
    };
    (context, rx)
}

impl ServiceContext {
    /// The IP of the service.
    pub fn addr(&self) -> Ipv4Addr {
        self.inner.addr
    }

    /// The port of the service, when the description pinned one.
    pub fn port(&self) -> Option<u16> {
        self.inner.port
    }

    /// Send a status to the creator of the context.
    pub async fn send_status(&self, status: AdapterStatus) -> Result<()> {
        let tx = {
            let guard = self.inner.status.lock().expect("status lock poisoned");
            guard.clone().ok_or(Error::ContextDead)?
        };
        tx.send(status).await.map_err(|_| Error::ContextDead)
    }

    /// Persist a string value for this adapter, retrievable by key.
    /// Adapters with different names cannot see each other's data.
    pub async fn store_data(&self, key: &str, value: &str) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::ContextDead);
        }
        self.inner
            .store
            .store_adapter_data(&self.inner.adapter_name, key, value)
            .await
    }

    /// Read back a value stored with `store_data`.
    pub async fn get_data(&self, key: &str) -> Result<Option<String>> {
        if !self.is_alive() {
            return Err(Error::ContextDead);
        }
        self.inner
            .store
            .get_adapter_data(&self.inner.adapter_name, key)
            .await
    }

    /// Kill the context. The status channel closes and every subsequent
    /// operation fails with `ContextDead`.
    pub fn kill(&self) {
        let mut guard = self.inner.status.lock().expect("status lock poisoned");
        *guard = None;
    }

    fn is_alive(&self) -> bool {
        self.inner
            .status
            .lock()
            .expect("status lock poisoned")
            .is_some()
    }
}
