//! The SIFT server
//!
//! ## Responsibilities
//!
//! - Own the scanner, factory registry, adapter pool, prioritizer, store,
//!   and notifier, and wire their channels together
//! - Supervise adapters: route their updates, watch their heartbeats, tear
//!   them down on failure and release their addresses
//! - Persist confirmed updates and fan the resulting changes out to
//!   subscribers
//! - Route intents back to the authoritative adapter for a device
//! - Shut everything down on stop or process signal
//!
//! Data flows scanner -> factory -> adapter -> prioritizer -> store ->
//! notifier -> subscriber; intents flow the reverse path.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adapter::{build_context, Adapter, AdapterFactory, AdapterStatus};
use crate::auth::{Authorizor, SiftAuthorizor, Token};
use crate::config::ServerConfig;
use crate::differ::DeviceUpdate;
use crate::error::{Error, Result};
use crate::notif::{ActionsMask, Filter, Notifier, Subscription};
use crate::prioritizer::{AdapterDescription, AdapterKind, Prioritizer};
use crate::scanner::{ContinuousScanner, Scanner, ServiceFound};
use crate::store::{DeviceUpsertResponse, Expansion, Store};
use crate::types::{
    Component, ComponentID, Device, DeviceID, ExternalComponentID, Intent,
};

const UPDATE_CHAN_CAP: usize = 1000;
const ADAPTER_DIED_CAP: usize = 10;

/// Attempts for a store write that reports `Busy` before giving up.
const BUSY_RETRIES: usize = 3;
const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Default port of the demo backend service.
pub const DEMO_SERVICE_PORT: u16 = 55442;

/// An adapter update tagged with the adapter that produced it.
struct UpdatePackage {
    description: AdapterDescription,
    update: DeviceUpdate,
}

/// Maintains the state of SIFT objects and provides methods for listening
/// to, retrieving, and manipulating them. Construct with `Server::new` and
/// run with `serve`.
pub struct Server {
    config: ServerConfig,
    store: Arc<Store>,
    authorizor: Arc<SiftAuthorizor>,
    notifier: Notifier,
    prioritizer: Arc<Prioritizer>,
    scanner: Arc<ContinuousScanner>,

    factories: Mutex<HashMap<String, Arc<dyn AdapterFactory>>>,
    adapters: Mutex<HashMap<String, Arc<dyn Adapter>>>,

    updates_tx: mpsc::Sender<UpdatePackage>,
    updates_rx: Mutex<Option<mpsc::Receiver<UpdatePackage>>>,

    stop_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
}

impl Server {
    /// Construct a new SIFT server from the given configuration, opening
    /// (or creating) the database it points at.
    pub async fn new(config: ServerConfig) -> Result<Arc<Server>> {
        let store = Arc::new(Store::open(&config.db_path).await?);
        let authorizor = Arc::new(SiftAuthorizor::new());
        let notifier = Notifier::new(authorizor.clone());
        let scanner = Scanner::new(
            config.scan_targets.clone(),
            config.interface_denylist.clone(),
            config.probe_timeout,
        )
        .await?;
        let scanner = Arc::new(ContinuousScanner::new(scanner, config.scan_period));
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHAN_CAP);
        let (stop_tx, _) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);

        Ok(Arc::new(Server {
            config,
            store,
            authorizor,
            notifier,
            prioritizer: Arc::new(Prioritizer::new(None)),
            scanner,
            factories: Mutex::new(HashMap::new()),
            adapters: Mutex::new(HashMap::new()),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
            stop_tx,
            stopped_tx,
        }))
    }

    /// Register an adapter factory. The server starts searching for
    /// services matching the factory's description and uses the factory to
    /// adapt any it finds. Returns the description id.
    pub fn add_adapter_factory(&self, factory: Arc<dyn AdapterFactory>) -> String {
        let id = self.scanner.scanner().add_description(factory.ipv4_description());
        tracing::info!(factory = %factory.name(), description_id = %id, "added adapter factory");
        self.factories
            .lock()
            .expect("factories lock poisoned")
            .insert(id.clone(), factory);
        id
    }

    /// Register the built-in factories: the demo backend driver and the
    /// lighting gateway driver.
    pub fn add_defaults(&self) {
        self.add_adapter_factory(Arc::new(crate::adapter::demo::DemoFactory::new(
            DEMO_SERVICE_PORT,
        )));
        self.add_adapter_factory(Arc::new(crate::adapter::gateway::GatewayFactory::new()));
    }

    /// Register a user; the token authorizes `listen` subscriptions.
    pub fn login(&self) -> Token {
        self.authorizor.login()
    }

    /// Subscribe to notifications matching the filters (all notifications
    /// when no filters are given).
    pub fn listen(&self, token: Token, filters: Vec<Filter>) -> Subscription {
        self.notifier.listen(token, filters)
    }

    /// Every persisted device, keyed by internal id.
    pub async fn get_devices(&self, expansion: Expansion) -> Result<BTreeMap<DeviceID, Device>> {
        self.store.get_devices(expansion).await
    }

    /// Every persisted component, keyed by internal component id.
    pub async fn get_components(
        &self,
        expansion: Expansion,
    ) -> Result<BTreeMap<ComponentID, Component>> {
        self.store.get_components(expansion).await
    }

    /// Attempt to fulfill an intent against the component's device,
    /// routed through the highest-priority adapter currently serving it.
    /// Dispatch is synchronous with the adapter's transmit; state
    /// convergence is observed through the notification stream.
    pub async fn enact_intent(&self, target: ComponentID, intent: Intent) -> Result<()> {
        tracing::debug!(target = %target, intent = %intent.kind(), "submitting intent");

        let external_id = self.store.get_external_device_id(target.device_id).await?;

        let adapter_id = self
            .prioritizer
            .highest_priority_adapter_for_device(&external_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no active adapter is currently handling component {target}"
                ))
            })?;
        let adapter = self
            .adapters
            .lock()
            .expect("adapters lock poisoned")
            .get(&adapter_id)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "adapter {adapter_id} is no longer live for component {target}"
                ))
            })?;

        let external_target = ExternalComponentID {
            device: external_id,
            name: target.name,
        };
        adapter.enact_intent(external_target, intent).await
    }

    /// Run the server: scanner under a restart supervisor, worker pools for
    /// both pipeline stages, and the main match/stop loop. Returns after
    /// `stop` (or a process signal) has been handled and the store closed.
    pub async fn serve(self: Arc<Self>) {
        self.clone().stop_on_exit_signal();

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Scanner, restarted if it panics.
        {
            let scanner = self.scanner.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let run = tokio::spawn({
                        let scanner = scanner.clone();
                        async move { scanner.serve().await }
                    });
                    match run.await {
                        Ok(()) => return,
                        Err(e) if e.is_panic() => {
                            tracing::error!("ipv4 scanner panicked; restarting");
                            continue;
                        }
                        Err(_) => return,
                    }
                }
            }));
        }

        // Workers draining adapter updates into the prioritizer.
        let updates_rx = self
            .updates_rx
            .lock()
            .expect("updates_rx lock poisoned")
            .take();
        let Some(updates_rx) = updates_rx else {
            tracing::error!("server already served; refusing to serve again");
            return;
        };
        let updates_rx = Arc::new(tokio::sync::Mutex::new(updates_rx));
        for _ in 0..self.config.adapter_update_workers {
            let updates_rx = updates_rx.clone();
            let prioritizer = self.prioritizer.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let package = { updates_rx.lock().await.recv().await };
                    match package {
                        Some(package) => {
                            if let Err(e) = prioritizer
                                .consider(&package.description, package.update)
                                .await
                            {
                                tracing::error!(error = %e, "error while prioritizing update");
                            }
                        }
                        None => return,
                    }
                }
            }));
        }

        // Workers draining confirmed updates into the store + notifier.
        let Some(confirmed_rx) = self.prioritizer.take_output() else {
            tracing::error!("prioritizer output already taken; refusing to serve again");
            return;
        };
        let confirmed_rx = Arc::new(tokio::sync::Mutex::new(confirmed_rx));
        for _ in 0..self.config.confirmed_update_workers {
            let confirmed_rx = confirmed_rx.clone();
            let server = self.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let update = { confirmed_rx.lock().await.recv().await };
                    match update {
                        Some(update) => server.handle_update(update).await,
                        None => return,
                    }
                }
            }));
        }

        // Main loop: react to scanner matches and the stop signal.
        let Some(mut found_rx) = self.scanner.take_found_services() else {
            tracing::error!("scanner match channel already taken; refusing to serve again");
            return;
        };
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    tracing::debug!("sift server stopping due to stop signal");
                    break;
                }
                found = found_rx.recv() => match found {
                    Some(found) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.try_handling_ipv4_service(found).await;
                        });
                    }
                    None => break,
                },
            }
        }

        // Shutdown: stop the scanner and adapters, drop the workers, mark
        // every device offline and release the store.
        self.scanner.stop();
        for handle in &handles {
            handle.abort();
        }
        let adapters: Vec<Arc<dyn Adapter>> = self
            .adapters
            .lock()
            .expect("adapters lock poisoned")
            .drain()
            .map(|(_, adapter)| adapter)
            .collect();
        for adapter in adapters {
            adapter.stop();
        }
        if let Err(e) = self.store.close().await {
            tracing::error!(error = %e, "could not gracefully close sift database");
        }
        self.stopped_tx.send_replace(true);
    }

    /// Ask the server to stop. Does not block.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop the server and wait for shutdown to complete.
    pub async fn stop_and_wait(&self, timeout: Duration) -> Result<()> {
        self.stop();
        let mut stopped_rx = self.stopped_tx.subscribe();
        tokio::time::timeout(timeout, async move {
            loop {
                if *stopped_rx.borrow_and_update() {
                    return;
                }
                if stopped_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| Error::Internal(format!("timed out after {timeout:?} waiting for stop")))
    }

    fn stop_on_exit_signal(self: Arc<Self>) {
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm =
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    {
                        Ok(sig) => sig,
                        Err(e) => {
                            tracing::error!(error = %e, "could not install SIGTERM handler");
                            return;
                        }
                    };
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            tracing::info!("caught exit signal, shutting down gracefully");
            self.stop();
        });
    }

    /// Walk the matched descriptions, handing the service to each viable
    /// factory in turn and supervising the resulting adapter until it dies,
    /// times out, or reports a non-handling status. When every viable
    /// adapter has failed, the address is released for the next scan.
    async fn try_handling_ipv4_service(self: &Arc<Self>, found: ServiceFound) {
        for description_id in &found.matching_description_ids {
            let factory = self
                .factories
                .lock()
                .expect("factories lock poisoned")
                .get(description_id)
                .cloned();
            let Some(factory) = factory else {
                tracing::error!(
                    description_id = %description_id,
                    "no factory registered for matched description"
                );
                continue;
            };

            let (context, mut status_rx) =
                build_context(found.addr, None, self.store.clone(), factory.name());
            let adapter = factory.handle_ipv4(context.clone());
            let adapter_id = Uuid::new_v4().to_string();
            self.adapters
                .lock()
                .expect("adapters lock poisoned")
                .insert(adapter_id.clone(), adapter.clone());
            tracing::debug!(
                ip = %found.addr,
                factory = %factory.name(),
                adapter_id = %adapter_id,
                "adapter created for scanned service"
            );

            // Pump adapter updates into the shared channel; signal liveness
            // (false) per update and death (true) when the stream closes.
            let (died_tx, mut died_rx) = mpsc::channel::<bool>(ADAPTER_DIED_CAP);
            let pump = match adapter.take_updates() {
                Some(mut updates) => {
                    let updates_tx = self.updates_tx.clone();
                    let died_tx = died_tx.clone();
                    let description = AdapterDescription {
                        kind: AdapterKind::Ipv4,
                        id: adapter_id.clone(),
                    };
                    tokio::spawn(async move {
                        while let Some(update) = updates.recv().await {
                            let package = UpdatePackage {
                                description: description.clone(),
                                update,
                            };
                            if updates_tx.send(package).await.is_err() {
                                break;
                            }
                            let _ = died_tx.try_send(false);
                        }
                        let _ = died_tx.send(true).await;
                    })
                }
                None => {
                    tracing::error!(adapter_id = %adapter_id, "adapter update stream already taken");
                    context.kill();
                    self.remove_adapter(&adapter_id);
                    continue;
                }
            };

            // Supervise until death, a non-handling status, a closed status
            // channel, or the adapter timeout.
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.adapter_timeout) => {
                        tracing::debug!(adapter_id = %adapter_id, "adapter timed out");
                        break;
                    }
                    died = died_rx.recv() => {
                        if died.unwrap_or(true) {
                            tracing::debug!(adapter_id = %adapter_id, "adapter died");
                            break;
                        }
                    }
                    status = status_rx.recv() => match status {
                        None => {
                            tracing::debug!(adapter_id = %adapter_id, "adapter status channel closed");
                            break;
                        }
                        Some(AdapterStatus::Handling) => {}
                        Some(status) => {
                            tracing::debug!(
                                adapter_id = %adapter_id,
                                status = ?status,
                                "adapter returned non-handling status"
                            );
                            break;
                        }
                    },
                }
            }

            // The adapter is done. Kill it and move on to the next viable
            // factory.
            context.kill();
            adapter.stop();
            pump.abort();
            self.remove_adapter(&adapter_id);
        }

        // All viable adapters (if any) have failed. Release the IP; if the
        // service is still there the next scan will pick it up again.
        self.scanner.scanner().unlock(found.addr);
    }

    fn remove_adapter(&self, adapter_id: &str) {
        self.adapters
            .lock()
            .expect("adapters lock poisoned")
            .remove(adapter_id);
    }

    /// Apply a confirmed update to the store and fan the changes out to
    /// subscribers.
    async fn handle_update(&self, update: DeviceUpdate) {
        match update {
            DeviceUpdate::Updated { id, device } => {
                tracing::debug!(device_id = %id, "handling device update");
                let response = match self.upsert_with_retry(&id, &device).await {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::error!(device_id = %id, error = %e, "could not upsert updated device");
                        return;
                    }
                };
                self.notify_upsert(&device, &response);
            }
            DeviceUpdate::Deleted { id } => {
                tracing::debug!(device_id = %id, "handling device delete");
                match self.store.delete_device(&id).await {
                    Ok(Some((device_id, device))) => {
                        for (name, component) in &device.components {
                            let component_id = ComponentID::new(device_id, name.clone());
                            self.notifier
                                .post_component(&component_id, component, ActionsMask::DELETE);
                        }
                        self.notifier
                            .post_device(device_id, &device, ActionsMask::DELETE);
                    }
                    Ok(None) => {
                        tracing::debug!(device_id = %id, "deleted device was not persisted");
                    }
                    Err(e) => {
                        tracing::error!(device_id = %id, error = %e, "could not delete device");
                    }
                }
            }
        }
    }

    async fn upsert_with_retry(
        &self,
        id: &crate::types::ExternalDeviceID,
        device: &Device,
    ) -> Result<DeviceUpsertResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.upsert_device(id, device).await {
                Err(e) if e.is_retryable() && attempt < BUSY_RETRIES => {
                    tracing::debug!(device_id = %id, attempt, "store busy, retrying upsert");
                    tokio::time::sleep(BUSY_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    fn notify_upsert(&self, device: &Device, response: &DeviceUpsertResponse) {
        for (name, component) in &response.upserted {
            let component_id = ComponentID::new(response.device_id, name.clone());
            let action = if response.created_component_names.contains(name) {
                ActionsMask::CREATE
            } else {
                ActionsMask::UPDATE
            };
            self.notifier.post_component(&component_id, component, action);
        }
        for (name, component) in &response.deleted {
            let component_id = ComponentID::new(response.device_id, name.clone());
            self.notifier
                .post_component(&component_id, component, ActionsMask::DELETE);
        }
        if response.created {
            self.notifier
                .post_device(response.device_id, device, ActionsMask::CREATE);
        } else if response.device_changed {
            self.notifier
                .post_device(response.device_id, device, ActionsMask::UPDATE);
        }
    }
}
