//! Continuous IPv4 service discovery
//!
//! ## Responsibilities
//!
//! - Enumerate local IPv4 networks (or scan operator-pinned CIDRs)
//! - Probe every candidate address against the registered service
//!   descriptions (expected-open TCP ports)
//! - Emit match notifications and lock matched addresses until the consumer
//!   releases them with `unlock`
//!
//! Found addresses stay suppressed in later scans until unlocked, so a
//! service being handled by an adapter is not re-discovered. Emission is
//! blocking: a slow consumer stalls the scan, which is the intended pacing.

pub mod net;

pub use net::Ipv4Net;

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::Result;
use net::InterfaceNet;

/// Maximum concurrent port probes per scan cycle.
const MAX_INFLIGHT_PROBES: usize = 100;

/// Networks wider than this prefix are skipped: probing 65k+ addresses per
/// cycle is an operator error, not a scan target.
const MIN_NETWORK_PREFIX: u8 = 16;

/// Default deny-list of interface-name prefixes (loopback, tunnels, container
/// bridges).
pub fn default_interface_denylist() -> Vec<String> {
    ["lo", "tun", "tap", "docker", "veth", "wg", "br-"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Where the scanner looks for candidate addresses.
#[derive(Debug, Clone)]
pub enum ScanTargets {
    /// Enumerate local IPv4 interfaces each cycle.
    Interfaces,
    /// Scan exactly these networks.
    Networks(Vec<Ipv4Net>),
}

/// Describes the IPv4 characteristics of a networked service: an address
/// matches when every listed port accepts a TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescription {
    pub open_ports: Vec<u16>,
}

/// A service was found at `addr`, matching all of `matching_description_ids`.
#[derive(Debug, Clone)]
pub struct ServiceFound {
    pub addr: Ipv4Addr,
    pub matching_description_ids: Vec<String>,
}

/// Searches IPv4 networks for services matching registered descriptions.
/// Found addresses are locked; callers unlock them once no longer in use.
pub struct Scanner {
    targets: ScanTargets,
    denylist: Vec<String>,
    probe_timeout: Duration,

    descriptions: RwLock<HashMap<String, ServiceDescription>>,
    in_use: Mutex<HashSet<Ipv4Addr>>,
    /// Interfaces seen on the previous refresh, to report disappearances.
    interfaces: Mutex<HashMap<String, Ipv4Net>>,
}

impl Scanner {
    /// Create a scanner. In `Interfaces` mode the initial interface
    /// enumeration must succeed; failure here is fatal.
    pub async fn new(
        targets: ScanTargets,
        denylist: Vec<String>,
        probe_timeout: Duration,
    ) -> Result<Self> {
        let scanner = Self {
            targets,
            denylist,
            probe_timeout,
            descriptions: RwLock::new(HashMap::new()),
            in_use: Mutex::new(HashSet::new()),
            interfaces: Mutex::new(HashMap::new()),
        };
        if matches!(scanner.targets, ScanTargets::Interfaces) {
            let nets = net::list_interface_networks(&scanner.denylist).await?;
            scanner.store_interfaces(nets);
        }
        Ok(scanner)
    }

    /// Register a description to search for. Returns the id reported back in
    /// match notifications. Duplicate descriptions get distinct ids.
    pub fn add_description(&self, desc: ServiceDescription) -> String {
        let id = Uuid::new_v4().to_string();
        self.descriptions
            .write()
            .expect("descriptions lock poisoned")
            .insert(id.clone(), desc);
        id
    }

    /// Release a previously found address so future scans may report it again.
    pub fn unlock(&self, addr: Ipv4Addr) {
        self.in_use
            .lock()
            .expect("in_use lock poisoned")
            .remove(&addr);
        tracing::debug!(ip = %addr, "scanner unlocked address");
    }

    /// Run one scan cycle. Returns matched addresses with the ids of every
    /// description they satisfied. Matched addresses are locked.
    pub async fn scan(&self) -> HashMap<Ipv4Addr, Vec<String>> {
        let descriptions: Vec<(String, ServiceDescription)> = self
            .descriptions
            .read()
            .expect("descriptions lock poisoned")
            .iter()
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect();
        if descriptions.is_empty() {
            tracing::debug!("scanner has no descriptions, ignoring scan");
            return HashMap::new();
        }

        let networks = self.current_networks().await;
        let mut candidates: Vec<Ipv4Addr> = Vec::new();
        for network in &networks {
            if network.size() > (1u64 << (32 - MIN_NETWORK_PREFIX as u32)) {
                tracing::warn!(
                    network = %network,
                    "skipping network wider than /{MIN_NETWORK_PREFIX}"
                );
                continue;
            }
            candidates.extend(network.host_addrs());
        }

        let checked = candidates.len();
        let mut already_in_use = 0usize;
        {
            let in_use = self.in_use.lock().expect("in_use lock poisoned");
            candidates.retain(|addr| {
                let locked = in_use.contains(addr);
                if locked {
                    already_in_use += 1;
                }
                !locked
            });
        }

        let probe_timeout = self.probe_timeout;
        let results: Vec<(Ipv4Addr, Vec<String>)> = stream::iter(candidates)
            .map(|addr| {
                let descriptions = &descriptions;
                async move {
                    let ids = matching_descriptions(addr, descriptions, probe_timeout).await;
                    (addr, ids)
                }
            })
            .buffer_unordered(MAX_INFLIGHT_PROBES)
            .collect()
            .await;

        let mut found = HashMap::new();
        {
            let mut in_use = self.in_use.lock().expect("in_use lock poisoned");
            for (addr, ids) in results {
                if !ids.is_empty() {
                    in_use.insert(addr);
                    found.insert(addr, ids);
                }
            }
        }

        tracing::info!(
            ips_checked = checked,
            matches_found = found.len(),
            ips_already_in_use = already_in_use,
            "ipv4 scan complete"
        );
        found
    }

    async fn current_networks(&self) -> Vec<Ipv4Net> {
        match &self.targets {
            ScanTargets::Networks(nets) => nets.clone(),
            ScanTargets::Interfaces => match net::list_interface_networks(&self.denylist).await {
                Ok(nets) => {
                    self.store_interfaces(nets.clone());
                    nets.into_iter().map(|i| i.network).collect()
                }
                Err(e) => {
                    // Keep scanning with the last known table.
                    tracing::error!(error = %e, "could not refresh interfaces");
                    self.interfaces
                        .lock()
                        .expect("interfaces lock poisoned")
                        .values()
                        .copied()
                        .collect()
                }
            },
        }
    }

    fn store_interfaces(&self, nets: Vec<InterfaceNet>) {
        let mut interfaces = self.interfaces.lock().expect("interfaces lock poisoned");
        let fresh: HashMap<String, Ipv4Net> =
            nets.into_iter().map(|i| (i.name, i.network)).collect();
        for name in interfaces.keys() {
            if !fresh.contains_key(name) {
                tracing::warn!(
                    interface = %name,
                    "interface disappeared; services on it may still be active"
                );
            }
        }
        for name in fresh.keys() {
            if !interfaces.contains_key(name) {
                tracing::debug!(interface = %name, "new interface found");
            }
        }
        *interfaces = fresh;
    }
}

/// Check one address against every description. Port probe results are
/// cached so the same (address, port) pair is dialed at most once per scan.
async fn matching_descriptions(
    addr: Ipv4Addr,
    descriptions: &[(String, ServiceDescription)],
    probe_timeout: Duration,
) -> Vec<String> {
    let mut port_open: HashMap<u16, bool> = HashMap::new();
    let mut matched = Vec::new();

    for (id, desc) in descriptions {
        let mut all_open = true;
        for &port in &desc.open_ports {
            let open = match port_open.get(&port) {
                Some(&cached) => cached,
                None => {
                    let open = net::probe_port(addr, port, probe_timeout).await;
                    port_open.insert(port, open);
                    open
                }
            };
            if !open {
                all_open = false;
                break;
            }
        }
        if all_open {
            tracing::debug!(ip = %addr, description_id = %id, "service description matched");
            matched.push(id.clone());
        }
    }
    matched
}

/// A scanner that runs continuously, emitting matches on a channel and
/// sleeping `period` between cycles. Cycles never overlap.
pub struct ContinuousScanner {
    scanner: Scanner,
    period: Duration,
    found_tx: mpsc::Sender<ServiceFound>,
    found_rx: Mutex<Option<mpsc::Receiver<ServiceFound>>>,
    stop_tx: watch::Sender<bool>,
}

impl ContinuousScanner {
    pub fn new(scanner: Scanner, period: Duration) -> Self {
        let (found_tx, found_rx) = mpsc::channel(1);
        let (stop_tx, _) = watch::channel(false);
        Self {
            scanner,
            period,
            found_tx,
            found_rx: Mutex::new(Some(found_rx)),
            stop_tx,
        }
    }

    /// The inner scanner, for description registration and unlocking.
    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    /// Take the match notification channel. May be taken exactly once.
    pub fn take_found_services(&self) -> Option<mpsc::Receiver<ServiceFound>> {
        self.found_rx.lock().expect("found_rx lock poisoned").take()
    }

    /// Scan forever. Emission blocks when the consumer is slow; the stop
    /// signal aborts the inter-scan wait.
    pub async fn serve(&self) {
        tracing::debug!(period = ?self.period, "starting continuous ipv4 scanner");
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            if *stop_rx.borrow_and_update() {
                return;
            }
            for (addr, ids) in self.scanner.scan().await {
                let notification = ServiceFound {
                    addr,
                    matching_description_ids: ids,
                };
                if self.found_tx.send(notification).await.is_err() {
                    // Consumer has gone away; nothing left to scan for.
                    return;
                }
            }

            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = tokio::time::sleep(self.period) => {}
            }
        }
    }

    /// Stop the scanner after the current cycle.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn counting_listener() -> (u16, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        tokio::spawn(async move {
            while let Ok((_conn, _)) = listener.accept().await {
                count2.fetch_add(1, Ordering::SeqCst);
            }
        });
        (port, count)
    }

    fn loopback_scanner(probe_timeout: Duration) -> Scanner {
        Scanner {
            targets: ScanTargets::Networks(vec![Ipv4Net::parse("127.0.0.1").unwrap()]),
            denylist: Vec::new(),
            probe_timeout,
            descriptions: RwLock::new(HashMap::new()),
            in_use: Mutex::new(HashSet::new()),
            interfaces: Mutex::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn scan_matches_open_ports_and_locks_address() {
        let (port, _count) = counting_listener().await;
        let scanner = loopback_scanner(Duration::from_millis(500));
        let id = scanner.add_description(ServiceDescription {
            open_ports: vec![port],
        });

        let found = scanner.scan().await;
        let localhost: Ipv4Addr = "127.0.0.1".parse().unwrap();
        assert_eq!(found.get(&localhost), Some(&vec![id.clone()]));

        // The address is now locked: a second scan reports nothing.
        let found = scanner.scan().await;
        assert!(found.is_empty());

        // Unlocking makes it discoverable again.
        scanner.unlock(localhost);
        let found = scanner.scan().await;
        assert_eq!(found.get(&localhost), Some(&vec![id]));
    }

    #[tokio::test]
    async fn scan_does_not_dial_the_same_port_twice() {
        let (port, count) = counting_listener().await;
        let scanner = loopback_scanner(Duration::from_millis(500));
        // Two descriptions listing the same port share one probe.
        scanner.add_description(ServiceDescription {
            open_ports: vec![port],
        });
        scanner.add_description(ServiceDescription {
            open_ports: vec![port],
        });

        let found = scanner.scan().await;
        assert_eq!(found.len(), 1);
        let ids = found.values().next().unwrap();
        assert_eq!(ids.len(), 2);

        // The accept loop may trail the probe's connect slightly.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn description_with_closed_port_does_not_match() {
        let (open_port, _count) = counting_listener().await;
        // Bind-then-drop to find a port that is closed.
        let closed_port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let scanner = loopback_scanner(Duration::from_millis(500));
        let open_id = scanner.add_description(ServiceDescription {
            open_ports: vec![open_port],
        });
        scanner.add_description(ServiceDescription {
            open_ports: vec![open_port, closed_port],
        });

        let found = scanner.scan().await;
        let localhost: Ipv4Addr = "127.0.0.1".parse().unwrap();
        assert_eq!(found.get(&localhost), Some(&vec![open_id]));
    }

    #[tokio::test]
    async fn scan_without_descriptions_is_a_no_op() {
        let scanner = loopback_scanner(Duration::from_millis(100));
        assert!(scanner.scan().await.is_empty());
    }

    #[tokio::test]
    async fn networks_wider_than_16_bits_are_skipped() {
        let scanner = Scanner {
            targets: ScanTargets::Networks(vec![Ipv4Net::parse("10.0.0.0/8").unwrap()]),
            denylist: Vec::new(),
            probe_timeout: Duration::from_millis(100),
            descriptions: RwLock::new(HashMap::new()),
            in_use: Mutex::new(HashSet::new()),
            interfaces: Mutex::new(HashMap::new()),
        };
        scanner.add_description(ServiceDescription {
            open_ports: vec![80],
        });

        // 16M candidate addresses would take minutes; the skip makes this
        // return immediately with no matches.
        assert!(scanner.scan().await.is_empty());
    }

    #[tokio::test]
    async fn continuous_scanner_emits_and_stops() {
        let (port, _count) = counting_listener().await;
        let scanner = loopback_scanner(Duration::from_millis(500));
        scanner.add_description(ServiceDescription {
            open_ports: vec![port],
        });

        let continuous = Arc::new(ContinuousScanner::new(scanner, Duration::from_secs(60)));
        let mut found_rx = continuous.take_found_services().unwrap();
        assert!(continuous.take_found_services().is_none());

        let serve = {
            let continuous = continuous.clone();
            tokio::spawn(async move { continuous.serve().await })
        };

        let found = tokio::time::timeout(Duration::from_secs(5), found_rx.recv())
            .await
            .expect("timed out waiting for scan match")
            .expect("scanner channel closed");
        assert_eq!(found.addr, "127.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(found.matching_description_ids.len(), 1);

        continuous.stop();
        tokio::time::timeout(Duration::from_secs(5), serve)
            .await
            .expect("scanner did not stop")
            .unwrap();
    }
}
