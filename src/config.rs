//! Server configuration
//!
//! Everything a `Server` needs is passed at construction; there is no
//! module-level state, so tests can run servers in parallel without
//! aliasing.

use std::path::PathBuf;
use std::time::Duration;

use crate::scanner::{default_interface_denylist, ScanTargets};

/// Configuration for a SIFT server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// Wait between network scan cycles.
    pub scan_period: Duration,
    /// TCP dial timeout for scan probes.
    pub probe_timeout: Duration,
    /// An adapter with no heartbeat or update for this long is collapsed.
    pub adapter_timeout: Duration,
    /// Where the scanner looks for services.
    pub scan_targets: ScanTargets,
    /// Interface-name prefixes excluded from interface discovery.
    pub interface_denylist: Vec<String>,
    /// Workers draining adapter updates into the prioritizer.
    pub adapter_update_workers: usize,
    /// Workers draining the prioritizer into the store + notifier.
    pub confirmed_update_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: std::env::var("SIFT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sift.db")),
            scan_period: Duration::from_secs(
                std::env::var("SIFT_SCAN_PERIOD_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            probe_timeout: Duration::from_secs(1),
            adapter_timeout: Duration::from_secs(15),
            scan_targets: ScanTargets::Interfaces,
            interface_denylist: default_interface_denylist(),
            adapter_update_workers: 5,
            confirmed_update_workers: 5,
        }
    }
}
