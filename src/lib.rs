//! SIFT - the Simple Interface of Functional Things
//!
//! SIFT makes it easy to write programs which understand and manipulate
//! connected devices. A SIFT [`Server`] presents an authoritative,
//! centralized repository of Devices (physical units) and their functional
//! Components. Components are generically typed: a program can manipulate
//! any number of light emitters or media players without knowing the vendor
//! protocols behind them.
//!
//! ## Architecture
//!
//! 1. `scanner` - continuous IPv4 discovery of candidate services
//! 2. `adapter` - per-service drivers translating vendor protocols
//! 3. `differ` - turns whole-world snapshots into incremental events
//! 4. `prioritizer` - picks one authoritative adapter per device
//! 5. `store` - transactional SQLite persistence and identity mapping
//! 6. `notif` - token-gated filtered pub/sub for subscribers
//! 7. `server` - wires the pipeline together and routes intents back
//!
//! Updates flow scanner -> adapter -> differ -> prioritizer -> store ->
//! notifier; intents flow the reverse path to the authoritative adapter.
//!
//! ## Example
//!
//! ```no_run
//! use sift::{Server, ServerConfig};
//! use sift::notif::Filter;
//! use sift::store::Expansion;
//!
//! #[tokio::main]
//! async fn main() -> sift::Result<()> {
//!     let server = Server::new(ServerConfig::default()).await?;
//!     server.add_defaults();
//!     tokio::spawn(server.clone().serve());
//!
//!     let token = server.login();
//!     let mut notifications = server.listen(token, vec![Filter::components()]);
//!     while let Some(notification) = notifications.recv().await {
//!         println!("{notification:?}");
//!         for (id, device) in server.get_devices(Expansion::SPECS).await? {
//!             println!("{id}: {device:?}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod auth;
pub mod config;
pub mod differ;
pub mod error;
pub mod notif;
pub mod prioritizer;
pub mod scanner;
pub mod server;
pub mod store;
pub mod types;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use server::Server;
