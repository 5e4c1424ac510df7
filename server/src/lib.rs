//! # Signage Player Server
//!
//! This library implements the server side of the signage player channel.
//! Players keep a WebSocket open to the server and periodically report their
//! status over it; the server keeps one document per player up to date and
//! decides when a player should be sent its group configuration.
//!
//! ## Core Responsibilities
//!
//! ### Check-in Processing
//! Each status report is reconciled onto the stored player record, or
//! creates one for a serial number seen for the first time. New players join
//! the group named "default". The last-upload time never moves backwards and
//! a known name is never blanked by a report that lacks one.
//!
//! ### Configuration Push Throttling
//! Unregistered players, and players that ask for it, get their group
//! configuration pushed. Pushes to the same player are at least the push
//! interval apart (60 seconds by default) unless the report is flagged as
//! priority.
//!
//! ### Connection Management
//! Open sockets get a socket id (`ws_<instance>_<n>`), are tracked with their
//! address and last activity, and mark their player as disconnected when they
//! close.
//!
//! ## Module Organization
//!
//! ### Check-in Module (`checkin`)
//! The check-in processor: reconciliation, default group resolution,
//! license gating, push decision and persistence.
//!
//! ### Registry Module (`registry`)
//! Process-wide active player set and per-player push timestamps.
//!
//! ### Store Module (`store`)
//! Player and group store traits with in-memory implementations.
//!
//! ### Database Module (`db`)
//! SQLite-backed store so player records survive restarts.
//!
//! ### Network Module (`network`)
//! WebSocket accept loop, frame dispatch and periodic statistics.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::checkin::CheckInProcessor;
//! use server::config::ServerConfig;
//! use server::device::{LoggingDeviceEvents, LoggingDispatcher};
//! use server::network::Server;
//! use server::registry::PlayerRegistry;
//! use server::store::{MemoryGroupStore, MemoryPlayerStore};
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = ServerConfig::default();
//!     let processor = Arc::new(CheckInProcessor::new(
//!         Arc::new(MemoryPlayerStore::new()),
//!         Arc::new(MemoryGroupStore::new()),
//!         Arc::new(LoggingDispatcher),
//!         Arc::new(RwLock::new(PlayerRegistry::new(config.push_interval))),
//!     ));
//!
//!     let server = Server::bind(&config, processor, Arc::new(LoggingDeviceEvents)).await?;
//!     server.run().await
//! }
//! ```

pub mod checkin;
pub mod config;
pub mod connections;
pub mod db;
pub mod device;
pub mod error;
pub mod model;
pub mod network;
pub mod registry;
pub mod store;
