//! `sandcore` provisions Firecracker microVM sandboxes and manages their lifecycle.
//!
//! # Overview
//!
//! A sandbox is a microVM booted for one developer session. sandcore turns a spawn request
//! into a running VM with its own tap device, guest address, copy-on-write root device, guest
//! configuration, cloned repositories and published service routes, and tears all of it down
//! again when a spawn fails part way or the sandbox is destroyed.
//!
//! # Architecture
//!
//! - [`hypervisor`] - Firecracker process launch and its HTTP control API over a Unix socket
//! - [`agent`] - HTTP client for the in-guest agent, reached over the VM's vsock
//! - [`network`] - Guest address allocation and tap device management
//! - [`environment`] - Every host side effect, real or simulated
//! - [`orchestration`] - Spawn with rollback, stop, start, destroy and liveness checks
//! - [`queue`] - Bounded-concurrency spawn queue with retries
//! - [`providers`] - Pluggable volume storage, routes, workspaces, events and records
//! - [`management`] - SQLite persistence of sandbox records
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sandcore::{
//!     config::SandcoreConfig,
//!     environment::SimulatedEnvironment,
//!     models::SpawnOptions,
//!     network::NetworkAllocator,
//!     orchestration::Orchestrator,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SandcoreConfig::default().into_simulated();
//!     let network = Arc::new(NetworkAllocator::new(config.get_network().clone()));
//!
//!     let orchestrator = Orchestrator::builder()
//!         .config(config)
//!         .environment(Arc::new(SimulatedEnvironment::new()))
//!         .network(network)
//!         .build();
//!
//!     let sandbox = orchestrator.spawn(SpawnOptions::default()).await?;
//!     println!("{} is {}", sandbox.id, sandbox.status);
//!
//!     orchestrator.destroy(&sandbox.id).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod error;
mod log;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod agent;
pub mod cli;
pub mod config;
pub mod environment;
pub mod hypervisor;
pub mod management;
pub mod models;
pub mod network;
pub mod orchestration;
pub mod providers;
pub mod queue;
pub mod transport;
pub mod utils;

pub use error::*;
pub use log::*;
