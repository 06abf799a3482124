//! Control-plane client for the Firecracker hypervisor.
//!
//! Each VM exposes a private HTTP API on a Unix socket. [`HypervisorLauncher`] starts the
//! process and waits for that socket; [`HypervisorClient`] drives the API; [`configure_vm`]
//! applies the standard sandbox machine layout.

mod client;
mod configure;
mod launcher;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use configure::*;
pub use launcher::*;
pub use types::*;
