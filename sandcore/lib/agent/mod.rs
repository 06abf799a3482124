//! Client for the agent running inside each sandbox.
//!
//! The agent serves HTTP/1.1 on a guest vsock port. The host reaches it through the Unix socket
//! the hypervisor binds for the VM's vsock device, one channel per sandbox.

mod channel;
mod client;
mod types;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use client::*;
pub use types::*;

#[cfg(test)]
pub(crate) use channel::testing;
