//! Collaborators the engine depends on but does not own.
//!
//! Each one is a trait so hosts can plug in their own volume manager, reverse proxy, workspace
//! catalogue, event bus and record store. Simple built-in implementations are provided for
//! single-host setups and tests.

mod events;
mod routes;
mod storage;
mod store;
mod workspace;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use events::*;
pub use routes::*;
pub use storage::*;
pub use store::*;
pub use workspace::*;
