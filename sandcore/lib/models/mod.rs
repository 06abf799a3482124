//! Data types shared by the provisioning engine.

mod options;
mod paths;
mod sandbox;
mod workspace;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use options::*;
pub use paths::*;
pub use sandbox::*;
pub use workspace::*;
