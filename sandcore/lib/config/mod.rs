//! Configuration types and helpers.

mod defaults;
mod sandcore;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use sandcore::*;
