//! Guest address allocation and per-sandbox tap devices.

mod allocator;
mod tap;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use allocator::*;
