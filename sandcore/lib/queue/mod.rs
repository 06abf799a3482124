//! Bounded-concurrency spawn queue.

mod job;
mod spawn_queue;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use job::*;
pub use spawn_queue::*;
