//! `sandutils` is a library containing general utilities for the sandcore project.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod error;
pub mod path;
pub mod process;
pub mod shell;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use error::*;
pub use path::*;
pub use process::*;
pub use shell::*;
