//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod dfu;
pub(crate) mod firmware;
pub(crate) mod link;
pub(crate) mod monitor;
pub(crate) mod ports;
