//! Configuration management module
//!
//! Configuration is sourced entirely from the process environment (see
//! the external interfaces in the root design document), not from a file.

mod config;

pub use config::*;
