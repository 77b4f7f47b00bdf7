//! Execution core for a sandboxed code-execution service.
//!
//! Given untrusted handler code, this core materializes a code and
//! dependency image onto durable storage (an Environment), spawns
//! ephemeral resource-capped sandboxed worker processes per invocation,
//! marshals JSON over stdio, bounds concurrency, enforces timeouts, and
//! garbage-collects expired environments.

pub mod builder;
pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod governor;
pub mod http;
pub mod policy;
pub mod reaper;
pub mod runtime;
pub mod store;
pub mod worker;

pub use config::Configuration;
pub use error::{CoreError, Result};
