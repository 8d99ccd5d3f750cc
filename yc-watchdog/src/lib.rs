//! yc-watchdog library.
//!
//! Exposes the watchdog modules for use by integration tests.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod host_checks;
pub mod install;
pub mod logging;
pub mod monitor;
