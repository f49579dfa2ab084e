//! # warden
//!
//! Operator CLI over the warden-core risk register.
//!
//! The binary is a thin shell around this library: `cli::execute` runs one
//! command against one session and returns its JSON report, so commands
//! are testable without capturing stdout.

pub mod cli;
pub mod config;
