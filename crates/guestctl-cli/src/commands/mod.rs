//! Subcommand implementations.

pub mod config;
pub mod context;
pub mod replay;
