//! Configuration module for the chop/nod burst demultiplexer
//!
//! Handles loading configuration from TOML files and environment variable overrides.

pub mod config;

pub use config::*;
