//! Configuration module for the HLS packager
//!
//! Handles loading configuration from TOML files and environment variable overrides,
//! and exposes the selectable base URLs used to build key URLs.

pub mod config;

pub use config::*;
