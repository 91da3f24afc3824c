//! Outreach Common - Shared types and configuration
//!
//! This crate provides the identifiers, configuration and error type
//! shared across all Outreach components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
