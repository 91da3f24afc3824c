//! API request handlers

pub mod dispatch;
pub mod health;
pub mod metrics;

pub use health::*;
