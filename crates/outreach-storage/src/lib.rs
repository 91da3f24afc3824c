//! Outreach Storage - Persistence for the dispatch engine
//!
//! This crate provides the campaign, recipient, template, thread and
//! wallet models together with repository traits, a PostgreSQL
//! implementation and an in-memory implementation.

pub mod db;
pub mod filter;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use filter::{Combinator, Condition, FilterError, FilterExpression, FilterOperator, RecipientFilter};
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
pub use sqlx::types::Json;
