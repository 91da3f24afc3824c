//! Outreach API - HTTP trigger surface
//!
//! This crate exposes the dispatch trigger, health checks, Prometheus
//! metrics and the OpenAPI document over axum.

pub mod auth;
pub mod handlers;
pub mod openapi;
pub mod routes;

pub use auth::AppState;
pub use openapi::create_openapi_routes;
pub use routes::create_router;
