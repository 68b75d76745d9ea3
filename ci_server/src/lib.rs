//! CI build orchestrator.
//!
//! Receives GitHub events, runs each build's tasks inside a fresh container,
//! and reports the outcome as commit statuses, comments and webhooks.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod migration;
pub mod models;
pub mod routes;
pub mod schema;
pub mod services;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod fakes;
