//! Investigation Orchestrator
//!
//! Coordinates anti-money-laundering investigations:
//! - Collects context through generated follow-up questions
//! - Dispatches specialist analyzers concurrently from a data-driven policy
//! - Aggregates their scores into a weighted, explainable risk snapshot
//! - Streams every state change as an ordered per-session event log
//! - Learns confirmed risk signatures to bias future dispatch
//!
//! SESSION LIFECYCLE:
//! COLLECTING CONTEXT → DISPATCHING → RUNNING ⇄ AGGREGATING → COMPLETE

pub mod agent;
pub mod api;
pub mod audit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod execution;
pub mod gemini;
pub mod memory;
pub mod models;
pub mod questions;
pub mod risk;
pub mod specialists;
pub mod state;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use agent::Orchestrator;
pub use config::Config;
