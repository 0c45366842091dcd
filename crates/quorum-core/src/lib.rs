//! Core types for the Quorum orchestration engine
//!
//! This crate defines the fundamental data structures shared by the engine
//! crates: generation requests and responses, the typed provider error
//! taxonomy, model and orchestrator configuration, and the static cost
//! table used for cost-aware model ordering.

pub mod config;
pub mod cost;
pub mod error;
pub mod types;
