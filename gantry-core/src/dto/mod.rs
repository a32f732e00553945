//! Data Transfer Objects
//!
//! This module contains DTOs exchanged over HTTP: between dashboard clients
//! and the orchestrator, and between the orchestrator and node agents.

pub mod agent;
pub mod job;
pub mod node;
pub mod stats;
