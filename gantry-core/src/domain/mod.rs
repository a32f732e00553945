//! Core domain types
//!
//! This module contains the core domain structures used across Gantry crates.
//! These types represent the fundamental entities of the cluster and are shared
//! between the orchestrator (which owns them) and its clients.

pub mod identity;
pub mod job;
pub mod node;
