//! Gantry Core
//!
//! Core types and abstractions for the Gantry GPU cluster control plane.
//!
//! This crate contains:
//! - Domain types: Core entities (Job, Node, JobEvent, Identity)
//! - DTOs: Request, report and aggregate payloads exchanged over HTTP

pub mod domain;
pub mod dto;
