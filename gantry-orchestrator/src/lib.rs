//! Gantry Orchestrator
//!
//! Control plane of the Gantry GPU cluster:
//! - `repository`: durable job records behind a compare-and-swap store
//! - `registry`: live node state and GPU reservations
//! - `service`: submission, scheduling, lifecycle and log handling
//! - `api`: the HTTP surface used by the dashboard and node agents

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod registry;
pub mod repository;
pub mod service;

pub use app::Orchestrator;
pub use config::Config;
