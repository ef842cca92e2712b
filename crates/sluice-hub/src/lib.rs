//! # sluice-hub: The Query Hub of SLUICE
//!
//! Runs the two-stage pipeline: the metadata stage resolves stream
//! definitions to stream identifiers, the timeseries stage fetches their
//! samples and streams them back in batches. Ships in-memory collaborators,
//! TOML configuration, readiness tracking and an HTTP surface.

pub mod api;
pub mod cache;
pub mod config;
pub mod health;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod stages;

pub use config::Config;
pub use health::{Health, Readiness};
pub use pipeline::Pipeline;
