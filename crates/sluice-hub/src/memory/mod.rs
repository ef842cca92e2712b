//! In-memory collaborators: a versioned metadata graph and a timeseries
//! backend, loadable from JSON fixtures.

pub mod graph;
pub mod parser;
pub mod timeseries;

pub use graph::{MemoryGraph, MEMORY_SCHEME};
pub use timeseries::MemoryTimeseries;
