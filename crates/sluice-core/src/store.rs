//! # Metadata Store Boundary
//!
//! The metadata stage talks to its graph store only through
//! [`MetadataStore`]. The store owns the query language; the stage only sees
//! the parsed [`SelectQuery`].

use crate::error::StoreError;
use crate::query::{ResultRow, SelectQuery};

/// Query used at stage startup to check the store answers at all.
pub const BOOTSTRAP_QUERY: &str = "SELECT ?c WHERE { ?c rdf:type brick:Class };";

#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Current snapshot version. Later versions see later writes.
    fn highwatermark(&self) -> u64;

    /// Parse query text, pinned to `version`.
    fn parse(&self, text: &str, version: u64) -> Result<SelectQuery, StoreError>;

    /// Execute a parsed query. Rows are aligned with `query.vars`.
    async fn select(&self, query: &SelectQuery) -> Result<Vec<ResultRow>, StoreError>;
}
