//! # Metadata Query Model
//!
//! A store-independent form of a parsed `SELECT` query. The metadata stage
//! rewrites it so that the query also returns the stream identifier of each
//! bound variable, then reads those identifiers back out of the result rows.

use crate::request::MetadataRow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Namespace of the BrickFrame vocabulary.
pub const BRICK_FRAME_NS: &str = "https://brickschema.org/schema/1.0.3/BrickFrame";

/// Suffix appended to a variable to name its identifier column.
const UUID_VAR_SUFFIX: &str = "_uuid";

/// A namespaced value. Literals have an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    #[serde(default)]
    pub namespace: String,
    pub value: String,
}

impl Uri {
    pub fn new(namespace: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            value: value.into(),
        }
    }

    pub fn literal(value: impl Into<String>) -> Self {
        Self::new("", value)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.value)
        } else {
            write!(f, "<{}#{}>", self.namespace, self.value)
        }
    }
}

/// The predicate linking a point to its stream identifier (`bf:uuid`).
pub fn uuid_predicate() -> Uri {
    Uri::new(BRICK_FRAME_NS, "uuid")
}

/// A position in a triple pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    /// Variable, including its leading `?`.
    Var(String),
    Uri(Uri),
}

impl Term {
    pub fn var(name: &str) -> Self {
        Term::Var(format!("?{}", name.trim_start_matches('?')))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriplePattern {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectQuery {
    /// Projection, in output column order.
    pub vars: Vec<String>,
    pub patterns: Vec<TriplePattern>,
    /// Graphs to evaluate against. Empty means all.
    pub graphs: Vec<String>,
    /// Snapshot version the query is pinned to.
    pub version: u64,
}

/// One result row, aligned with [`SelectQuery::vars`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub values: Vec<Uri>,
}

/// Extend `query` to also project the stream identifier of each variable in
/// `data_vars`.
///
/// For `?sensor` this adds the pattern `?sensor bf:uuid ?sensor_uuid` and the
/// projected variable `?sensor_uuid`. Returns the projection length before
/// the rewrite; every column from there on is an identifier column, in
/// `data_vars` order.
pub fn rewrite_query(data_vars: &[String], query: &mut SelectQuery) -> usize {
    let start_idx = query.vars.len();
    for var in data_vars {
        let base = var.trim_start_matches('?');
        let uuid_var = format!("?{}{}", base, UUID_VAR_SUFFIX);
        query.patterns.push(TriplePattern {
            subject: Term::var(base),
            predicate: Term::Uri(uuid_predicate()),
            object: Term::Var(uuid_var.clone()),
        });
        query.vars.push(uuid_var);
    }
    start_idx
}

/// Identifier values found in `columns` of each row, in row order then
/// column order. Duplicates are kept.
pub fn collect_identifiers(rows: &[ResultRow], columns: Range<usize>) -> Vec<String> {
    rows.iter()
        .flat_map(|row| {
            columns
                .clone()
                .filter_map(move |idx| row.values.get(idx).map(|v| v.value.clone()))
        })
        .collect()
}

/// Client-facing shape of a store row.
pub fn transform_row(row: &ResultRow) -> MetadataRow {
    MetadataRow {
        values: row
            .values
            .iter()
            .map(|v| Uri::new(v.namespace.clone(), v.value.clone()))
            .collect(),
    }
}
