//! # In-Memory Metadata Graph
//!
//! A versioned triple store. Every insert batch bumps the version and stamps
//! its triples with it, so a query pinned to version `v` only sees what was
//! inserted up to `v`. Queries are conjunctive: each pattern is joined
//! against the bindings produced so far.

use super::parser::{self, default_prefixes, Prefixes};
use async_trait::async_trait;
use serde::Deserialize;
use sluice_core::{MetadataStore, ResultRow, SelectQuery, StageError, StoreError, Term, TriplePattern, Uri};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

pub const MEMORY_SCHEME: &str = "memory://";

/// On-disk fixture: prefixes plus triples per graph, in query syntax.
#[derive(Debug, Deserialize)]
struct GraphFixture {
    #[serde(default)]
    prefixes: HashMap<String, String>,
    #[serde(default)]
    graphs: BTreeMap<String, Vec<[String; 3]>>,
}

struct StoredTriple {
    graph: String,
    subject: Uri,
    predicate: Uri,
    object: Uri,
    version: u64,
}

struct GraphState {
    prefixes: Prefixes,
    triples: Vec<StoredTriple>,
    version: u64,
}

pub struct MemoryGraph {
    state: RwLock<GraphState>,
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState {
                prefixes: default_prefixes(),
                triples: Vec::new(),
                version: 0,
            }),
        }
    }

    /// Open `location`: `memory://` for an empty graph, else a JSON fixture
    /// path (optionally `file://`-prefixed).
    pub fn connect(location: &str) -> Result<Self, StageError> {
        let graph = Self::new();
        if location.is_empty() || location == MEMORY_SCHEME {
            return Ok(graph);
        }
        let path = location.strip_prefix("file://").unwrap_or(location);
        let content = std::fs::read_to_string(path).map_err(|e| StageError::Connect {
            target: location.to_string(),
            reason: e.to_string(),
        })?;
        let version = graph.load_json(&content).map_err(|e| StageError::Connect {
            target: location.to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(location, version, "Loaded metadata graph");
        Ok(graph)
    }

    /// Load a JSON fixture. Each graph is inserted as its own version.
    pub fn load_json(&self, json: &str) -> Result<u64, StoreError> {
        let fixture: GraphFixture =
            serde_json::from_str(json).map_err(|e| StoreError::Parse(e.to_string()))?;
        self.write().prefixes.extend(fixture.prefixes);
        for (graph, triples) in &fixture.graphs {
            let triples: Vec<[&str; 3]> = triples
                .iter()
                .map(|[s, p, o]| [s.as_str(), p.as_str(), o.as_str()])
                .collect();
            self.insert(graph, &triples)?;
        }
        Ok(self.highwatermark())
    }

    /// Insert triples into `graph` as one new version. Returns that version.
    pub fn insert(&self, graph: &str, triples: &[[&str; 3]]) -> Result<u64, StoreError> {
        let mut state = self.write();
        let mut parsed = Vec::with_capacity(triples.len());
        for [s, p, o] in triples {
            parsed.push((
                ground(s, &state.prefixes)?,
                ground(p, &state.prefixes)?,
                ground(o, &state.prefixes)?,
            ));
        }

        state.version += 1;
        let version = state.version;
        state
            .triples
            .extend(parsed.into_iter().map(|(subject, predicate, object)| StoredTriple {
                graph: graph.to_string(),
                subject,
                predicate,
                object,
                version,
            }));
        Ok(version)
    }

    pub fn len(&self) -> usize {
        self.read().triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, GraphState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn evaluate(&self, query: &SelectQuery) -> Result<Vec<ResultRow>, StoreError> {
        let state = self.read();
        let visible: Vec<&StoredTriple> = state
            .triples
            .iter()
            .filter(|t| t.version <= query.version && in_scope(&t.graph, &query.graphs))
            .collect();

        let mut solutions: Vec<Bindings<'_>> = vec![Bindings::new()];
        for pattern in &query.patterns {
            solutions = solutions
                .iter()
                .flat_map(|bindings| {
                    visible
                        .iter()
                        .copied()
                        .filter_map(move |triple| unify(pattern, triple, bindings))
                })
                .collect();
            if solutions.is_empty() {
                break;
            }
        }

        solutions
            .iter()
            .map(|bindings| {
                query
                    .vars
                    .iter()
                    .map(|var| {
                        bindings
                            .get(var.as_str())
                            .map(|uri| (*uri).clone())
                            .ok_or_else(|| StoreError::Execution(format!("{} is unbound", var)))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(|values| ResultRow { values })
            })
            .collect()
    }
}

type Bindings<'a> = HashMap<&'a str, &'a Uri>;

fn ground(token: &str, prefixes: &Prefixes) -> Result<Uri, StoreError> {
    match parser::parse_term(token, prefixes)? {
        Term::Uri(uri) => Ok(uri),
        Term::Var(var) => Err(StoreError::Parse(format!("variable {} in stored triple", var))),
    }
}

fn in_scope(graph: &str, graphs: &[String]) -> bool {
    graphs.is_empty() || graphs.iter().any(|g| g == "*" || g == graph)
}

fn unify<'a>(
    pattern: &'a TriplePattern,
    triple: &'a StoredTriple,
    bindings: &Bindings<'a>,
) -> Option<Bindings<'a>> {
    let mut next = bindings.clone();
    for (term, value) in [
        (&pattern.subject, &triple.subject),
        (&pattern.predicate, &triple.predicate),
        (&pattern.object, &triple.object),
    ] {
        match term {
            Term::Uri(uri) => {
                if uri != value {
                    return None;
                }
            }
            Term::Var(name) => match next.get(name.as_str()) {
                Some(bound) if *bound != value => return None,
                Some(_) => {}
                None => {
                    next.insert(name.as_str(), value);
                }
            },
        }
    }
    Some(next)
}

#[async_trait]
impl MetadataStore for MemoryGraph {
    fn highwatermark(&self) -> u64 {
        self.read().version
    }

    fn parse(&self, text: &str, version: u64) -> Result<SelectQuery, StoreError> {
        parser::parse(text, &self.read().prefixes, version)
    }

    async fn select(&self, query: &SelectQuery) -> Result<Vec<ResultRow>, StoreError> {
        self.evaluate(query)
    }
}
