//! # sluice-core: The Contract of SLUICE
//!
//! Types shared by every stage of the query pipeline: the [`Request`] that
//! moves between stages, the [`Stage`] trait that chains them, the
//! collaborator boundaries ([`MetadataStore`], [`TimeseriesBackend`]), and
//! the pure helpers for durations, aggregates and batching.
//!
//! A request flows ingress → metadata resolution → timeseries fetch. The
//! client reads metadata rows, then data batches, then exactly one
//! [`Response::End`].

pub mod aggregate;
pub mod backend;
pub mod batch;
pub mod duration;
pub mod error;
pub mod query;
pub mod request;
pub mod stage;
pub mod store;

pub use aggregate::{select_value, suggested_accuracy, AggFunc, RawPoint, StatPoint};
pub use backend::{PointSink, PointStream, StreamHandle, TimeseriesBackend};
pub use batch::{Batcher, DEFAULT_BATCH_SIZE};
pub use duration::parse_duration;
pub use error::{BackendError, DurationError, QueryError, StageError, StoreError};
pub use query::{ResultRow, SelectQuery, Term, TriplePattern, Uri};
pub use request::{
    Completion, DataFrame, EndHandle, FetchBatch, FetchRequest, MetadataResponse, MetadataRow,
    Publish, Request, Response, ResponseStream, StreamDefinition, TimeParams,
};
pub use stage::{describe_chain, IngressStage, Stage, StageQueue, UpstreamLink};
pub use store::MetadataStore;
