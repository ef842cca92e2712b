//! # Requests and Responses
//!
//! A [`Request`] is the unit of work that travels down the pipeline. It is
//! owned by exactly one worker at a time and handed to the next stage by
//! value. The client holds the matching [`ResponseStream`] and reads
//! [`Response`]s until [`Response::End`].

use crate::aggregate::AggFunc;
use crate::error::QueryError;
use crate::query::Uri;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default capacity of a request's response channel.
pub const DEFAULT_RESPONSE_BUFFER: usize = 32;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Fetch specification (client input)
// =============================================================================

/// The parsed client query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Metadata graphs (sites) the query is scoped to.
    #[serde(default)]
    pub sites: Vec<String>,
    #[serde(default)]
    pub streams: Vec<StreamDefinition>,
    #[serde(default)]
    pub data_frames: Vec<DataFrame>,
    #[serde(default)]
    pub time: TimeParams,
}

/// A logical variable bound by a metadata query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub name: String,
    /// Query text handed to the metadata store.
    pub definition: String,
    /// Variables whose stream identifiers should be resolved, e.g. `?sensor`.
    #[serde(default)]
    pub data_vars: Vec<String>,
    /// Identifiers resolved by the metadata stage.
    #[serde(default)]
    pub uuids: Vec<String>,
}

/// A named output series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataFrame {
    pub name: String,
    #[serde(default)]
    pub aggregation: AggFunc,
    /// Window size for aggregated frames, e.g. `15m`.
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub uuids: Vec<String>,
    /// Stream definitions whose resolved identifiers are added to `uuids`.
    #[serde(default)]
    pub streams: Vec<String>,
}

/// Absolute time range, RFC 3339. `[start, end)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeParams {
    pub start: String,
    pub end: String,
}

impl TimeParams {
    /// Start and end in nanoseconds since the Unix epoch.
    pub fn to_nanos(&self) -> Result<(i64, i64), QueryError> {
        Ok((
            parse_timestamp("start", &self.start)?,
            parse_timestamp("end", &self.end)?,
        ))
    }
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<i64, QueryError> {
    let invalid = |reason: String| QueryError::Timestamp {
        field,
        value: value.to_string(),
        reason,
    };
    let parsed = DateTime::parse_from_rfc3339(value).map_err(|e| invalid(e.to_string()))?;
    parsed
        .timestamp_nanos_opt()
        .ok_or_else(|| invalid("outside the representable range".into()))
}

// =============================================================================
// Responses (client output)
// =============================================================================

/// A metadata result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRow {
    pub values: Vec<Uri>,
}

/// All rows returned for one stream definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub stream: String,
    pub variables: Vec<String>,
    pub rows: Vec<MetadataRow>,
}

/// Up to one batch worth of samples for one stream of one data frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchBatch {
    pub data_frame: String,
    pub identifier: String,
    pub times: Vec<i64>,
    pub values: Vec<f64>,
}

impl FetchBatch {
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

/// Terminal status of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Metadata(MetadataResponse),
    Data(FetchBatch),
    /// Exactly one per request, always last.
    End(Completion),
}

/// Outcome of [`Request::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    Sent,
    /// The request was cancelled or the client went away; the response
    /// was dropped.
    Dropped,
}

// =============================================================================
// Request
// =============================================================================

#[derive(Debug)]
pub struct Request {
    id: u64,
    pub fetch: FetchRequest,
    token: CancellationToken,
    responses: mpsc::Sender<Response>,
    errors: Vec<String>,
}

impl Request {
    /// Create a request and the client half that reads its responses.
    ///
    /// The request's token is a child of `parent`, so cancelling the
    /// process scope cancels every outstanding request.
    pub fn new(
        fetch: FetchRequest,
        parent: &CancellationToken,
        buffer: usize,
    ) -> (Request, ResponseStream) {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let token = parent.child_token();
        let request = Request {
            id,
            fetch,
            token: token.clone(),
            responses: tx,
            errors: Vec::new(),
        };
        let stream = ResponseStream { id, rx, token };
        (request, stream)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record an error. It is reported to the client in the final
    /// [`Completion`].
    pub fn add_error(&mut self, err: QueryError) {
        tracing::warn!(request = self.id, "{}", err);
        self.errors.push(err.to_string());
    }

    /// Detached handle that can still end this request if its owner is
    /// lost mid-processing.
    pub fn end_handle(&self) -> EndHandle {
        EndHandle {
            id: self.id,
            token: self.token.clone(),
            responses: self.responses.clone(),
        }
    }

    /// Send a response unless the request is cancelled first.
    ///
    /// Never blocks past cancellation. A closed response channel cancels the
    /// request so later publishes return immediately.
    pub async fn publish(&self, response: Response) -> Publish {
        send_or_cancel(&self.token, &self.responses, response).await
    }

    /// Publish the end marker. Consumes the request.
    pub async fn finish(mut self) {
        let completion = Completion {
            errors: std::mem::take(&mut self.errors),
        };
        if self.publish(Response::End(completion)).await == Publish::Dropped {
            tracing::debug!(request = self.id, "request ended after cancellation");
        }
    }
}

/// See [`Request::end_handle`].
#[derive(Debug, Clone)]
pub struct EndHandle {
    id: u64,
    token: CancellationToken,
    responses: mpsc::Sender<Response>,
}

impl EndHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Publish an end marker carrying only `reason`. Must only be used
    /// once the request itself can no longer be finished.
    pub async fn abort(self, reason: String) {
        let completion = Completion {
            errors: vec![reason],
        };
        if send_or_cancel(&self.token, &self.responses, Response::End(completion)).await
            == Publish::Dropped
        {
            tracing::debug!(request = self.id, "request aborted after cancellation");
        }
    }
}

async fn send_or_cancel(
    token: &CancellationToken,
    responses: &mpsc::Sender<Response>,
    response: Response,
) -> Publish {
    tokio::select! {
        biased;
        _ = token.cancelled() => Publish::Dropped,
        sent = responses.send(response) => match sent {
            Ok(()) => Publish::Sent,
            Err(_) => {
                token.cancel();
                Publish::Dropped
            }
        },
    }
}

// =============================================================================
// ResponseStream
// =============================================================================

/// Client half of a request.
#[derive(Debug)]
pub struct ResponseStream {
    id: u64,
    rx: mpsc::Receiver<Response>,
    token: CancellationToken,
}

impl ResponseStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next response, or `None` once the request has been dropped by the
    /// pipeline.
    pub async fn recv(&mut self) -> Option<Response> {
        self.rx.recv().await
    }

    /// Abandon the request. Responses not yet published are discarded.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Read responses up to and including [`Response::End`].
    pub async fn collect(mut self) -> Vec<Response> {
        let mut out = Vec::new();
        while let Some(response) = self.rx.recv().await {
            let end = matches!(response, Response::End(_));
            out.push(response);
            if end {
                break;
            }
        }
        out
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
