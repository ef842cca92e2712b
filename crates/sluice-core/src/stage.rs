//! # Pipeline Stages
//!
//! Stages form a linear chain. Each one publishes requests onto its own
//! bounded queue and pulls work from its upstream's queue with a fixed pool
//! of workers. Wiring happens once at construction; [`Stage::set_upstream`]
//! only redirects later reads.

use crate::error::StageError;
use crate::request::{FetchRequest, Request, ResponseStream};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

/// Default depth of a stage's output queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// The capability set every stage exposes.
pub trait Stage: fmt::Display + Send + Sync {
    /// The stage currently feeding this one. `None` at the head of the chain.
    fn upstream(&self) -> Option<Arc<dyn Stage>>;

    /// Replace the upstream reference.
    fn set_upstream(&self, upstream: Arc<dyn Stage>);

    /// The queue this stage publishes requests onto.
    fn queue(&self) -> flume::Receiver<Request>;
}

// =============================================================================
// Queues and links
// =============================================================================

/// Bounded multi-consumer output queue of a stage.
pub struct StageQueue {
    tx: flume::Sender<Request>,
    rx: flume::Receiver<Request>,
}

impl StageQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = flume::bounded(depth);
        Self { tx, rx }
    }

    pub fn receiver(&self) -> flume::Receiver<Request> {
        self.rx.clone()
    }

    /// Hand a request downstream. Gives up when `shutdown` fires first, in
    /// which case the request is dropped.
    pub async fn forward(&self, request: Request, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            sent = self.tx.send_async(request) => sent.is_ok(),
        }
    }
}

/// Lock-guarded upstream reference shared by a stage's workers.
pub struct UpstreamLink {
    inner: RwLock<Arc<dyn Stage>>,
}

impl UpstreamLink {
    pub fn new(upstream: Arc<dyn Stage>) -> Self {
        Self {
            inner: RwLock::new(upstream),
        }
    }

    pub fn get(&self) -> Arc<dyn Stage> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, upstream: Arc<dyn Stage>) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = upstream;
    }

    /// Wait for the next request from the current upstream queue.
    ///
    /// `None` when `shutdown` fires or the upstream queue is closed.
    pub async fn next(&self, shutdown: &CancellationToken) -> Option<Request> {
        let input = self.get().queue();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            received = input.recv_async() => received.ok(),
        }
    }
}

/// Walk the chain from `tail` to the head, collecting stage labels.
pub fn describe_chain(tail: Arc<dyn Stage>) -> Vec<String> {
    let mut labels = Vec::new();
    let mut current = Some(tail);
    while let Some(stage) = current {
        labels.push(stage.to_string());
        current = stage.upstream();
    }
    labels
}

// =============================================================================
// Ingress
// =============================================================================

/// Head of the chain: turns client fetch requests into [`Request`]s.
pub struct IngressStage {
    output: StageQueue,
    shutdown: CancellationToken,
    response_buffer: usize,
}

impl IngressStage {
    pub fn new(shutdown: CancellationToken, queue_depth: usize, response_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            output: StageQueue::new(queue_depth),
            shutdown,
            response_buffer,
        })
    }

    /// Enqueue a fetch request. The returned stream yields its responses.
    pub async fn submit(&self, fetch: FetchRequest) -> Result<ResponseStream, StageError> {
        let (request, responses) = Request::new(fetch, &self.shutdown, self.response_buffer);
        tracing::debug!(request = request.id(), "submitting request");
        if self.output.forward(request, &self.shutdown).await {
            Ok(responses)
        } else {
            Err(StageError::ShuttingDown)
        }
    }
}

impl Stage for IngressStage {
    fn upstream(&self) -> Option<Arc<dyn Stage>> {
        None
    }

    fn set_upstream(&self, upstream: Arc<dyn Stage>) {
        tracing::warn!("ignoring upstream {} for {}", upstream, self);
    }

    fn queue(&self) -> flume::Receiver<Request> {
        self.output.receiver()
    }
}

impl fmt::Display for IngressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<| ingress stage |>")
    }
}
