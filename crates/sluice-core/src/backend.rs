//! # Timeseries Backend Boundary
//!
//! A backend hands out [`StreamHandle`]s by identifier. Reads are streamed:
//! points arrive on a bounded channel, and a separate completion signal
//! reports the stream generation or the error that cut the read short.

use crate::aggregate::{RawPoint, StatPoint};
use crate::error::BackendError;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Points buffered between a backend reader and its consumer.
pub const POINT_BUFFER: usize = 1024;

pub trait TimeseriesBackend: Send + Sync {
    /// A handle for `uuid`. The stream is not guaranteed to exist.
    fn stream_from_uuid(&self, uuid: Uuid) -> Arc<dyn StreamHandle>;
}

#[async_trait::async_trait]
pub trait StreamHandle: Send + Sync {
    fn uuid(&self) -> Uuid;

    /// Whether the stream exists. Backends without an existence check
    /// return [`BackendError::Unsupported`].
    async fn exists(&self) -> Result<bool, BackendError>;

    /// Raw samples in `[start, end)` nanoseconds.
    fn raw_values(&self, start: i64, end: i64, version: u64) -> PointStream<RawPoint>;

    /// Window summaries of `width` nanoseconds over `[start, end)`. `depth`
    /// is the precision hint.
    fn windows(
        &self,
        start: i64,
        end: i64,
        width: u64,
        depth: u8,
        version: u64,
    ) -> PointStream<StatPoint>;
}

/// Consumer half of a streamed read.
pub struct PointStream<T> {
    pub points: mpsc::Receiver<T>,
    done: oneshot::Receiver<Result<u64, BackendError>>,
}

/// Producer half of a streamed read.
pub struct PointSink<T> {
    points: mpsc::Sender<T>,
    done: oneshot::Sender<Result<u64, BackendError>>,
}

impl<T> PointStream<T> {
    pub fn channel(buffer: usize) -> (PointSink<T>, PointStream<T>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (done_tx, done_rx) = oneshot::channel();
        (
            PointSink {
                points: tx,
                done: done_tx,
            },
            PointStream {
                points: rx,
                done: done_rx,
            },
        )
    }

    /// Wait for the read to complete. Returns the stream generation.
    ///
    /// Call after `points` is exhausted.
    pub async fn completion(self) -> Result<u64, BackendError> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Failed("read ended without completion".into())),
        }
    }
}

impl<T> PointSink<T> {
    /// Returns `false` once the consumer has gone away.
    pub async fn send(&self, point: T) -> bool {
        self.points.send(point).await.is_ok()
    }

    /// Close the point channel and report the outcome.
    pub fn complete(self, result: Result<u64, BackendError>) {
        let PointSink { points, done } = self;
        drop(points);
        let _ = done.send(result);
    }
}
