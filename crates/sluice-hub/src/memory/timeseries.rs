//! # In-Memory Timeseries Backend
//!
//! Streams of `(time, value)` samples kept sorted by time. Reads run on a
//! spawned task and push into a [`PointSink`], the way a networked backend
//! would. A stream can be given a fault, which cuts every read short with a
//! backend error after its points are sent.

use async_trait::async_trait;
use serde::Deserialize;
use sluice_core::backend::POINT_BUFFER;
use sluice_core::{
    BackendError, PointSink, PointStream, RawPoint, StageError, StatPoint, StreamHandle,
    TimeseriesBackend,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

use super::MEMORY_SCHEME;

#[derive(Debug, Deserialize)]
struct TimeseriesFixture {
    #[serde(default)]
    unsupported_exists: bool,
    #[serde(default)]
    streams: Vec<StreamFixture>,
}

#[derive(Debug, Deserialize)]
struct StreamFixture {
    uuid: Uuid,
    #[serde(default)]
    points: Vec<(i64, f64)>,
    #[serde(default)]
    fault: Option<String>,
}

#[derive(Clone, Default)]
struct StreamData {
    points: Vec<(i64, f64)>,
    generation: u64,
    fault: Option<String>,
}

#[derive(Default)]
struct Shared {
    streams: RwLock<HashMap<Uuid, StreamData>>,
    unsupported_exists: AtomicBool,
    exists_calls: AtomicU64,
}

impl Shared {
    fn snapshot(&self, uuid: &Uuid) -> Option<StreamData> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uuid)
            .cloned()
    }
}

#[derive(Clone, Default)]
pub struct MemoryTimeseries {
    shared: Arc<Shared>,
}

impl MemoryTimeseries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `location`: `memory://` for an empty backend, else a JSON fixture
    /// path (optionally `file://`-prefixed).
    pub fn connect(location: &str) -> Result<Self, StageError> {
        let backend = Self::new();
        if location.is_empty() || location == MEMORY_SCHEME {
            return Ok(backend);
        }
        let path = location.strip_prefix("file://").unwrap_or(location);
        let connect_err = |reason: String| StageError::Connect {
            target: location.to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| connect_err(e.to_string()))?;
        let fixture: TimeseriesFixture =
            serde_json::from_str(&content).map_err(|e| connect_err(e.to_string()))?;

        backend.set_unsupported_exists(fixture.unsupported_exists);
        let count = fixture.streams.len();
        for stream in fixture.streams {
            backend.insert(stream.uuid, &stream.points);
            if let Some(fault) = stream.fault {
                backend.set_fault(stream.uuid, fault);
            }
        }
        tracing::info!(location, streams = count, "Loaded timeseries streams");
        Ok(backend)
    }

    /// Add samples to `uuid`, creating the stream if needed. Bumps its
    /// generation.
    pub fn insert(&self, uuid: Uuid, points: &[(i64, f64)]) {
        let mut streams = self
            .shared
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stream = streams.entry(uuid).or_default();
        stream.points.extend_from_slice(points);
        stream.points.sort_by_key(|(time, _)| *time);
        stream.generation += 1;
    }

    pub fn set_fault(&self, uuid: Uuid, fault: impl Into<String>) {
        let mut streams = self
            .shared
            .streams
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        streams.entry(uuid).or_default().fault = Some(fault.into());
    }

    /// Make existence checks answer [`BackendError::Unsupported`].
    pub fn set_unsupported_exists(&self, unsupported: bool) {
        self.shared
            .unsupported_exists
            .store(unsupported, Ordering::Relaxed);
    }

    /// Existence checks answered so far.
    pub fn exists_calls(&self) -> u64 {
        self.shared.exists_calls.load(Ordering::Relaxed)
    }
}

impl TimeseriesBackend for MemoryTimeseries {
    fn stream_from_uuid(&self, uuid: Uuid) -> Arc<dyn StreamHandle> {
        Arc::new(MemoryStream {
            uuid,
            shared: self.shared.clone(),
        })
    }
}

pub struct MemoryStream {
    uuid: Uuid,
    shared: Arc<Shared>,
}

#[async_trait]
impl StreamHandle for MemoryStream {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn exists(&self) -> Result<bool, BackendError> {
        self.shared.exists_calls.fetch_add(1, Ordering::Relaxed);
        if self.shared.unsupported_exists.load(Ordering::Relaxed) {
            return Err(BackendError::Unsupported);
        }
        Ok(self.shared.snapshot(&self.uuid).is_some())
    }

    fn raw_values(&self, start: i64, end: i64, _version: u64) -> PointStream<RawPoint> {
        let (sink, stream) = PointStream::channel(POINT_BUFFER);
        let data = self.shared.snapshot(&self.uuid).unwrap_or_default();
        tokio::spawn(async move {
            for &(time, value) in in_range(&data.points, start, end) {
                if !sink.send(RawPoint { time, value }).await {
                    return;
                }
            }
            finish(sink, &data);
        });
        stream
    }

    fn windows(
        &self,
        start: i64,
        end: i64,
        width: u64,
        _depth: u8,
        _version: u64,
    ) -> PointStream<StatPoint> {
        let (sink, stream) = PointStream::channel(POINT_BUFFER);
        let data = self.shared.snapshot(&self.uuid).unwrap_or_default();
        tokio::spawn(async move {
            let width = match i64::try_from(width) {
                Ok(w) if w > 0 => w,
                _ => {
                    sink.complete(Err(BackendError::Failed(format!(
                        "invalid window width {}",
                        width
                    ))));
                    return;
                }
            };
            let mut window_start = start;
            while let Some(window_end) = window_start.checked_add(width).filter(|e| *e <= end) {
                let summary = summarize(&data.points, window_start, window_end);
                if !sink.send(summary).await {
                    return;
                }
                window_start = window_end;
            }
            finish(sink, &data);
        });
        stream
    }
}

fn finish<T>(sink: PointSink<T>, data: &StreamData) {
    match &data.fault {
        Some(fault) => sink.complete(Err(BackendError::Failed(fault.clone()))),
        None => sink.complete(Ok(data.generation)),
    }
}

/// The samples of a time-sorted series that fall in `[start, end)`.
fn in_range(points: &[(i64, f64)], start: i64, end: i64) -> &[(i64, f64)] {
    let lo = points.partition_point(|(t, _)| *t < start);
    let hi = points.partition_point(|(t, _)| *t < end).max(lo);
    &points[lo..hi]
}

/// Summary of samples in `[start, end)`. Empty windows have count 0.
fn summarize(points: &[(i64, f64)], start: i64, end: i64) -> StatPoint {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut count = 0u64;
    for &(_, value) in in_range(points, start, end) {
        min = min.min(value);
        max = max.max(value);
        sum += value;
        count += 1;
    }
    if count == 0 {
        return StatPoint {
            time: start,
            min: 0.0,
            mean: 0.0,
            max: 0.0,
            count: 0,
        };
    }
    StatPoint {
        time: start,
        min,
        mean: sum / count as f64,
        max,
        count,
    }
}
