//! # Timeseries Stage
//!
//! Terminal stage. For every data frame and every identifier bound to it,
//! reads the stream over the request's time range and publishes the samples
//! in bounded batches. RAW frames get raw samples; aggregated frames get one
//! value per window, picked from the window summary. Every request taken off
//! the queue is finished here, with any error reported in its end marker.
//!
//! Stream handles are cached once the backend confirms the stream exists.
//! Backends that cannot answer existence checks get an uncached handle.

use crate::cache::StreamCache;
use crate::metrics::StageMetrics;
use crate::stages::{handle_guarded, WorkerPool};
use sluice_core::{
    parse_duration, select_value, suggested_accuracy, AggFunc, BackendError, Batcher, DataFrame,
    FetchBatch, Publish, QueryError, Request, Response, Stage, StageError, StageQueue,
    StreamHandle, TimeseriesBackend, UpstreamLink,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct TimeseriesStageConfig {
    pub upstream: Arc<dyn Stage>,
    pub shutdown: CancellationToken,
    pub workers: usize,
    pub queue_depth: usize,
    pub batch_size: usize,
    pub cache_capacity: usize,
    pub cache_ttl: Option<Duration>,
}

pub struct TimeseriesStage {
    upstream: UpstreamLink,
    output: StageQueue,
    shutdown: CancellationToken,
    backend: Arc<dyn TimeseriesBackend>,
    cache: StreamCache,
    batch_size: usize,
    metrics: StageMetrics,
    pool: WorkerPool,
}

impl TimeseriesStage {
    pub fn start(
        config: TimeseriesStageConfig,
        backend: Arc<dyn TimeseriesBackend>,
    ) -> Result<Arc<Self>, StageError> {
        if config.workers == 0 {
            return Err(StageError::Config("timeseries stage needs at least one worker".into()));
        }
        if config.batch_size == 0 {
            return Err(StageError::Config("batch size must be at least 1".into()));
        }

        let stage = Arc::new(Self {
            upstream: UpstreamLink::new(config.upstream),
            output: StageQueue::new(config.queue_depth),
            shutdown: config.shutdown,
            backend,
            cache: StreamCache::new(config.cache_capacity, config.cache_ttl),
            batch_size: config.batch_size,
            metrics: StageMetrics::default(),
            pool: WorkerPool::default(),
        });

        for worker in 0..config.workers {
            stage.pool.spawn(Arc::clone(&stage).run_worker(worker));
        }
        info!(workers = config.workers, "Started timeseries stage");
        Ok(stage)
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn workers(&self) -> usize {
        self.pool.len()
    }

    pub async fn join(&self) {
        self.pool.join("timeseries").await;
    }

    /// Handle for `uuid`, checking existence on a cache miss.
    pub async fn get_stream(&self, uuid: Uuid) -> Result<Arc<dyn StreamHandle>, QueryError> {
        if let Some(stream) = self.cache.get(&uuid) {
            StageMetrics::incr(&self.metrics.cache_hits);
            return Ok(stream);
        }
        StageMetrics::incr(&self.metrics.cache_misses);

        let stream = self.backend.stream_from_uuid(uuid);
        match stream.exists().await {
            Ok(true) => {
                self.cache.insert(uuid, stream.clone());
                Ok(stream)
            }
            Ok(false) => Err(QueryError::StreamNotFound(uuid)),
            Err(e) if e.is_unsupported() => {
                debug!(%uuid, "backend cannot check existence, skipping cache");
                Ok(stream)
            }
            Err(source) => Err(QueryError::StreamLookup { uuid, source }),
        }
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        while let Some(request) = self.upstream.next(&self.shutdown).await {
            let end = request.end_handle();
            handle_guarded("timeseries", &self.metrics, end, self.handle(request)).await;
        }
        debug!(worker, "Ending timeseries queue");
    }

    async fn handle(&self, mut request: Request) {
        StageMetrics::incr(&self.metrics.requests_total);
        if request.fetch.sites.is_empty() || request.fetch.data_frames.is_empty() {
            request.finish().await;
            return;
        }

        if let Err(err) = self.process_query(&request).await {
            StageMetrics::incr(&self.metrics.requests_failed);
            request.add_error(err);
        }
        request.finish().await;
    }

    async fn process_query(&self, request: &Request) -> Result<(), QueryError> {
        let (start, end) = request.fetch.time.to_nanos()?;
        debug!(request = request.id(), start, end, "fetching data");

        for frame in &request.fetch.data_frames {
            for identifier in &frame.uuids {
                let uuid = match Uuid::parse_str(identifier) {
                    Ok(uuid) => uuid,
                    Err(e) => {
                        warn!("Could not parse uuid {}: {}", identifier, e);
                        StageMetrics::incr(&self.metrics.identifiers_skipped);
                        continue;
                    }
                };
                let stream = self.get_stream(uuid).await?;
                match frame.aggregation {
                    AggFunc::Raw => {
                        self.fetch_raw(request, frame, identifier, stream.as_ref(), start, end)
                            .await?
                    }
                    _ => {
                        self.fetch_windows(request, frame, identifier, stream.as_ref(), start, end)
                            .await?
                    }
                }
            }
        }
        Ok(())
    }

    async fn fetch_raw(
        &self,
        request: &Request,
        frame: &DataFrame,
        identifier: &str,
        stream: &dyn StreamHandle,
        start: i64,
        end: i64,
    ) -> Result<(), QueryError> {
        let mut points = stream.raw_values(start, end, 0);
        let mut batcher = Batcher::new(self.batch_size, &frame.name, identifier);
        while let Some(point) = points.points.recv().await {
            if point.time > end {
                continue;
            }
            if let Some(batch) = batcher.push(point.time, point.value) {
                self.publish(request, batch).await;
            }
        }
        if let Some(batch) = batcher.flush() {
            self.publish(request, batch).await;
        }

        points
            .completion()
            .await
            .map(|_generation| ())
            .map_err(|source| read_failed(stream.uuid(), source))
    }

    async fn fetch_windows(
        &self,
        request: &Request,
        frame: &DataFrame,
        identifier: &str,
        stream: &dyn StreamHandle,
        start: i64,
        end: i64,
    ) -> Result<(), QueryError> {
        let window = frame
            .window
            .as_deref()
            .ok_or_else(|| QueryError::MissingWindow(frame.name.clone()))?;
        let width = parse_duration(window).map_err(|source| QueryError::Duration {
            frame: frame.name.clone(),
            source,
        })?;
        let depth = suggested_accuracy(width);
        let width = u64::try_from(width.as_nanos()).unwrap_or(u64::MAX);

        let mut points = stream.windows(start, end, width, depth, 0);
        let mut batcher = Batcher::new(self.batch_size, &frame.name, identifier);
        while let Some(point) = points.points.recv().await {
            let value = select_value(&point, frame.aggregation);
            if let Some(batch) = batcher.push(point.time, value) {
                self.publish(request, batch).await;
            }
        }
        if let Some(batch) = batcher.flush() {
            self.publish(request, batch).await;
        }

        points
            .completion()
            .await
            .map(|_generation| ())
            .map_err(|source| read_failed(stream.uuid(), source))
    }

    async fn publish(&self, request: &Request, batch: FetchBatch) {
        let points = batch.len() as u64;
        match request.publish(Response::Data(batch)).await {
            Publish::Sent => {
                StageMetrics::incr(&self.metrics.batches_published);
                StageMetrics::add(&self.metrics.points_published, points);
            }
            Publish::Dropped => StageMetrics::incr(&self.metrics.batches_dropped),
        }
    }
}

fn read_failed(uuid: Uuid, source: BackendError) -> QueryError {
    error!(%uuid, "Error while reading stream: {}", source);
    QueryError::Backend { uuid, source }
}

impl Stage for TimeseriesStage {
    fn upstream(&self) -> Option<Arc<dyn Stage>> {
        Some(self.upstream.get())
    }

    fn set_upstream(&self, upstream: Arc<dyn Stage>) {
        info!("Updated stage to {}", upstream);
        self.upstream.set(upstream);
    }

    /// Terminal stage: nothing is ever published here.
    fn queue(&self) -> flume::Receiver<Request> {
        self.output.receiver()
    }
}

impl fmt::Display for TimeseriesStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<| timeseries stage |>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTimeseries;
    use sluice_core::{
        FetchRequest, IngressStage, PointStream, RawPoint, StatPoint, TimeParams,
    };
    use std::sync::Mutex;

    const T0: &str = "1970-01-01T00:00:00Z";

    fn stage_over(
        backend: Arc<dyn TimeseriesBackend>,
        batch_size: usize,
    ) -> (CancellationToken, Arc<IngressStage>, Arc<TimeseriesStage>) {
        let token = CancellationToken::new();
        let ingress = IngressStage::new(token.clone(), 4, 64);
        let stage = TimeseriesStage::start(
            TimeseriesStageConfig {
                upstream: ingress.clone(),
                shutdown: token.clone(),
                workers: 2,
                queue_depth: 4,
                batch_size,
                cache_capacity: 16,
                cache_ttl: None,
            },
            backend,
        )
        .unwrap();
        (token, ingress, stage)
    }

    fn frame(name: &str, aggregation: AggFunc, window: Option<&str>, uuids: &[Uuid]) -> DataFrame {
        DataFrame {
            name: name.into(),
            aggregation,
            window: window.map(String::from),
            uuids: uuids.iter().map(Uuid::to_string).collect(),
            streams: Vec::new(),
        }
    }

    fn fetch(frames: Vec<DataFrame>, end: &str) -> FetchRequest {
        FetchRequest {
            sites: vec!["ciee".into()],
            data_frames: frames,
            time: TimeParams {
                start: T0.into(),
                end: end.into(),
            },
            ..Default::default()
        }
    }

    fn split(responses: Vec<Response>) -> (Vec<FetchBatch>, Vec<String>) {
        let mut batches = Vec::new();
        let mut errors = Vec::new();
        for response in responses {
            match response {
                Response::Data(batch) => batches.push(batch),
                Response::End(done) => errors = done.errors,
                Response::Metadata(_) => panic!("unexpected metadata"),
            }
        }
        (batches, errors)
    }

    #[tokio::test]
    async fn test_raw_frame_batches_points() {
        let backend = MemoryTimeseries::new();
        let uuid = Uuid::new_v4();
        backend.insert(uuid, &[(1, 1.0), (2, 2.0), (3, 3.0), (4, 4.0), (5, 5.0)]);
        let (token, ingress, stage) = stage_over(Arc::new(backend), 2);

        let responses = ingress
            .submit(fetch(vec![frame("raw", AggFunc::Raw, None, &[uuid])], "1970-01-01T00:00:01Z"))
            .await
            .unwrap();
        let (batches, errors) = split(responses.collect().await);
        assert!(errors.is_empty());
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].times, vec![1, 2]);
        assert_eq!(batches[2].values, vec![5.0]);
        assert!(batches.iter().all(|b| b.data_frame == "raw" && b.identifier == uuid.to_string()));
        assert_eq!(stage.metrics().snapshot().points_published, 5);
        token.cancel();
    }

    #[tokio::test]
    async fn test_aggregated_frame_selects_values() {
        let backend = MemoryTimeseries::new();
        let uuid = Uuid::new_v4();
        let minute = 60_000_000_000i64;
        backend.insert(uuid, &[(0, 1.0), (1, 3.0), (2 * minute, 10.0)]);
        let (token, ingress, _stage) = stage_over(Arc::new(backend), 100);

        let responses = ingress
            .submit(fetch(
                vec![frame("max", AggFunc::Max, Some("1m"), &[uuid])],
                "1970-01-01T00:03:00Z",
            ))
            .await
            .unwrap();
        let (batches, errors) = split(responses.collect().await);
        assert!(errors.is_empty());
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].times, vec![0, minute, 2 * minute]);
        assert_eq!(batches[0].values[0], 3.0);
        assert!(batches[0].values[1].is_nan());
        assert_eq!(batches[0].values[2], 10.0);
        token.cancel();
    }

    #[tokio::test]
    async fn test_missing_window_is_reported() {
        let backend = MemoryTimeseries::new();
        let uuid = Uuid::new_v4();
        backend.insert(uuid, &[(0, 1.0)]);
        let (token, ingress, _stage) = stage_over(Arc::new(backend), 100);

        let responses = ingress
            .submit(fetch(vec![frame("mean", AggFunc::Mean, None, &[uuid])], "1970-01-01T00:03:00Z"))
            .await
            .unwrap();
        let (batches, errors) = split(responses.collect().await);
        assert!(batches.is_empty());
        assert_eq!(errors, vec!["data frame 'mean' requests an aggregate but has no window"]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_bad_window_is_reported() {
        let backend = MemoryTimeseries::new();
        let uuid = Uuid::new_v4();
        backend.insert(uuid, &[(0, 1.0)]);
        let (token, ingress, _stage) = stage_over(Arc::new(backend), 100);

        let responses = ingress
            .submit(fetch(vec![frame("mean", AggFunc::Mean, Some("3xyz"), &[uuid])], T0))
            .await
            .unwrap();
        let (_, errors) = split(responses.collect().await);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("invalid unit 'xyz'"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_missing_stream_fails_request() {
        let backend = MemoryTimeseries::new();
        let known = Uuid::new_v4();
        let unknown = Uuid::new_v4();
        backend.insert(known, &[(1, 1.0)]);
        let (token, ingress, _stage) = stage_over(Arc::new(backend), 100);

        let responses = ingress
            .submit(fetch(
                vec![frame("raw", AggFunc::Raw, None, &[unknown, known])],
                "1970-01-01T00:00:01Z",
            ))
            .await
            .unwrap();
        let (batches, errors) = split(responses.collect().await);
        assert!(batches.is_empty());
        assert_eq!(errors, vec![format!("stream {} does not exist", unknown)]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_bad_identifier_is_skipped() {
        let backend = MemoryTimeseries::new();
        let uuid = Uuid::new_v4();
        backend.insert(uuid, &[(1, 1.0)]);
        let (token, ingress, stage) = stage_over(Arc::new(backend), 100);

        let mut bad = frame("raw", AggFunc::Raw, None, &[uuid]);
        bad.uuids.insert(0, "not-a-uuid".into());
        let responses = ingress
            .submit(fetch(vec![bad], "1970-01-01T00:00:01Z"))
            .await
            .unwrap();
        let (batches, errors) = split(responses.collect().await);
        assert!(errors.is_empty());
        assert_eq!(batches.len(), 1);
        assert_eq!(stage.metrics().snapshot().identifiers_skipped, 1);
        token.cancel();
    }

    #[tokio::test]
    async fn test_requests_without_sites_or_frames_just_end() {
        let backend = MemoryTimeseries::new();
        let (token, ingress, _stage) = stage_over(Arc::new(backend), 100);

        let mut no_sites = fetch(vec![frame("raw", AggFunc::Raw, None, &[Uuid::new_v4()])], T0);
        no_sites.sites.clear();
        let responses = ingress.submit(no_sites).await.unwrap();
        assert!(matches!(responses.collect().await.as_slice(), [Response::End(_)]));

        let responses = ingress.submit(fetch(Vec::new(), T0)).await.unwrap();
        assert!(matches!(responses.collect().await.as_slice(), [Response::End(_)]));
        token.cancel();
    }

    #[tokio::test]
    async fn test_bad_time_range_is_reported() {
        let backend = MemoryTimeseries::new();
        let (token, ingress, _stage) = stage_over(Arc::new(backend), 100);
        let responses = ingress
            .submit(fetch(vec![frame("raw", AggFunc::Raw, None, &[Uuid::new_v4()])], "yesterday"))
            .await
            .unwrap();
        let (_, errors) = split(responses.collect().await);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("could not parse end time (yesterday)"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_backend_fault_is_reported_after_data() {
        let backend = MemoryTimeseries::new();
        let uuid = Uuid::new_v4();
        backend.insert(uuid, &[(1, 1.0)]);
        backend.set_fault(uuid, "replica lost");
        let (token, ingress, _stage) = stage_over(Arc::new(backend), 100);

        let responses = ingress
            .submit(fetch(vec![frame("raw", AggFunc::Raw, None, &[uuid])], "1970-01-01T00:00:01Z"))
            .await
            .unwrap();
        let (batches, errors) = split(responses.collect().await);
        assert_eq!(batches.len(), 1);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("replica lost"));
        token.cancel();
    }

    #[tokio::test]
    async fn test_existence_checked_once_per_stream() {
        let backend = MemoryTimeseries::new();
        let uuid = Uuid::new_v4();
        backend.insert(uuid, &[(1, 1.0)]);
        let (token, _ingress, stage) = stage_over(Arc::new(backend.clone()), 100);

        stage.get_stream(uuid).await.unwrap();
        stage.get_stream(uuid).await.unwrap();
        assert_eq!(backend.exists_calls(), 1);
        let snap = stage.metrics().snapshot();
        assert_eq!((snap.cache_hits, snap.cache_misses), (1, 1));
        token.cancel();
    }

    #[tokio::test]
    async fn test_missing_stream_is_not_cached() {
        let backend = MemoryTimeseries::new();
        let uuid = Uuid::new_v4();
        let (token, _ingress, stage) = stage_over(Arc::new(backend.clone()), 100);

        assert!(matches!(
            stage.get_stream(uuid).await,
            Err(QueryError::StreamNotFound(u)) if u == uuid
        ));
        backend.insert(uuid, &[(1, 1.0)]);
        assert!(stage.get_stream(uuid).await.is_ok());
        assert_eq!(backend.exists_calls(), 2);
        token.cancel();
    }

    #[tokio::test]
    async fn test_unsupported_existence_check_is_tolerated() {
        let backend = MemoryTimeseries::new();
        backend.set_unsupported_exists(true);
        let uuid = Uuid::new_v4();
        let (token, _ingress, stage) = stage_over(Arc::new(backend.clone()), 100);

        assert_eq!(stage.get_stream(uuid).await.unwrap().uuid(), uuid);
        assert_eq!(stage.get_stream(uuid).await.unwrap().uuid(), uuid);
        assert_eq!(backend.exists_calls(), 2);
        token.cancel();
    }

    /// Records the window parameters it is asked for.
    #[derive(Default)]
    struct Recording {
        windows: Arc<Mutex<Vec<(u64, u8)>>>,
    }

    struct RecordingHandle {
        uuid: Uuid,
        windows: Arc<Mutex<Vec<(u64, u8)>>>,
    }

    impl TimeseriesBackend for Recording {
        fn stream_from_uuid(&self, uuid: Uuid) -> Arc<dyn StreamHandle> {
            Arc::new(RecordingHandle {
                uuid,
                windows: self.windows.clone(),
            })
        }
    }

    #[async_trait::async_trait]
    impl StreamHandle for RecordingHandle {
        fn uuid(&self) -> Uuid {
            self.uuid
        }
        async fn exists(&self) -> Result<bool, BackendError> {
            Err(BackendError::Unavailable("unreachable".into()))
        }
        fn raw_values(&self, _start: i64, _end: i64, _version: u64) -> PointStream<RawPoint> {
            let (sink, stream) = PointStream::channel(1);
            sink.complete(Ok(0));
            stream
        }
        fn windows(&self, _s: i64, _e: i64, width: u64, depth: u8, _v: u64) -> PointStream<StatPoint> {
            self.windows.lock().unwrap().push((width, depth));
            let (sink, stream) = PointStream::channel(1);
            sink.complete(Ok(0));
            stream
        }
    }

    #[tokio::test]
    async fn test_lookup_failure_is_reported() {
        let (token, ingress, _stage) = stage_over(Arc::new(Recording::default()), 100);
        let uuid = Uuid::new_v4();
        let responses = ingress
            .submit(fetch(vec![frame("raw", AggFunc::Raw, None, &[uuid])], T0))
            .await
            .unwrap();
        let (_, errors) = split(responses.collect().await);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with(&format!("could not fetch stream {}", uuid)));
        token.cancel();
    }

    #[tokio::test]
    async fn test_window_width_and_accuracy_passed_to_backend() {
        let recording = Recording::default();
        let windows = recording.windows.clone();
        let uuid = Uuid::new_v4();
        let stage_backend: Arc<dyn TimeseriesBackend> = Arc::new(recording);
        let (token, _ingress, stage) = stage_over(stage_backend, 100);

        let request_frame = frame("mean", AggFunc::Mean, Some("15m"), &[uuid]);
        let handle = stage.backend.stream_from_uuid(uuid);
        let token_parent = CancellationToken::new();
        let (request, _responses) = Request::new(FetchRequest::default(), &token_parent, 4);
        stage
            .fetch_windows(&request, &request_frame, &uuid.to_string(), handle.as_ref(), 0, 1)
            .await
            .unwrap();

        let recorded = windows.lock().unwrap().clone();
        assert_eq!(recorded, vec![(900_000_000_000, 34)]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_label() {
        let (token, ingress, stage) = stage_over(Arc::new(MemoryTimeseries::new()), 1);
        assert_eq!(stage.to_string(), "<| timeseries stage |>");
        assert_eq!(stage.workers(), 2);
        assert_eq!(stage.upstream().map(|s| s.to_string()), Some(ingress.to_string()));
        token.cancel();
        stage.join().await;
    }
}
