//! # Metadata Stage
//!
//! Resolves each stream definition of a request against the metadata store.
//! The query is rewritten to also return the stream identifier of every
//! data variable, evaluated at the highwatermark captured at startup, and
//! scoped to the request's sites. Matching rows go back to the client; the
//! identifiers are bound to the stream definition and to every data frame
//! that names it. Once all definitions are resolved the request moves on.
//!
//! The first failing definition ends the request here: the error is
//! reported in its end marker and nothing is forwarded.

use crate::metrics::StageMetrics;
use crate::stages::{handle_guarded, WorkerPool};
use sluice_core::query::{collect_identifiers, rewrite_query, transform_row};
use sluice_core::store::BOOTSTRAP_QUERY;
use sluice_core::{
    MetadataResponse, MetadataStore, QueryError, Request, Response, Stage, StageError, StageQueue,
    UpstreamLink,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct MetadataStageConfig {
    pub upstream: Arc<dyn Stage>,
    pub shutdown: CancellationToken,
    pub workers: usize,
    pub queue_depth: usize,
}

pub struct MetadataStage {
    upstream: UpstreamLink,
    output: StageQueue,
    shutdown: CancellationToken,
    store: Arc<dyn MetadataStore>,
    highwatermark: u64,
    metrics: StageMetrics,
    pool: WorkerPool,
}

impl MetadataStage {
    /// Bootstrap against `store` and start the workers.
    ///
    /// Fails if the bootstrap query cannot be evaluated. No workers are
    /// started in that case.
    pub async fn start(
        config: MetadataStageConfig,
        store: Arc<dyn MetadataStore>,
    ) -> Result<Arc<Self>, StageError> {
        if config.workers == 0 {
            return Err(StageError::Config("metadata stage needs at least one worker".into()));
        }

        info!("Start loading metadata");
        let started = Instant::now();
        let highwatermark = store.highwatermark();
        let bootstrap = store
            .parse(BOOTSTRAP_QUERY, highwatermark)
            .map_err(StageError::Bootstrap)?;
        let classes = store
            .select(&bootstrap)
            .await
            .map_err(StageError::Bootstrap)?;
        info!(
            classes = classes.len(),
            highwatermark,
            "Done loading metadata. Took {:?}",
            started.elapsed()
        );

        let stage = Arc::new(Self {
            upstream: UpstreamLink::new(config.upstream),
            output: StageQueue::new(config.queue_depth),
            shutdown: config.shutdown,
            store,
            highwatermark,
            metrics: StageMetrics::default(),
            pool: WorkerPool::default(),
        });

        for worker in 0..config.workers {
            stage.pool.spawn(Arc::clone(&stage).run_worker(worker));
        }
        Ok(stage)
    }

    pub fn highwatermark(&self) -> u64 {
        self.highwatermark
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn workers(&self) -> usize {
        self.pool.len()
    }

    /// Wait for the workers to exit after shutdown.
    pub async fn join(&self) {
        self.pool.join("metadata").await;
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        while let Some(request) = self.upstream.next(&self.shutdown).await {
            let end = request.end_handle();
            handle_guarded("metadata", &self.metrics, end, self.handle(request)).await;
        }
        debug!(worker, "Ending metadata queue");
    }

    async fn handle(&self, mut request: Request) {
        StageMetrics::incr(&self.metrics.requests_total);
        match self.process_query(&mut request).await {
            Ok(()) => {
                let id = request.id();
                if !self.output.forward(request, &self.shutdown).await {
                    debug!(request = id, "dropped request on shutdown");
                }
            }
            Err(err) => {
                StageMetrics::incr(&self.metrics.requests_failed);
                request.add_error(err);
                request.finish().await;
            }
        }
    }

    async fn process_query(&self, request: &mut Request) -> Result<(), QueryError> {
        for idx in 0..request.fetch.streams.len() {
            let stream = &request.fetch.streams[idx];
            let name = stream.name.clone();
            let data_vars = stream.data_vars.clone();

            let mut query = self
                .store
                .parse(&stream.definition, self.highwatermark)
                .map_err(|source| QueryError::Parse {
                    stream: name.clone(),
                    source,
                })?;
            let start_idx = rewrite_query(&data_vars, &mut query);
            query.graphs = request.fetch.sites.clone();

            let rows = self
                .store
                .select(&query)
                .await
                .map_err(|source| QueryError::Execution {
                    stream: name.clone(),
                    source,
                })?;

            let uuids = collect_identifiers(&rows, start_idx..query.vars.len());
            debug!(
                request = request.id(),
                stream = %name,
                rows = rows.len(),
                identifiers = uuids.len(),
                "resolved stream"
            );
            StageMetrics::add(&self.metrics.identifiers_resolved, uuids.len() as u64);

            for frame in request
                .fetch
                .data_frames
                .iter_mut()
                .filter(|frame| frame.streams.contains(&name))
            {
                frame.uuids.extend(uuids.iter().cloned());
            }
            request.fetch.streams[idx].uuids.extend(uuids);

            let response = MetadataResponse {
                stream: name,
                variables: query.vars,
                rows: rows.iter().map(transform_row).collect(),
            };
            request.publish(Response::Metadata(response)).await;
        }
        Ok(())
    }
}

impl Stage for MetadataStage {
    fn upstream(&self) -> Option<Arc<dyn Stage>> {
        Some(self.upstream.get())
    }

    fn set_upstream(&self, upstream: Arc<dyn Stage>) {
        info!("Updated stage to {}", upstream);
        self.upstream.set(upstream);
    }

    fn queue(&self) -> flume::Receiver<Request> {
        self.output.receiver()
    }
}

impl fmt::Display for MetadataStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<| metadata stage |>")
    }
}
