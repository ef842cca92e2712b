//! # Pipeline Wiring
//!
//! Builds the chain ingress → metadata → timeseries, tracks readiness of
//! each stage, and owns the root cancellation token.

use crate::config::Config;
use crate::health::Health;
use crate::metrics::MetricsSnapshot;
use crate::stages::{MetadataStage, MetadataStageConfig, TimeseriesStage, TimeseriesStageConfig};
use sluice_core::{
    describe_chain, FetchRequest, IngressStage, MetadataStore, ResponseStream, StageError,
    TimeseriesBackend,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const METADATA_COMPONENT: &str = "metadata";
pub const TIMESERIES_COMPONENT: &str = "timeseries";

pub struct Pipeline {
    ingress: Arc<IngressStage>,
    metadata: Arc<MetadataStage>,
    timeseries: Arc<TimeseriesStage>,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Health tracker covering every stage of the pipeline.
    pub fn health() -> Health {
        Health::new(&[METADATA_COMPONENT, TIMESERIES_COMPONENT])
    }

    pub async fn start(
        config: &Config,
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn TimeseriesBackend>,
        health: &Health,
        shutdown: CancellationToken,
    ) -> Result<Self, StageError> {
        let ingress = IngressStage::new(
            shutdown.clone(),
            config.pipeline.queue_depth,
            config.pipeline.response_buffer,
        );

        let metadata = MetadataStage::start(
            MetadataStageConfig {
                upstream: ingress.clone(),
                shutdown: shutdown.clone(),
                workers: config.metadata.workers,
                queue_depth: config.pipeline.queue_depth,
            },
            store,
        )
        .await
        .inspect_err(|e| {
            health.mark_failed(METADATA_COMPONENT, e.to_string());
        })?;
        health.mark_ready(METADATA_COMPONENT);

        let timeseries = TimeseriesStage::start(
            TimeseriesStageConfig {
                upstream: metadata.clone(),
                shutdown: shutdown.clone(),
                workers: config.timeseries.workers,
                queue_depth: config.pipeline.queue_depth,
                batch_size: config.timeseries.batch_size,
                cache_capacity: config.timeseries.stream_cache_capacity,
                cache_ttl: config.timeseries.stream_cache_ttl(),
            },
            backend,
        )
        .inspect_err(|e| {
            health.mark_failed(TIMESERIES_COMPONENT, e.to_string());
            shutdown.cancel();
        })?;
        health.mark_ready(TIMESERIES_COMPONENT);

        let pipeline = Self {
            ingress,
            metadata,
            timeseries,
            shutdown,
        };
        for label in pipeline.stages() {
            tracing::info!("{}", label);
        }
        Ok(pipeline)
    }

    /// Submit a fetch request. The stream yields its metadata rows, data
    /// batches, and finally one end marker.
    pub async fn submit(&self, fetch: FetchRequest) -> Result<ResponseStream, StageError> {
        self.ingress.submit(fetch).await
    }

    /// Stage labels from the tail of the chain to its head.
    pub fn stages(&self) -> Vec<String> {
        describe_chain(self.timeseries.clone())
    }

    pub fn highwatermark(&self) -> u64 {
        self.metadata.highwatermark()
    }

    pub fn metrics(&self) -> Vec<(&'static str, MetricsSnapshot)> {
        vec![
            (METADATA_COMPONENT, self.metadata.metrics().snapshot()),
            (TIMESERIES_COMPONENT, self.timeseries.metrics().snapshot()),
        ]
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel every in-flight request and wait for the workers to exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down pipeline");
        self.shutdown.cancel();
        self.metadata.join().await;
        self.timeseries.join().await;
    }
}
