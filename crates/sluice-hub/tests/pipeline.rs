//! End-to-end runs of the pipeline over the bundled fixtures.

use sluice_core::{
    AggFunc, DataFrame, FetchBatch, FetchRequest, MetadataResponse, Response, StreamDefinition,
    TimeParams,
};
use sluice_hub::memory::{MemoryGraph, MemoryTimeseries};
use sluice_hub::{Config, Health, Pipeline, Readiness};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const ZTEMP_1: &str = "0a4e4a1f-0d4e-4b6a-9c3e-7f3e2d1c0b01";
const ZTEMP_2: &str = "0a4e4a1f-0d4e-4b6a-9c3e-7f3e2d1c0b02";
const START_NS: i64 = 1_483_228_800_000_000_000;

fn fixture(name: &str) -> String {
    format!("{}/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
}

fn load_request(name: &str) -> FetchRequest {
    let content = std::fs::read_to_string(fixture(name)).unwrap();
    serde_json::from_str(&content).unwrap()
}

fn config(batch_size: usize) -> Config {
    let mut config = Config::default();
    config.metadata.workers = 2;
    config.timeseries.workers = 2;
    config.timeseries.batch_size = batch_size;
    config
}

struct Harness {
    pipeline: Pipeline,
    health: Health,
    backend: MemoryTimeseries,
}

async fn harness(config: &Config) -> Harness {
    let store = MemoryGraph::connect(&fixture("graph.json")).unwrap();
    let backend = MemoryTimeseries::connect(&fixture("streams.json")).unwrap();
    let health = Pipeline::health();
    let pipeline = Pipeline::start(
        config,
        Arc::new(store),
        Arc::new(backend.clone()),
        &health,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    Harness {
        pipeline,
        health,
        backend,
    }
}

struct Split {
    metadata: Vec<MetadataResponse>,
    batches: Vec<FetchBatch>,
    errors: Vec<String>,
    ends: usize,
}

fn split(responses: Vec<Response>) -> Split {
    let mut out = Split {
        metadata: Vec::new(),
        batches: Vec::new(),
        errors: Vec::new(),
        ends: 0,
    };
    for response in responses {
        match response {
            Response::Metadata(md) => {
                assert!(out.batches.is_empty(), "metadata after data");
                out.metadata.push(md);
            }
            Response::Data(batch) => out.batches.push(batch),
            Response::End(done) => {
                out.ends += 1;
                out.errors = done.errors;
            }
        }
    }
    out
}

#[tokio::test]
async fn test_raw_fetch_end_to_end() {
    let h = harness(&config(5000)).await;
    assert!(h.health.is_ready());

    let responses = h.pipeline.submit(load_request("raw_query.json")).await.unwrap();
    let out = split(responses.collect().await);

    assert_eq!(out.ends, 1);
    assert!(out.errors.is_empty(), "{:?}", out.errors);

    assert_eq!(out.metadata.len(), 1);
    let md = &out.metadata[0];
    assert_eq!(md.stream, "temp");
    assert_eq!(md.variables, vec!["?sensor", "?room", "?sensor_uuid"]);
    assert_eq!(md.rows.len(), 2);
    assert_eq!(md.rows[0].values[1].value, "room_1");

    assert_eq!(out.batches.len(), 2);
    assert_eq!(out.batches[0].identifier, ZTEMP_1);
    assert_eq!(out.batches[1].identifier, ZTEMP_2);
    for batch in &out.batches {
        assert_eq!(batch.data_frame, "temp_raw");
        assert_eq!(
            batch.times,
            vec![START_NS, START_NS + 60_000_000_000, START_NS + 120_000_000_000]
        );
    }
    assert_eq!(out.batches[0].values, vec![20.5, 21.0, 21.5]);

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_small_batches_preserve_order() {
    let h = harness(&config(2)).await;
    let responses = h.pipeline.submit(load_request("raw_query.json")).await.unwrap();
    let out = split(responses.collect().await);

    // ceil(3 / 2) batches per stream
    assert_eq!(out.batches.len(), 4);
    let sizes: Vec<usize> = out.batches.iter().map(FetchBatch::len).collect();
    assert_eq!(sizes, vec![2, 1, 2, 1]);
    let first: Vec<f64> = out
        .batches
        .iter()
        .filter(|b| b.identifier == ZTEMP_1)
        .flat_map(|b| b.values.clone())
        .collect();
    assert_eq!(first, vec![20.5, 21.0, 21.5]);

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_windowed_fetch_end_to_end() {
    let h = harness(&config(5000)).await;
    let responses = h
        .pipeline
        .submit(load_request("window_query.json"))
        .await
        .unwrap();
    let out = split(responses.collect().await);

    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert_eq!(out.batches.len(), 2);
    let batch = &out.batches[0];
    assert_eq!(batch.data_frame, "temp_15m");
    assert_eq!(batch.len(), 4);
    assert_eq!(batch.values[0], 21.0);
    assert!(batch.values[1..].iter().all(|v| v.is_nan()));

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_stream_cache_reused_across_requests() {
    let h = harness(&config(5000)).await;
    for _ in 0..3 {
        let responses = h.pipeline.submit(load_request("raw_query.json")).await.unwrap();
        assert!(split(responses.collect().await).errors.is_empty());
    }
    assert_eq!(h.backend.exists_calls(), 2);

    let metrics = h.pipeline.metrics();
    let (_, ts) = metrics.iter().find(|(name, _)| *name == "timeseries").unwrap();
    assert_eq!(ts.cache_misses, 2);
    assert_eq!(ts.cache_hits, 4);
    assert_eq!(ts.requests_total, 3);

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_backend_fault_reaches_end_marker() {
    let h = harness(&config(5000)).await;
    let mut request = load_request("raw_query.json");
    request.sites = vec!["soda".into()];
    request.streams[0].definition =
        "SELECT ?sensor WHERE { ?sensor rdf:type brick:Zone_Temperature_Sensor };".into();

    let responses = h.pipeline.submit(request).await.unwrap();
    let out = split(responses.collect().await);
    assert_eq!(out.ends, 1);
    assert_eq!(out.batches.len(), 1);
    assert_eq!(out.errors.len(), 1);
    assert!(out.errors[0].contains("replica unavailable"));

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_metadata_failure_skips_fetch() {
    let h = harness(&config(5000)).await;
    let mut request = load_request("raw_query.json");
    request.streams.push(StreamDefinition {
        name: "broken".into(),
        definition: "SELECT ?x WHERE { ?x unknown:p ?y };".into(),
        ..Default::default()
    });

    let responses = h.pipeline.submit(request).await.unwrap();
    let out = split(responses.collect().await);
    assert_eq!(out.ends, 1);
    assert_eq!(out.metadata.len(), 1);
    assert!(out.batches.is_empty());
    assert_eq!(out.errors.len(), 1);
    assert!(out.errors[0].contains("'broken'"));

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_missing_stream_ends_request() {
    let h = harness(&config(5000)).await;
    let request = FetchRequest {
        sites: vec!["ciee".into()],
        data_frames: vec![DataFrame {
            name: "direct".into(),
            aggregation: AggFunc::Raw,
            uuids: vec!["0a4e4a1f-0d4e-4b6a-9c3e-7f3e2d1c0bff".into()],
            ..Default::default()
        }],
        time: TimeParams {
            start: "2017-01-01T00:00:00Z".into(),
            end: "2017-01-01T01:00:00Z".into(),
        },
        ..Default::default()
    };
    let out = split(h.pipeline.submit(request).await.unwrap().collect().await);
    assert_eq!(out.ends, 1);
    assert_eq!(
        out.errors,
        vec!["stream 0a4e4a1f-0d4e-4b6a-9c3e-7f3e2d1c0bff does not exist"]
    );
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_non_ascii_definition_fails_cleanly() {
    let mut config = config(5000);
    config.metadata.workers = 1;
    let h = harness(&config).await;

    for definition in ["aééé WHERE { ?s a brick:X }", "SELECT ?s ééé { ?s a brick:X }"] {
        let mut request = load_request("raw_query.json");
        request.streams[0].definition = definition.into();
        let out = split(h.pipeline.submit(request).await.unwrap().collect().await);
        assert_eq!(out.ends, 1);
        assert!(out.batches.is_empty());
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].contains("could not parse query"), "{:?}", out.errors);
    }

    let out = tokio::time::timeout(Duration::from_secs(5), async {
        h.pipeline
            .submit(load_request("raw_query.json"))
            .await
            .unwrap()
            .collect()
            .await
    })
    .await
    .expect("metadata worker lost after a bad query");
    let out = split(out);
    assert!(out.errors.is_empty(), "{:?}", out.errors);
    assert_eq!(out.batches.len(), 2);

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_client_cancellation_does_not_stall_workers() {
    let mut config = config(1);
    config.metadata.workers = 1;
    config.timeseries.workers = 1;
    config.pipeline.response_buffer = 1;
    let h = harness(&config).await;

    let mut abandoned = h.pipeline.submit(load_request("raw_query.json")).await.unwrap();
    assert!(matches!(abandoned.recv().await, Some(Response::Metadata(_))));
    drop(abandoned);

    let responses = tokio::time::timeout(Duration::from_secs(5), async {
        h.pipeline
            .submit(load_request("raw_query.json"))
            .await
            .unwrap()
            .collect()
            .await
    })
    .await
    .expect("pipeline stalled after a cancelled request");
    let out = split(responses);
    assert_eq!(out.batches.len(), 6);
    assert!(out.errors.is_empty());

    let metrics = h.pipeline.metrics();
    let (_, ts) = metrics.iter().find(|(name, _)| *name == "timeseries").unwrap();
    assert!(ts.batches_dropped > 0);

    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_new_requests() {
    let h = harness(&config(5000)).await;
    h.pipeline.shutdown().await;
    assert!(h.pipeline.submit(FetchRequest::default()).await.is_err());
    assert_eq!(
        h.pipeline.stages(),
        vec!["<| timeseries stage |>", "<| metadata stage |>", "<| ingress stage |>"]
    );
}

#[tokio::test]
async fn test_bootstrap_failure_marks_metadata_failed() {
    struct Offline;

    #[async_trait::async_trait]
    impl sluice_core::MetadataStore for Offline {
        fn highwatermark(&self) -> u64 {
            0
        }
        fn parse(
            &self,
            _text: &str,
            _version: u64,
        ) -> Result<sluice_core::SelectQuery, sluice_core::StoreError> {
            Err(sluice_core::StoreError::Unavailable("offline".into()))
        }
        async fn select(
            &self,
            _query: &sluice_core::SelectQuery,
        ) -> Result<Vec<sluice_core::ResultRow>, sluice_core::StoreError> {
            Err(sluice_core::StoreError::Unavailable("offline".into()))
        }
    }

    let health = Pipeline::health();
    let result = Pipeline::start(
        &config(5000),
        Arc::new(Offline),
        Arc::new(MemoryTimeseries::new()),
        &health,
        CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
    assert!(matches!(health.state("metadata"), Some(Readiness::Failed(_))));
    assert_eq!(health.state("timeseries"), Some(Readiness::NotReady));
    assert!(!health.is_ready());
}
