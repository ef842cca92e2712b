//! Pipeline stages: metadata resolution feeding timeseries fetch.

pub mod metadata;
pub mod timeseries;

pub use metadata::{MetadataStage, MetadataStageConfig};
pub use timeseries::{TimeseriesStage, TimeseriesStageConfig};

use crate::metrics::StageMetrics;
use futures_util::FutureExt;
use sluice_core::EndHandle;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};
use tokio::task::JoinHandle;

/// Fixed set of worker tasks owned by a stage.
#[derive(Default)]
pub(crate) struct WorkerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn spawn<F>(&self, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tokio::spawn(worker));
    }

    pub(crate) fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait for every worker to exit.
    pub(crate) async fn join(&self, stage: &str) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        for result in futures_util::future::join_all(handles).await {
            if let Err(e) = result {
                tracing::error!("{} worker exited abnormally: {}", stage, e);
            }
        }
    }
}

/// Drive `work` for one request. If it panics, the worker survives and the
/// request is ended through `end` with the panic as its error.
pub(crate) async fn handle_guarded<F>(
    stage: &str,
    metrics: &StageMetrics,
    end: EndHandle,
    work: F,
) where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
        let reason = panic_message(&*panic);
        tracing::error!(request = end.id(), "{} worker panicked: {}", stage, reason);
        StageMetrics::incr(&metrics.requests_failed);
        end.abort(format!("internal error in {} stage: {}", stage, reason)).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}
