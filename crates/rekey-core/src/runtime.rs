//! End-to-end pipeline run.
//!
//! A run spawns the consumer and the supervisor as background tokio tasks,
//! waits for the read phase to finish, then spawns the write phase as a
//! third task fed with the frozen buffer:
//!
//! ```text
//!  ┌───────────────┐   CompletionSignal   ┌──────────────────┐
//!  │ StreamConsumer│ ───────────────────▶ │ PhaseCoordinator │
//!  └───────────────┘                      └────────┬─────────┘
//!  ┌───────────────┐   watch(PhaseState)           │ await_drain()
//!  │  supervisor   │ ◀─────────────────────────────┤
//!  └───────────────┘                               ▼
//!                                         ┌──────────────────┐
//!                                         │  BatchMutator    │
//!                                         └──────────────────┘
//! ```

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::PipelineConfig;
use crate::consumer::StreamConsumer;
use crate::error::{PipelineError, Result};
use crate::mutator::{BatchMutator, WriteSummary};
use crate::phase::{supervise, PhaseCoordinator, PhaseState};
use crate::traits::DocumentStore;

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub records_read: u64,
    pub write: WriteSummary,
}

/// Read-then-write pipeline over one document store.
///
/// # Example
///
/// ```ignore
/// use rekey_core::{Pipeline, PipelineConfig, HttpDocumentStore};
///
/// let config = PipelineConfig::load("rekey.toml")?;
/// let store = Arc::new(HttpDocumentStore::from_config(&config)?);
/// let report = Pipeline::new(store, config)?.run().await?;
/// println!("{} records updated", report.write.total_modified());
/// ```
pub struct Pipeline {
    store: Arc<dyn DocumentStore>,
    config: PipelineConfig,
    cancel: CancellationToken,
    phase: Option<tokio::sync::watch::Sender<PhaseState>>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn DocumentStore>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            cancel: CancellationToken::new(),
            phase: None,
        })
    }

    /// Token that cancels the run: the store cursor is released, any
    /// in-flight bulk call is dropped and no further batches are sent.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Mirror every phase transition of the next runs into `observer`.
    pub fn with_phase_observer(mut self, observer: tokio::sync::watch::Sender<PhaseState>) -> Self {
        self.phase = Some(observer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run both phases to completion.
    pub async fn run(&self) -> Result<RunReport> {
        let (mut coordinator, signal) = PhaseCoordinator::new();
        let mirror = self.phase.clone().map(|observer| {
            let mut phase = coordinator.subscribe();
            tokio::spawn(async move {
                loop {
                    let state = *phase.borrow_and_update();
                    observer.send_replace(state);
                    if phase.changed().await.is_err() {
                        break;
                    }
                }
            })
        });

        let result = self.run_phases(&mut coordinator, signal).await;
        if let Err(e) = &result {
            coordinator.fail();
            error!(phase = e.phase(), error = %e, "pipeline run failed");
        }
        drop(coordinator);
        if let Some(mirror) = mirror {
            let _ = mirror.await;
        }
        result
    }

    async fn run_phases(
        &self,
        coordinator: &mut PhaseCoordinator,
        signal: crate::phase::CompletionSignal,
    ) -> Result<RunReport> {
        let records_read = Arc::new(AtomicU64::new(0));
        let consumer = StreamConsumer::from_config(self.store.clone(), &self.config)?
            .with_progress(records_read.clone())
            .with_cancellation(self.cancel.clone());

        let supervisor = tokio::spawn(supervise(
            coordinator.subscribe(),
            records_read,
            self.config.progress.supervisor_interval(),
        ));
        let reader = tokio::spawn(consumer.run(signal));

        let read_result = reader
            .await
            .map_err(|e| PipelineError::Runtime(format!("read task failed: {}", e)))
            .and_then(|r| r);
        let records = match read_result {
            Ok(records) => records,
            Err(e) => {
                coordinator.fail();
                let _ = supervisor.await;
                return Err(e);
            }
        };

        let buffer = coordinator.await_drain().await?;
        let _ = supervisor.await;

        info!(
            records = buffer.len(),
            store = self.store.name(),
            "start writing updates"
        );

        let mutator = BatchMutator::from_config(self.store.clone(), &self.config)?
            .with_cancellation(self.cancel.clone());
        let writer = tokio::spawn(async move { mutator.run(&buffer).await });
        let write = writer
            .await
            .map_err(|e| PipelineError::Runtime(format!("write task failed: {}", e)))??;

        coordinator.finish()?;
        info!(
            records_read = records,
            modified = write.total_modified(),
            "pipeline run complete"
        );
        Ok(RunReport {
            records_read: records,
            write,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::InMemoryStore;
    use serde_json::json;

    fn config(batch_size: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.write.batch_size = batch_size;
        config.read.prefetch = 8;
        config.progress.supervisor_interval_ms = 10;
        config
    }

    fn docs(n: u64) -> Vec<serde_json::Value> {
        (0..n)
            .map(|i| json!({"_id": i, "hex": format!("{:x}", i)}))
            .collect()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = Arc::new(InMemoryStore::new(vec![]));
        let result = Pipeline::new(store, config(0));
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn test_run_reports_counts() {
        let store = Arc::new(InMemoryStore::new(docs(23)));
        let pipeline = Pipeline::new(store.clone(), config(10)).unwrap();

        let report = pipeline.run().await.unwrap();
        assert_eq!(report.records_read, 23);
        assert_eq!(report.write.batches.len(), 3);
        assert_eq!(report.write.total_modified(), 23);
        assert_eq!(store.document(&json!(22)).unwrap()["key"], json!(22));
    }

    #[tokio::test]
    async fn test_request_built_from_config() {
        let store = Arc::new(InMemoryStore::new(docs(1)));
        Pipeline::new(store.clone(), config(10)).unwrap().run().await.unwrap();

        let requests = store.aggregate_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].pipeline, crate::config::QueryConfig::default().stages());
        assert!(requests[0].allow_disk_use);
        assert_eq!(requests[0].batch_size, 1000);
    }

    #[tokio::test]
    async fn test_phase_observer_sees_done() {
        let store = Arc::new(InMemoryStore::new(docs(3)));
        let (tx, rx) = tokio::sync::watch::channel(PhaseState::Reading);
        let pipeline = Pipeline::new(store, config(10))
            .unwrap()
            .with_phase_observer(tx);

        pipeline.run().await.unwrap();
        assert_eq!(*rx.borrow(), PhaseState::Done);
    }

    #[tokio::test]
    async fn test_phase_observer_sees_failure() {
        let store = Arc::new(InMemoryStore::new(docs(3)).fail_aggregate("boom"));
        let (tx, rx) = tokio::sync::watch::channel(PhaseState::Reading);
        let pipeline = Pipeline::new(store, config(10))
            .unwrap()
            .with_phase_observer(tx);

        assert!(pipeline.run().await.is_err());
        assert_eq!(*rx.borrow(), PhaseState::Failed);
    }
}
