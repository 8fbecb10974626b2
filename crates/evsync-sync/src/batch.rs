//! Resumable batch runner: fixed-size batches, one retry per batch, a
//! checkpoint after every success and on terminal failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evsync_core::BatchProgress;
use evsync_storage::CheckpointStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// Retries granted to a batch after its first failure.
const RETRIES_PER_BATCH: u32 = 1;

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    type Accumulator: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Process items `[start, start + batch_size)` and return the new accumulator.
    async fn process_batch(
        &self,
        start: usize,
        accumulator: Self::Accumulator,
    ) -> anyhow::Result<Self::Accumulator>;

    /// Short progress note logged with each batch.
    fn describe(&self, _accumulator: &Self::Accumulator) -> String {
        String::new()
    }
}

#[derive(Debug, Clone)]
pub struct BatchRunnerConfig {
    pub label: String,
    pub batch_size: usize,
    pub total: usize,
    pub progress_key: String,
    pub inter_batch_delay: Duration,
    pub retry_delay: Duration,
}

impl BatchRunnerConfig {
    pub fn new(
        label: impl Into<String>,
        progress_key: impl Into<String>,
        batch_size: usize,
        total: usize,
    ) -> Self {
        Self {
            label: label.into(),
            batch_size,
            total,
            progress_key: progress_key.into(),
            inter_batch_delay: Duration::from_millis(500),
            retry_delay: Duration::from_millis(2000),
        }
    }

    pub fn with_delays(mut self, inter_batch_delay: Duration, retry_delay: Duration) -> Self {
        self.inter_batch_delay = inter_batch_delay;
        self.retry_delay = retry_delay;
        self
    }
}

/// Result of one attempt at a batch.
#[derive(Debug)]
pub enum BatchOutcome<A> {
    Success(A),
    /// Failed, but a retry is still allowed.
    RetryableFailure(anyhow::Error),
    /// Failed with no retries left. `accumulator` is the state as of the last success.
    TerminalFailure { accumulator: A, error: anyhow::Error },
}

impl<A: Clone> BatchOutcome<A> {
    pub fn settle(result: anyhow::Result<A>, attempt: u32, last_good: &A) -> Self {
        match result {
            Ok(next) => BatchOutcome::Success(next),
            Err(error) if attempt < RETRIES_PER_BATCH => BatchOutcome::RetryableFailure(error),
            Err(error) => BatchOutcome::TerminalFailure {
                accumulator: last_good.clone(),
                error,
            },
        }
    }

    /// Checkpoint to persist for this outcome of the batch starting at `start`.
    pub fn checkpoint(&self, start: usize, batch_size: usize) -> Option<BatchProgress<A>> {
        match self {
            BatchOutcome::Success(accumulator) => Some(BatchProgress {
                next_index: start + batch_size,
                accumulator: accumulator.clone(),
            }),
            BatchOutcome::RetryableFailure(_) => None,
            BatchOutcome::TerminalFailure { accumulator, .. } => Some(BatchProgress {
                next_index: start,
                accumulator: accumulator.clone(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("{label}: batch at item {next_index} failed after retry; progress saved to {location}, re-run to resume")]
    Failed {
        label: String,
        progress_key: String,
        next_index: usize,
        location: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("checkpoint store failed for {progress_key}")]
    Checkpoint {
        progress_key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{label}: batch size must be greater than zero")]
    ZeroBatchSize { label: String },
}

impl BatchError {
    pub fn next_index(&self) -> Option<usize> {
        match self {
            BatchError::Failed { next_index, .. } => Some(*next_index),
            _ => None,
        }
    }
}

pub struct BatchRunner {
    store: Arc<dyn CheckpointStore>,
    config: BatchRunnerConfig,
}

impl BatchRunner {
    pub fn new(store: Arc<dyn CheckpointStore>, config: BatchRunnerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BatchRunnerConfig {
        &self.config
    }

    pub async fn run<P: BatchProcessor>(
        &self,
        processor: &P,
        initial: P::Accumulator,
    ) -> Result<P::Accumulator, BatchError> {
        let cfg = &self.config;
        if cfg.batch_size == 0 {
            return Err(BatchError::ZeroBatchSize {
                label: cfg.label.clone(),
            });
        }

        let (mut start, mut accumulator) = match self.load_progress::<P::Accumulator>().await? {
            Some(progress) => {
                info!(
                    label = %cfg.label,
                    next_index = progress.next_index,
                    total = cfg.total,
                    "resuming from checkpoint"
                );
                (progress.next_index, progress.accumulator)
            }
            None => (0, initial),
        };

        while start < cfg.total {
            let end = (start + cfg.batch_size).min(cfg.total);
            info!(
                label = %cfg.label,
                start,
                end,
                total = cfg.total,
                progress = %processor.describe(&accumulator),
                "processing batch"
            );

            let mut attempt = 0u32;
            let outcome = loop {
                let result = processor.process_batch(start, accumulator.clone()).await;
                match BatchOutcome::settle(result, attempt, &accumulator) {
                    BatchOutcome::RetryableFailure(error) => {
                        warn!(
                            label = %cfg.label,
                            start,
                            error = %format!("{error:#}"),
                            "batch failed, retrying once"
                        );
                        tokio::time::sleep(cfg.retry_delay).await;
                        attempt += 1;
                    }
                    settled => break settled,
                }
            };

            if let Some(progress) = outcome.checkpoint(start, cfg.batch_size) {
                self.save_progress(&progress).await?;
            }

            match outcome {
                BatchOutcome::Success(next) => accumulator = next,
                BatchOutcome::TerminalFailure { error, .. } | BatchOutcome::RetryableFailure(error) => {
                    let location = self.store.location(&cfg.progress_key);
                    warn!(
                        label = %cfg.label,
                        next_index = start,
                        %location,
                        "batch failed after retry, progress saved"
                    );
                    return Err(BatchError::Failed {
                        label: cfg.label.clone(),
                        progress_key: cfg.progress_key.clone(),
                        next_index: start,
                        location,
                        source: error,
                    });
                }
            }

            start += cfg.batch_size;
            if start < cfg.total && !cfg.inter_batch_delay.is_zero() {
                tokio::time::sleep(cfg.inter_batch_delay).await;
            }
        }

        self.store
            .clear(&cfg.progress_key)
            .await
            .map_err(|source| self.checkpoint_error(source))?;
        info!(label = %cfg.label, total = cfg.total, "batch run complete");
        Ok(accumulator)
    }

    async fn load_progress<A: DeserializeOwned>(&self) -> Result<Option<BatchProgress<A>>, BatchError> {
        let key = &self.config.progress_key;
        let Some(raw) = self
            .store
            .load(key)
            .await
            .map_err(|source| self.checkpoint_error(source))?
        else {
            return Ok(None);
        };

        match serde_json::from_value::<BatchProgress<A>>(raw) {
            Ok(progress) => Ok(Some(progress)),
            Err(err) => {
                warn!(
                    progress_key = %key,
                    error = %err,
                    "ignoring undecodable checkpoint, starting fresh"
                );
                Ok(None)
            }
        }
    }

    async fn save_progress<A: Serialize>(&self, progress: &BatchProgress<A>) -> Result<(), BatchError> {
        let blob = serde_json::to_value(progress)
            .map_err(|err| self.checkpoint_error(anyhow::Error::new(err)))?;
        self.store
            .save(&self.config.progress_key, &blob)
            .await
            .map_err(|source| self.checkpoint_error(source))
    }

    fn checkpoint_error(&self, source: anyhow::Error) -> BatchError {
        BatchError::Checkpoint {
            progress_key: self.config.progress_key.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evsync_storage::MemoryCheckpointStore;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every start index it is called with; fails at configured
    /// indices a configured number of times.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<usize>>,
        failures: Mutex<HashMap<usize, u32>>,
    }

    impl Recorder {
        fn failing_at(start: usize, times: u32) -> Self {
            let recorder = Self::default();
            recorder.failures.lock().unwrap().insert(start, times);
            recorder
        }

        fn calls(&self) -> Vec<usize> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchProcessor for Recorder {
        type Accumulator = Vec<usize>;

        async fn process_batch(&self, start: usize, mut acc: Vec<usize>) -> anyhow::Result<Vec<usize>> {
            self.calls.lock().unwrap().push(start);
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&start) {
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("model timed out at {start}");
                }
            }
            acc.push(start);
            Ok(acc)
        }
    }

    fn config(total: usize) -> BatchRunnerConfig {
        BatchRunnerConfig::new("test", "test-progress", 10, total)
            .with_delays(Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn walks_partial_last_batch_and_clears_checkpoint() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let runner = BatchRunner::new(store.clone(), config(37));
        let recorder = Recorder::default();

        let acc = runner.run(&recorder, Vec::new()).await.unwrap();

        assert_eq!(recorder.calls(), vec![0, 10, 20, 30]);
        assert_eq!(acc, vec![0, 10, 20, 30]);
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn single_failure_is_retried_in_place() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let runner = BatchRunner::new(store, config(30));
        let recorder = Recorder::failing_at(10, 1);

        let acc = runner.run(&recorder, Vec::new()).await.unwrap();

        assert_eq!(recorder.calls(), vec![0, 10, 10, 20]);
        assert_eq!(acc, vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn double_failure_checkpoints_and_rerun_resumes() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let runner = BatchRunner::new(store.clone(), config(37));

        let failing = Recorder::failing_at(20, 2);
        let err = runner.run(&failing, Vec::new()).await.expect_err("fails at 20");
        assert_eq!(err.next_index(), Some(20));
        assert!(err.to_string().contains("memory:test-progress"));
        assert_eq!(failing.calls(), vec![0, 10, 20, 20]);

        let saved = store.load("test-progress").await.unwrap().expect("checkpoint");
        let progress: BatchProgress<Vec<usize>> = serde_json::from_value(saved).unwrap();
        assert_eq!(progress.next_index, 20);
        assert_eq!(progress.accumulator, vec![0, 10]);

        let healthy = Recorder::default();
        let acc = runner.run(&healthy, Vec::new()).await.unwrap();
        assert_eq!(healthy.calls(), vec![20, 30]);
        assert_eq!(acc, vec![0, 10, 20, 30]);
        assert!(store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn undecodable_checkpoint_starts_fresh() {
        let store = Arc::new(MemoryCheckpointStore::new());
        store
            .save("test-progress", &serde_json::json!({"nextIndex": "soon"}))
            .await
            .unwrap();
        let runner = BatchRunner::new(store, config(15));
        let recorder = Recorder::default();

        runner.run(&recorder, Vec::new()).await.unwrap();
        assert_eq!(recorder.calls(), vec![0, 10]);
    }

    #[tokio::test]
    async fn zero_batch_size_is_rejected() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let runner = BatchRunner::new(store, BatchRunnerConfig::new("x", "x", 0, 5));
        let err = runner.run(&Recorder::default(), Vec::new()).await.expect_err("invalid");
        assert!(matches!(err, BatchError::ZeroBatchSize { .. }));
    }

    #[test]
    fn checkpoint_write_follows_outcome() {
        let ok: BatchOutcome<Vec<usize>> = BatchOutcome::Success(vec![0, 10]);
        assert_eq!(ok.checkpoint(10, 10).map(|p| p.next_index), Some(20));

        let retry: BatchOutcome<Vec<usize>> = BatchOutcome::RetryableFailure(anyhow::anyhow!("x"));
        assert!(retry.checkpoint(10, 10).is_none());

        let terminal = BatchOutcome::TerminalFailure {
            accumulator: vec![0],
            error: anyhow::anyhow!("x"),
        };
        let progress = terminal.checkpoint(10, 10).unwrap();
        assert_eq!(progress.next_index, 10);
        assert_eq!(progress.accumulator, vec![0]);
    }
}
