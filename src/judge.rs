mod batch;
pub mod model;

pub use batch::BatchEvaluator;

use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::JudgeConfig;
use crate::sandbox::{
    Artifact, CANCELLED_MESSAGE, CompileError, ProcessLauncher, RunSettings, TestRunner,
    Toolchain, create_launcher,
};
use model::{Batch, BatchResult, JudgeResult, ResourceLimits, Submission};

/// Compiles a submission once and scores it against every batch.
///
/// Holds only read-only state, so one engine can judge any number of
/// submissions concurrently.
#[derive(Clone)]
pub struct JudgeEngine {
    config: Arc<JudgeConfig>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl JudgeEngine {
    pub fn new(config: JudgeConfig) -> Self {
        Self::with_launcher(config, create_launcher())
    }

    pub fn with_launcher(config: JudgeConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            config: Arc::new(config),
            launcher,
        }
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    pub async fn judge(&self, submission: &Submission) -> JudgeResult {
        self.judge_with_cancel(submission, &CancellationToken::new())
            .await
    }

    /// Judges a submission. Never fails: every fault is encoded in the result.
    ///
    /// Cancelling `cancel`, or dropping the returned future, kills the running
    /// process tree and removes the submission's workspace.
    pub async fn judge_with_cancel(
        &self,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> JudgeResult {
        let token = cancel.child_token();
        let guard = token.clone().drop_guard();

        let engine = self.clone();
        let owned = submission.clone();
        let handle = tokio::spawn(async move { engine.run_submission(&owned, &token).await });
        let joined = handle.await;
        let _ = guard.disarm();

        match joined {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                log::error!("Judging failed with an internal error: {e:#}");
                JudgeResult::internal_error(&submission.batches, format!("{e:#}"))
            }
            Err(e) => {
                log::error!("Judging task aborted: {e}");
                JudgeResult::internal_error(&submission.batches, format!("Judging task aborted: {e}"))
            }
        }
    }

    async fn run_submission(
        &self,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> anyhow::Result<JudgeResult> {
        log::info!("Compiling {} submission", submission.language);
        let artifact = match Toolchain::new(&self.config, self.launcher.as_ref())
            .compile(&submission.code, &submission.language, cancel)
            .await
        {
            Ok(artifact) => artifact,
            Err(CompileError::Internal(e)) => return Err(e.context("Compilation failed")),
            Err(CompileError::Cancelled) => return Err(anyhow!(CANCELLED_MESSAGE)),
            Err(e) => {
                log::info!("Compile failed: {e}");
                return Ok(JudgeResult::compile_error(&submission.batches, e.to_string()));
            }
        };
        log::debug!("Compiled {} submission", artifact.language());

        let artifact = Arc::new(artifact);
        let batch_results = self
            .evaluate_batches(artifact.clone(), &submission.batches, submission.limits(), cancel)
            .await;
        // Every evaluation has finished, so this releases the workspace.
        drop(artifact);

        let result = JudgeResult::from_batches(batch_results?);
        log::info!(
            "Completed: {} with {} points",
            result.status,
            result.points_earned
        );
        Ok(result)
    }

    /// Batches are independent scoring units: all of them run regardless of
    /// earlier outcomes, at most `max_parallel_batches` at a time.
    async fn evaluate_batches(
        &self,
        artifact: Arc<Artifact>,
        batches: &[Batch],
        limits: ResourceLimits,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<BatchResult>> {
        let evaluator = BatchEvaluator::new(TestRunner::new(
            self.launcher.clone(),
            RunSettings::from(self.config.as_ref()),
        ));
        let total = batches.len();
        let parallel = self.config.max_parallel_batches.max(1);

        if parallel == 1 {
            let mut results = Vec::with_capacity(total);
            for (idx, batch) in batches.iter().enumerate() {
                log::debug!("Evaluating batch {} of {total}", idx + 1);
                results.push(evaluator.evaluate(&artifact, batch, limits, cancel).await);
            }
            return Ok(results);
        }

        let slots = Arc::new(Semaphore::new(parallel));
        let mut tasks = JoinSet::new();
        for (idx, batch) in batches.iter().cloned().enumerate() {
            let evaluator = evaluator.clone();
            let artifact = artifact.clone();
            let slots = slots.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = slots.acquire_owned().await;
                log::debug!("Evaluating batch {} of {total}", idx + 1);
                (idx, evaluator.evaluate(&artifact, &batch, limits, &cancel).await)
            });
        }

        let mut results: Vec<Option<BatchResult>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            let (idx, result) = joined.map_err(|e| anyhow!("Batch task failed: {e}"))?;
            results[idx] = Some(result);
        }
        results
            .into_iter()
            .enumerate()
            .map(|(idx, r)| r.ok_or_else(|| anyhow!("Batch {} produced no result", idx + 1)))
            .collect()
    }
}
