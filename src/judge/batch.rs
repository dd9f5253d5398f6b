use tokio_util::sync::CancellationToken;

use crate::sandbox::{Artifact, TestRunner};

use super::model::{Batch, BatchResult, ExecutionOutcome, ResourceLimits, TestCaseReport, Verdict};

/// Evaluates one batch: cases run in order and the first failure ends it.
#[derive(Clone)]
pub struct BatchEvaluator {
    runner: TestRunner,
}

impl BatchEvaluator {
    pub fn new(runner: TestRunner) -> Self {
        Self { runner }
    }

    pub async fn evaluate(
        &self,
        artifact: &Artifact,
        batch: &Batch,
        limits: ResourceLimits,
        cancel: &CancellationToken,
    ) -> BatchResult {
        if batch.test_cases.is_empty() {
            log::warn!("Batch worth {} points has no test cases", batch.points);
            return BatchResult {
                status: Verdict::RuntimeError,
                points_awarded: 0,
                execution_time_ms: 0.0,
                memory_used_kb: 0.0,
                test_case_results: vec![TestCaseReport::Executed(
                    ExecutionOutcome::runtime_error("Batch has no test cases"),
                )],
            };
        }

        let mut reports = Vec::with_capacity(batch.test_cases.len());
        let mut failure: Option<Verdict> = None;
        let mut execution_time_ms = 0.0f64;
        let mut memory_used_kb = 0.0f64;

        for (idx, case) in batch.test_cases.iter().enumerate() {
            if failure.is_some() {
                reports.push(TestCaseReport::Skipped);
                continue;
            }

            let outcome = self.runner.run(artifact, case, limits, cancel).await;
            if let Some(ms) = outcome.execution_time_ms.as_millis() {
                execution_time_ms = execution_time_ms.max(ms);
            }
            memory_used_kb = memory_used_kb.max(outcome.memory_used_kb);

            if !outcome.is_accepted() {
                log::debug!("Test case {} failed with {}", idx + 1, outcome.verdict);
                failure = Some(outcome.verdict);
            }
            reports.push(TestCaseReport::Executed(outcome));
        }

        BatchResult {
            status: failure.unwrap_or(Verdict::Accepted),
            points_awarded: if failure.is_none() { batch.points } else { 0 },
            execution_time_ms,
            memory_used_kb,
            test_case_results: reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::JudgeConfig;
    use crate::judge::model::TestCase;
    use crate::sandbox::{Invocation, LocalLauncher, RunSettings};

    fn evaluator() -> BatchEvaluator {
        let settings = RunSettings::from(&JudgeConfig::default());
        BatchEvaluator::new(TestRunner::new(Arc::new(LocalLauncher), settings))
    }

    // Echoes its input back
    fn cat_artifact() -> Artifact {
        let invocation =
            Invocation::from_words(vec!["cat".to_string()], std::env::temp_dir()).unwrap();
        Artifact::for_invocation(invocation)
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            time_limit_ms: 2000,
            memory_limit_mb: 256,
        }
    }

    fn case(input: &str, output: &str) -> TestCase {
        TestCase {
            input: input.to_string(),
            expected_output: output.to_string(),
        }
    }

    #[tokio::test]
    async fn test_all_cases_passing_awards_points() {
        let batch = Batch {
            points: 25,
            test_cases: vec![case("a", "a"), case("b\n", "b")],
        };
        let result = evaluator()
            .evaluate(&cat_artifact(), &batch, limits(), &CancellationToken::new())
            .await;

        assert_eq!(result.status, Verdict::Accepted);
        assert_eq!(result.points_awarded, 25);
        assert_eq!(result.executed_count(), 2);
    }

    #[tokio::test]
    async fn test_first_failure_skips_the_rest() {
        let batch = Batch {
            points: 25,
            test_cases: vec![case("a", "a"), case("b", "c"), case("d", "d"), case("e", "e")],
        };
        let result = evaluator()
            .evaluate(&cat_artifact(), &batch, limits(), &CancellationToken::new())
            .await;

        assert_eq!(result.status, Verdict::WrongAnswer);
        assert_eq!(result.points_awarded, 0);
        assert_eq!(result.executed_count(), 2);
        assert_eq!(result.test_case_results[2], TestCaseReport::Skipped);
        assert_eq!(result.test_case_results[3], TestCaseReport::Skipped);
    }

    #[tokio::test]
    async fn test_empty_batch_is_runtime_error() {
        let batch = Batch {
            points: 25,
            test_cases: vec![],
        };
        let result = evaluator()
            .evaluate(&cat_artifact(), &batch, limits(), &CancellationToken::new())
            .await;

        assert_eq!(result.status, Verdict::RuntimeError);
        assert_eq!(result.points_awarded, 0);
    }
}
