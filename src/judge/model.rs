use std::fmt;

use anyhow::{bail, ensure};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// One hidden test: feed `input`, expect `expected_output`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub input: String,
    #[serde(rename = "output", alias = "expected_output")]
    pub expected_output: String,
}

/// A scored, all-or-nothing group of test cases.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub points: u64,
    pub test_cases: Vec<TestCase>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
}

impl ResourceLimits {
    pub fn memory_limit_kb(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024)
    }
}

/// Everything the caller hands over for one judging call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub code: String,
    pub language: String,
    pub batches: Vec<Batch>,
    #[serde(alias = "time_limit")]
    pub time_limit_ms: u64,
    #[serde(alias = "memory_limit")]
    pub memory_limit_mb: u64,
}

impl Submission {
    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            time_limit_ms: self.time_limit_ms,
            memory_limit_mb: self.memory_limit_mb,
        }
    }
}

/// Checks a problem definition before it is judged.
///
/// The engine tolerates bad input (an empty batch is reported as a failure),
/// but callers should reject it when the problem is defined.
pub fn validate_submission(submission: &Submission) -> anyhow::Result<()> {
    ensure!(submission.time_limit_ms > 0, "time limit must be positive");
    ensure!(submission.memory_limit_mb > 0, "memory limit must be positive");
    if submission.batches.is_empty() {
        bail!("a problem needs at least one batch");
    }
    if let Some(idx) = submission.batches.iter().position(|b| b.test_cases.is_empty()) {
        bail!("batch {} has no test cases", idx + 1);
    }
    ensure!(
        submission
            .batches
            .iter()
            .try_fold(0u64, |total, b| total.checked_add(b.points))
            .is_some(),
        "total points do not fit in 64 bits"
    );
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "CE")]
    CompileError,
}

impl Verdict {
    pub fn code(self) -> &'static str {
        match self {
            Self::Accepted => "AC",
            Self::WrongAnswer => "WA",
            Self::RuntimeError => "RE",
            Self::TimeLimitExceeded => "TLE",
            Self::MemoryLimitExceeded => "MLE",
            Self::CompileError => "CE",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Wall-clock time of one run. A killed run has no meaningful sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExecutionTime {
    Measured(f64),
    Exceeded { limit_ms: u64 },
}

impl ExecutionTime {
    pub fn as_millis(&self) -> Option<f64> {
        match self {
            Self::Measured(ms) => Some(*ms),
            Self::Exceeded { .. } => None,
        }
    }
}

impl Serialize for ExecutionTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Measured(ms) => serializer.serialize_f64(round2(*ms)),
            Self::Exceeded { limit_ms } => {
                serializer.serialize_str(&format!(">{:.2}", *limit_ms as f64))
            }
        }
    }
}

/// Result of running the artifact against one test case
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    #[serde(rename = "status")]
    pub verdict: Verdict,
    pub execution_time_ms: ExecutionTime,
    pub memory_used_kb: f64,
    #[serde(rename = "expected", skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(rename = "got", skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn accepted(time_ms: f64, memory_kb: f64) -> Self {
        Self {
            verdict: Verdict::Accepted,
            execution_time_ms: ExecutionTime::Measured(time_ms),
            memory_used_kb: memory_kb,
            expected_output: None,
            actual_output: None,
            error: None,
        }
    }

    pub fn wrong_answer(time_ms: f64, memory_kb: f64, expected: &str, got: &str) -> Self {
        Self {
            verdict: Verdict::WrongAnswer,
            expected_output: Some(expected.to_string()),
            actual_output: Some(got.to_string()),
            ..Self::accepted(time_ms, memory_kb)
        }
    }

    /// A run that never produced a usable sample, such as a failed launch.
    pub fn runtime_error(error: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::RuntimeError,
            error: Some(error.into()),
            ..Self::accepted(0.0, 0.0)
        }
    }

    pub fn time_limit_exceeded(limit_ms: u64, memory_kb: f64) -> Self {
        Self {
            verdict: Verdict::TimeLimitExceeded,
            execution_time_ms: ExecutionTime::Exceeded { limit_ms },
            memory_used_kb: memory_kb,
            expected_output: None,
            actual_output: None,
            error: Some("Time limit exceeded".to_string()),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }
}

/// Entry in a batch report: either a real run or a case that was never started.
#[derive(Debug, Clone, PartialEq)]
pub enum TestCaseReport {
    Executed(ExecutionOutcome),
    Skipped,
}

impl TestCaseReport {
    pub fn outcome(&self) -> Option<&ExecutionOutcome> {
        match self {
            Self::Executed(outcome) => Some(outcome),
            Self::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

impl Serialize for TestCaseReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Executed(outcome) => outcome.serialize(serializer),
            Self::Skipped => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("status", "skipped")?;
                map.end()
            }
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct BatchResult {
    pub status: Verdict,
    #[serde(rename = "batch_points")]
    pub points_awarded: u64,
    #[serde(serialize_with = "serialize_rounded")]
    pub execution_time_ms: f64,
    pub memory_used_kb: f64,
    pub test_case_results: Vec<TestCaseReport>,
}

impl BatchResult {
    /// A batch that was never evaluated: every case is reported as skipped.
    pub fn not_run(status: Verdict, batch: &Batch) -> Self {
        Self {
            status,
            points_awarded: 0,
            execution_time_ms: 0.0,
            memory_used_kb: 0.0,
            test_case_results: vec![TestCaseReport::Skipped; batch.test_cases.len()],
        }
    }

    pub fn executed_count(&self) -> usize {
        self.test_case_results
            .iter()
            .filter(|r| !r.is_skipped())
            .count()
    }
}

/// The terminal artifact of one judging call.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JudgeResult {
    pub status: Verdict,
    pub points_earned: u64,
    #[serde(serialize_with = "serialize_rounded")]
    pub execution_time_ms: f64,
    pub memory_used_kb: f64,
    pub batch_results: Vec<BatchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JudgeResult {
    /// Aggregates batch results. Only fully accepted batches contribute to the
    /// reported time and memory.
    pub fn from_batches(batch_results: Vec<BatchResult>) -> Self {
        // saturating: a huge total must never wrap to zero
        let points_earned = batch_results
            .iter()
            .fold(0u64, |total, b| total.saturating_add(b.points_awarded));
        let accepted = batch_results
            .iter()
            .filter(|b| b.status == Verdict::Accepted);
        let (execution_time_ms, memory_used_kb) = accepted.fold((0.0f64, 0.0f64), |acc, b| {
            (acc.0.max(b.execution_time_ms), acc.1.max(b.memory_used_kb))
        });

        Self {
            status: if points_earned > 0 {
                Verdict::Accepted
            } else {
                Verdict::WrongAnswer
            },
            points_earned,
            execution_time_ms,
            memory_used_kb,
            batch_results,
            error: None,
        }
    }

    pub fn compile_error(batches: &[Batch], diagnostics: String) -> Self {
        Self::not_judged(Verdict::CompileError, batches, diagnostics)
    }

    pub fn internal_error(batches: &[Batch], message: String) -> Self {
        Self::not_judged(Verdict::RuntimeError, batches, message)
    }

    fn not_judged(status: Verdict, batches: &[Batch], error: String) -> Self {
        Self {
            status,
            points_earned: 0,
            execution_time_ms: 0.0,
            memory_used_kb: 0.0,
            batch_results: batches
                .iter()
                .map(|b| BatchResult::not_run(status, b))
                .collect(),
            error: Some(error),
        }
    }

    pub fn is_solved(&self) -> bool {
        self.status == Verdict::Accepted && self.points_earned > 0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn serialize_rounded<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(round2(*value))
}
