use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::JudgeConfig;
use crate::judge::model::{ExecutionOutcome, ExecutionTime, ResourceLimits, TestCase, Verdict};

use super::compile::Artifact;
use super::launcher::{ProcessLauncher, exited};
use super::memory::MemoryWatch;

const STDERR_LIMIT_BYTES: usize = 64 * 1024;
/// How long pipes may stay open after the process tree is gone
const PIPE_GRACE: Duration = Duration::from_millis(200);

pub const CANCELLED_MESSAGE: &str = "Judging cancelled";

/// Knobs of a single run, taken from [`JudgeConfig`]
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub sample_interval: Duration,
    pub enforce_memory_limit: bool,
    pub output_limit_bytes: usize,
}

impl From<&JudgeConfig> for RunSettings {
    fn from(config: &JudgeConfig) -> Self {
        Self {
            sample_interval: Duration::from_millis(config.memory_sample_interval_ms),
            enforce_memory_limit: config.enforce_memory_limit,
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

/// Runs one artifact against one test case and classifies what happened.
#[derive(Clone)]
pub struct TestRunner {
    launcher: Arc<dyn ProcessLauncher>,
    settings: RunSettings,
}

enum Termination {
    Exited,
    TimedOut,
    MemoryExceeded,
    Cancelled,
}

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl TestRunner {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, settings: RunSettings) -> Self {
        Self { launcher, settings }
    }

    /// Never fails: launch problems and infrastructure hiccups become `RE`.
    pub async fn run(
        &self,
        artifact: &Artifact,
        case: &TestCase,
        limits: ResourceLimits,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        if cancel.is_cancelled() {
            return ExecutionOutcome::runtime_error(CANCELLED_MESSAGE);
        }

        let invocation = artifact.invocation();
        let start_time = Instant::now();
        let mut child = match self.launcher.launch(invocation) {
            Ok(child) => child,
            Err(e) => {
                log::warn!("Failed to launch {}: {e}", invocation.program);
                return ExecutionOutcome::runtime_error(format!(
                    "Failed to launch {}: {e}",
                    invocation.program
                ));
            }
        };
        let pid = child.id();

        let feeder = child
            .stdin
            .take()
            .map(|stdin| tokio::spawn(feed_input(stdin, case.input.clone())));
        let stdout = Arc::new(Mutex::new(Captured::default()));
        let stderr = Arc::new(Mutex::new(Captured::default()));
        let readers: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|s| tokio::spawn(capture(s, stdout.clone(), self.settings.output_limit_bytes))),
            child
                .stderr
                .take()
                .map(|s| tokio::spawn(capture(s, stderr.clone(), STDERR_LIMIT_BYTES))),
        ]
        .into_iter()
        .flatten()
        .collect();

        let memory = MemoryWatch::spawn(pid, self.settings.sample_interval);
        let memory_limit_kb = limits.memory_limit_kb();
        let deadline = tokio::time::sleep(Duration::from_millis(limits.time_limit_ms));

        let termination = tokio::select! {
            () = exited(&mut child) => Termination::Exited,
            () = deadline => Termination::TimedOut,
            () = memory.exceeded(memory_limit_kb), if self.settings.enforce_memory_limit => {
                Termination::MemoryExceeded
            }
            () = cancel.cancelled() => Termination::Cancelled,
        };
        let elapsed = start_time.elapsed();

        // Nothing started by this run may outlive it. The leader is not reaped
        // yet, so its group id cannot belong to anyone else.
        if let Some(pid) = pid {
            self.launcher.terminate(pid);
        }
        let wait_result = child.wait().await;
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        let mut abandoned = false;
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(PIPE_GRACE, reader).await.is_err() {
                log::warn!("Output pipe still open after process exit, abandoning it");
                abort.abort();
                abandoned = true;
            }
        }

        let memory_kb = memory.finish();
        let memory_used_kb = memory_kb as f64;
        let time_ms = elapsed.as_secs_f64() * 1000.0;
        let over_time = elapsed > Duration::from_millis(limits.time_limit_ms);
        let over_memory = self.settings.enforce_memory_limit && memory_kb > memory_limit_kb;

        let status = match termination {
            Termination::TimedOut => {
                return ExecutionOutcome::time_limit_exceeded(limits.time_limit_ms, memory_used_kb);
            }
            Termination::MemoryExceeded => {
                return memory_limit_exceeded(time_ms, memory_used_kb);
            }
            Termination::Cancelled => {
                return ExecutionOutcome {
                    memory_used_kb,
                    ..ExecutionOutcome::runtime_error(CANCELLED_MESSAGE)
                };
            }
            Termination::Exited => match wait_result {
                Ok(status) => status,
                Err(e) => {
                    log::error!("Failed to wait for {}: {e}", invocation.program);
                    return ExecutionOutcome::runtime_error(format!(
                        "Failed to wait for process: {e}"
                    ));
                }
            },
        };

        if over_time {
            return ExecutionOutcome::time_limit_exceeded(limits.time_limit_ms, memory_used_kb);
        }
        if over_memory {
            return memory_limit_exceeded(time_ms, memory_used_kb);
        }

        let stderr = std::mem::take(&mut *stderr.lock());
        if !status.success() {
            let stderr_text = String::from_utf8_lossy(&stderr.bytes).trim().to_string();
            let error = if stderr_text.is_empty() {
                describe_exit(&status)
            } else {
                stderr_text
            };
            return ExecutionOutcome {
                verdict: Verdict::RuntimeError,
                error: Some(error),
                ..ExecutionOutcome::accepted(time_ms, memory_used_kb)
            };
        }

        // partial output must not be graded
        if abandoned {
            return ExecutionOutcome {
                verdict: Verdict::RuntimeError,
                error: Some("Output stream stayed open after the process exited".to_string()),
                ..ExecutionOutcome::accepted(time_ms, memory_used_kb)
            };
        }

        let stdout = std::mem::take(&mut *stdout.lock());
        if stdout.truncated {
            return ExecutionOutcome {
                verdict: Verdict::RuntimeError,
                error: Some(format!(
                    "Output limit exceeded ({} bytes)",
                    self.settings.output_limit_bytes
                )),
                ..ExecutionOutcome::accepted(time_ms, memory_used_kb)
            };
        }

        let actual = String::from_utf8_lossy(&stdout.bytes);
        if outputs_match(&actual, &case.expected_output) {
            ExecutionOutcome::accepted(time_ms, memory_used_kb)
        } else {
            ExecutionOutcome::wrong_answer(
                time_ms,
                memory_used_kb,
                case.expected_output.trim(),
                actual.trim(),
            )
        }
    }
}

/// Output comparison: only leading and trailing whitespace is ignored.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}

fn memory_limit_exceeded(time_ms: f64, memory_kb: f64) -> ExecutionOutcome {
    ExecutionOutcome {
        verdict: Verdict::MemoryLimitExceeded,
        execution_time_ms: ExecutionTime::Measured(time_ms),
        memory_used_kb: memory_kb,
        expected_output: None,
        actual_output: None,
        error: Some("Memory limit exceeded".to_string()),
    }
}

fn describe_exit(status: &std::process::ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("Process killed by signal {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("Process exited with code {code}"),
        None => "Process exited abnormally".to_string(),
    }
}

/// Writes the whole input and closes stdin. A child that exits without
/// reading its input is not an error.
async fn feed_input(mut stdin: ChildStdin, input: String) {
    if let Err(e) = stdin.write_all(input.as_bytes()).await {
        log::debug!("Child stopped reading its input: {e}");
        return;
    }
    let _ = stdin.shutdown().await;
}

/// Reads a stream to EOF, keeping at most `limit` bytes and draining the rest.
async fn capture<R: AsyncRead + Unpin>(mut stream: R, sink: Arc<Mutex<Captured>>, limit: usize) {
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let mut captured = sink.lock();
                let room = limit.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                let keep = n.min(room);
                captured.bytes.extend_from_slice(&buf[..keep]);
            }
            Err(e) => {
                log::debug!("Stopped reading child output: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::LanguageConfig;
    use crate::sandbox::compile::Toolchain;
    use crate::sandbox::launcher::LocalLauncher;

    fn sh_config(root: PathBuf) -> JudgeConfig {
        JudgeConfig {
            languages: vec![LanguageConfig {
                name: "sh".to_string(),
                file_name: "main.sh".to_string(),
                compile: None,
                run: vec!["sh".to_string(), "%INPUT%".to_string()],
            }],
            work_root: Some(root),
            ..JudgeConfig::default()
        }
    }

    async fn run_script(script: &str, input: &str, expected: &str, limits: ResourceLimits) -> ExecutionOutcome {
        let root = tempfile::tempdir().unwrap();
        let config = sh_config(root.path().to_path_buf());
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(LocalLauncher);
        let cancel = CancellationToken::new();
        let artifact = Toolchain::new(&config, launcher.as_ref())
            .compile(script, "sh", &cancel)
            .await
            .unwrap();
        let runner = TestRunner::new(launcher, RunSettings::from(&config));
        let case = TestCase {
            input: input.to_string(),
            expected_output: expected.to_string(),
        };
        runner.run(&artifact, &case, limits, &cancel).await
    }

    fn limits(time_limit_ms: u64) -> ResourceLimits {
        ResourceLimits {
            time_limit_ms,
            memory_limit_mb: 256,
        }
    }

    #[test]
    fn test_outputs_match_trims_only_the_ends() {
        assert!(outputs_match("5\n", "5"));
        assert!(outputs_match("  1 2\n3\n\n", "1 2\n3"));
        assert!(!outputs_match("1  2", "1 2"));
        assert!(!outputs_match("1\n\n2", "1\n2"));
    }

    #[tokio::test]
    async fn test_accepted() {
        let outcome = run_script("read a b\necho $((a + b))\n", "2 3\n", "5", limits(2000)).await;
        assert_eq!(outcome.verdict, Verdict::Accepted, "{outcome:?}");
        assert!(outcome.execution_time_ms.as_millis().unwrap() >= 0.0);
        assert!(outcome.expected_output.is_none());
    }

    #[tokio::test]
    async fn test_wrong_answer_keeps_both_outputs() {
        let outcome = run_script("echo 6\n", "", " 5 \n", limits(2000)).await;
        assert_eq!(outcome.verdict, Verdict::WrongAnswer);
        assert_eq!(outcome.expected_output.as_deref(), Some("5"));
        assert_eq!(outcome.actual_output.as_deref(), Some("6"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_runtime_error() {
        let outcome = run_script("echo boom >&2\nexit 3\n", "", "", limits(2000)).await;
        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert_eq!(outcome.error.as_deref(), Some("boom"));

        let outcome = run_script("exit 7\n", "", "", limits(2000)).await;
        assert_eq!(outcome.error.as_deref(), Some("Process exited with code 7"));
    }

    #[tokio::test]
    async fn test_infinite_loop_is_time_limit_exceeded() {
        let start = Instant::now();
        let outcome = run_script("while :; do :; done\n", "", "", limits(300)).await;
        assert_eq!(outcome.verdict, Verdict::TimeLimitExceeded);
        assert_eq!(outcome.execution_time_ms, ExecutionTime::Exceeded { limit_ms: 300 });
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleeping_descendant_does_not_hold_the_run() {
        let start = Instant::now();
        let outcome = run_script("sleep 30 &\nsleep 30\n", "", "", limits(300)).await;
        assert_eq!(outcome.verdict, Verdict::TimeLimitExceeded);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_descendants_of_a_finished_run_are_killed() {
        let start = Instant::now();
        let outcome = run_script("sleep 30 &\necho 5\n", "", "5", limits(5000)).await;
        assert_eq!(outcome.verdict, Verdict::Accepted, "{outcome:?}");
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_output_held_open_by_an_escaped_process_is_runtime_error() {
        let has_setsid = std::process::Command::new("setsid")
            .arg("true")
            .status()
            .is_ok_and(|s| s.success());
        if !has_setsid {
            eprintln!("setsid not available, skipping");
            return;
        }
        // the detached sleep leaves the process group but keeps stdout open
        let outcome = run_script("setsid sleep 3 &\nsleep 0.3\necho 5\n", "", "5", limits(5000)).await;
        assert_eq!(outcome.verdict, Verdict::RuntimeError, "{outcome:?}");
        assert_eq!(
            outcome.error.as_deref(),
            Some("Output stream stayed open after the process exited")
        );
    }

    #[tokio::test]
    async fn test_unread_input_is_fine() {
        let input = "x".repeat(1 << 20);
        let outcome = run_script("echo ok\n", &input, "ok", limits(2000)).await;
        assert_eq!(outcome.verdict, Verdict::Accepted, "{outcome:?}");
    }

    #[tokio::test]
    async fn test_missing_program_is_runtime_error() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact::for_invocation(
            crate::sandbox::launcher::Invocation {
                program: "/nonexistent/solution".to_string(),
                args: vec![],
                working_dir: dir.path().to_path_buf(),
            },
        );
        let runner = TestRunner::new(Arc::new(LocalLauncher), RunSettings::from(&JudgeConfig::default()));
        let case = TestCase {
            input: String::new(),
            expected_output: String::new(),
        };
        let outcome = runner
            .run(&artifact, &case, limits(1000), &CancellationToken::new())
            .await;
        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert!(outcome.error.unwrap().starts_with("Failed to launch"));
    }

    #[tokio::test]
    async fn test_output_flood_is_capped() {
        let root = tempfile::tempdir().unwrap();
        let config = JudgeConfig {
            output_limit_bytes: 1024,
            ..sh_config(root.path().to_path_buf())
        };
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(LocalLauncher);
        let cancel = CancellationToken::new();
        let artifact = Toolchain::new(&config, launcher.as_ref())
            .compile("i=0\nwhile [ $i -lt 2000 ]; do echo line; i=$((i + 1)); done\n", "sh", &cancel)
            .await
            .unwrap();
        let runner = TestRunner::new(launcher, RunSettings::from(&config));
        let case = TestCase {
            input: String::new(),
            expected_output: String::new(),
        };
        let outcome = runner.run(&artifact, &case, limits(5000), &cancel).await;
        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert!(outcome.error.unwrap().starts_with("Output limit exceeded"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_run() {
        let root = tempfile::tempdir().unwrap();
        let config = sh_config(root.path().to_path_buf());
        let launcher: Arc<dyn ProcessLauncher> = Arc::new(LocalLauncher);
        let cancel = CancellationToken::new();
        let artifact = Toolchain::new(&config, launcher.as_ref())
            .compile("sleep 30\n", "sh", &cancel)
            .await
            .unwrap();
        let runner = TestRunner::new(launcher, RunSettings::from(&config));
        let case = TestCase {
            input: String::new(),
            expected_output: String::new(),
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let start = Instant::now();
        let outcome = runner.run(&artifact, &case, limits(20_000), &cancel).await;
        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert_eq!(outcome.error.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
