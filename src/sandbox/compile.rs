use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Local;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::config::{JudgeConfig, LanguageConfig};

use super::launcher::{Invocation, ProcessLauncher, exited};

const EXECUTABLE_NAME: &str = "main";
const DEFAULT_JAVA_CLASS: &str = "Solution";
const DIAGNOSTICS_LIMIT_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("{0}")]
    Rejected(String),

    #[error("compilation exceeded {0} ms")]
    TimedOut(u64),

    #[error("toolchain unavailable: failed to launch `{program}`: {source}")]
    ToolchainUnavailable {
        program: String,
        source: std::io::Error,
    },

    #[error("compilation cancelled")]
    Cancelled,

    /// Infrastructure fault unrelated to the submitted code
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CompileError {
    /// Whether this failure is the submission's fault (`CE`) rather than the judge's
    pub fn is_submission_fault(&self) -> bool {
        !matches!(self, Self::Internal(_) | Self::Cancelled)
    }
}

/// Single-use directory that is removed when dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
}

impl Workspace {
    pub fn create(root: &Path, language: &str) -> anyhow::Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create work root {}", root.display()))?;
        let prefix = format!("{language}-{}-", Local::now().format("%y%m%d-%H%M%S"));
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(root)
            .with_context(|| format!("Failed to create workspace in {}", root.display()))?;
        log::debug!("Created workspace {}", dir.path().display());
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        // `dir` is only taken in `drop`
        self.dir.as_ref().map(TempDir::path).unwrap_or(Path::new(""))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => log::debug!("Removed workspace {}", path.display()),
                Err(e) => log::error!("Failed to remove workspace {}: {e}", path.display()),
            }
        }
    }
}

/// The invocable form of a submission. Owns its workspace, so the source,
/// binaries and everything the program wrote disappear with it.
#[derive(Debug)]
pub struct Artifact {
    language: String,
    invocation: Invocation,
    workspace: Option<Workspace>,
}

impl Artifact {
    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn workspace_path(&self) -> Option<&Path> {
        self.workspace.as_ref().map(Workspace::path)
    }

    #[cfg(test)]
    pub(crate) fn for_invocation(invocation: Invocation) -> Self {
        Self {
            language: "test".to_string(),
            invocation,
            workspace: None,
        }
    }
}

/// Turns source code into an [`Artifact`] using the configured toolchains.
pub struct Toolchain<'a> {
    config: &'a JudgeConfig,
    launcher: &'a dyn ProcessLauncher,
}

impl<'a> Toolchain<'a> {
    pub fn new(config: &'a JudgeConfig, launcher: &'a dyn ProcessLauncher) -> Self {
        Self { config, launcher }
    }

    pub async fn compile(
        &self,
        code: &str,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<Artifact, CompileError> {
        let language_config = self
            .config
            .language(language)
            .ok_or_else(|| CompileError::UnsupportedLanguage(language.to_string()))?;

        let workspace = Workspace::create(&self.config.work_root(), &language_config.name)?;
        let paths = ArtifactPaths::new(language_config, code, workspace.path());

        // Write source code to workspace
        fs::write(&paths.source, format!("{code}\n"))
            .with_context(|| format!("Failed to write {}", paths.source.display()))?;

        if let Some(template) = &language_config.compile {
            let command = paths.apply_template(template);
            let invocation = Invocation::from_words(command, workspace.path().to_path_buf())
                .ok_or_else(|| anyhow::anyhow!("Empty compile command for {language}"))?;
            self.execute_compile_command(&invocation, cancel).await?;

            let expects_binary = template.iter().any(|w| w.contains("%OUTPUT%"));
            if expects_binary && !paths.executable.exists() {
                return Err(CompileError::Rejected(
                    "Compiler produced no executable".to_string(),
                ));
            }
        }

        let run = paths.apply_template(&language_config.run);
        let invocation = Invocation::from_words(run, workspace.path().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Empty run command for {language}"))?;

        Ok(Artifact {
            language: language_config.name.clone(),
            invocation,
            workspace: Some(workspace),
        })
    }

    /// Runs the compiler, returning its diagnostics on failure
    async fn execute_compile_command(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<(), CompileError> {
        let mut child = self.launcher.launch(invocation).map_err(|source| {
            CompileError::ToolchainUnavailable {
                program: invocation.program.clone(),
                source,
            }
        })?;
        let pid = child.id();
        drop(child.stdin.take());

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let collect = async {
            let (out, err, ()) = tokio::join!(
                read_limited(stdout.as_mut()),
                read_limited(stderr.as_mut()),
                exited(&mut child)
            );
            (out, err)
        };

        let limit = Duration::from_millis(self.config.compile_time_limit_ms);
        let finished = tokio::select! {
            finished = tokio::time::timeout(limit, collect) => Some(finished),
            () = cancel.cancelled() => None,
        };

        // The compiler is not reaped yet, so its group id is still its own.
        if let Some(pid) = pid {
            self.launcher.terminate(pid);
        }
        let status = child.wait().await;

        let Some(finished) = finished else {
            return Err(CompileError::Cancelled);
        };
        let Ok((out, err)) = finished else {
            log::info!("Compilation of {} timed out", invocation.program);
            return Err(CompileError::TimedOut(self.config.compile_time_limit_ms));
        };
        let status = status.context("Failed to wait for compiler")?;

        if status.success() {
            return Ok(());
        }
        let diagnostics = if err.trim().is_empty() { out } else { err };
        log::debug!("Compilation failed with {status}");
        Err(CompileError::Rejected(diagnostics))
    }
}

/// Resolved file locations inside one workspace
struct ArtifactPaths {
    dir: PathBuf,
    source: PathBuf,
    executable: PathBuf,
    class_name: String,
}

impl ArtifactPaths {
    fn new(language: &LanguageConfig, code: &str, dir: &Path) -> Self {
        let class_name = detect_public_class(code).unwrap_or_else(|| DEFAULT_JAVA_CLASS.to_string());
        let file_name = language.file_name.replace("%CLASS%", &class_name);
        Self {
            dir: dir.to_path_buf(),
            source: dir.join(file_name),
            executable: dir.join(EXECUTABLE_NAME),
            class_name,
        }
    }

    /// Applies template substitutions to command arguments
    fn apply_template(&self, template: &[String]) -> Vec<String> {
        let source = self.source.to_string_lossy();
        let executable = self.executable.to_string_lossy();
        let dir = self.dir.to_string_lossy();

        let mut mapping = HashMap::<&str, &str>::new();
        mapping.insert("%INPUT%", &source);
        mapping.insert("%OUTPUT%", &executable);
        mapping.insert("%DIR%", &dir);
        mapping.insert("%CLASS%", &self.class_name);

        template
            .iter()
            .map(|s| {
                let mut t = s.clone();
                for (k, v) in mapping.iter() {
                    t = t.replace(k, v);
                }
                t
            })
            .collect()
    }
}

/// Finds the name of a top-level `public class`, which javac requires to
/// match the file name.
fn detect_public_class(code: &str) -> Option<String> {
    code.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("public ")?;
        let rest = rest
            .trim_start()
            .trim_start_matches("final ")
            .trim_start_matches("abstract ")
            .trim_start();
        let rest = rest.strip_prefix("class ")?;
        let name: String = rest
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
            .collect();
        (!name.is_empty()).then_some(name)
    })
}

async fn read_limited<R: tokio::io::AsyncRead + Unpin>(stream: Option<&mut R>) -> String {
    let Some(stream) = stream else {
        return String::new();
    };
    let mut bytes = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = DIAGNOSTICS_LIMIT_BYTES.saturating_sub(bytes.len());
                bytes.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
