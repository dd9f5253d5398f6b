use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "oj-judge", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the judge configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<PathBuf>,

    /// JSON file holding one submission or an array of submissions ("-" reads stdin)
    #[arg(long = "submission", short = 's', conflicts_with_all = ["code", "language", "batches"])]
    pub submission_path: Option<String>,

    /// Source code of the submission
    #[arg(long, env = "CODE")]
    pub code: Option<String>,

    /// Language name, one of the configured languages
    #[arg(long, env = "LANGUAGE")]
    pub language: Option<String>,

    /// Batches as JSON: [{"points": 100, "test_cases": [{"input": "...", "output": "..."}]}]
    #[arg(long, env = "BATCHES")]
    pub batches: Option<String>,

    /// Wall-clock limit per test case in milliseconds
    #[arg(long = "time-limit", env = "TIME_LIMIT", default_value_t = 1000)]
    pub time_limit_ms: u64,

    /// Memory limit per test case in megabytes
    #[arg(long = "memory-limit", env = "MEMORY_LIMIT", default_value_t = 256)]
    pub memory_limit_mb: u64,

    /// Pretty-print the JSON result
    #[arg(long, default_value_t = false)]
    pub pretty: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file, or the defaults
    pub fn to_config(&self) -> anyhow::Result<JudgeConfig> {
        match &self.config_path {
            Some(path) => JudgeConfig::from_file(path),
            None => Ok(JudgeConfig::default()),
        }
    }
}

/// Settings handed to every judging call. Never mutated after construction.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JudgeConfig {
    pub languages: Vec<LanguageConfig>,
    pub work_root: Option<PathBuf>,
    pub compile_time_limit_ms: u64,
    pub memory_sample_interval_ms: u64,
    pub enforce_memory_limit: bool,
    pub output_limit_bytes: usize,
    pub max_parallel_batches: usize,
    pub workers: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            languages: LanguageConfig::builtin(),
            work_root: None,
            compile_time_limit_ms: 30_000,
            memory_sample_interval_ms: 5,
            enforce_memory_limit: true,
            output_limit_bytes: 64 * 1024 * 1024,
            max_parallel_batches: 1,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl JudgeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn language(&self, name: &str) -> Option<&LanguageConfig> {
        self.languages.iter().find(|l| l.name == name)
    }

    /// Directory under which every submission gets its own workspace
    pub fn work_root(&self) -> PathBuf {
        use directories::ProjectDirs;

        if let Some(root) = &self.work_root {
            return root.clone();
        }
        ProjectDirs::from("", "", "oj-judge")
            .map(|dirs| dirs.cache_dir().join("work"))
            .unwrap_or_else(|| std::env::temp_dir().join("oj-judge"))
    }
}

/// How one language is turned into a runnable artifact.
///
/// Templates may use `%INPUT%` (source path), `%OUTPUT%` (executable path),
/// `%DIR%` (workspace) and `%CLASS%` (Java public class name).
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    pub name: String,
    pub file_name: String,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
}

impl LanguageConfig {
    pub fn builtin() -> Vec<Self> {
        let words = |ws: &[&str]| ws.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        vec![
            Self {
                name: "cpp".to_string(),
                file_name: "solution.cpp".to_string(),
                compile: Some(words(&[
                    "g++", "-O2", "-std=c++17", "-o", "%OUTPUT%", "%INPUT%",
                ])),
                run: words(&["%OUTPUT%"]),
            },
            Self {
                name: "java".to_string(),
                file_name: "%CLASS%.java".to_string(),
                compile: Some(words(&["javac", "-encoding", "UTF-8", "%INPUT%"])),
                run: words(&["java", "-cp", "%DIR%", "%CLASS%"]),
            },
            Self {
                name: "python".to_string(),
                file_name: "solution.py".to_string(),
                compile: Some(words(&["python3", "-m", "py_compile", "%INPUT%"])),
                run: words(&["python3", "%INPUT%"]),
            },
        ]
    }
}
