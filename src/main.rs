use std::io::Read;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinSet;

use oj_judge::config::CliArgs;
use oj_judge::{Batch, JudgeEngine, JudgePool, Submission, validate_submission};

#[derive(Deserialize)]
#[serde(untagged)]
enum SubmissionInput {
    One(Submission),
    Many(Vec<Submission>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let output = match run(&cli).await {
        Ok(output) => output,
        Err(e) => {
            log::error!("{e:#}");
            json!({ "status": "CE", "error": format!("{e:#}") })
        }
    };

    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{rendered}");
    Ok(())
}

async fn run(cli: &CliArgs) -> anyhow::Result<serde_json::Value> {
    let config = cli.to_config()?;
    let Some(input) = read_input(cli)? else {
        return Ok(json!({ "status": "CE", "error": "Missing required parameters" }));
    };
    let (submissions, single) = match input {
        SubmissionInput::One(submission) => (vec![submission], true),
        SubmissionInput::Many(submissions) => (submissions, false),
    };
    for (idx, submission) in submissions.iter().enumerate() {
        validate_submission(submission)
            .with_context(|| format!("Invalid submission {}", idx + 1))?;
    }

    let engine = JudgeEngine::new(config);
    let workers = engine.config().workers;
    let pool = Arc::new(JudgePool::new(engine, workers));

    let ctrl_c_pool = pool.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-c received, shutting down...");
            ctrl_c_pool.shutdown();
        }
    });

    let mut tasks = JoinSet::new();
    for (idx, submission) in submissions.into_iter().enumerate() {
        let pool = pool.clone();
        tasks.spawn(async move { (idx, pool.submit(idx as u64, &submission).await) });
    }
    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        results.push(joined.context("Judging task failed")?);
    }
    ctrl_c.abort();
    results.sort_by_key(|(idx, _)| *idx);

    let mut values = results
        .into_iter()
        .map(|(_, result)| serde_json::to_value(result))
        .collect::<Result<Vec<_>, _>>()?;
    if single {
        Ok(values.pop().unwrap_or_default())
    } else {
        Ok(serde_json::Value::Array(values))
    }
}

/// Reads the submission from `--submission`, or assembles it from the
/// individual arguments. `None` when required parameters are missing.
fn read_input(cli: &CliArgs) -> anyhow::Result<Option<SubmissionInput>> {
    if let Some(path) = &cli.submission_path {
        let text = if path == "-" {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read submission from stdin")?;
            text
        } else {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read submission {path}"))?
        };
        let input = serde_json::from_str(&text).context("Failed to parse submission")?;
        return Ok(Some(input));
    }

    let (Some(code), Some(language), Some(batches)) = (&cli.code, &cli.language, &cli.batches)
    else {
        return Ok(None);
    };
    if code.is_empty() || language.is_empty() {
        return Ok(None);
    }
    let batches: Vec<Batch> = serde_json::from_str(batches).context("Failed to parse batches")?;
    if batches.is_empty() {
        return Ok(None);
    }
    Ok(Some(SubmissionInput::One(Submission {
        code: code.clone(),
        language: language.clone(),
        batches,
        time_limit_ms: cli.time_limit_ms,
        memory_limit_mb: cli.memory_limit_mb,
    })))
}
