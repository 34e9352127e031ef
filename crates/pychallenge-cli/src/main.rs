use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pychallenge::{BatchSummary, ChallengeEngine, ExecutionSettings, LessonStep, Verdict};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Grade a Python source file against a lesson step and emit JSON verdicts.
#[derive(Parser, Debug)]
#[command(
    name = "pychallenge-cli",
    about = "Grade Python code against a lesson step and emit JSON verdicts"
)]
struct Args {
    /// Read Python source from file instead of stdin
    #[arg(long)]
    file: Option<PathBuf>,

    /// Lesson step JSON: {"starter_code", "tests", "hints", "checkpoint"}
    #[arg(long)]
    step: PathBuf,

    /// Wall-clock limit for the sandbox run, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Comma-separated list of importable modules (default: standard set)
    #[arg(long)]
    modules: Option<String>,
}

#[derive(Serialize)]
struct Report {
    verdicts: Vec<Verdict>,
    summary: BatchSummary,
    unlocks_next_step: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let code = match &args.file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading source {}", path.display()))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("reading source from stdin")?;
            buf
        }
    };

    let step_json = std::fs::read_to_string(&args.step)
        .with_context(|| format!("reading lesson step {}", args.step.display()))?;
    let step = LessonStep::from_json(&step_json)
        .with_context(|| format!("parsing lesson step {}", args.step.display()))?;

    let mut settings = ExecutionSettings::from_env();
    if let Some(ms) = args.timeout_ms {
        settings.timeout_ns = ms.saturating_mul(1_000_000);
    }
    if let Some(modules) = &args.modules {
        settings.allowed_modules = modules
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
    }
    debug!(?settings, tests = step.tests.len(), "grading");

    let mut engine = ChallengeEngine::new(settings);
    let verdicts = engine.run_tests(&code, &step.tests)?;
    engine.dispose()?;

    let summary = BatchSummary::from_verdicts(&verdicts);
    let report = Report {
        unlocks_next_step: summary.unlocks_next_step(step.checkpoint),
        verdicts,
        summary,
    };
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}
