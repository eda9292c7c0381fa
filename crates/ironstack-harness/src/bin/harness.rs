//! CLI entrypoint for the IronStack exercise harness.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ironstack::{
    Guarded, PageChecked, Paranoia, ParanoiaLevel, ProtectedStack, SelfChecked, Shadowed,
    Unguarded,
};
use ironstack_harness::structured_log::{ArtifactIndex, LogEmitter, LogLevel, Outcome};
use ironstack_harness::{Scenario, ScenarioError, judge, run_in_process, spawn_scenario};
use ironstack_membrane::config::build_level;
use ironstack_membrane::global_metrics;
use thiserror::Error;

const SUITE: &str = "ironstack";

/// Exercise tooling for IronStack.
#[derive(Debug, Parser)]
#[command(name = "ironstack-harness")]
#[command(about = "Drives protected stacks through normal use and deliberate corruption")]
struct Cli {
    /// Verification depth (name or 0-4). Defaults to the build level.
    #[arg(long, global = true, value_parser = parse_level)]
    level: Option<ParanoiaLevel>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Push a run of values, pop them back and check LIFO order.
    Demo {
        /// Number of values to push.
        #[arg(long, default_value_t = 1000)]
        count: u32,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Run one scenario in this process. Fatal scenarios end the process.
    Scenario {
        #[arg(value_enum)]
        name: Scenario,
    },
    /// Run scenarios in isolated child processes and judge how they end.
    Run {
        /// Scenarios to run (repeatable). Defaults to all of them.
        #[arg(long = "scenario", value_enum)]
        scenarios: Vec<Scenario>,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Directory for captured stderr and the artifact index.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// List scenarios with their minimum level.
    List,
}

#[derive(Debug, Error)]
enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error("LIFO order broken: expected {expected}, found {found}")]
    Order { expected: u32, found: u32 },
}

fn parse_level(raw: &str) -> Result<ParanoiaLevel, String> {
    let wanted = raw.trim().to_ascii_lowercase();
    [
        ParanoiaLevel::Unguarded,
        ParanoiaLevel::Guarded,
        ParanoiaLevel::SelfChecked,
        ParanoiaLevel::PageChecked,
        ParanoiaLevel::Shadowed,
    ]
    .into_iter()
    .find(|level| level.name() == wanted || level.as_u8().to_string() == wanted)
    .ok_or_else(|| format!("unknown paranoia level `{raw}`"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = cli.level.unwrap_or_else(build_level);
    match dispatch(cli.command, level) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ironstack-harness: {err}");
            ExitCode::from(2)
        }
    }
}

fn dispatch(command: Command, level: ParanoiaLevel) -> Result<ExitCode, HarnessError> {
    match command {
        Command::Demo { count, log } => {
            let mut emitter = open_log(log.as_deref(), "demo")?;
            if let Some(emitter) = emitter.as_mut() {
                let entry = emitter
                    .entry(LogLevel::Info, "demo_start")
                    .with_paranoia(level)
                    .with_details(serde_json::json!({ "count": count }));
                emitter.emit_entry(entry)?;
            }
            demo_at(level, count)?;
            println!("demo: pushed and popped {count} values at level {level}");
            if let Some(emitter) = emitter.as_mut() {
                let entry = emitter
                    .entry(LogLevel::Info, "demo_complete")
                    .with_paranoia(level)
                    .with_details(metrics_json());
                emitter.emit_entry(entry)?;
                emitter.flush()?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Scenario { name } => {
            let summary = run_in_process(name, level)?;
            println!("{name}: {summary}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            scenarios,
            log,
            artifacts,
        } => run_supervised(level, &scenarios, log.as_deref(), artifacts.as_deref()),
        Command::List => {
            for scenario in Scenario::ALL {
                let expected = scenario.expectation(level);
                println!(
                    "{:<20} min level {:<13} expect {:?}{}",
                    scenario.name(),
                    scenario.min_level().name(),
                    expected.termination,
                    expected
                        .violation
                        .map(|v| format!(" {v}"))
                        .unwrap_or_default()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn demo_at(level: ParanoiaLevel, count: u32) -> Result<(), HarnessError> {
    match level {
        ParanoiaLevel::Unguarded => demo::<Unguarded>(count),
        ParanoiaLevel::Guarded => demo::<Guarded>(count),
        ParanoiaLevel::SelfChecked => demo::<SelfChecked>(count),
        ParanoiaLevel::PageChecked => demo::<PageChecked>(count),
        ParanoiaLevel::Shadowed => demo::<Shadowed>(count),
    }
}

fn demo<P: Paranoia>(count: u32) -> Result<(), HarnessError> {
    let mut stack = ProtectedStack::<u32, P>::new();
    for value in 0..count {
        stack.as_mut().push(value);
    }
    for expected in (0..count).rev() {
        let found = *stack.top();
        if found != expected {
            return Err(HarnessError::Order { expected, found });
        }
        stack.as_mut().pop();
    }
    Ok(())
}

fn run_supervised(
    level: ParanoiaLevel,
    selected: &[Scenario],
    log: Option<&Path>,
    artifacts: Option<&Path>,
) -> Result<ExitCode, HarnessError> {
    let program = std::env::current_exe()?;
    let run_id = make_run_id();
    let mut emitter = LogEmitter::to_file_or_sink(log, SUITE, &run_id)?;
    let mut index = ArtifactIndex::new(run_id.clone());
    if let Some(dir) = artifacts {
        fs::create_dir_all(dir)?;
    }

    let scenarios = if selected.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        selected.to_vec()
    };
    let (mut passed, mut failed, mut skipped) = (0u32, 0u32, 0u32);

    for scenario in scenarios {
        if level < scenario.min_level() {
            skipped += 1;
            let entry = emitter
                .entry(LogLevel::Info, "scenario_outcome")
                .with_scenario(scenario.name())
                .with_paranoia(level)
                .with_outcome(Outcome::Skip)
                .with_details(serde_json::json!({
                    "reason": format!("needs {}", scenario.min_level()),
                }));
            emitter.emit_entry(entry)?;
            println!("SKIP {scenario} (needs {})", scenario.min_level());
            continue;
        }

        let start = emitter
            .entry(LogLevel::Info, "scenario_start")
            .with_scenario(scenario.name())
            .with_paranoia(level);
        emitter.emit_entry(start)?;

        let observed = match spawn_scenario(&program, scenario, level) {
            Ok(observed) => observed,
            Err(err) => {
                failed += 1;
                let entry = emitter
                    .entry(LogLevel::Error, "scenario_outcome")
                    .with_scenario(scenario.name())
                    .with_paranoia(level)
                    .with_outcome(Outcome::Error)
                    .with_details(serde_json::json!({ "error": err.to_string() }));
                emitter.emit_entry(entry)?;
                println!("ERROR {scenario}: {err}");
                continue;
            }
        };
        let report = judge(scenario, level, &observed);

        let mut refs = Vec::new();
        if let Some(dir) = artifacts {
            let path = dir.join(format!("{}.{}.stderr", scenario.name(), level.name()));
            fs::write(&path, &observed.stderr)?;
            index.add_file(&path, "stderr", Some(format!("diagnostics of {scenario}")))?;
            refs.push(path.display().to_string());
        }

        let (log_level, outcome) = if report.passed {
            passed += 1;
            (LogLevel::Info, Outcome::Pass)
        } else {
            failed += 1;
            (LogLevel::Error, Outcome::Fail)
        };
        let mut entry = emitter
            .entry(log_level, "scenario_outcome")
            .with_scenario(scenario.name())
            .with_paranoia(level)
            .with_outcome(outcome)
            .with_duration_ms(report.duration_ms)
            .with_details(serde_json::to_value(&report)?);
        if let Some(code) = &report.reported_violation {
            entry = entry.with_violation(code.clone());
        }
        if let Some(code) = report.exit_code {
            entry = entry.with_exit_code(code);
        }
        if let Some(signal) = report.signal {
            entry = entry.with_signal(signal);
        }
        if !refs.is_empty() {
            entry = entry.with_artifacts(refs);
        }
        emitter.emit_entry(entry)?;

        if report.passed {
            println!("PASS {scenario}");
        } else {
            println!("FAIL {scenario}: {}", report.notes.join("; "));
        }
    }

    let summary = emitter
        .entry(LogLevel::Info, "run_summary")
        .with_paranoia(level)
        .with_details(serde_json::json!({
            "passed": passed,
            "failed": failed,
            "skipped": skipped,
        }));
    emitter.emit_entry(summary)?;
    emitter.flush()?;

    if let Some(dir) = artifacts {
        let index_path = dir.join("artifact_index.json");
        fs::write(&index_path, index.to_json()?)?;
    }
    println!("{passed} passed, {failed} failed, {skipped} skipped at level {level}");

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn open_log(path: Option<&Path>, tag: &str) -> io::Result<Option<LogEmitter>> {
    path.map(|path| LogEmitter::to_file(path, SUITE, &format!("{tag}-{}", make_run_id())))
        .transpose()
}

fn make_run_id() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("run-{secs}-{}", std::process::id())
}

fn metrics_json() -> serde_json::Value {
    let snapshot = global_metrics().snapshot();
    let map: serde_json::Map<String, serde_json::Value> = snapshot
        .entries()
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.into()))
        .collect();
    serde_json::Value::Object(map)
}
