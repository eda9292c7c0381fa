//! Runs scenarios in child processes and judges how they ended.

use std::path::Path;
use std::process::Command as ProcCommand;
use std::time::{Duration, Instant};

use ironstack::{ParanoiaLevel, Violation};
use serde::Serialize;

use crate::scenarios::{Expectation, Scenario, Termination};

/// Everything observed about one finished scenario process.
#[derive(Debug, Clone)]
pub struct Observation {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl Observation {
    #[must_use]
    pub fn termination(&self) -> Termination {
        match (self.exit_code, self.signal) {
            (Some(0), _) => Termination::Clean,
            (Some(1), _) => Termination::Exit1,
            (None, Some(9)) => Termination::Killed,
            _ => Termination::Other,
        }
    }

    /// Reason code named in the diagnostic output, if any.
    ///
    /// Accepts both the fatal header of a live instance and the construction
    /// error printed before an instance exists.
    #[must_use]
    pub fn reported_violation(&self) -> Option<Violation> {
        for line in self.stderr.lines() {
            if let Some((_, code)) = line.split_once("validator message: ") {
                let code = code.trim();
                return Violation::ALL.into_iter().find(|v| v.to_string() == code);
            }
            if let Some(message) = line.strip_prefix("IronStack construction ERROR: ") {
                let message = message.trim();
                if let Some(v) = Violation::ALL
                    .into_iter()
                    .find(|v| v.description() == message)
                {
                    return Some(v);
                }
            }
        }
        None
    }

    /// True when the construction error header was printed.
    #[must_use]
    pub fn construction_error(&self) -> bool {
        self.stderr
            .lines()
            .any(|line| line.starts_with("IronStack construction ERROR: "))
    }
}

/// Verdict for one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub paranoia: String,
    pub passed: bool,
    pub expected_termination: Termination,
    pub observed_termination: Termination,
    pub expected_violation: Option<String>,
    pub reported_violation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub duration_ms: u64,
    /// Mismatches, empty when the scenario passed.
    pub notes: Vec<String>,
}

/// Run `program --level <level> scenario <name>` in its own process group.
///
/// A group kill triggered by the scenario then takes down the child and its
/// shadow peers without reaching this process.
pub fn spawn_scenario(
    program: &Path,
    scenario: Scenario,
    level: ParanoiaLevel,
) -> std::io::Result<Observation> {
    let mut command = ProcCommand::new(program);
    command
        .arg("--level")
        .arg(level.name())
        .arg("scenario")
        .arg(scenario.name());
    isolate(&mut command);

    let started = Instant::now();
    let output = command.output()?;
    Ok(Observation {
        exit_code: output.status.code(),
        signal: exit_signal(&output.status),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: started.elapsed(),
    })
}

#[cfg(unix)]
fn isolate(command: &mut ProcCommand) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_command: &mut ProcCommand) {}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Compare an observation with what `scenario` should do at `level`.
#[must_use]
pub fn judge(scenario: Scenario, level: ParanoiaLevel, observed: &Observation) -> ScenarioReport {
    let expected: Expectation = scenario.expectation(level);
    let observed_termination = observed.termination();
    let reported = observed.reported_violation();

    let mut notes = Vec::new();
    if observed_termination != expected.termination {
        notes.push(format!(
            "expected termination {:?}, observed {:?}",
            expected.termination, observed_termination
        ));
    }
    if reported != expected.violation {
        notes.push(format!(
            "expected violation {}, reported {}",
            code_or_none(expected.violation),
            code_or_none(reported)
        ));
    }
    if expected.construction != observed.construction_error() {
        notes.push(if expected.construction {
            "construction error header missing".to_string()
        } else {
            "unexpected construction error".to_string()
        });
    }
    if expected.violation.is_some()
        && !expected.construction
        && !observed.stderr.contains("Exiting...")
    {
        notes.push("fatal path did not announce exit".to_string());
    }

    ScenarioReport {
        scenario,
        paranoia: level.name().to_string(),
        passed: notes.is_empty(),
        expected_termination: expected.termination,
        observed_termination,
        expected_violation: expected.violation.map(|v| v.to_string()),
        reported_violation: reported.map(|v| v.to_string()),
        exit_code: observed.exit_code,
        signal: observed.signal,
        duration_ms: u64::try_from(observed.duration.as_millis()).unwrap_or(u64::MAX),
        notes,
    }
}

fn code_or_none(violation: Option<Violation>) -> String {
    violation.map_or_else(|| "none".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(exit_code: Option<i32>, signal: Option<i32>, stderr: &str) -> Observation {
        Observation {
            exit_code,
            signal,
            stdout: String::new(),
            stderr: stderr.to_string(),
            duration: Duration::from_millis(3),
        }
    }

    #[test]
    fn parses_fatal_header() {
        let obs = observed(
            Some(1),
            None,
            "Error in ironstack::stack::ProtectedStack<u64, Guarded>::push (src/scenarios.rs:227), \
             validator message: BAD_HASH_SUM\nIronStack [0x1000] (Validator: - BAD_HASH_SUM) {\n}\nExiting...\n",
        );
        assert_eq!(obs.termination(), Termination::Exit1);
        assert_eq!(obs.reported_violation(), Some(Violation::BadSelfHash));
        assert!(!obs.construction_error());
    }

    #[test]
    fn parses_construction_error() {
        let obs = observed(
            Some(1),
            None,
            "IronStack construction ERROR: This pointer is already in use (two stacks are constructed at the same address)\nExiting...\n",
        );
        assert_eq!(obs.reported_violation(), Some(Violation::AddressInUse));
        assert!(obs.construction_error());
    }

    #[test]
    fn judge_matches_expectation() {
        let obs = observed(
            None,
            Some(9),
            "Error in x::top (a.rs:1), validator message: STACK_IS_EMPTY\nExiting...\n",
        );
        let report = judge(Scenario::EmptyTop, ParanoiaLevel::Shadowed, &obs);
        assert!(report.passed, "{:?}", report.notes);

        let report = judge(Scenario::EmptyTop, ParanoiaLevel::Guarded, &obs);
        assert!(!report.passed);
        assert_eq!(report.notes.len(), 1);
    }

    #[test]
    fn clean_run_with_stray_output_fails() {
        let obs = observed(Some(0), None, "");
        assert!(judge(Scenario::EmptyPop, ParanoiaLevel::Unguarded, &obs).passed);
        let report = judge(Scenario::ClobberBuffer, ParanoiaLevel::Guarded, &obs);
        assert!(!report.passed);
        assert_eq!(report.observed_termination, Termination::Clean);
        assert!(report.reported_violation.is_none());
    }
}
