//! Exercise harness for IronStack.
//!
//! This crate provides:
//! - Scenarios: deliberate misuse and memory corruption of a protected stack
//! - Supervisor: run scenarios in isolated process groups and judge the exit
//! - Structured logs: JSONL run records and a hashed artifact index
//!
//! The `ironstack-verifier` binary in this crate is the out-of-process shadow
//! peer used at the `shadowed` level.

pub mod scenarios;
pub mod structured_log;
pub mod supervisor;

pub use scenarios::{Scenario, ScenarioError, Termination, run_in_process};
pub use supervisor::{Observation, ScenarioReport, judge, spawn_scenario};
