//! Human-readable rendering of reports, plans and errors.

use std::fmt::Write;

use pvt_common::{
    Exercise, HarnessError, HarnessResult, RunOutcome, ScenarioExpectation, SuiteReport,
};
use serde::Serialize;

pub fn to_json<T: Serialize>(value: &T) -> HarnessResult<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| HarnessError::Config(format!("serializing output: {e}")))
}

pub fn render_report(report: &SuiteReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "run {}", report.run_id);
    if let Some(address) = &report.rendezvous_address {
        let _ = writeln!(out, "rendezvous {address}");
    }
    if let Some(pid) = report.server_pid {
        let _ = writeln!(out, "server pid {pid}");
    }

    for scenario in &report.scenarios {
        let mark = if scenario.passed { "ok  " } else { "FAIL" };
        let _ = writeln!(
            out,
            "{mark} {:<12} get={:<3} set={:<3} {} ms",
            scenario.name, scenario.expected_get, scenario.expected_set, scenario.duration_ms
        );
        for step in scenario.steps.iter().filter(|s| !s.matched) {
            let _ = writeln!(
                out,
                "     {}: expected {:?}, got {:?}",
                step.step, step.expected, step.actual
            );
        }
    }
    for check in &report.poll_checks {
        match (&check.outcome, &check.error) {
            (Some(outcome), _) => {
                let _ = writeln!(
                    out,
                    "ok   poll {:<7} {} = {} after {} reads",
                    check.name, outcome.address, outcome.value, outcome.reads
                );
            }
            (None, error) => {
                let _ = writeln!(
                    out,
                    "FAIL poll {:<7} {}",
                    check.name,
                    error.as_deref().unwrap_or("no outcome")
                );
            }
        }
    }
    if let Some(path) = &report.journal_path {
        let _ = writeln!(out, "journal {}", path.display());
    }

    match &report.outcome {
        RunOutcome::Passed => {
            let _ = writeln!(out, "PASSED");
        }
        RunOutcome::Failed { code, .. } => {
            let _ = writeln!(out, "FAILED [{code}]");
        }
    }
    out
}

pub fn render_plan(expectations: &[ScenarioExpectation]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<12} {:<7} {:>4} {:>4}  target", "scenario", "kind", "get", "set");
    for expectation in expectations {
        let (kind, target) = match &expectation.exercise {
            Exercise::Scalar { callback, .. } => ("scalar", callback.to_string()),
            Exercise::Array { address, .. } => ("array", address.to_string()),
        };
        let _ = writeln!(
            out,
            "{:<12} {:<7} {:>4} {:>4}  {}",
            expectation.name, kind, expectation.expected_get, expectation.expected_set, target
        );
    }
    out
}

pub fn render_provenance(rows: &[(&'static str, String, String)]) -> String {
    let width = rows.iter().map(|(key, ..)| key.len()).max().unwrap_or(0);
    let mut out = String::new();
    for (key, value, source) in rows {
        let _ = writeln!(out, "{key:<width$} = {value}  ({source})");
    }
    out
}

pub fn render_error(error: &HarnessError) -> String {
    let mut line = format!("error[{}]: {error}", error.code());
    if error.is_environmental() {
        line.push_str("\nhint: the server or its environment failed, not the assertions");
    }
    line
}
