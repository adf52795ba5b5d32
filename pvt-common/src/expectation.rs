//! Scenario expectations and the engine that checks them.
//!
//! Callback counters are cumulative for the life of the server, so the
//! expected counts of a scenario depend on every scenario before it. The
//! [`CounterLedger`] folds the per-scenario access patterns into those
//! counts instead of hard-coding them.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::PropertyAddress;
use crate::config::{ScenarioConfig, ValueType};
use crate::error::{HarnessError, HarnessResult};
use crate::journal::{RunJournal, RunPhase};
use crate::mutator::PropertyAccess;
use crate::rendezvous::RendezvousChannel;

/// One external client call against a callback-wrapped property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAccess {
    /// A put runs get, set, get inside the server.
    Put,
    /// A get runs get, get.
    Get,
}

impl CallbackAccess {
    pub const fn delta(self) -> CounterDelta {
        match self {
            Self::Put => CounterDelta { get: 2, set: 1 },
            Self::Get => CounterDelta { get: 2, set: 0 },
        }
    }
}

/// Counter increase caused by one or more accesses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub get: u64,
    pub set: u64,
}

impl CounterDelta {
    pub fn of(pattern: &[CallbackAccess]) -> Self {
        pattern.iter().fold(Self::default(), |acc, access| {
            let d = access.delta();
            Self {
                get: acc.get + d.get,
                set: acc.set + d.set,
            }
        })
    }
}

/// Cumulative callback counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub get: u64,
    pub set: u64,
}

impl CounterState {
    pub fn apply(self, delta: CounterDelta) -> Self {
        Self {
            get: self.get + delta.get,
            set: self.set + delta.set,
        }
    }
}

/// Folds scenario access patterns into expected cumulative counters.
#[derive(Debug, Clone, Default)]
pub struct CounterLedger {
    state: CounterState,
    scenarios: usize,
}

impl CounterLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CounterState {
        self.state
    }

    pub fn scenarios(&self) -> usize {
        self.scenarios
    }

    /// Account for one scenario and return the counters it must observe.
    pub fn record(&mut self, pattern: &[CallbackAccess]) -> CounterState {
        self.state = self.state.apply(CounterDelta::of(pattern));
        self.scenarios += 1;
        self.state
    }
}

/// What a scenario does to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Exercise {
    /// Put a value on the plain address, then another on its callback twin.
    Scalar {
        value_type: ValueType,
        plain: PropertyAddress,
        callback: PropertyAddress,
        plain_value: String,
        callback_value: String,
    },
    /// Fill an array from a source, then read it back in aggregate.
    Array {
        address: PropertyAddress,
        source: String,
        expected_last: String,
    },
}

impl Exercise {
    /// Type used to compare the echo and value observations. Array
    /// elements and counters are integers.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Scalar { value_type, .. } => *value_type,
            Self::Array { .. } => ValueType::Int,
        }
    }

    /// Accesses this exercise makes against callback-wrapped properties.
    pub fn callback_pattern(&self) -> &'static [CallbackAccess] {
        match self {
            Self::Scalar { .. } => &[CallbackAccess::Put],
            Self::Array { .. } => &[],
        }
    }
}

/// A scenario together with the counters the server must report after it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioExpectation {
    pub name: String,
    pub exercise: Exercise,
    pub expected_get: u64,
    pub expected_set: u64,
}

/// Expected counter table for a sequence of scenarios run against one
/// server instance, in order.
pub fn plan(scenarios: &[ScenarioConfig]) -> HarnessResult<Vec<ScenarioExpectation>> {
    let mut ledger = CounterLedger::new();
    scenarios
        .iter()
        .map(|scenario| {
            let exercise = match scenario {
                ScenarioConfig::Scalar(s) => Exercise::Scalar {
                    value_type: s.value_type,
                    plain: s.plain.clone(),
                    callback: s.callback_address(),
                    plain_value: s.plain_value.clone(),
                    callback_value: s.callback_value.clone(),
                },
                ScenarioConfig::Array(a) => Exercise::Array {
                    address: a.address.clone(),
                    source: a.source.clone(),
                    expected_last: a.resolve_expected_last()?,
                },
            };
            let counters = ledger.record(exercise.callback_pattern());
            Ok(ScenarioExpectation {
                name: scenario.name().to_string(),
                exercise,
                expected_get: counters.get,
                expected_set: counters.set,
            })
        })
        .collect()
}

/// Compare a revealed value with its expectation. Text must match exactly
/// unless both sides are numbers, in which case `10` equals `10.0`.
pub fn values_match(expected: &str, actual: &str) -> bool {
    let (expected, actual) = (expected.trim(), actual.trim());
    if expected == actual {
        return true;
    }
    match (expected.parse::<f64>(), actual.parse::<f64>()) {
        (Ok(e), Ok(a)) => e == a,
        _ => false,
    }
}

/// Kind of observation made during a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Output of the client command itself.
    Echo,
    /// Peeked property value.
    Value,
    /// Peeked cumulative get counter.
    GetCounter,
    /// Peeked cumulative set counter.
    SetCounter,
}

impl ProbeKind {
    fn label(self) -> &'static str {
        match self {
            Self::Echo => "echo",
            Self::Value => "value",
            Self::GetCounter => "get_counter",
            Self::SetCounter => "set_counter",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub kind: ProbeKind,
    pub step: String,
    pub expected: String,
    pub actual: String,
    pub matched: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub expected_get: u64,
    pub expected_set: u64,
    pub steps: Vec<StepRecord>,
    pub passed: bool,
    pub duration_ms: u64,
}

impl ScenarioReport {
    pub fn for_scenario(scenario: &ScenarioExpectation) -> Self {
        Self {
            name: scenario.name.clone(),
            expected_get: scenario.expected_get,
            expected_set: scenario.expected_set,
            ..Self::default()
        }
    }
}

/// Drives scenarios: client calls first, then one peek/acknowledge cycle
/// per observation point. Each peek is checked before it is acknowledged;
/// a mismatch leaves the server blocked for teardown to kill.
pub struct ExpectationEngine<'a> {
    access: &'a dyn PropertyAccess,
    channel: &'a mut RendezvousChannel,
    journal: Option<&'a RunJournal>,
}

impl<'a> ExpectationEngine<'a> {
    pub fn new(access: &'a dyn PropertyAccess, channel: &'a mut RendezvousChannel) -> Self {
        Self {
            access,
            channel,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: &'a RunJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Run one scenario and return its report.
    pub fn exercise(&mut self, scenario: &ScenarioExpectation) -> HarnessResult<ScenarioReport> {
        let mut report = ScenarioReport::for_scenario(scenario);
        self.run(scenario, &mut report)?;
        Ok(report)
    }

    /// Run one scenario, recording steps into `report` as they happen so
    /// a failed scenario still shows how far it got.
    pub fn run(
        &mut self,
        scenario: &ScenarioExpectation,
        report: &mut ScenarioReport,
    ) -> HarnessResult<()> {
        let started = Instant::now();
        info!(
            scenario = %scenario.name,
            expected_get = scenario.expected_get,
            expected_set = scenario.expected_set,
            "Running scenario"
        );
        let result = self.drive(scenario, report);
        report.duration_ms = started.elapsed().as_millis() as u64;
        report.passed = result.is_ok();
        if let Err(e) = &result {
            warn!(scenario = %scenario.name, error = %e, "Scenario failed");
        }
        result
    }

    fn drive(
        &mut self,
        scenario: &ScenarioExpectation,
        report: &mut ScenarioReport,
    ) -> HarnessResult<()> {
        let expected_value = match &scenario.exercise {
            Exercise::Scalar {
                plain,
                callback,
                plain_value,
                callback_value,
                ..
            } => {
                let echoed = self.access.set(plain, plain_value)?;
                self.check(scenario, report, ProbeKind::Echo, plain_value, &echoed)?;
                self.access.set(callback, callback_value)?;
                echoed
            }
            Exercise::Array {
                address,
                source,
                expected_last,
            } => {
                self.access.set_array(address, source)?;
                let last = self.access.get_array(address)?;
                self.check(scenario, report, ProbeKind::Echo, expected_last, &last)?;
                last
            }
        };

        self.peek(scenario, report, ProbeKind::Value, &expected_value)?;
        self.peek(
            scenario,
            report,
            ProbeKind::GetCounter,
            &scenario.expected_get.to_string(),
        )?;
        self.peek(
            scenario,
            report,
            ProbeKind::SetCounter,
            &scenario.expected_set.to_string(),
        )
    }

    fn peek(
        &mut self,
        scenario: &ScenarioExpectation,
        report: &mut ScenarioReport,
        kind: ProbeKind,
        expected: &str,
    ) -> HarnessResult<()> {
        let step = step_name(scenario, kind);
        let actual = self.channel.await_message(&step)?;
        self.check(scenario, report, kind, expected, &actual)?;
        self.channel.acknowledge()
    }

    fn check(
        &mut self,
        scenario: &ScenarioExpectation,
        report: &mut ScenarioReport,
        kind: ProbeKind,
        expected: &str,
        actual: &str,
    ) -> HarnessResult<()> {
        let step = step_name(scenario, kind);
        let value_type = match kind {
            ProbeKind::Echo | ProbeKind::Value => scenario.exercise.value_type(),
            ProbeKind::GetCounter | ProbeKind::SetCounter => ValueType::Int,
        };
        let matched = value_type.matches(expected, actual);
        debug!(%step, expected, actual, matched, "Checked observation");
        if let Some(journal) = self.journal {
            let decision = if matched { "MATCH" } else { "MISMATCH" };
            journal.record(RunPhase::Scenario, step.as_str(), decision, Some(actual));
        }
        report.steps.push(StepRecord {
            kind,
            step: step.clone(),
            expected: expected.to_string(),
            actual: actual.to_string(),
            matched,
        });
        if matched {
            Ok(())
        } else {
            Err(HarnessError::AssertionMismatch {
                step,
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }
}

fn step_name(scenario: &ScenarioExpectation, kind: ProbeKind) -> String {
    format!("{}/{}", scenario.name, kind.label())
}
