//! End-to-end suite execution against one server lifetime.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{PollCheckConfig, SuiteConfig};
use crate::controller::{ServerController, ServerSession};
use crate::error::HarnessResult;
use crate::expectation::{ExpectationEngine, ScenarioReport, plan};
use crate::journal::{RunJournal, RunPhase};
use crate::mutator::{ClientCommand, PropertyAccess, PropertyMutator};
use crate::polling::{PollOutcome, await_eventual_value};
use crate::rendezvous::RendezvousChannel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Passed,
    Failed { code: String, message: String },
}

impl RunOutcome {
    fn from_result(result: &HarnessResult<()>) -> Self {
        match result {
            Ok(()) => Self::Passed,
            Err(e) => Self::Failed {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCheckReport {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PollOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rendezvous_address: Option<String>,
    pub server_pid: Option<u32>,
    pub scenarios: Vec<ScenarioReport>,
    pub poll_checks: Vec<PollCheckReport>,
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_path: Option<PathBuf>,
}

impl SuiteReport {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            rendezvous_address: None,
            server_pid: None,
            scenarios: Vec::new(),
            poll_checks: Vec::new(),
            outcome: RunOutcome::Passed,
            journal_path: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == RunOutcome::Passed
    }
}

/// Runs a configured suite: bind, launch, handshake, scenarios in order,
/// poll checks, teardown. Teardown is attempted on every path and the first
/// failure wins.
pub struct SuiteRunner {
    config: SuiteConfig,
}

impl SuiteRunner {
    pub fn new(config: SuiteConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    /// Execute the suite. The report is returned even when the run fails.
    pub fn run(&self) -> (SuiteReport, HarnessResult<()>) {
        let run_id = Uuid::new_v4().to_string();
        let mut report = SuiteReport::new(run_id.clone());

        let journal = match &self.config.journal_dir {
            Some(dir) => match RunJournal::create(dir, run_id.as_str()) {
                Ok(journal) => journal,
                Err(e) => {
                    let result = Err(e);
                    report.outcome = RunOutcome::from_result(&result);
                    report.finished_at = Some(Utc::now());
                    return (report, result);
                }
            },
            None => RunJournal::new(run_id.as_str()),
        };
        report.journal_path = journal.path().map(|p| p.to_path_buf());
        info!(run_id = %run_id, scenarios = self.config.scenarios.len(), "Starting suite");

        let mut channel = None;
        let mut session = None;
        let mut result = self.execute(&journal, &mut report, &mut channel, &mut session);

        let teardown = teardown(&journal, channel, session);
        if result.is_ok() {
            result = teardown;
        } else if let Err(e) = teardown {
            warn!(error = %e, "Teardown failed after an earlier failure");
        }

        match &result {
            Ok(()) => info!(run_id = %run_id, "Suite passed"),
            Err(e) => error!(run_id = %run_id, code = e.code(), error = %e, "Suite failed"),
        }
        report.outcome = RunOutcome::from_result(&result);
        report.finished_at = Some(Utc::now());
        (report, result)
    }

    fn execute(
        &self,
        journal: &RunJournal,
        report: &mut SuiteReport,
        channel_slot: &mut Option<RendezvousChannel>,
        session_slot: &mut Option<ServerSession>,
    ) -> HarnessResult<()> {
        let config = &self.config;
        config.validate()?;
        let expectations = plan(&config.scenarios)?;
        let mutator = PropertyMutator::new(
            ClientCommand::from_argv(&config.client.put)?,
            ClientCommand::from_argv(&config.client.get)?,
        )
        .with_timeout(config.client.timeout);

        let channel = RendezvousChannel::bind(&config.rendezvous.address)
            .inspect_err(|e| {
                journal.record(RunPhase::Bind, "rendezvous", "BIND_FAILED", Some(&e.to_string()));
            })?
            .with_message_timeout(config.rendezvous.message_timeout);
        let address = channel.local_addr().to_string();
        journal.record(RunPhase::Bind, "rendezvous", "BIND_OK", Some(&address));
        report.rendezvous_address = Some(address.clone());
        let channel = channel_slot.insert(channel);

        let controller = ServerController::new(&config.server.executable)
            .with_args(config.server.expanded_args(&address))
            .with_settling_delay(config.server.settling_delay)
            .with_ready_timeout(config.server.ready_timeout);
        let session = session_slot.insert(ServerSession::start(controller).inspect_err(|e| {
            journal.record(RunPhase::Launch, "server", "LAUNCH_FAILED", Some(&e.to_string()));
        })?);
        journal.record(RunPhase::Launch, "server", "LAUNCHED", None);

        let pid = session.await_ready(channel).inspect_err(|e| {
            journal.record(RunPhase::Handshake, "handshake", e.code(), Some(&e.to_string()));
        })?;
        report.server_pid = Some(pid);
        journal.record(RunPhase::Handshake, "handshake", "PID_RECEIVED", Some(&pid.to_string()));

        for expectation in &expectations {
            let mut scenario_report = ScenarioReport::for_scenario(expectation);
            let outcome = ExpectationEngine::new(&mutator, channel)
                .with_journal(journal)
                .run(expectation, &mut scenario_report);
            report.scenarios.push(scenario_report);
            if let Err(e) = outcome {
                journal.record(
                    RunPhase::Scenario,
                    expectation.name.as_str(),
                    e.code(),
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }

        for check in &config.poll_checks {
            let outcome = run_poll_check(&mutator, check, config);
            let (passed, error) = match &outcome {
                Ok(_) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            journal.record(
                RunPhase::Poll,
                check.name.as_str(),
                if passed { "CONVERGED" } else { "NOT_CONVERGED" },
                error.as_deref(),
            );
            report.poll_checks.push(PollCheckReport {
                name: check.name.clone(),
                passed,
                outcome: outcome.as_ref().ok().cloned(),
                error,
            });
            outcome?;
        }
        Ok(())
    }
}

fn run_poll_check(
    access: &dyn PropertyAccess,
    check: &PollCheckConfig,
    config: &SuiteConfig,
) -> HarnessResult<PollOutcome> {
    info!(check = %check.name, write = %check.write, read = %check.read, "Running poll check");
    access.set(&check.write, &check.value)?;
    await_eventual_value(access, &check.read, check.expected(), config.poll.policy())
}

fn teardown(
    journal: &RunJournal,
    channel: Option<RendezvousChannel>,
    session: Option<ServerSession>,
) -> HarnessResult<()> {
    // `stop` includes the settling delay, so the channel is closed first.
    if let Some(channel) = channel {
        channel.close();
        journal.record(RunPhase::Teardown, "rendezvous", "CHANNEL_CLOSED", None);
    }
    let result = match session {
        Some(session) => session.stop(),
        None => Ok(()),
    };
    match &result {
        Ok(()) => journal.record(RunPhase::Teardown, "server", "STOPPED", None),
        Err(e) => journal.record(RunPhase::Teardown, "server", e.code(), Some(&e.to_string())),
    };
    result
}
