//! End-to-end runs of the harness against the mock server binaries.

mod common;

use std::time::Duration;

use common::*;
use pvt_common::{
    HarnessError, ProbeKind, RendezvousChannel, ScalarScenarioConfig, ScenarioConfig, SuiteRunner,
    ValueType,
};
use serial_test::serial;
use tempfile::TempDir;

#[test]
fn test_default_suite_passes() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let config = suite_config(dir.path());

    let (report, result) = SuiteRunner::new(config).run();
    assert!(result.is_ok(), "suite failed: {result:?}");
    assert!(report.passed());
    assert!(report.server_pid.is_some());
    assert_eq!(report.scenarios.len(), 5);

    let counters: Vec<(u64, u64)> = report
        .scenarios
        .iter()
        .map(|s| (s.expected_get, s.expected_set))
        .collect();
    assert_eq!(counters, vec![(2, 1), (4, 2), (6, 3), (8, 4), (8, 4)]);

    for scenario in &report.scenarios {
        let kinds: Vec<ProbeKind> = scenario.steps.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ProbeKind::Echo,
                ProbeKind::Value,
                ProbeKind::GetCounter,
                ProbeKind::SetCounter
            ]
        );
        assert!(scenario.steps.iter().all(|s| s.matched));
    }

    let journal = std::fs::read_to_string(report.journal_path.as_ref().unwrap()).unwrap();
    assert!(journal.lines().any(|l| l.contains("PID_RECEIVED")));
    assert!(journal.lines().any(|l| l.contains("STOPPED")));
    assert!(!dir.path().join("pvtd.sock").exists(), "server did not shut down");
}

#[test]
fn test_poll_check_waits_for_monitor() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let mut config = suite_config(dir.path());
    config.poll.max_attempts = 30;
    config.poll.interval = Duration::from_millis(100);
    config.poll_checks.push(voltage_check("42"));

    let (report, result) = SuiteRunner::new(config).run();
    assert!(result.is_ok(), "suite failed: {result:?}");
    let check = &report.poll_checks[0];
    assert!(check.passed);
    assert_eq!(check.outcome.as_ref().unwrap().value, "42");
}

#[test]
fn test_poll_check_gives_up_on_wrong_value() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let mut config = suite_config(dir.path());
    config.poll.max_attempts = 3;
    config.poll.interval = Duration::from_millis(50);
    let mut check = voltage_check("42");
    check.expected = Some("43".to_string());
    config.poll_checks.push(check);

    let (report, result) = SuiteRunner::new(config).run();
    match result {
        Err(HarnessError::AssertionMismatch { step, expected, .. }) => {
            assert!(step.starts_with("poll "));
            assert_eq!(expected, "43");
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
    assert!(!report.poll_checks[0].passed);
    assert!(report.scenarios.iter().all(|s| s.passed));
}

#[test]
fn test_wrong_array_expectation_fails_and_tears_down() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let mut config = suite_config(dir.path());
    if let Some(ScenarioConfig::Array(array)) = config.scenarios.last_mut() {
        array.expected_last = Some("6".to_string());
    }

    let (report, result) = SuiteRunner::new(config).run();
    match result {
        Err(HarnessError::AssertionMismatch {
            step,
            expected,
            actual,
        }) => {
            assert_eq!(step, "array/echo");
            assert_eq!(expected, "6");
            assert_eq!(actual, "5");
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
    assert_eq!(report.scenarios.len(), 5);
    assert!(!report.scenarios[4].passed);
    assert!(!dir.path().join("pvtd.sock").exists(), "server did not shut down");
}

#[test]
fn test_uninstrumented_property_times_out_instead_of_hanging() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let mut config = suite_config(dir.path());
    config.rendezvous.message_timeout = Duration::from_secs(1);

    // A plain property posing as the callback twin never reports.
    let mut scenario = ScalarScenarioConfig::new(
        "silent",
        ValueType::Int,
        address("TARGET_VOLTAGE").parse().unwrap(),
    );
    scenario.callback = Some(address("MONITOR_VOLTAGE").parse().unwrap());
    config.scenarios = vec![ScenarioConfig::Scalar(scenario)];

    let started = std::time::Instant::now();
    let (report, result) = SuiteRunner::new(config).run();
    match result {
        Err(HarnessError::Timeout {
            step,
            completed_cycles,
            ..
        }) => {
            assert_eq!(step, "silent/value");
            // Only the pid handshake completed.
            assert_eq!(completed_cycles, 1);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(!report.passed());
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[test]
fn test_server_without_rendezvous_fails_handshake() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let mut config = suite_config(dir.path());
    config.server.args.push("--no-rendezvous".to_string());
    config.server.ready_timeout = Duration::from_secs(1);

    let (report, result) = SuiteRunner::new(config).run();
    assert!(
        matches!(result, Err(HarnessError::Timeout { ref step, .. }) if step == "handshake"),
        "got {result:?}"
    );
    assert!(report.server_pid.is_none());
    assert!(!dir.path().join("pvtd.sock").exists(), "server did not shut down");
}

#[test]
fn test_bind_conflict_never_launches_server() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let holder = RendezvousChannel::bind("127.0.0.1:0").unwrap();
    let mut config = suite_config(dir.path());
    config.rendezvous.address = holder.local_addr().to_string();

    let (report, result) = SuiteRunner::new(config).run();
    assert!(matches!(result, Err(HarnessError::Bind { .. })), "got {result:?}");
    assert!(report.server_pid.is_none());
    assert!(!dir.path().join("pvtd.sock").exists());
    holder.close();
}

#[test]
#[serial]
fn test_default_rendezvous_port() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let mut config = suite_config(dir.path());
    config.rendezvous.address = pvt_common::RendezvousConfig::default().address;
    config.scenarios.truncate(1);

    let (report, result) = SuiteRunner::new(config).run();
    assert!(result.is_ok(), "suite failed: {result:?}");
    assert_eq!(report.rendezvous_address.as_deref(), Some("127.0.0.1:3497"));
}
