//! Configuration for verification runs.
//!
//! Values are layered: built-in defaults, then the suite file, then `PVT_*`
//! environment variables. Each overridable value remembers where it came
//! from so `pvt config` can explain the effective setup.

pub mod env;
pub mod source;
pub mod suite;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};
pub use suite::{
    ArrayScenarioConfig, ClientConfig, PollCheckConfig, PollConfig, RendezvousConfig,
    ScalarScenarioConfig, ScenarioConfig, ServerConfig, SuiteConfig, ValueType,
};

use crate::error::{HarnessError, HarnessResult};

/// Suite configuration after env overrides, with per-value provenance.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub suite: SuiteConfig,
    pub rendezvous_address: Sourced<String>,
    pub message_timeout_ms: Sourced<u64>,
    pub server_executable: Sourced<PathBuf>,
    pub settling_delay_ms: Sourced<u64>,
    pub log_level: Sourced<String>,
}

impl ResolvedConfig {
    /// Load `path` (or the defaults when `None`), apply environment
    /// overrides and validate the result.
    pub fn resolve(path: Option<&Path>) -> HarnessResult<Self> {
        let (suite, raw) = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    HarnessError::Config(format!("reading {}: {e}", path.display()))
                })?;
                let suite = SuiteConfig::from_toml_str(&raw)
                    .map_err(|e| HarnessError::Config(format!("{}: {e}", path.display())))?;
                let table: toml::Table = toml::from_str(&raw).unwrap_or_default();
                (suite, Some((path.display().to_string(), table)))
            }
            None => (SuiteConfig::default(), None),
        };
        let mut parser = EnvParser::new();
        let resolved = Self::overlay(suite, raw.as_ref(), &mut parser);

        let errors = parser.take_errors();
        if !errors.is_empty() {
            let joined: Vec<_> = errors.iter().map(ToString::to_string).collect();
            return Err(HarnessError::Config(joined.join("; ")));
        }
        resolved.suite.validate()?;
        Ok(resolved)
    }

    fn overlay(
        mut suite: SuiteConfig,
        file: Option<&(String, toml::Table)>,
        parser: &mut EnvParser,
    ) -> Self {
        let from_file = |section: &str, key: &str| -> Option<String> {
            let (path, table) = file?;
            table
                .get(section)
                .and_then(|s| s.as_table())
                .filter(|s| s.contains_key(key))
                .map(|_| path.clone())
        };

        // File values stay untouched unless the environment overrides them.
        let rendezvous_address = match parser.get_optional_string("RENDEZVOUS_ADDR") {
            Some(address) => {
                suite.rendezvous.address = address.value.clone();
                address
            }
            None => layered(
                suite.rendezvous.address.clone(),
                from_file("rendezvous", "address"),
            ),
        };

        let message_timeout_ms =
            match parser.get_optional_u64_range("MESSAGE_TIMEOUT_MS", 1, 3_600_000) {
                Some(ms) => {
                    suite.rendezvous.message_timeout = Duration::from_millis(ms.value);
                    ms
                }
                None => layered(
                    suite.rendezvous.message_timeout.as_millis() as u64,
                    from_file("rendezvous", "message_timeout"),
                ),
            };

        let server_executable = match parser.get_optional_string("SERVER_EXECUTABLE") {
            Some(executable) => {
                let executable = executable.map(PathBuf::from);
                suite.server.executable = executable.value.clone();
                executable
            }
            None => layered(
                suite.server.executable.clone(),
                from_file("server", "executable"),
            ),
        };

        let settling_delay_ms =
            match parser.get_optional_u64_range("SETTLING_DELAY_MS", 0, 60_000) {
                Some(ms) => {
                    suite.server.settling_delay = Duration::from_millis(ms.value);
                    ms
                }
                None => layered(
                    suite.server.settling_delay.as_millis() as u64,
                    from_file("server", "settling_delay"),
                ),
            };

        let log_level = parser.get_log_level("LOG_LEVEL", "info");

        Self {
            suite,
            rendezvous_address,
            message_timeout_ms,
            server_executable,
            settling_delay_ms,
            log_level,
        }
    }

    /// `(key, value, source)` rows for display.
    pub fn provenance(&self) -> Vec<(&'static str, String, String)> {
        vec![
            (
                "rendezvous.address",
                self.rendezvous_address.value.clone(),
                self.rendezvous_address.describe_source(),
            ),
            (
                "rendezvous.message_timeout_ms",
                self.message_timeout_ms.value.to_string(),
                self.message_timeout_ms.describe_source(),
            ),
            (
                "server.executable",
                self.server_executable.value.display().to_string(),
                self.server_executable.describe_source(),
            ),
            (
                "server.settling_delay_ms",
                self.settling_delay_ms.value.to_string(),
                self.settling_delay_ms.describe_source(),
            ),
            (
                "log_level",
                self.log_level.value.clone(),
                self.log_level.describe_source(),
            ),
        ]
    }
}

fn layered<T>(value: T, file: Option<String>) -> Sourced<T> {
    match file {
        Some(path) => Sourced::from_file(value, path),
        None => Sourced::default_value(value),
    }
}
