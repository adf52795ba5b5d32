//! Suite configuration file format.
//!
//! ```toml
//! [server]
//! executable = "pvtd"
//! args = ["--rendezvous", "{rendezvous}", "--socket", "/tmp/pvtd.sock"]
//!
//! [client]
//! put = ["pvtd-client", "--socket", "/tmp/pvtd.sock", "put"]
//! get = ["pvtd-client", "--socket", "/tmp/pvtd.sock", "get"]
//!
//! [[scenario]]
//! kind = "scalar"
//! name = "int"
//! value_type = "int"
//! plain = "TEST.DOOCS/LOCALHOST_610498009/DPVATESTSRVLOCATION/TESTTYPE_INT"
//! ```
//!
//! `{rendezvous}` in server arguments is replaced with the bound
//! rendezvous address.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::address::PropertyAddress;
use crate::error::{HarnessError, HarnessResult};
use crate::expectation::values_match;
use crate::mutator::last_token;
use crate::polling::PollPolicy;

/// Placeholder in server arguments for the rendezvous address.
pub const RENDEZVOUS_PLACEHOLDER: &str = "{rendezvous}";

/// Location shared by the default scenarios.
pub const DEFAULT_LOCATION: &str = "TEST.DOOCS/LOCALHOST_610498009/DPVATESTSRVLOCATION";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SuiteConfig {
    /// Directory for the JSONL run journal. No journal file when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_dir: Option<PathBuf>,
    pub server: ServerConfig,
    pub rendezvous: RendezvousConfig,
    pub client: ClientConfig,
    pub poll: PollConfig,
    #[serde(rename = "scenario")]
    pub scenarios: Vec<ScenarioConfig>,
    #[serde(rename = "poll_check", skip_serializing_if = "Vec::is_empty")]
    pub poll_checks: Vec<PollCheckConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub settling_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("./dpvatestsrv_server"),
            args: Vec::new(),
            settling_delay: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Arguments with the rendezvous placeholder substituted.
    pub fn expanded_args(&self, rendezvous: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(RENDEZVOUS_PLACEHOLDER, rendezvous))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendezvousConfig {
    pub address: String,
    #[serde(with = "humantime_serde")]
    pub message_timeout: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3497".to_string(),
            message_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub put: Vec<String>,
    pub get: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            put: vec!["doocsput".to_string()],
            get: vec!["doocsget".to_string()],
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        let policy = PollPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            interval: policy.interval,
        }
    }
}

impl PollConfig {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy {
            max_attempts: self.max_attempts,
            interval: self.interval,
        }
    }
}

/// Representation type of a scalar property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    Double,
    String,
}

impl ValueType {
    /// Whether two renderings denote the same value. Strings compare
    /// exactly, numbers numerically.
    pub fn matches(self, expected: &str, actual: &str) -> bool {
        match self {
            Self::String => expected.trim() == actual.trim(),
            Self::Int | Self::Float | Self::Double => values_match(expected, actual),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioConfig {
    Scalar(ScalarScenarioConfig),
    Array(ArrayScenarioConfig),
}

impl ScenarioConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Scalar(s) => &s.name,
            Self::Array(a) => &a.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalarScenarioConfig {
    pub name: String,
    pub value_type: ValueType,
    pub plain: PropertyAddress,
    /// Defaults to the plain address with the callback suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<PropertyAddress>,
    #[serde(default = "default_plain_value", deserialize_with = "text_value")]
    pub plain_value: String,
    #[serde(default = "default_callback_value", deserialize_with = "text_value")]
    pub callback_value: String,
}

impl ScalarScenarioConfig {
    pub fn new(name: &str, value_type: ValueType, plain: PropertyAddress) -> Self {
        Self {
            name: name.to_string(),
            value_type,
            plain,
            callback: None,
            plain_value: default_plain_value(),
            callback_value: default_callback_value(),
        }
    }

    pub fn callback_address(&self) -> PropertyAddress {
        self.callback
            .clone()
            .unwrap_or_else(|| self.plain.callback())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArrayScenarioConfig {
    pub name: String,
    pub address: PropertyAddress,
    /// Named data source the array is filled from.
    pub source: String,
    #[serde(
        default,
        deserialize_with = "optional_text_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected_last: Option<String>,
    /// Directory holding `source` as a file of whitespace-separated values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixture_dir: Option<PathBuf>,
}

impl ArrayScenarioConfig {
    /// Expected final element: configured explicitly, or the last token of
    /// the fixture file backing `source`.
    pub fn resolve_expected_last(&self) -> HarnessResult<String> {
        if let Some(expected) = &self.expected_last {
            return Ok(expected.clone());
        }
        let Some(dir) = &self.fixture_dir else {
            return Err(HarnessError::Config(format!(
                "array scenario {} needs expected_last or fixture_dir",
                self.name
            )));
        };
        let path = dir.join(&self.source);
        let content = fs::read_to_string(&path).map_err(|e| {
            HarnessError::Config(format!("reading fixture {}: {e}", path.display()))
        })?;
        last_token(&content).map(str::to_string).ok_or_else(|| {
            HarnessError::Config(format!("fixture {} is empty", path.display()))
        })
    }
}

/// Write one property, then wait for another to converge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollCheckConfig {
    pub name: String,
    pub write: PropertyAddress,
    #[serde(deserialize_with = "text_value")]
    pub value: String,
    pub read: PropertyAddress,
    /// Defaults to `value`.
    #[serde(
        default,
        deserialize_with = "optional_text_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected: Option<String>,
}

impl PollCheckConfig {
    pub fn expected(&self) -> &str {
        self.expected.as_deref().unwrap_or(&self.value)
    }
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            journal_dir: None,
            server: ServerConfig::default(),
            rendezvous: RendezvousConfig::default(),
            client: ClientConfig::default(),
            poll: PollConfig::default(),
            scenarios: default_scenarios(),
            poll_checks: Vec::new(),
        }
    }
}

impl SuiteConfig {
    pub fn from_toml_str(raw: &str) -> HarnessResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| HarnessError::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn load(path: &Path) -> HarnessResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|e| HarnessError::Config(format!("{}: {e}", path.display())))
    }

    pub fn to_toml_string(&self) -> HarnessResult<String> {
        toml::to_string_pretty(self).map_err(|e| HarnessError::Config(e.to_string()))
    }

    /// Check the structural rules the runner relies on. All problems are
    /// reported together.
    pub fn validate(&self) -> HarnessResult<()> {
        let mut problems = Vec::new();

        if self.scenarios.is_empty() {
            problems.push("at least one [[scenario]] is required".to_string());
        }
        if self.client.put.is_empty() || self.client.put[0].trim().is_empty() {
            problems.push("client.put must name a program".to_string());
        }
        if self.client.get.is_empty() || self.client.get[0].trim().is_empty() {
            problems.push("client.get must name a program".to_string());
        }
        if self.poll.max_attempts == 0 {
            problems.push("poll.max_attempts must be at least 1".to_string());
        }
        if self.rendezvous.message_timeout.is_zero() {
            problems.push("rendezvous.message_timeout must be positive".to_string());
        }
        if self.server.executable.as_os_str().is_empty() {
            problems.push("server.executable must be set".to_string());
        }

        let mut seen = HashSet::new();
        for name in self
            .scenarios
            .iter()
            .map(ScenarioConfig::name)
            .chain(self.poll_checks.iter().map(|c| c.name.as_str()))
        {
            if !seen.insert(name) {
                problems.push(format!("duplicate scenario name {name:?}"));
            }
        }

        for scenario in &self.scenarios {
            if let ScenarioConfig::Array(array) = scenario
                && array.expected_last.is_none()
                && array.fixture_dir.is_none()
            {
                problems.push(format!(
                    "array scenario {:?} needs expected_last or fixture_dir",
                    array.name
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Config(problems.join("; ")))
        }
    }
}

fn default_scenarios() -> Vec<ScenarioConfig> {
    let at = |property: &'static str| {
        PropertyAddress::from_static(
            "TEST.DOOCS",
            "LOCALHOST_610498009",
            "DPVATESTSRVLOCATION",
            property,
        )
    };

    let mut scenarios: Vec<ScenarioConfig> = [
        ("int", ValueType::Int, "TESTTYPE_INT"),
        ("float", ValueType::Float, "TESTTYPE_FLOAT"),
        ("double", ValueType::Double, "TESTTYPE_DOUBLE"),
        ("string", ValueType::String, "TESTTYPE_STRING"),
    ]
    .into_iter()
    .map(|(name, value_type, property)| {
        ScenarioConfig::Scalar(ScalarScenarioConfig::new(name, value_type, at(property)))
    })
    .collect();

    scenarios.push(ScenarioConfig::Array(ArrayScenarioConfig {
        name: "array".to_string(),
        address: at("TESTARRAY_INT"),
        source: "dspectrum_input1".to_string(),
        expected_last: Some("5".to_string()),
        fixture_dir: None,
    }));
    scenarios
}

fn default_plain_value() -> String {
    "10".to_string()
}

fn default_callback_value() -> String {
    "20".to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Text(String),
    Int(i64),
    Float(f64),
}

impl TextOrNumber {
    fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
        }
    }
}

/// Accept `10`, `10.5` or `"10"` for value fields.
fn text_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    TextOrNumber::deserialize(deserializer).map(TextOrNumber::into_text)
}

fn optional_text_value<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Option::<TextOrNumber>::deserialize(deserializer).map(|v| v.map(TextOrNumber::into_text))
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PVTD_SUITE: &str = r#"
journal_dir = "/tmp/pvt-journal"

[server]
executable = "pvtd"
args = ["--rendezvous", "{rendezvous}", "--fixtures-dir", "fixtures"]
settling_delay = "50ms"

[rendezvous]
address = "127.0.0.1:0"
message_timeout = "5s"

[client]
put = ["pvtd-client", "--socket", "/tmp/pvtd.sock", "put"]
get = ["pvtd-client", "--socket", "/tmp/pvtd.sock", "get"]
timeout = "10s"

[poll]
max_attempts = 30
interval = "50ms"

[[scenario]]
kind = "scalar"
name = "int"
value_type = "int"
plain = "TEST.DOOCS/LOCALHOST_610498009/DPVATESTSRVLOCATION/TESTTYPE_INT"
plain_value = 10
callback_value = "20"

[[scenario]]
kind = "array"
name = "array"
address = "TEST.DOOCS/LOCALHOST_610498009/DPVATESTSRVLOCATION/TESTARRAY_INT"
source = "dspectrum_input1"
fixture_dir = "fixtures"

[[poll_check]]
name = "monitor"
write = "TEST.DOOCS/LOCALHOST_610498009/DPVATESTSRVLOCATION/TARGET_INT"
value = 42
read = "TEST.DOOCS/LOCALHOST_610498009/DPVATESTSRVLOCATION/MONITOR_INT"
"#;

    #[test]
    fn test_parse_full_suite() {
        let config = SuiteConfig::from_toml_str(PVTD_SUITE).unwrap();
        assert_eq!(config.server.settling_delay, Duration::from_millis(50));
        assert_eq!(config.rendezvous.message_timeout, Duration::from_secs(5));
        assert_eq!(config.poll.policy().max_attempts, 30);
        assert_eq!(config.scenarios.len(), 2);
        assert_eq!(config.poll_checks[0].expected(), "42");
        config.validate().unwrap();

        match &config.scenarios[0] {
            ScenarioConfig::Scalar(s) => {
                assert_eq!(s.plain_value, "10");
                assert_eq!(s.callback_value, "20");
                assert_eq!(s.callback_address().property(), "TESTTYPE_INT_CB");
            }
            other => panic!("unexpected scenario: {other:?}"),
        }
        assert_eq!(
            config.server.expanded_args("127.0.0.1:4000"),
            vec!["--rendezvous", "127.0.0.1:4000", "--fixtures-dir", "fixtures"]
        );
    }

    #[test]
    fn test_empty_file_is_the_default_suite() {
        let config = SuiteConfig::from_toml_str("").unwrap();
        assert_eq!(config, SuiteConfig::default());
        assert_eq!(config.rendezvous.address, "127.0.0.1:3497");
        assert_eq!(config.server.settling_delay, Duration::from_secs(1));
        let names: Vec<_> = config.scenarios.iter().map(ScenarioConfig::name).collect();
        assert_eq!(names, vec!["int", "float", "double", "string", "array"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let config = SuiteConfig::default();
        let raw = config.to_toml_string().unwrap();
        assert_eq!(SuiteConfig::from_toml_str(&raw).unwrap(), config);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = SuiteConfig::from_toml_str("[server]\nexecutabel = \"x\"\n").unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let mut config = SuiteConfig::default();
        config.client.put.clear();
        config.poll.max_attempts = 0;
        config.scenarios.push(config.scenarios[0].clone());

        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("client.put"));
        assert!(msg.contains("max_attempts"));
        assert!(msg.contains("duplicate scenario name \"int\""));

        config.scenarios.clear();
        assert!(config.validate().unwrap_err().to_string().contains("at least one"));
    }

    #[test]
    fn test_array_expected_last_from_fixture() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dspectrum_input1"), "1 2 3\n4 5\n").unwrap();
        let mut array = ArrayScenarioConfig {
            name: "array".to_string(),
            address: format!("{DEFAULT_LOCATION}/TESTARRAY_INT").parse().unwrap(),
            source: "dspectrum_input1".to_string(),
            expected_last: None,
            fixture_dir: Some(dir.path().to_path_buf()),
        };
        assert_eq!(array.resolve_expected_last().unwrap(), "5");

        array.expected_last = Some("9".to_string());
        assert_eq!(array.resolve_expected_last().unwrap(), "9");

        array.expected_last = None;
        array.source = "missing".to_string();
        assert!(array.resolve_expected_last().is_err());

        array.fixture_dir = None;
        assert!(matches!(
            array.resolve_expected_last(),
            Err(HarnessError::Config(_))
        ));
    }
}
