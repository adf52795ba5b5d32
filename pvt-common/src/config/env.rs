//! Environment variable parsing with type safety.
//!
//! Errors are collected during parsing so all bad variables can be reported
//! at once instead of failing on the first one.

use std::env;

use thiserror::Error;

use super::source::Sourced;

/// Prefix shared by every harness environment variable.
pub const ENV_PREFIX: &str = "PVT_";

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: ENV_PREFIX,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Full variable name with prefix.
    pub fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Optional string; empty values count as unset.
    pub fn get_optional_string(&mut self, name: &str) -> Option<Sourced<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if !value.trim().is_empty() => Some(Sourced::from_env(value, var_name)),
            _ => None,
        }
    }

    /// Optional u64 with range validation. Invalid values are recorded as
    /// errors and treated as unset.
    pub fn get_optional_u64_range(
        &mut self,
        name: &str,
        min: u64,
        max: u64,
    ) -> Option<Sourced<u64>> {
        let var_name = self.var_name(name);
        let value = env::var(&var_name).ok()?;
        match value.trim().parse::<u64>() {
            Ok(n) if (min..=max).contains(&n) => Some(Sourced::from_env(n, var_name)),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var: var_name,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "unsigned 64-bit integer".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Log level with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let lower = value.trim().to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                        Sourced::from_env(lower, var_name)
                    }
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name,
                            value,
                        });
                        Sourced::default_value(default.to_string())
                    }
                }
            }
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::ConfigSource;
    use serial_test::serial;

    fn set_env(key: &str, value: &str) {
        // SAFETY: env-mutating tests are serialized.
        unsafe { env::set_var(key, value) };
    }

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: env-mutating tests are serialized.
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn test_optional_string() {
        let vars = ["PVT_TEST_STRING", "PVT_TEST_EMPTY"];
        cleanup_env(&vars);
        set_env("PVT_TEST_STRING", "127.0.0.1:4000");
        set_env("PVT_TEST_EMPTY", "  ");

        let mut parser = EnvParser::new();
        let value = parser.get_optional_string("TEST_STRING").unwrap();
        assert_eq!(value.value, "127.0.0.1:4000");
        assert_eq!(value.source, ConfigSource::Environment);
        assert_eq!(value.origin.as_deref(), Some("PVT_TEST_STRING"));
        assert!(parser.get_optional_string("TEST_EMPTY").is_none());
        assert!(parser.get_optional_string("TEST_MISSING").is_none());

        cleanup_env(&vars);
    }

    #[test]
    #[serial]
    fn test_u64_range_collects_every_error() {
        let vars = ["PVT_TEST_OOR", "PVT_TEST_NAN", "PVT_TEST_OK"];
        cleanup_env(&vars);
        set_env("PVT_TEST_OOR", "0");
        set_env("PVT_TEST_NAN", "soon");
        set_env("PVT_TEST_OK", "250");

        let mut parser = EnvParser::new();
        assert!(parser.get_optional_u64_range("TEST_OOR", 1, 1000).is_none());
        assert!(parser.get_optional_u64_range("TEST_NAN", 1, 1000).is_none());
        assert_eq!(
            parser.get_optional_u64_range("TEST_OK", 1, 1000).unwrap().value,
            250
        );
        let errors = parser.take_errors();
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], EnvError::OutOfRange { .. }));
        assert!(matches!(errors[1], EnvError::InvalidValue { .. }));
        assert!(!parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    #[serial]
    fn test_log_level() {
        let vars = ["PVT_TEST_LEVEL"];
        cleanup_env(&vars);

        let mut parser = EnvParser::new();
        assert!(parser.get_log_level("TEST_LEVEL", "info").is_default());

        set_env("PVT_TEST_LEVEL", "DEBUG");
        assert_eq!(parser.get_log_level("TEST_LEVEL", "info").value, "debug");

        set_env("PVT_TEST_LEVEL", "chatty");
        let level = parser.get_log_level("TEST_LEVEL", "info");
        assert_eq!(level.value, "info");
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }
}
