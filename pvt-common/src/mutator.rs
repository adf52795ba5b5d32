//! Property reads and writes through the external command-line client.
//!
//! These calls provoke the server's instrumentation points but are not
//! synchronized with the rendezvous channel; the expectation engine orders
//! them.

use std::time::Duration;

use tracing::debug;

use crate::address::PropertyAddress;
use crate::error::{HarnessError, HarnessResult};
use crate::exec::{CommandOutput, CommandRunner};

/// Read and write access to server properties.
pub trait PropertyAccess {
    /// Write a scalar. Returns the value echoed by the client.
    fn set(&self, address: &PropertyAddress, value: &str) -> HarnessResult<String>;

    /// Read a scalar.
    fn get(&self, address: &PropertyAddress) -> HarnessResult<String>;

    /// Fill an array from a named source. Returns the client's echo.
    fn set_array(&self, address: &PropertyAddress, source: &str) -> HarnessResult<String>;

    /// Aggregate array read. Returns the last element.
    fn get_array(&self, address: &PropertyAddress) -> HarnessResult<String>;
}

/// A client invocation prefix, e.g. `["doocsput"]` or
/// `["pvtd-client", "--socket", "/tmp/pvtd.sock", "put"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCommand {
    program: String,
    prefix_args: Vec<String>,
}

impl ClientCommand {
    /// Build from an argv array. The first element is the program.
    pub fn from_argv(argv: &[String]) -> HarnessResult<Self> {
        match argv.split_first() {
            Some((program, rest)) if !program.trim().is_empty() => Ok(Self {
                program: program.clone(),
                prefix_args: rest.to_vec(),
            }),
            _ => Err(HarnessError::Config(
                "client command must name a program".to_string(),
            )),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn argv(&self, extra: &[&str]) -> Vec<String> {
        self.prefix_args
            .iter()
            .cloned()
            .chain(extra.iter().map(|s| (*s).to_string()))
            .collect()
    }
}

/// [`PropertyAccess`] backed by the external put/get clients.
#[derive(Debug, Clone)]
pub struct PropertyMutator {
    put: ClientCommand,
    get: ClientCommand,
    runner: CommandRunner,
}

impl PropertyMutator {
    pub fn new(put: ClientCommand, get: ClientCommand) -> Self {
        Self {
            put,
            get,
            runner: CommandRunner::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.runner = CommandRunner::new(timeout);
        self
    }

    pub fn with_runner(mut self, runner: CommandRunner) -> Self {
        self.runner = runner;
        self
    }

    fn invoke(&self, client: &ClientCommand, extra: &[&str]) -> HarnessResult<String> {
        let output: CommandOutput = self
            .runner
            .run(&client.program, client.argv(extra))?
            .into_success()?;
        let value = output.stdout.trim().to_string();
        debug!(command = %output.command_line, %value, "Client returned");
        Ok(value)
    }
}

impl PropertyAccess for PropertyMutator {
    fn set(&self, address: &PropertyAddress, value: &str) -> HarnessResult<String> {
        let address = address.to_string();
        self.invoke(&self.put, &["-c", &address, "-d", value])
    }

    fn get(&self, address: &PropertyAddress) -> HarnessResult<String> {
        let address = address.to_string();
        self.invoke(&self.get, &["-c", &address])
    }

    fn set_array(&self, address: &PropertyAddress, source: &str) -> HarnessResult<String> {
        let address = address.to_string();
        self.invoke(&self.put, &["-c", &address, "-a", source])
    }

    fn get_array(&self, address: &PropertyAddress) -> HarnessResult<String> {
        let rendered = address.to_string();
        let output = self.invoke(&self.get, &["-a", "-c", &rendered])?;
        last_token(&output).map(str::to_string).ok_or_else(|| {
            HarnessError::Protocol(format!("array read of {address} returned no elements"))
        })
    }
}

/// Final whitespace-separated token of an aggregate read.
pub fn last_token(output: &str) -> Option<&str> {
    output.split_whitespace().last()
}
