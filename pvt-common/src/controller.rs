//! Server process lifecycle: spawn, pid handshake, signal-based teardown.
//!
//! The server reports its own pid as the first rendezvous message. Teardown
//! signals that pid, reaps the child we spawned and then waits out the
//! settling delay so the next run finds the environment clean.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::exec::CommandRunner;
use crate::rendezvous::RendezvousChannel;

/// Step name used for the identity handshake.
pub const HANDSHAKE_STEP: &str = "handshake";

/// Default pause after termination.
pub const DEFAULT_SETTLING_DELAY: Duration = Duration::from_secs(1);

const REAP_GRACE: Duration = Duration::from_secs(5);

/// Owns one server process for the lifetime of a run.
#[derive(Debug)]
pub struct ServerController {
    executable: PathBuf,
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
    settling_delay: Duration,
    ready_timeout: Duration,
    runner: CommandRunner,
    child: Option<Child>,
    pid: Option<u32>,
}

impl ServerController {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
            settling_delay: DEFAULT_SETTLING_DELAY,
            ready_timeout: crate::rendezvous::DEFAULT_MESSAGE_TIMEOUT,
            runner: CommandRunner::new(Duration::from_secs(10)),
            child: None,
            pid: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn with_settling_delay(mut self, delay: Duration) -> Self {
        self.settling_delay = delay;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Pid reported by the server during the handshake.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Pid of the process we spawned, which may differ from the reported
    /// pid when the executable is a wrapper.
    pub fn child_id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Launch the server in the background.
    ///
    /// Only detects failure to invoke the process, not failure to initialize.
    pub fn start(&mut self) -> HarnessResult<()> {
        if self.child.is_some() {
            return Err(HarnessError::Launch(format!(
                "{} is already running",
                self.executable.display()
            )));
        }

        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (k, v) in &self.env_vars {
            cmd.env(k, v);
        }

        info!(executable = %self.executable.display(), args = ?self.args, "Starting server");
        let mut child = cmd.spawn().map_err(|e| {
            HarnessError::Launch(format!("{}: {e}", self.executable.display()))
        })?;

        if let Some(status) = child.try_wait()? {
            if !status.success() {
                return Err(HarnessError::Launch(format!(
                    "{} exited immediately with {status}",
                    self.executable.display()
                )));
            }
        }

        debug!(child_pid = child.id(), "Server process spawned");
        self.child = Some(child);
        Ok(())
    }

    /// Perform the identity handshake: the first message is the server pid.
    pub fn await_ready(&mut self, channel: &mut RendezvousChannel) -> HarnessResult<u32> {
        let payload = match channel.await_message_within(HANDSHAKE_STEP, self.ready_timeout) {
            Ok(payload) => payload,
            Err(err @ HarnessError::Timeout { .. }) => {
                // A server that died during startup is a launch failure.
                if let Some(child) = self.child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(HarnessError::Launch(format!(
                            "{} exited with {status} before the handshake",
                            self.executable.display()
                        )));
                    }
                }
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let pid = payload
            .parse::<u32>()
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| {
                HarnessError::Protocol(format!(
                    "handshake payload {payload:?} is not a process id"
                ))
            })?;
        channel.acknowledge()?;

        info!(pid, "Server ready");
        self.pid = Some(pid);
        Ok(pid)
    }

    /// Signal the server, reap it and wait out the settling delay.
    ///
    /// A no-op when nothing was started.
    pub fn stop(&mut self) -> HarnessResult<()> {
        let target = self.pid.or_else(|| self.child_id());
        let Some(pid) = target else {
            return Ok(());
        };

        info!(pid, "Stopping server");
        let signal_result = self
            .runner
            .run("kill", [pid.to_string()])
            .and_then(|output| output.into_success().map(|_| ()));

        if let Some(mut child) = self.child.take() {
            if signal_result.is_err() {
                let _ = child.kill();
            }
            reap(&mut child);
        }
        self.pid = None;

        if let Err(e) = signal_result {
            warn!(pid, error = %e, "Termination signal failed");
            return Err(HarnessError::Teardown(format!("kill {pid}: {e}")));
        }

        if !self.settling_delay.is_zero() {
            debug!(delay = ?self.settling_delay, "Settling after teardown");
            thread::sleep(self.settling_delay);
        }
        Ok(())
    }
}

fn reap(child: &mut Child) {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(child_pid = child.id(), %status, "Server process reaped");
                return;
            }
            Ok(None) if started.elapsed() < REAP_GRACE => {
                thread::sleep(Duration::from_millis(10));
            }
            Ok(None) => {
                warn!(child_pid = child.id(), "Server ignored termination signal, killing");
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
            Err(e) => {
                warn!(child_pid = child.id(), error = %e, "Failed to reap server process");
                return;
            }
        }
    }
}

/// Scoped server lifetime. Dropping the session stops the server if the run
/// did not, so assertion failures and panics never leak the process.
#[derive(Debug)]
pub struct ServerSession {
    controller: Option<ServerController>,
}

impl ServerSession {
    /// Start the server and take ownership of it.
    pub fn start(mut controller: ServerController) -> HarnessResult<Self> {
        controller.start()?;
        Ok(Self {
            controller: Some(controller),
        })
    }

    pub fn await_ready(&mut self, channel: &mut RendezvousChannel) -> HarnessResult<u32> {
        match self.controller.as_mut() {
            Some(controller) => controller.await_ready(channel),
            None => Err(HarnessError::Launch("server session already stopped".to_string())),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.controller.as_ref().and_then(ServerController::pid)
    }

    pub fn child_id(&self) -> Option<u32> {
        self.controller.as_ref().and_then(ServerController::child_id)
    }

    /// Explicit teardown that reports failures.
    pub fn stop(mut self) -> HarnessResult<()> {
        match self.controller.take() {
            Some(mut controller) => controller.stop(),
            None => Ok(()),
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if let Some(mut controller) = self.controller.take() {
            if let Err(e) = controller.stop() {
                warn!(error = %e, "Server teardown during drop failed");
            }
        }
    }
}
