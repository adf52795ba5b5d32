//! Synchronous external command execution with output capture.

use std::ffi::OsStr;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{HarnessError, HarnessResult};

/// Exit code reported for commands killed after exceeding their timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Captured result of one command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command_line: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Check if the command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into [`HarnessError::Command`].
    pub fn into_success(self) -> HarnessResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(HarnessError::Command {
                exit_code: self.exit_code,
                command: self.command_line,
                stderr: self.stderr,
            })
        }
    }
}

/// Runs external commands with a bounded timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    current_dir: Option<PathBuf>,
    env_vars: Vec<(String, String)>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl CommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            current_dir: None,
            env_vars: Vec::new(),
        }
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute a command and capture output. Non-zero exits are returned as
    /// data, not as errors; spawn failures are errors.
    pub fn run<I, S>(&self, program: &str, args: I) -> HarnessResult<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().collect();
        let command_line = render_command_line(
            program,
            args.iter().map(|s| s.as_ref().to_string_lossy().into_owned()),
        );
        debug!(command = %command_line, "Executing");

        let start = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env_vars {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| HarnessError::Command {
            exit_code: -1,
            command: command_line.clone(),
            stderr: format!("failed to spawn: {e}"),
        })?;
        let stdout_handle = child
            .stdout
            .take()
            .map(|mut stdout| thread::spawn(move || read_to_string(&mut stdout)));
        let stderr_handle = child
            .stderr
            .take()
            .map(|mut stderr| thread::spawn(move || read_to_string(&mut stderr)));

        let mut timed_out = false;
        let exit_status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }

            if start.elapsed() >= self.timeout {
                timed_out = true;
                let _ = child.kill();
                break child.wait().ok();
            }

            thread::sleep(Duration::from_millis(10));
        };

        let duration = start.elapsed();
        let stdout = join_output(stdout_handle);
        let mut stderr = join_output(stderr_handle);
        if timed_out {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!("Process timed out after {:?}.", self.timeout));
            warn!(command = %command_line, timeout = ?self.timeout, "Command killed after timeout");
        }

        let exit_code = exit_status
            .and_then(|status| status.code())
            .unwrap_or(if timed_out { TIMEOUT_EXIT_CODE } else { -1 });

        for line in stdout.lines() {
            trace!(target: "pvt::exec::stdout", "{line}");
        }
        for line in stderr.lines() {
            trace!(target: "pvt::exec::stderr", "{line}");
        }
        debug!(
            command = %command_line,
            exit_code,
            duration_ms = duration.as_millis() as u64,
            timed_out,
            "Command completed"
        );

        Ok(CommandOutput {
            command_line,
            exit_code,
            stdout,
            stderr,
            duration,
            timed_out,
        })
    }
}

/// Shell-quoted rendering of a command line for diagnostics.
pub fn render_command_line<I>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut rendered = shell_escape::escape(program.into()).into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&shell_escape::escape(arg.into()));
    }
    rendered
}

fn read_to_string<R: Read>(reader: &mut R) -> String {
    let mut buffer = Vec::new();
    if reader.read_to_end(&mut buffer).is_ok() {
        String::from_utf8_lossy(&buffer).to_string()
    } else {
        String::new()
    }
}

fn join_output(handle: Option<thread::JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.join().unwrap_or_default(),
        None => String::new(),
    }
}
