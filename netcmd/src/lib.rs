// Fabric: Virtual Topology Binding for Network Test Beds
// Copyright (C) 2021  Tibor Schneider
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! # Shell Command Gateway
//!
//! This is a very simple crate to drive the Linux networking tools (`ip`, `brctl`, `ovs-vsctl`,
//! `ovs-ofctl`, ...) from the topology engine. Every interaction with the OS network stack goes
//! through [`Cmd`], which captures stdout, stderr and the exit code, and supports bounded retries
//! for tools that are only eventually consistent (a freshly added OVS port is not always visible
//! to the very next query).
//!
//! ```
//! use netcmd::Cmd;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // a command which must succeed
//!     let out = Cmd::new("echo hello").run()?;
//!     assert_eq!(out, "hello\n");
//!
//!     // a command which is expected to fail (e.g., asserting an interface is absent)
//!     Cmd::new("false").negative().run()?;
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]

use log::*;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Default timeout for joining batched background processes.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(600);

/// # Gateway Error type
#[derive(Debug, Error)]
pub enum Error {
    /// The command could not be spawned or its output could not be collected.
    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),
    /// The command exhausted all retries without the expected result.
    #[error("ret_code={ret_code}, error message=\"{stderr}\", cmd=\"{cmdline}\"")]
    CommandFailed {
        /// Exit code of the last attempt.
        ret_code: i32,
        /// Stderr of the last attempt.
        stderr: String,
        /// The original command line (including the filter command, if any).
        cmdline: String,
    },
    /// The command line contains no words.
    #[error("Empty command line")]
    EmptyCommand,
    /// At least one background process of a batch exited with an error or timed out.
    #[error("One of the batch commands failed: {0}")]
    BatchFailed(String),
}

/// Gateway Result type
pub type Result<T> = core::result::Result<T, Error>;

/// # External command
///
/// Builder for a single external command invocation. The command line is split on whitespace
/// unless [`Cmd::shell`] is requested, in which case it is handed to `sh -c` verbatim (needed for
/// the few `... || true` teardown forms).
#[derive(Debug, Clone)]
pub struct Cmd {
    cmdline: String,
    filter: Option<String>,
    retry: usize,
    negative: bool,
    ignore_errors: bool,
    shell: bool,
}

/// Captured result of a single attempt.
#[derive(Debug, Clone)]
struct CmdOutput {
    ret_code: i32,
    stdout: String,
    stderr: String,
}

impl Cmd {
    /// Create a new command with default settings: one attempt, success means exit code zero.
    pub fn new(cmdline: impl Into<String>) -> Self {
        Self {
            cmdline: cmdline.into(),
            filter: None,
            retry: 1,
            negative: false,
            ignore_errors: false,
            shell: false,
        }
    }

    /// Pipe the command output through a second filter command.
    pub fn filter(mut self, filter_cmdline: impl Into<String>) -> Self {
        self.filter = Some(filter_cmdline.into());
        self
    }

    /// Set the maximum number of attempts. Every attempt re-invokes the full command.
    pub fn retry(mut self, attempts: usize) -> Self {
        self.retry = attempts.max(1);
        self
    }

    /// Invert the success predicate: the command is expected to fail. Used to assert that an
    /// interface does *not* exist, without conflating "absent" with "the check itself broke".
    pub fn negative(mut self) -> Self {
        self.negative = true;
        self
    }

    /// Return the last captured output instead of failing once all retries are exhausted.
    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    /// Run the command line through `sh -c` instead of splitting it ourselves.
    pub fn shell(mut self) -> Self {
        self.shell = true;
        self
    }

    /// Execute the command and return its stdout.
    pub fn run(&self) -> Result<String> {
        let mut last: Option<CmdOutput> = None;
        for attempt in 0..self.retry {
            debug!(
                "*** CMD: {}, filter: {:?}, attempt: {}",
                self.cmdline,
                self.filter,
                attempt + 1
            );
            let output = self.run_once()?;
            debug!(
                "*** OUTPUT: ret_code={}, stdout={:?}, stderr={:?}",
                output.ret_code, output.stdout, output.stderr
            );
            let expected = if self.negative {
                output.ret_code != 0
            } else {
                output.ret_code == 0
            };
            if expected {
                return Ok(output.stdout);
            }
            last = Some(output);
        }

        let last = last.unwrap();
        if self.ignore_errors {
            return Ok(last.stdout);
        }
        Err(Error::CommandFailed {
            ret_code: last.ret_code,
            stderr: last.stderr,
            cmdline: match &self.filter {
                Some(f) => format!("{} | {}", self.cmdline, f),
                None => self.cmdline.clone(),
            },
        })
    }

    fn build_command(cmdline: &str, shell: bool) -> Result<Command> {
        if shell {
            let mut c = Command::new("sh");
            c.arg("-c").arg(cmdline);
            Ok(c)
        } else {
            let words: Vec<&str> = cmdline.split_whitespace().collect();
            match words.split_first() {
                Some((prog, args)) => {
                    let mut c = Command::new(prog);
                    c.args(args);
                    Ok(c)
                }
                None => Err(Error::EmptyCommand),
            }
        }
    }

    fn run_once(&self) -> Result<CmdOutput> {
        let mut command = Self::build_command(&self.cmdline, self.shell)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match &self.filter {
            Some(filter_cmdline) => {
                let mut producer = command.spawn()?;
                let producer_out = producer.stdout.take().unwrap();
                let mut filter = Self::build_command(filter_cmdline, self.shell)?;
                let output = filter
                    .stdin(Stdio::from(producer_out))
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .output()?;
                producer.wait()?;
                output
            }
            None => command.output()?,
        };

        Ok(CmdOutput {
            ret_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Execute a command line with default settings and return its stdout.
pub fn cmd(cmdline: impl Into<String>) -> Result<String> {
    Cmd::new(cmdline).run()
}

/// Handle to a background process launched with [`fire_and_forget`].
#[derive(Debug)]
pub struct BatchProcess {
    child: Child,
    cmdline: String,
}

impl BatchProcess {
    /// The command line this process was started with.
    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }
}

/// Launch a process without waiting for it, returning a handle for a later [`join_batch`].
pub fn fire_and_forget(cmdline: impl Into<String>) -> Result<BatchProcess> {
    let cmdline = cmdline.into();
    let child = Cmd::build_command(&cmdline, false)?
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    Ok(BatchProcess { child, cmdline })
}

/// Join every background process of a batch, with one overall timeout.
///
/// All handles are joined (or killed, once the deadline has passed) before any error is reported;
/// the aggregate error names every failing command line.
pub fn join_batch(processes: Vec<BatchProcess>, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut failures: Vec<String> = Vec::new();

    for mut process in processes {
        let timed_out = loop {
            match process.child.try_wait()? {
                Some(_) => break false,
                None => {
                    if Instant::now() >= deadline {
                        process.child.kill().ok();
                        break true;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        };

        let cmdline = process.cmdline;
        let output = process.child.wait_with_output()?;
        if timed_out {
            failures.push(format!(
                "timeout after {} seconds, cmd=\"{}\"",
                timeout.as_secs(),
                cmdline
            ));
        } else if !output.status.success() {
            failures.push(format!(
                "return_code={}, error message=\"{}\", cmd=\"{}\"",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim(),
                cmdline
            ));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::BatchFailed(failures.join("; ")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn simple_command() {
        assert_eq!(cmd("echo hello").unwrap(), "hello\n");
    }

    #[test]
    fn negative_command() {
        assert!(Cmd::new("false").negative().run().is_ok());
        assert!(Cmd::new("true").negative().run().is_err());
    }

    #[test]
    fn failed_command_reports_cmdline() {
        match Cmd::new("false").retry(2).run() {
            Err(Error::CommandFailed { ret_code, cmdline, .. }) => {
                assert_eq!(ret_code, 1);
                assert_eq!(cmdline, "false");
            }
            x => panic!("unexpected result: {:?}", x),
        }
    }

    #[test]
    fn ignore_errors_returns_output() {
        let out = Cmd::new("echo partial && false")
            .shell()
            .ignore_errors()
            .run()
            .unwrap();
        assert_eq!(out, "partial\n");
    }

    #[test]
    fn filter_command() {
        let out = Cmd::new("printf a\\nb\\nab\\n")
            .filter("grep b")
            .run()
            .unwrap();
        assert_eq!(out, "b\nab\n");
    }

    #[test]
    fn shell_command_tolerates_failure() {
        assert!(Cmd::new("false || true").shell().run().is_ok());
    }

    #[test]
    fn empty_command() {
        assert!(matches!(cmd(""), Err(Error::EmptyCommand)));
    }

    #[test]
    fn batch_join_success() {
        let procs = vec![
            fire_and_forget("true").unwrap(),
            fire_and_forget("echo done").unwrap(),
        ];
        assert!(join_batch(procs, DEFAULT_BATCH_TIMEOUT).is_ok());
    }

    #[test]
    fn batch_join_aggregates_failures() {
        let procs = vec![
            fire_and_forget("true").unwrap(),
            fire_and_forget("false").unwrap(),
        ];
        match join_batch(procs, DEFAULT_BATCH_TIMEOUT) {
            Err(Error::BatchFailed(msg)) => assert!(msg.contains("cmd=\"false\"")),
            x => panic!("unexpected result: {:?}", x),
        }
    }
}
