//! Centralized external-command execution.
//!
//! All builder processes go through [`Cmd`], which captures stderr for error
//! messages and stdout as raw bytes (artifacts are binary). Input bytes, when
//! set, are streamed to the child's stdin from a scoped thread so a child
//! that fills its stdout pipe before draining stdin cannot deadlock us.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::process::{Command, ExitStatus, Stdio};

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout, unmodified bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    input: Option<Vec<u8>>,
    /// Custom error message prefix.
    error_prefix: Option<String>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            input: None,
            error_prefix: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Feed the given bytes to the child's stdin.
    pub fn input(mut self, bytes: &[u8]) -> Self {
        self.input = Some(bytes.to_vec());
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Run the command, wait for it to exit and capture its output.
    ///
    /// Fails with the trimmed stderr on non-zero exit. Blocks until the
    /// child terminates; there is no timeout.
    pub fn run(self) -> Result<CommandResult> {
        let Cmd {
            program,
            args,
            input,
            error_prefix,
        } = self;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to execute '{program}'; is it installed?"))?;

        let output = if let Some(input) = input {
            let mut stdin = child
                .stdin
                .take()
                .with_context(|| format!("stdin of '{program}' was not captured"))?;
            std::thread::scope(|scope| -> Result<std::process::Output> {
                let feeder = scope.spawn(move || {
                    let res = stdin.write_all(&input);
                    // Dropping stdin closes the pipe so the child sees EOF.
                    drop(stdin);
                    res
                });
                let output = child
                    .wait_with_output()
                    .with_context(|| format!("waiting for '{program}'"))?;
                // A failed stdin write (e.g. EPIPE) only matters if the
                // child claims success anyway; otherwise the exit status
                // carries the real failure.
                match feeder.join() {
                    Ok(Err(err)) if output.status.success() => {
                        bail!("writing stdin of '{program}': {err}")
                    }
                    _ => {}
                }
                Ok(output)
            })?
        } else {
            child
                .wait_with_output()
                .with_context(|| format!("waiting for '{program}'"))?
        };

        let result = CommandResult {
            status: output.status,
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            let prefix = error_prefix.unwrap_or_else(|| format!("'{program}' failed"));
            let stderr = result.stderr_trimmed();
            if stderr.is_empty() {
                bail!("{} (exit code {})", prefix, result.code());
            } else {
                bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
            }
        }

        Ok(result)
    }
}
