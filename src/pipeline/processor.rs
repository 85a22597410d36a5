//! The processing callback and a command-backed implementation for the CLI.

use anyhow::Result;
use serde_json::json;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::engine::hashing::to_hex;
use crate::resilience::ProcessError;
use crate::types::Processed;

/// Per-file processing callback. Must be idempotent enough that identical content yields
/// an equivalent result: the ledger skips files whose content was already processed.
pub trait Processor: Send + Sync {
    fn process(&self, path: &Path) -> Result<Processed>;
}

impl<F> Processor for F
where
    F: Fn(&Path) -> Result<Processed> + Send + Sync,
{
    fn process(&self, path: &Path) -> Result<Processed> {
        self(path)
    }
}

// sysexits.h
const EX_DATAERR: i32 = 65;
const EX_OSERR: i32 = 71;
const EX_CANTCREAT: i32 = 73;
const EX_TEMPFAIL: i32 = 75;
const EX_NOPERM: i32 = 77;
const EX_CONFIG: i32 = 78;
/// Shell: command found but not executable.
const SHELL_NOEXEC: i32 = 126;
/// Shell: killed by SIGKILL (typically the OOM killer).
const SHELL_SIGKILL: i32 = 137;

/// Runs an external command once per file. `{}` in the arguments is replaced by the path;
/// without a placeholder the path is appended. The result id is the blake3 of stdout.
#[derive(Clone, Debug)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace: first word is the program.
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let Some(program) = words.next() else {
            anyhow::bail!("empty command");
        };
        Ok(Self::new(program, words.collect()))
    }

    fn command_for(&self, path: &Path) -> Command {
        let path_str = path.to_string_lossy();
        let mut cmd = Command::new(&self.program);
        let mut placed = false;
        for arg in &self.args {
            if arg.contains("{}") {
                cmd.arg(arg.replace("{}", &path_str));
                placed = true;
            } else {
                cmd.arg(arg);
            }
        }
        if !placed {
            cmd.arg(path);
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

/// Map an exit code to a typed error.
fn exit_error(code: i32, stderr: &str) -> ProcessError {
    let msg = if stderr.is_empty() {
        format!("exit code {code}")
    } else {
        format!("exit code {code}: {stderr}")
    };
    match code {
        EX_DATAERR => ProcessError::InvalidData(msg),
        EX_NOPERM | EX_CANTCREAT | SHELL_NOEXEC => ProcessError::Permission(msg),
        EX_TEMPFAIL => ProcessError::Transient(msg),
        EX_CONFIG => ProcessError::Configuration(msg),
        EX_OSERR | SHELL_SIGKILL => ProcessError::ResourceExhausted(msg),
        _ => ProcessError::Other(msg),
    }
}

#[cfg(unix)]
fn killed_by_sigkill(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGKILL)
}

#[cfg(not(unix))]
fn killed_by_sigkill(_status: &std::process::ExitStatus) -> bool {
    false
}

impl Processor for CommandProcessor {
    fn process(&self, path: &Path) -> Result<Processed> {
        let output = self.command_for(path).output().map_err(|e| {
            let msg = format!("cannot run {}: {}", self.program, e);
            match e.kind() {
                std::io::ErrorKind::PermissionDenied => ProcessError::Permission(msg),
                _ => ProcessError::Configuration(msg),
            }
        })?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            let err = match output.status.code() {
                Some(code) => exit_error(code, &stderr),
                None if killed_by_sigkill(&output.status) => {
                    ProcessError::ResourceExhausted("killed by SIGKILL".into())
                }
                None => ProcessError::Other(format!("terminated by signal: {}", output.status)),
            };
            return Err(err.into());
        }
        let digest = blake3::hash(&output.stdout);
        Ok(Processed::new(to_hex(digest.as_bytes())).with_metadata(json!({
            "command": self.program,
            "stdout_bytes": output.stdout.len(),
        })))
    }
}
