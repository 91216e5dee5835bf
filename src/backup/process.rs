// lbackup/src/backup/process.rs
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;

use crate::errors::{BackupError, Result};

/// A fully described external command. Environment values marked secret are never displayed.
#[derive(Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
    pub secret_envs: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            secret_envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn secret_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.secret_envs.push(key.clone());
        self.envs.push((key, value.into()));
        self
    }

    /// Arguments as strings, for assertions and log lines.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.envs {
            if self.secret_envs.contains(key) {
                write!(f, "{}=*** ", key)?;
            } else {
                write!(f, "{}={} ", key, value)?;
            }
        }
        write!(f, "{}", self.program.display())?;
        for arg in self.args_lossy() {
            // `-e KEY=value` handed to a wrapper.
            match arg.split_once('=') {
                Some((key, _)) if self.secret_envs.iter().any(|s| s == key) => {
                    write!(f, " {}=***", key)?
                }
                _ => write!(f, " {}", arg)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Runs `spec` to completion, capturing stdout and stderr separately.
///
/// The child is killed if `limit` elapses first; that is reported as
/// [`BackupError::DumpTimedOut`], never as a short read.
pub async fn run_bounded(spec: &CommandSpec, limit: Duration) -> Result<CommandOutput> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(BackupError::DumpSpawn)?;

    match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        }),
        Ok(Err(e)) => Err(BackupError::DumpSpawn(e)),
        // Dropping the wait future drops the child, and kill_on_drop reaps it.
        Err(_) => Err(BackupError::DumpTimedOut {
            seconds: limit.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_streams_separately() -> anyhow::Result<()> {
        let out = run_bounded(&sh("printf 'dump body'; printf 'warning' >&2"), Duration::from_secs(10)).await?;
        assert!(out.status.success());
        assert_eq!(out.stdout, b"dump body");
        assert_eq!(out.stderr, b"warning");
        Ok(())
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() -> anyhow::Result<()> {
        let out = run_bounded(&sh("echo boom >&2; exit 1"), Duration::from_secs(10)).await?;
        assert_eq!(out.status.code(), Some(1));
        assert_eq!(out.stderr, b"boom\n");
        Ok(())
    }

    #[tokio::test]
    async fn environment_is_passed_to_child() -> anyhow::Result<()> {
        let spec = sh("printf \"$PGPASSWORD\"").secret_env("PGPASSWORD", "s3cret");
        let out = run_bounded(&spec, Duration::from_secs(10)).await?;
        assert_eq!(out.stdout, b"s3cret");
        Ok(())
    }

    #[tokio::test]
    async fn timeout_is_an_error() {
        let result = run_bounded(&sh("sleep 5"), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(BackupError::DumpTimedOut { .. })));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let result = run_bounded(&CommandSpec::new("/nonexistent/pg_dump"), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BackupError::DumpSpawn(_))));
    }

    #[test]
    fn display_masks_secrets() {
        let spec = CommandSpec::new("docker")
            .secret_env("PGPASSWORD", "hunter2")
            .arg("exec")
            .arg("-e")
            .arg("PGPASSWORD=hunter2")
            .arg("db");
        let shown = spec.to_string();
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("PGPASSWORD=***"));
    }
}
