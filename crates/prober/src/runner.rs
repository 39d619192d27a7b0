//! External process execution.
//!
//! Every backend invocation goes through the [`CommandRunner`] trait so the
//! probing engine never touches `std::process` directly. The production
//! implementation is [`TokioCommandRunner`]; tests substitute a spy.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Budget for `<runtime> kill` after a containerized stage times out
const CONTAINER_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Which of the four backend invocation shapes a command represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationKind {
    /// `-version` liveness query
    Version,
    /// Structured format/stream enumeration
    Structured,
    /// Verbose diagnostic log over a stream copy
    Verbose,
    /// Bounded partial decode
    DecodeProbe,
}

impl InvocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationKind::Version => "version",
            InvocationKind::Structured => "structured",
            InvocationKind::Verbose => "verbose",
            InvocationKind::DecodeProbe => "decode-probe",
        }
    }
}

impl std::fmt::Display for InvocationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully built command line, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub kind: InvocationKind,
    /// Host-side file the command inspects, if any
    pub target: Option<PathBuf>,
    pub program: OsString,
    pub args: Vec<OsString>,
    /// `--name` given to a container run; `program` is then the runtime
    pub container_name: Option<String>,
}

impl CommandSpec {
    /// Render the command line for logs and status output
    pub fn display(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        decode_output(&self.stdout)
    }

    pub fn stderr_text(&self) -> String {
        decode_output(&self.stderr)
    }
}

/// Error type for process execution.
#[derive(Debug, Error)]
pub enum RunError {
    /// The executable could not be started.
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish within its time budget and was killed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// IO error while collecting output.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executes backend command lines.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion, killing it once `timeout` elapses.
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput, RunError>;
}

/// Runs commands as real child processes with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec, timeout: Duration) -> Result<CommandOutput, RunError> {
        debug!(kind = %spec.kind, command = %spec.display(), "spawning backend process");

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunError::Spawn {
                program: spec.program.to_string_lossy().into_owned(),
                source: e,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        // For containers that child is only the runtime client.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                if let Some(name) = &spec.container_name {
                    kill_container(&spec.program, name).await;
                }
                return Err(RunError::Timeout(timeout));
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Stop a container left behind by a timed-out run.
async fn kill_container(runtime: &OsString, name: &str) {
    let status = Command::new(runtime)
        .args(["kill", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(CONTAINER_KILL_TIMEOUT, status).await {
        Ok(Ok(status)) if status.success() => debug!(container = name, "killed timed-out container"),
        Ok(Ok(status)) => warn!(container = name, %status, "container kill failed"),
        Ok(Err(e)) => warn!(container = name, error = %e, "could not run container kill"),
        Err(_) => warn!(container = name, "container kill timed out"),
    }
}

/// Decode process output as UTF-8, falling back to Latin-1.
///
/// Tag metadata in damaged files is frequently not valid UTF-8; Latin-1
/// maps every byte to a char, so decoding never fails.
pub fn decode_output(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_output_utf8() {
        assert_eq!(decode_output("Stream #0:0: Audio: mp3".as_bytes()), "Stream #0:0: Audio: mp3");
        assert_eq!(decode_output("título".as_bytes()), "título");
    }

    #[test]
    fn test_decode_output_latin1_fallback() {
        // "caf\xe9" is Latin-1 for "café" and invalid UTF-8
        let bytes = [b'c', b'a', b'f', 0xe9];
        assert_eq!(decode_output(&bytes), "café");
    }

    #[test]
    fn test_command_spec_display() {
        let spec = CommandSpec {
            kind: InvocationKind::Version,
            target: None,
            program: OsString::from("ffmpeg"),
            args: vec![OsString::from("-version")],
            container_name: None,
        };
        assert_eq!(spec.display(), "ffmpeg -version");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let spec = CommandSpec {
            kind: InvocationKind::Version,
            target: None,
            program: OsString::from("/nonexistent/audio-probe/ffmpeg"),
            args: vec![OsString::from("-version")],
            container_name: None,
        };
        let result = TokioCommandRunner.run(&spec, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RunError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let spec = CommandSpec {
            kind: InvocationKind::Verbose,
            target: None,
            program: OsString::from("sleep"),
            args: vec![OsString::from("5")],
            container_name: None,
        };

        let started = std::time::Instant::now();
        let result = TokioCommandRunner.run(&spec, Duration::from_millis(100)).await;

        assert!(matches!(result, Err(RunError::Timeout(t)) if t == Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(3), "runner waited for the child");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_named_container() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let killed = dir.path().join("killed");
        // Stand-in runtime: `kill <name>` records the name, anything else hangs
        let runtime = dir.path().join("runtime");
        std::fs::write(
            &runtime,
            format!(
                "#!/bin/sh\nif [ \"$1\" = kill ]; then echo \"$2\" > '{}'; exit 0; fi\nsleep 5\n",
                killed.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();

        let spec = CommandSpec {
            kind: InvocationKind::Verbose,
            target: None,
            program: runtime.into_os_string(),
            args: vec![OsString::from("run")],
            container_name: Some("audio-probe-stuck".to_string()),
        };
        let result = TokioCommandRunner.run(&spec, Duration::from_millis(200)).await;

        assert!(matches!(result, Err(RunError::Timeout(_))));
        assert_eq!(std::fs::read_to_string(&killed).unwrap().trim(), "audio-probe-stuck");
    }
}
