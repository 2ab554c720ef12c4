//! Purpose: Run the prediction script as a child process with bounded time and output.
//! Exports: `ScriptRunner`, `ProcessRunner`, `Captured`, `validate_script_settings`, default limits.
//! Role: Subprocess capability injected into the request adapter.
//! Invariants: One child per `invoke` call; stdin is closed right after the payload is written.
//! Invariants: A child that outlives the timeout is killed (whole process group on unix) and reaped.
//! Invariants: Captured stdout and stderr are each capped at `max_output_bytes`.
//! Notes: The command string runs through the platform shell, so it may carry its own arguments.

use std::future::Future;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};

use super::error::{Error, ErrorKind};

pub const DEFAULT_COMMAND: &str = "python3 functions/backend.py";
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 1024 * 1024;

/// Rejects settings under which no script run could succeed.
pub fn validate_script_settings(
    command: &str,
    timeout_ms: u64,
    max_output_bytes: u64,
) -> Result<(), Error> {
    if command.trim().is_empty() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--command must not be empty")
            .with_hint("Use a shell command like `python3 functions/backend.py`."));
    }
    if timeout_ms == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--timeout-ms must be greater than zero")
            .with_hint("Use a positive value like 5000."));
    }
    if max_output_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-output-bytes must be greater than zero")
            .with_hint("Use a positive value like 1048576."));
    }
    Ok(())
}

/// Raw output of a script that ran to a successful exit.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Captured {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Runs the script once: feed `input` on stdin, wait at most `timeout`, return what it printed.
///
/// Implementations return an error whose kind satisfies
/// [`ErrorKind::is_invocation_failure`] when no usable output exists
/// (could not start, non-zero exit, killed, timed out, or too much output).
pub trait ScriptRunner: Send + Sync + 'static {
    fn invoke(
        &self,
        input: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<Captured, Error>> + Send;
}

#[derive(Clone, Debug)]
pub struct ProcessRunner {
    command: String,
    max_output_bytes: u64,
}

impl ProcessRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: u64) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn max_output_bytes(&self) -> u64 {
        self.max_output_bytes
    }

    fn build_command(&self) -> Command {
        #[cfg(unix)]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd
        };
        #[cfg(not(unix))]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&self.command);
            cmd
        };
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn failure(&self, kind: ErrorKind, message: impl Into<String>) -> Error {
        Error::new(kind)
            .with_message(message)
            .with_command(self.command.clone())
    }

    fn check_status(&self, status: ExitStatus, captured: Captured) -> Result<Captured, Error> {
        if status.success() {
            return Ok(captured);
        }
        let mut message = format!("`{}` failed with {status}", self.command);
        if !captured.stderr.is_empty() {
            message.push('\n');
            message.push_str(&String::from_utf8_lossy(&captured.stderr));
        }
        Err(self.failure(ErrorKind::Exit, message))
    }
}

impl ScriptRunner for ProcessRunner {
    async fn invoke(&self, input: Vec<u8>, timeout: Duration) -> Result<Captured, Error> {
        let mut child = self.build_command().spawn().map_err(|err| {
            self.failure(
                ErrorKind::Spawn,
                format!("failed to start `{}`: {err}", self.command),
            )
            .with_source(err)
        })?;

        let limit = self.max_output_bytes;
        let exchange = async {
            let (_, stdout, stderr) = tokio::try_join!(
                feed(child.stdin.take(), input),
                read_capped(child.stdout.take(), limit, "stdout"),
                read_capped(child.stderr.take(), limit, "stderr"),
            )?;
            let status = child.wait().await.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to wait for script")
                    .with_source(err)
            })?;
            Ok::<_, Error>((status, Captured { stdout, stderr }))
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(self.failure(
                ErrorKind::Timeout,
                format!(
                    "`{}` timed out after {} ms and was killed",
                    self.command,
                    timeout.as_millis()
                ),
            )),
        };

        match result {
            Ok((status, captured)) => self.check_status(status, captured),
            Err(err) => {
                terminate(&mut child).await;
                Err(err.with_command(self.command.clone()))
            }
        }
    }
}

async fn feed(stdin: Option<ChildStdin>, input: Vec<u8>) -> Result<(), Error> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    match stdin.write_all(&input).await {
        Ok(()) => {}
        // Scripts that exit without reading their input close the pipe first.
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
        Err(err) => {
            return Err(Error::new(ErrorKind::Io)
                .with_message("failed to write script input")
                .with_source(err));
        }
    }
    drop(stdin);
    Ok(())
}

async fn read_capped<R>(stream: Option<R>, limit: u64, label: &str) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let Some(stream) = stream else {
        return Ok(buf);
    };
    stream
        .take(limit.saturating_add(1))
        .read_to_end(&mut buf)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to read script {label}"))
                .with_source(err)
        })?;
    if buf.len() as u64 > limit {
        return Err(Error::new(ErrorKind::OutputLimit)
            .with_message(format!("script {label} exceeded {limit} bytes")));
    }
    Ok(buf)
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own process group; take the whole group down.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    if let Err(err) = child.kill().await {
        tracing::debug!(error = %err, "script already exited");
    }
}
