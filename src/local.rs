//! Local command execution using `tokio::process`

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use crate::error::ExecError;
use crate::output;
use crate::traits::{CmdWorker, Runner};

/// Runner that spawns processes on the local machine.
///
/// Stateless; the command string is split on whitespace into a program name
/// and arguments, with no shell interpretation.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl LocalRunner {
    /// Create a new local runner
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn command(&self, cmd: &str) -> Result<Box<dyn CmdWorker>, ExecError> {
        let mut fields = cmd.split_whitespace();
        let program = fields.next().ok_or(ExecError::EmptyCommand)?;

        debug!(command = %cmd, "preparing local command");

        // The OS pipes are created here, before any process exists, so the
        // worker's pipe accessors are live in the Created state. The child
        // ends go into the Command as blocking fds; spawning inherits them.
        let pipe_err = |e: std::io::Error| ExecError::PipeFailed(e.to_string());
        let (stdin_tx, stdin_rx) = pipe::pipe().map_err(pipe_err)?;
        let (stdout_tx, stdout_rx) = pipe::pipe().map_err(pipe_err)?;
        let (stderr_tx, stderr_rx) = pipe::pipe().map_err(pipe_err)?;

        let mut command = Command::new(program);
        command
            .args(fields)
            .stdin(Stdio::from(stdin_rx.into_blocking_fd().map_err(pipe_err)?))
            .stdout(Stdio::from(stdout_tx.into_blocking_fd().map_err(pipe_err)?))
            .stderr(Stdio::from(stderr_tx.into_blocking_fd().map_err(pipe_err)?));

        Ok(Box::new(LocalCmd {
            command: Some(command),
            child: None,
            stdin: Some(stdin_tx),
            stdout: Some(stdout_rx),
            stderr: Some(stderr_rx),
            exit: None,
        }))
    }
}

/// Worker for one local process invocation.
///
/// All three pipes are wired at construction; input written before
/// [`CmdWorker::start`] sits in the OS pipe buffer until the process reads
/// it. Spawning consumes the prepared `Command`, dropping the child-side
/// pipe ends so the parent's readers see end-of-stream when the process
/// exits.
pub struct LocalCmd {
    command: Option<Command>,
    child: Option<Child>,
    stdin: Option<pipe::Sender>,
    stdout: Option<pipe::Receiver>,
    stderr: Option<pipe::Receiver>,
    exit: Option<std::process::ExitStatus>,
}

#[async_trait]
impl CmdWorker for LocalCmd {
    async fn start(&mut self) -> Result<(), ExecError> {
        let mut command = self
            .command
            .take()
            .ok_or_else(|| ExecError::StartFailed("process already started".to_string()))?;
        let child = command
            .spawn()
            .map_err(|e| ExecError::StartFailed(e.to_string()))?;
        self.child = Some(child);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn wait(&mut self) -> Result<(), ExecError> {
        // Never started: the child-side pipe ends are still held by the
        // prepared Command, so draining would block forever.
        if self.command.is_some() {
            return Err(ExecError::StartFailed("process not started".to_string()));
        }

        // Drain stderr first so diagnostic text is captured even if the
        // caller never read it. The reader stays owned by the worker; a
        // repeat drain on a later call yields zero bytes.
        let mut diagnostic = Vec::new();
        if let Some(stderr) = self.stderr.as_mut() {
            stderr
                .read_to_end(&mut diagnostic)
                .await
                .map_err(|e| ExecError::StreamFailed(e.to_string()))?;
        }

        // Closing stdin signals end of input. The child being gone already
        // is a graceful close, not a failure.
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(err) = stdin.shutdown().await {
                if !matches!(
                    err.kind(),
                    std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof
                ) {
                    return Err(ExecError::execution(format!("closing stdin failed: {err}"))
                        .with_diagnostic(&diagnostic));
                }
            }
        }

        let status = match self.exit {
            Some(status) => status,
            None => {
                let child = self
                    .child
                    .as_mut()
                    .ok_or_else(|| ExecError::StartFailed("process not started".to_string()))?;
                let status = child
                    .wait()
                    .await
                    .map_err(|e| ExecError::execution(e.to_string()).with_diagnostic(&diagnostic))?;
                self.exit = Some(status);
                status
            }
        };

        if status.success() {
            Ok(())
        } else {
            debug!(%status, "local command failed");
            Err(ExecError::execution(format!("process exited with {status}"))
                .with_diagnostic(&diagnostic))
        }
    }

    async fn run(&mut self) -> Result<Vec<String>, ExecError> {
        self.start().await?;

        let mut out = Vec::new();
        if let Some(stdout) = self.stdout.as_mut() {
            stdout
                .read_to_end(&mut out)
                .await
                .map_err(|e| ExecError::StreamFailed(e.to_string()))?;
        }
        let mut err_bytes = Vec::new();
        if let Some(stderr) = self.stderr.as_mut() {
            stderr
                .read_to_end(&mut err_bytes)
                .await
                .map_err(|e| ExecError::StreamFailed(e.to_string()))?;
        }

        match self.wait().await {
            Ok(()) => Ok(output::capture(&out, &err_bytes)),
            Err(e) => Err(e.with_diagnostic(&err_bytes)),
        }
    }

    fn stdin_pipe(&mut self) -> Option<&mut (dyn AsyncWrite + Send + Unpin)> {
        self.stdin
            .as_mut()
            .map(|s| s as &mut (dyn AsyncWrite + Send + Unpin))
    }

    fn stdout_pipe(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)> {
        self.stdout
            .as_mut()
            .map(|s| s as &mut (dyn AsyncRead + Send + Unpin))
    }

    fn stderr_pipe(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)> {
        self.stderr
            .as_mut()
            .map(|s| s as &mut (dyn AsyncRead + Send + Unpin))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// Write an executable /bin/sh script and return its path.
    fn script(body: &str) -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        file.write_all(body.as_bytes()).unwrap();
        let path = file.into_temp_path();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let runner = LocalRunner::new();
        assert!(matches!(
            runner.command("").await,
            Err(ExecError::EmptyCommand)
        ));
        assert!(matches!(
            runner.command("   ").await,
            Err(ExecError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn run_collects_stdout_lines() {
        let path = script("printf 'a\\nb\\n'\n");
        let runner = LocalRunner::new();
        let mut worker = runner.command(&path.to_string_lossy()).await.unwrap();
        assert_eq!(worker.run().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stderr_lines_are_captured_on_success() {
        let path = script("echo err1 >&2\necho err2 >&2\n");
        let runner = LocalRunner::new();
        let mut worker = runner.command(&path.to_string_lossy()).await.unwrap();
        assert_eq!(worker.run().await.unwrap(), vec!["err1", "err2"]);
    }

    #[tokio::test]
    async fn stdout_lines_precede_stderr_lines() {
        let path = script("echo out\necho err >&2\n");
        let runner = LocalRunner::new();
        let mut worker = runner.command(&path.to_string_lossy()).await.unwrap();
        assert_eq!(worker.run().await.unwrap(), vec!["out", "err"]);
    }

    #[tokio::test]
    async fn failure_carries_exit_status_and_stderr() {
        let path = script("echo boom >&2\nexit 3\n");
        let runner = LocalRunner::new();
        let mut worker = runner.command(&path.to_string_lossy()).await.unwrap();
        let err = worker.run().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit status"), "message: {message}");
        assert!(message.contains("boom"), "message: {message}");
        assert!(err.diagnostic().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn wait_twice_is_harmless() {
        let path = script("exit 0\n");
        let runner = LocalRunner::new();
        let mut worker = runner.command(&path.to_string_lossy()).await.unwrap();
        worker.start().await.unwrap();
        worker.wait().await.unwrap();
        // Second wait re-drains an exhausted stderr and reuses the recorded
        // exit status.
        worker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn wait_before_start_errors() {
        let runner = LocalRunner::new();
        let mut worker = runner.command("true").await.unwrap();
        assert!(matches!(
            worker.wait().await.unwrap_err(),
            ExecError::StartFailed(_)
        ));
    }

    #[tokio::test]
    async fn pipes_are_wired_before_start() {
        let runner = LocalRunner::new();
        let mut worker = runner.command("head -1").await.unwrap();
        assert!(worker.stdin_pipe().is_some());
        assert!(worker.stdout_pipe().is_some());
        assert!(worker.stderr_pipe().is_some());

        // Input written before start sits in the pipe buffer until the
        // process reads it.
        let stdin = worker.stdin_pipe().unwrap();
        stdin.write_all(b"a\n").await.unwrap();
        stdin.flush().await.unwrap();

        worker.start().await.unwrap();
        worker.wait().await.unwrap();

        let mut echoed = String::new();
        worker
            .stdout_pipe()
            .unwrap()
            .read_to_string(&mut echoed)
            .await
            .unwrap();
        assert_eq!(echoed, "a\n");
    }

    #[tokio::test]
    async fn missing_executable_fails_at_start() {
        let runner = LocalRunner::new();
        let mut worker = runner
            .command("definitely-not-a-real-binary-4f1d")
            .await
            .unwrap();
        assert!(matches!(
            worker.start().await.unwrap_err(),
            ExecError::StartFailed(_)
        ));
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let path = script("exit 0\n");
        let runner = LocalRunner::new();
        let mut worker = runner.command(&path.to_string_lossy()).await.unwrap();
        worker.start().await.unwrap();
        assert!(matches!(
            worker.start().await.unwrap_err(),
            ExecError::StartFailed(_)
        ));
        worker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn run_with_timeout_expires() {
        let runner = LocalRunner::new();
        let mut worker = runner.command("sleep 5").await.unwrap();
        let result = worker.run_with_timeout(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }
}
