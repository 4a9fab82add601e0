//! Runner and command worker traits

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ExecError;

/// Factory producing one [`CmdWorker`] per command for a given execution
/// target (local machine or an established SSH connection).
#[async_trait]
pub trait Runner: Send + Sync {
    /// Prepare a worker for `cmd` without starting it.
    ///
    /// Fails with [`ExecError::EmptyCommand`] before any resource is
    /// acquired when `cmd` is empty or all whitespace.
    async fn command(&self, cmd: &str) -> Result<Box<dyn CmdWorker>, ExecError>;
}

/// One command invocation: start it, stream its pipes, wait for it.
///
/// Both backends satisfy the same contract. `wait` drains the error stream
/// before reaping so diagnostic text is never lost, closes the input writer
/// (end-of-stream there is a graceful signal, not a failure) and releases the
/// backend on every exit path. The error stream stays owned by the worker, so
/// draining it a second time yields zero bytes instead of blocking.
#[async_trait]
pub trait CmdWorker: Send {
    /// Instruct the backend to begin executing the command.
    async fn start(&mut self) -> Result<(), ExecError>;

    /// Wait for termination. Drains stderr, closes stdin, reaps the backend
    /// and, on failure, attaches the drained stderr text to the error.
    async fn wait(&mut self) -> Result<(), ExecError>;

    /// Start, read both output streams to completion, then wait.
    ///
    /// Returns the captured output as lines: stdout first, then stderr, each
    /// stream trimmed of surrounding newlines and split on `'\n'`. Streams
    /// are drained sequentially, stdout first; a command that fills both pipe
    /// buffers before either is read can block, in which case the caller
    /// should drive the raw pipes instead.
    async fn run(&mut self) -> Result<Vec<String>, ExecError>;

    /// [`run`](CmdWorker::run) bounded by a time limit.
    async fn run_with_timeout(&mut self, limit: Duration) -> Result<Vec<String>, ExecError> {
        match tokio::time::timeout(limit, self.run()).await {
            Ok(result) => result,
            Err(_) => Err(ExecError::Timeout { timeout: limit }),
        }
    }

    /// Raw input writer. Wired at construction; `None` once `wait` has
    /// closed it.
    fn stdin_pipe(&mut self) -> Option<&mut (dyn AsyncWrite + Send + Unpin)>;

    /// Raw output reader, wired at construction.
    fn stdout_pipe(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)>;

    /// Raw error reader, wired at construction.
    fn stderr_pipe(&mut self) -> Option<&mut (dyn AsyncRead + Send + Unpin)>;
}
