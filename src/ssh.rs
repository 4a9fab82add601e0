//! Remote command execution over SSH using the russh crate

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect, client};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::error::ExecError;
use crate::output;
use crate::traits::{CmdWorker, Runner};

/// Capacity of each in-memory pipe between a worker and its channel pump.
/// A command that fills both output pipes beyond this before either is read
/// can stall, the same limitation the local backend has with OS pipes.
const PIPE_CAPACITY: usize = 256 * 1024;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no).
        Ok(true)
    }
}

/// Runner that executes commands over one authenticated SSH connection.
///
/// Each [`Runner::command`] call opens an independent session channel on the
/// shared connection; sessions are never reused across commands. The
/// connection stays usable until [`RemoteRunner::close_connection`].
pub struct RemoteRunner {
    addr: String,
    user: String,
    conn: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for RemoteRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRunner")
            .field("addr", &self.addr)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl RemoteRunner {
    /// Connect and authenticate with a private key file.
    ///
    /// # Errors
    /// [`ExecError::KeyError`] if the key file is missing or unparseable
    /// (checked before dialing), [`ExecError::ConnectionFailed`] if the dial
    /// fails, [`ExecError::AuthenticationFailed`] if the server rejects the
    /// key.
    #[instrument(skip(key_path))]
    pub async fn connect_with_key(
        user: &str,
        addr: &str,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, ExecError> {
        let key_pair = load_secret_key(key_path.as_ref(), None)
            .map_err(|e| ExecError::KeyError(e.to_string()))?;

        let mut session = Self::dial(addr).await?;
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg))
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;
        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(
                "public key authentication rejected".to_string(),
            ));
        }

        info!(addr, user, "SSH connected and authenticated");
        Ok(Self::from_handle(addr, user, session))
    }

    /// Connect and authenticate with a password.
    ///
    /// # Errors
    /// [`ExecError::ConnectionFailed`] if the dial fails,
    /// [`ExecError::AuthenticationFailed`] if the server rejects the
    /// password.
    #[instrument(skip(password))]
    pub async fn connect_with_password(
        user: &str,
        addr: &str,
        password: &str,
    ) -> Result<Self, ExecError> {
        let mut session = Self::dial(addr).await?;
        let auth_res = session
            .authenticate_password(user, password)
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;
        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(
                "password authentication rejected".to_string(),
            ));
        }

        info!(addr, user, "SSH connected and authenticated");
        Ok(Self::from_handle(addr, user, session))
    }

    /// Tear down the underlying transport.
    ///
    /// Distinct from closing an individual session: after this, every
    /// subsequent [`Runner::command`] call fails with
    /// [`ExecError::NotConnected`]. Calling it again is a no-op.
    pub async fn close_connection(&self) -> Result<(), ExecError> {
        let mut conn = self.conn.lock().await;
        if let Some(handle) = conn.take() {
            handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;
            info!(addr = %self.addr, "SSH disconnected");
        }
        Ok(())
    }

    async fn dial(addr: &str) -> Result<client::Handle<SshClientHandler>, ExecError> {
        let config = Arc::new(client::Config::default());
        client::connect(config, addr, SshClientHandler)
            .await
            .map_err(|e| ExecError::ConnectionFailed(e.to_string()))
    }

    fn from_handle(addr: &str, user: &str, handle: client::Handle<SshClientHandler>) -> Self {
        Self {
            addr: addr.to_string(),
            user: user.to_string(),
            conn: Mutex::new(Some(handle)),
        }
    }
}

#[async_trait]
impl Runner for RemoteRunner {
    async fn command(&self, cmd: &str) -> Result<Box<dyn CmdWorker>, ExecError> {
        if cmd.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }

        let mut conn = self.conn.lock().await;
        let handle = conn.as_mut().ok_or(ExecError::NotConnected)?;

        debug!(addr = %self.addr, command = %cmd, "opening session channel");
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ExecError::SessionFailed(e.to_string()))?;

        Ok(Box::new(RemoteCmd::new(cmd.to_string(), Box::new(channel))))
    }
}

/// The channel operations the worker and its pump need. One production
/// implementation (a russh session channel); tests drive the worker with a
/// scripted stand-in.
#[async_trait]
trait PumpChannel: Send {
    async fn exec_command(&mut self, cmd: &str) -> Result<(), russh::Error>;
    async fn wait_msg(&mut self) -> Option<ChannelMsg>;
    /// Returns false once the peer is gone.
    async fn send_data(&mut self, data: &[u8]) -> bool;
    async fn send_eof(&mut self);
    async fn close_channel(&mut self);
}

#[async_trait]
impl PumpChannel for Channel<client::Msg> {
    async fn exec_command(&mut self, cmd: &str) -> Result<(), russh::Error> {
        self.exec(true, cmd).await
    }

    async fn wait_msg(&mut self) -> Option<ChannelMsg> {
        self.wait().await
    }

    async fn send_data(&mut self, data: &[u8]) -> bool {
        self.data(data).await.is_ok()
    }

    async fn send_eof(&mut self) {
        let _ = self.eof().await;
    }

    async fn close_channel(&mut self) {
        let _ = self.close().await;
    }
}

/// Parts handed to the channel pump when the command starts.
struct PumpParts {
    channel: Box<dyn PumpChannel>,
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

/// Worker for one command on one session channel.
///
/// The pipe endpoints are wired at construction; a background pump task owns
/// the channel from `start` onward, demuxing stdout/stderr traffic into the
/// pipes and forwarding stdin bytes to the channel. The pump closes the
/// channel when its message loop ends, on every exit path.
pub struct RemoteCmd {
    cmd: String,
    parts: Option<PumpParts>,
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    pump: Option<JoinHandle<Option<u32>>>,
    finished: bool,
    exit: Option<u32>,
}

impl RemoteCmd {
    fn new(cmd: String, channel: Box<dyn PumpChannel>) -> Self {
        let (stdin_w, stdin_r) = duplex(PIPE_CAPACITY);
        let (stdout_w, stdout_r) = duplex(PIPE_CAPACITY);
        let (stderr_w, stderr_r) = duplex(PIPE_CAPACITY);
        Self {
            cmd,
            parts: Some(PumpParts {
                channel,
                stdin: stdin_r,
                stdout: stdout_w,
                stderr: stderr_w,
            }),
            stdin: Some(stdin_w),
            stdout: Some(stdout_r),
            stderr: Some(stderr_r),
            pump: None,
            finished: false,
            exit: None,
        }
    }
}

#[async_trait]
impl CmdWorker for RemoteCmd {
    async fn start(&mut self) -> Result<(), ExecError> {
        let mut parts = self
            .parts
            .take()
            .ok_or_else(|| ExecError::StartFailed("command already started".to_string()))?;

        debug!(command = %self.cmd, "executing remote command");
        parts
            .channel
            .exec_command(self.cmd.as_str())
            .await
            .map_err(|e| ExecError::StartFailed(e.to_string()))?;

        self.pump = Some(tokio::spawn(pump(parts)));
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn wait(&mut self) -> Result<(), ExecError> {
        // Never started: the pipe write halves are still parked in
        // `self.parts`, so draining would block forever waiting for a pump
        // that does not exist.
        if self.parts.is_some() {
            return Err(ExecError::StartFailed("command not started".to_string()));
        }

        // Drain stderr first so diagnostic text survives even if the caller
        // never read it. The reader stays in place; re-draining after the
        // pump has finished yields zero bytes.
        let mut diagnostic = Vec::new();
        if let Some(stderr) = self.stderr.as_mut() {
            stderr
                .read_to_end(&mut diagnostic)
                .await
                .map_err(|e| ExecError::StreamFailed(e.to_string()))?;
        }

        // Dropping the writer signals end of input; the pump turns that into
        // a channel EOF. Shutdown on an in-memory pipe cannot fail other than
        // by the peer being gone, which is the graceful case.
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        if !self.finished {
            let pump = self
                .pump
                .take()
                .ok_or_else(|| ExecError::StartFailed("command not started".to_string()))?;
            self.exit = pump
                .await
                .map_err(|e| ExecError::execution(format!("session task failed: {e}")))?;
            self.finished = true;
        }

        match self.exit {
            Some(0) => Ok(()),
            Some(status) => {
                debug!(status, "remote command failed");
                Err(
                    ExecError::execution(format!("command exited with status {status}"))
                        .with_diagnostic(&diagnostic),
                )
            }
            None => Err(
                ExecError::execution("session closed without reporting an exit status")
                    .with_diagnostic(&diagnostic),
            ),
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

/// Drive one session channel to completion.
///
/// Demuxes channel traffic into the stdout/stderr pipes, forwards stdin
/// bytes to the channel and records the exit status. The channel is closed
/// when the loop ends; dropping the pipe writers delivers end-of-stream to
/// the worker's readers.
async fn pump(parts: PumpParts) -> Option<u32> {
    let PumpParts {
        mut channel,
        stdin: mut stdin_rx,
        stdout: mut stdout_tx,
        stderr: mut stderr_tx,
    } = parts;

    enum Event {
        Channel(Option<ChannelMsg>),
        Stdin(std::io::Result<usize>),
    }

    let mut exit_status = None;
    let mut stdin_open = true;
    let mut buf = vec![0u8; 8192];

    loop {
        let event = tokio::select! {
            msg = channel.wait_msg() => Event::Channel(msg),
            read = stdin_rx.read(&mut buf), if stdin_open => Event::Stdin(read),
        };

        match event {
            Event::Channel(Some(ChannelMsg::Data { data })) => {
                // A dropped reader just discards the traffic.
                let _ = stdout_tx.write_all(&data).await;
            }
            Event::Channel(Some(ChannelMsg::ExtendedData { data, ext })) if ext == 1 => {
                let _ = stderr_tx.write_all(&data).await;
            }
            Event::Channel(Some(ChannelMsg::ExitStatus { exit_status: status })) => {
                // Data can still arrive after the exit status; keep looping
                // until the server closes the channel.
                exit_status = Some(status);
            }
            Event::Channel(None) => break,
            Event::Channel(Some(_)) => {}
            Event::Stdin(Ok(0)) | Event::Stdin(Err(_)) => {
                stdin_open = false;
                channel.send_eof().await;
            }
            Event::Stdin(Ok(n)) => {
                if !channel.send_data(&buf[..n]).await {
                    stdin_open = false;
                }
            }
        }
    }

    channel.close_channel().await;
    exit_status
}
