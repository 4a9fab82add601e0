//! runcmd: unified local and remote command execution
//!
//! One lifecycle contract over two backends: a local OS process
//! ([`local::LocalRunner`]) and an SSH session on an authenticated
//! connection ([`ssh::RemoteRunner`]). Either runner turns a command string
//! into a [`traits::CmdWorker`] that can be started, streamed and waited on
//! with identical semantics, or driven end to end with
//! [`traits::CmdWorker::run`] to collect combined output lines.

pub mod error;
pub mod local;
mod output;
pub mod ssh;
pub mod traits;

pub use error::ExecError;
pub use local::{LocalCmd, LocalRunner};
pub use ssh::{RemoteCmd, RemoteRunner};
pub use traits::{CmdWorker, Runner};
