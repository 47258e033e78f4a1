//! Remote session capability.
//!
//! A `HostSession` backend knows how to open one remote command session for one host. The
//! dispatcher only ever sees the resulting `Channel`: a primary reader, an optional separate
//! error reader, an optional writer and an optional backchannel for signal forwarding.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::DispatchOptions;
use crate::error::{DispatchError, HostError};
use crate::exec::ExecSession;
use crate::ssh::SshSession;
use crate::transfer::CopySpec;

pub type Reader = Box<dyn AsyncRead + Send + Unpin>;
pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Which backend opens the sessions for a dispatch. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConnectionKind {
    /// OpenSSH multiplexed sessions.
    Ssh,
    /// A local client process built from a command template.
    Exec,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ssh => f.write_str("ssh"),
            Self::Exec => f.write_str("exec"),
        }
    }
}

/// What gets sent to every host.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A command template, rendered per host.
    Command(String),
    /// Files streamed to a remote copy sink.
    Copy(CopySpec),
}

/// Everything a backend needs to open one host's session.
#[derive(Debug)]
pub struct OpenRequest<'a> {
    pub host: &'a str,
    pub address: Option<IpAddr>,
    pub local_user: &'a str,
    pub remote_user: &'a str,
    /// The fully rendered remote command line.
    pub command: &'a str,
    pub node_index: usize,
    /// Number of hosts in the dispatch.
    pub nhosts: usize,
    /// Whether the caller keeps stderr apart from stdout. Backends that cannot separate the
    /// streams still hand back a stderr reader and the relay merges it.
    pub want_error_channel: bool,
    /// Whether the caller needs to write to the remote side (copy mode).
    pub want_input: bool,
}

/// Forwards signals to the remote peer of one session.
#[async_trait]
pub trait Backchannel: Send + Sync {
    async fn signal(&self, signo: i32) -> Result<(), HostError>;
}

/// How a session's command ended, as far as the backend can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    Unknown,
}

impl From<std::process::ExitStatus> for Termination {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signo)) => Self::Signaled(signo),
            (None, None) => Self::Unknown,
        }
    }
}

/// Closes the session once its streams are drained.
#[async_trait]
pub trait Reaper: Send {
    async fn reap(self: Box<Self>) -> Result<Termination, HostError>;
}

struct NoopReaper;

#[async_trait]
impl Reaper for NoopReaper {
    async fn reap(self: Box<Self>) -> Result<Termination, HostError> {
        Ok(Termination::Unknown)
    }
}

/// An established session.
pub struct Channel {
    pub stdout: Reader,
    pub stderr: Option<Reader>,
    pub stdin: Option<Writer>,
    pub backchannel: Option<Arc<dyn Backchannel>>,
    pub reaper: Box<dyn Reaper>,
}

impl Channel {
    pub fn new(stdout: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            stdout: Box::new(stdout),
            stderr: None,
            stdin: None,
            backchannel: None,
            reaper: Box::new(NoopReaper),
        }
    }

    pub fn with_stderr(mut self, stderr: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }

    pub fn with_stdin(mut self, stdin: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn with_backchannel(mut self, backchannel: Arc<dyn Backchannel>) -> Self {
        self.backchannel = Some(backchannel);
        self
    }

    pub fn with_reaper(mut self, reaper: impl Reaper + 'static) -> Self {
        self.reaper = Box::new(reaper);
        self
    }
}

#[async_trait]
pub trait HostSession: Send + Sync {
    fn kind(&self) -> ConnectionKind;

    /// One-time setup before any host is contacted.
    async fn init(&self, _options: &DispatchOptions) -> Result<(), DispatchError> {
        Ok(())
    }

    /// Resolves the address of `host`. Called by the scheduler for every host, one at a time,
    /// before any worker starts.
    async fn resolve(&self, host: &str) -> Result<Option<IpAddr>, DispatchError> {
        lookup_address(host).await.map(Some)
    }

    async fn open(&self, request: &OpenRequest<'_>) -> Result<Channel, HostError>;

    /// Best-effort signal forwarding. Without a backchannel this is a no-op.
    async fn signal(
        &self,
        backchannel: Option<&Arc<dyn Backchannel>>,
        signo: i32,
    ) -> Result<(), HostError> {
        match backchannel {
            Some(backchannel) => backchannel.signal(signo).await,
            None => Ok(()),
        }
    }

    /// Whether a failure on one host must take down the whole fleet.
    fn lockstep(&self) -> bool {
        false
    }
}

/// DNS lookup of the first address for `host`.
pub async fn lookup_address(host: &str) -> Result<IpAddr, DispatchError> {
    let mut addrs =
        tokio::net::lookup_host((host, 0))
            .await
            .map_err(|source| DispatchError::Resolution {
                host: host.to_string(),
                source,
            })?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| DispatchError::Resolution {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        })
}

/// Builds the backend for `kind`.
pub fn backend(
    kind: ConnectionKind,
    exec_template: &str,
    lockstep: bool,
) -> Result<Arc<dyn HostSession>, DispatchError> {
    Ok(match kind {
        ConnectionKind::Ssh => Arc::new(SshSession::new()),
        ConnectionKind::Exec => Arc::new(ExecSession::new(exec_template, lockstep)?),
    })
}

/// Quotes `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
