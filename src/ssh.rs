//! OpenSSH backend.
//!
//! Uses the native multiplexing support of the `openssh` crate. The master connection is
//! established in `open`; the remote command then runs through `sh -c` on that master.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use openssh::{KnownHosts, Session as SSHSession, SessionBuilder, Stdio};

use crate::error::{DispatchError, HostError};
use crate::session::{
    shell_quote, Channel, ConnectionKind, HostSession, OpenRequest, Reaper, Termination,
};

#[derive(Debug, Default)]
pub struct SshSession;

impl SshSession {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostSession for SshSession {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Ssh
    }

    /// ssh resolves aliases from its own configuration.
    async fn resolve(&self, _host: &str) -> Result<Option<IpAddr>, DispatchError> {
        Ok(None)
    }

    async fn open(&self, request: &OpenRequest<'_>) -> Result<Channel, HostError> {
        let mut builder = SessionBuilder::default();
        builder
            .user(request.remote_user.to_string())
            .known_hosts_check(KnownHosts::Add);
        let session = Arc::new(builder.connect_mux(request.host).await?);
        tracing::debug!(host = request.host, "ssh master connected");

        let mut cmd = Arc::clone(&session).arc_command("sh");
        cmd.arg("-c")
            .raw_arg(shell_quote(request.command))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if request.want_input {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        let mut child = cmd.spawn().await?;

        let stdout = child
            .stdout()
            .take()
            .ok_or_else(|| HostError::Connect("remote stdout unavailable".to_string()))?;
        let stderr = child.stderr().take();
        let stdin = child.stdin().take();

        let mut channel = Channel::new(stdout);
        if let Some(stderr) = stderr {
            channel = channel.with_stderr(stderr);
        }
        if let Some(stdin) = stdin {
            channel = channel.with_stdin(stdin);
        }
        Ok(channel.with_reaper(SshReaper { child, session }))
    }
}

struct SshReaper {
    child: openssh::Child<Arc<SSHSession>>,
    session: Arc<SSHSession>,
}

#[async_trait]
impl Reaper for SshReaper {
    async fn reap(self: Box<Self>) -> Result<Termination, HostError> {
        let Self { child, session } = *self;
        let status = child.wait().await?;
        tracing::debug!(?status, "remote command exited");
        // The child held the other reference; it is gone now.
        if let Ok(session) = Arc::try_unwrap(session) {
            session.close().await?;
        }
        Ok(status.into())
    }
}
