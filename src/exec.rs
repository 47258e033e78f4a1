//! Local-client backend.
//!
//! Runs a local program per host, built from a command template such as
//! `ssh -oBatchMode=yes -l {{user}} {{host}}`, with the remote command appended as the final
//! argument. Signals are forwarded to the local client process.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::config::DispatchOptions;
use crate::error::{DispatchError, HostError};
use crate::host::Host;
use crate::session::{
    lookup_address, Backchannel, Channel, ConnectionKind, HostSession, OpenRequest, Reaper,
    Termination,
};
use crate::template::{CommandTemplate, TemplateParams};

pub const DEFAULT_EXEC_TEMPLATE: &str = "ssh -oBatchMode=yes -l {{user}} {{host}}";

pub struct ExecSession {
    template: CommandTemplate,
    lockstep: bool,
}

impl ExecSession {
    pub fn new(template: &str, lockstep: bool) -> Result<Self, DispatchError> {
        Ok(Self {
            template: CommandTemplate::new(template)?,
            lockstep,
        })
    }

    fn argv(&self, request: &OpenRequest<'_>) -> Result<Vec<String>, HostError> {
        let host = Host::new(request.host.to_string());
        let rendered = self
            .template
            .render(&TemplateParams {
                host: request.host,
                label: host.label(),
                user: request.remote_user,
                rank: request.node_index,
                nhosts: request.nhosts,
                address: request.address.map(|a| a.to_string()),
            })
            .map_err(|e| HostError::Spawn(e.to_string()))?;
        let mut argv =
            shell_words::split(&rendered).map_err(|e| HostError::Spawn(e.to_string()))?;
        argv.push(request.command.to_string());
        Ok(argv)
    }
}

#[async_trait]
impl HostSession for ExecSession {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Exec
    }

    async fn init(&self, options: &DispatchOptions) -> Result<(), DispatchError> {
        let probe = self.template.render(&TemplateParams {
            host: "localhost",
            label: "localhost",
            user: &options.local_user,
            rank: 0,
            nhosts: 1,
            address: Some("127.0.0.1".to_string()),
        })?;
        let argv = shell_words::split(&probe).map_err(|e| {
            DispatchError::Init(format!(
                "exec template '{}': {}",
                self.template.source(),
                e
            ))
        })?;
        if argv.is_empty() {
            return Err(DispatchError::Init(format!(
                "exec template '{}' renders to an empty command",
                self.template.source()
            )));
        }
        Ok(())
    }

    async fn resolve(&self, host: &str) -> Result<Option<IpAddr>, DispatchError> {
        if self.template.uses_address() {
            lookup_address(host).await.map(Some)
        } else {
            Ok(None)
        }
    }

    async fn open(&self, request: &OpenRequest<'_>) -> Result<Channel, HostError> {
        let argv = self.argv(request)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HostError::Spawn("empty command".to_string()))?;
        tracing::debug!(host = request.host, ?argv, "starting local client");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if request.want_input {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HostError::Spawn(format!("{}: {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Spawn("stdout not captured".to_string()))?;
        let mut channel = Channel::new(stdout);
        if let Some(stderr) = child.stderr.take() {
            channel = channel.with_stderr(stderr);
        }
        if let Some(stdin) = child.stdin.take() {
            channel = channel.with_stdin(stdin);
        }
        if let Some(pid) = child.id() {
            channel = channel.with_backchannel(Arc::new(ProcessBackchannel { pid }));
        }
        Ok(channel.with_reaper(ChildReaper(child)))
    }

    fn lockstep(&self) -> bool {
        self.lockstep
    }
}

struct ProcessBackchannel {
    pid: u32,
}

#[async_trait]
impl Backchannel for ProcessBackchannel {
    async fn signal(&self, signo: i32) -> Result<(), HostError> {
        let signal = Signal::try_from(signo).map_err(|e| HostError::Io(e.into()))?;
        let pid = i32::try_from(self.pid)
            .map_err(|_| HostError::Spawn(format!("pid {} out of range", self.pid)))?;
        kill(Pid::from_raw(pid), signal).map_err(|e| HostError::Io(e.into()))
    }
}

struct ChildReaper(Child);

#[async_trait]
impl Reaper for ChildReaper {
    async fn reap(self: Box<Self>) -> Result<Termination, HostError> {
        let mut child = self.0;
        let status = child.wait().await?;
        tracing::debug!(?status, "local client exited");
        Ok(status.into())
    }
}
