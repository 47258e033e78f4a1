use thiserror::Error;

use crate::record::Phase;

/// Errors that abort a whole dispatch.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No target hosts given")]
    NoHosts,
    #[error("Failed to read hosts file {path}: {reason}")]
    HostsFile { path: String, reason: String },
    #[error("Failed to resolve host {host}: {source}")]
    Resolution {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {reason}")]
    Enumeration { path: String, reason: String },
    #[error("Failed to render template '{template}': {reason}")]
    Template { template: String, reason: String },
    #[error("Connection backend initialization failed: {0}")]
    Init(String),
    #[error("Worker for {host} died: {reason}")]
    Worker { host: String, reason: String },
    #[error("Interrupted")]
    Interrupted,
    #[error("Lock-step session failed on {host}, aborting all hosts")]
    LockstepAbort { host: String },
}

/// Errors local to one host. Recorded on the host's record, never fatal to the batch.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("{0}")]
    Connect(String),
    #[error("ssh: {0}")]
    Ssh(#[from] openssh::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("command timed out or was interrupted while {phase}")]
    Interrupted { phase: Phase },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("failed to start local client: {0}")]
    Spawn(String),
    #[error("client exited with status {0} before the command reported one")]
    ClientFailed(i32),
    #[error("client killed by signal {0}")]
    Killed(i32),
}
