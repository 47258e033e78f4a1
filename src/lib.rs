//! Fanout: A Parallel Remote Command Dispatcher.

// Command line arguments and dispatch settings.
pub mod config;
// Error handling.
pub mod error;
// Local-client connection backend.
pub mod exec;
// How to parse and represent hosts.
pub mod host;
// Ctrl-C handling.
pub mod interrupt;
// Tracing setup.
pub mod logging;
// Line-atomic output relay.
pub mod output;
// Per-host state records.
pub mod record;
// Fanout scheduling.
pub mod scheduler;
// Remote session capability.
pub mod session;
// OpenSSH connection backend.
pub mod ssh;
// Remote exit status recovery.
pub mod status;
// Per-host command templates.
pub mod template;
// Copy mode.
pub mod transfer;
// Timeout enforcement.
pub mod watchdog;
// The per-host task.
mod worker;

pub use config::{Config, DispatchOptions};
pub use error::{DispatchError, HostError};
pub use host::{get_hosts, parse_host_list, Host, TargetList};
pub use output::Console;
pub use record::{HostRecord, Phase};
pub use scheduler::{dispatch, DispatchOutcome, HostReport, FAILED_HOST_EXIT_CODE};
pub use session::{
    Backchannel, Channel, ConnectionKind, HostSession, OpenRequest, Payload, Reaper, Termination,
};
pub use transfer::CopySpec;
