//! Configuration for Fanout.
//!
//! Holds the clap structs for command line arguments and flags, and `DispatchOptions`, the
//! plain settings struct the library works from.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::exec::DEFAULT_EXEC_TEMPLATE;
use crate::session::ConnectionKind;

pub const DEFAULT_FANOUT: usize = 32;
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    /// Target hosts, comma separated (`user@host` allowed). May be repeated
    #[arg(long, short = 'w', value_name = "HOSTS")]
    pub hosts: Vec<String>,

    /// YAML file listing target hosts
    #[arg(long)]
    pub hosts_file: Option<String>,

    /// Hosts to exclude, comma separated. May be repeated
    #[arg(long, short = 'x', value_name = "HOSTS")]
    pub exclude: Vec<String>,

    /// Maximum number of hosts handled at once. 0 means no limit
    #[arg(long, short = 'f', default_value_t = DEFAULT_FANOUT)]
    pub fanout: usize,

    /// Seconds allowed for establishing a session. 0 disables the limit
    #[arg(long, short = 't', default_value_t = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: u64,

    /// Seconds allowed for the remote command once connected. 0 disables the limit
    #[arg(long, short = 'u', default_value_t = 0)]
    pub command_timeout: u64,

    /// Remote user name
    #[arg(long, short = 'l')]
    pub user: Option<String>,

    /// Connection backend
    #[arg(long, short = 'R', value_enum, default_value_t = ConnectionKind::Ssh)]
    pub rcmd: ConnectionKind,

    /// (exec backend) Local client command template
    #[arg(long, default_value = DEFAULT_EXEC_TEMPLATE)]
    pub exec_template: String,

    /// (exec backend) Abort every host as soon as one host fails
    #[arg(long)]
    pub lockstep: bool,

    /// Exit with the largest remote exit status
    #[arg(short = 'S', long = "max-status")]
    pub max_status: bool,

    /// Don't prefix output lines with host names
    #[arg(short = 'N', long = "no-labels")]
    pub no_labels: bool,

    /// Keep remote stderr on local stderr instead of merging it into stdout
    #[arg(long, short = 's')]
    pub separate_stderr: bool,

    /// Color host labels
    #[arg(long)]
    pub color: bool,

    /// Abort on the first Ctrl-C instead of printing host status
    #[arg(long, short = 'b')]
    pub batch: bool,

    /// Run the dispatch this many times
    #[arg(long, default_value_t = 1)]
    pub passes: usize,

    /// Drop hosts that failed before the next pass
    #[arg(long)]
    pub drop_failed: bool,

    /// More logging (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
    /// Run a command on every host
    Exec {
        /// Command to run. Handlebars parameters: host, label, user, rank, nhosts, address
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Copy local files to every host
    Copy {
        /// Preserve modification times and modes
        #[arg(long, short)]
        preserve: bool,
        /// Copy directories recursively
        #[arg(long, short)]
        recursive: bool,
        /// Local sources
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        /// Remote destination
        destination: String,
    },
}

/// Settings for one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Maximum concurrent hosts; 0 means unlimited.
    pub fanout: usize,
    /// Zero disables the limit.
    pub connect_timeout: Duration,
    /// Zero disables the limit.
    pub command_timeout: Duration,
    pub separate_stderr: bool,
    pub display_labels: bool,
    pub color_labels: bool,
    pub batch: bool,
    pub max_remote_status: bool,
    pub drop_failed: bool,
    pub local_user: String,
    pub remote_user: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT),
            command_timeout: Duration::ZERO,
            separate_stderr: true,
            display_labels: true,
            color_labels: false,
            batch: false,
            max_remote_status: false,
            drop_failed: false,
            local_user: local_user(),
            remote_user: None,
        }
    }
}

impl DispatchOptions {
    /// The effective concurrency limit for `targets` hosts.
    pub fn fanout_limit(&self, targets: usize) -> usize {
        let limit = if self.fanout == 0 {
            targets
        } else {
            self.fanout.min(targets)
        };
        limit.max(1)
    }
}

impl From<&Config> for DispatchOptions {
    fn from(cli: &Config) -> Self {
        Self {
            fanout: cli.fanout,
            connect_timeout: Duration::from_secs(cli.connect_timeout),
            command_timeout: Duration::from_secs(cli.command_timeout),
            separate_stderr: cli.separate_stderr,
            display_labels: !cli.no_labels,
            color_labels: cli.color,
            batch: cli.batch,
            max_remote_status: cli.max_status,
            drop_failed: cli.drop_failed,
            local_user: local_user(),
            remote_user: cli.user.clone(),
        }
    }
}

/// Name of the invoking user.
pub fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}
