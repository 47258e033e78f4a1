//! Target hosts.
//!
//! One remote session is opened for one `Host`. Each session runs in its own tokio task,
//! concurrently with the other hosts up to the fanout limit.

use std::fmt;
use std::fs::File;

use colored::*;
use colourado::Color;
use serde::Deserialize;

use crate::error::DispatchError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Hostname (or ssh alias) to connect to.
    pub hostname: String,
    /// Remote user for this host only; overrides the dispatch-wide user.
    pub user: Option<String>,
}

impl Host {
    pub fn new(hostname: String) -> Self {
        Self {
            hostname,
            user: None,
        }
    }

    /// Parses `host` or `user@host`.
    pub fn parse(spec: &str) -> Self {
        match spec.rsplit_once('@') {
            Some((user, hostname)) if !user.is_empty() => Self {
                hostname: hostname.to_string(),
                user: Some(user.to_string()),
            },
            _ => Self::new(spec.to_string()),
        }
    }

    /// The name printed in front of each output line.
    ///
    /// Truncated at the first `.`, except for numeric addresses which are kept whole.
    pub fn label(&self) -> &str {
        let numeric = self
            .hostname
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.');
        if numeric {
            return &self.hostname;
        }
        match self.hostname.find('.') {
            Some(dot) => &self.hostname[..dot],
            None => &self.hostname,
        }
    }

    /// For pretty-printing the label with a palette color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        self.label().truecolor(r, g, b)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}@{}", user, self.hostname),
            None => write!(f, "{}", self.hostname),
        }
    }
}

/// The ordered list of hosts a dispatch runs against. Duplicates are allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetList(Vec<Host>);

impl TargetList {
    pub fn new(hosts: Vec<Host>) -> Self {
        Self(hosts)
    }

    pub fn hosts(&self) -> &[Host] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend(&mut self, hosts: impl IntoIterator<Item = Host>) {
        self.0.extend(hosts);
    }

    /// Removes every host whose hostname is in `names`.
    pub fn exclude(&mut self, names: &[String]) {
        self.0.retain(|host| !names.contains(&host.hostname));
    }

    /// Keeps only the entries at the given positions, in order.
    pub fn retain_indices(&mut self, keep: &[bool]) {
        let mut flags = keep.iter();
        self.0.retain(|_| flags.next().copied().unwrap_or(true));
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.0.iter().map(|h| h.hostname.as_str()).collect()
    }
}

impl FromIterator<Host> for TargetList {
    fn from_iter<I: IntoIterator<Item = Host>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Splits a `-w` argument (`a,b,user@c`) into hosts.
pub fn parse_host_list(list: &str) -> Vec<Host> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Host::parse)
        .collect()
}

/// A hosts file entry: either a bare hostname or a mapping.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HostSpec {
    Bare(String),
    Mapping {
        hostname: String,
        #[serde(default)]
        user: Option<String>,
    },
}

impl From<HostSpec> for Host {
    fn from(spec: HostSpec) -> Self {
        match spec {
            HostSpec::Bare(name) => Host::parse(&name),
            HostSpec::Mapping { hostname, user } => Host { hostname, user },
        }
    }
}

/// Reads a YAML list of hosts.
pub fn get_hosts(hosts_file: &str) -> Result<Vec<Host>, DispatchError> {
    let hosts_fd = File::open(hosts_file).map_err(|e| DispatchError::HostsFile {
        path: hosts_file.to_string(),
        reason: e.to_string(),
    })?;
    let specs: Vec<HostSpec> =
        serde_yaml::from_reader(hosts_fd).map_err(|e| DispatchError::HostsFile {
            path: hosts_file.to_string(),
            reason: e.to_string(),
        })?;
    let hosts: Vec<Host> = specs.into_iter().map(Host::from).collect();
    tracing::debug!(count = hosts.len(), file = hosts_file, "hosts loaded");
    Ok(hosts)
}
