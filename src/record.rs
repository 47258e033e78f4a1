//! Per-host state records.
//!
//! One `HostRecord` exists per target for the lifetime of a dispatch. Its mutable fields are
//! atomics or write-once cells: the owning worker is the only writer, while the watchdog and the
//! interrupt coordinator read them concurrently without taking locks.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use crate::host::Host;
use crate::session::{Backchannel, ConnectionKind};

/// Where a host is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    New = 0,
    Connecting = 1,
    Executing = 2,
    Done = 3,
    Failed = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Connecting,
            2 => Self::Executing,
            3 => Self::Done,
            _ => Self::Failed,
        }
    }

    /// Whether a worker holding this phase occupies a fanout slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Executing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Legal edges: New -> Connecting -> {Executing -> {Done, Failed}, Failed}.
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Connecting)
                | (Self::Connecting, Self::Executing)
                | (Self::Connecting, Self::Failed)
                | (Self::Executing, Self::Done)
                | (Self::Executing, Self::Failed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Executing => "executing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A level-triggered, one-shot abort request for a single worker.
///
/// Firing is idempotent. A worker that starts waiting after the abort was fired returns
/// immediately.
#[derive(Debug, Default)]
pub struct AbortSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolves once `fire` has been called.
    pub async fn fired(&self) {
        loop {
            // Register before checking the flag so a concurrent `fire` is not missed.
            let notified = self.notify.notified();
            if self.is_fired() {
                return;
            }
            notified.await;
        }
    }
}

const NO_EXIT_CODE: i32 = i32::MIN;

pub struct HostRecord {
    pub host: Host,
    /// Resolved before any worker starts, when the backend needs it.
    pub address: Option<IpAddr>,
    pub local_user: String,
    pub remote_user: String,
    pub connection_kind: ConnectionKind,
    /// Position in the target list, usable as a rank by commands.
    pub node_index: usize,
    pub display_labels: bool,
    phase: AtomicU8,
    started_at: OnceLock<Instant>,
    connected_at: OnceLock<Instant>,
    finished_at: OnceLock<Instant>,
    exit_code: AtomicI32,
    backchannel: OnceLock<Arc<dyn Backchannel>>,
    failure: OnceLock<String>,
    pub abort: AbortSignal,
}

impl HostRecord {
    pub fn new(
        host: Host,
        node_index: usize,
        address: Option<IpAddr>,
        local_user: String,
        remote_user: String,
        connection_kind: ConnectionKind,
        display_labels: bool,
    ) -> Self {
        Self {
            host,
            address,
            local_user,
            remote_user,
            connection_kind,
            node_index,
            display_labels,
            phase: AtomicU8::new(Phase::New as u8),
            started_at: OnceLock::new(),
            connected_at: OnceLock::new(),
            finished_at: OnceLock::new(),
            exit_code: AtomicI32::new(NO_EXIT_CODE),
            backchannel: OnceLock::new(),
            failure: OnceLock::new(),
            abort: AbortSignal::default(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.host.hostname
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Moves the record to `next`, stamping the matching timestamp.
    ///
    /// Returns `false` and leaves the record untouched if the edge is not legal, so a record
    /// can never regress or leave a terminal phase.
    pub fn advance(&self, next: Phase) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if !Phase::from_u8(current).can_advance_to(next) {
                return false;
            }
            match self.phase.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        let now = Instant::now();
        match next {
            Phase::Connecting => {
                let _ = self.started_at.set(now);
            }
            Phase::Executing => {
                let _ = self.connected_at.set(now);
            }
            Phase::Done | Phase::Failed => {
                let _ = self.finished_at.set(now);
            }
            Phase::New => {}
        }
        true
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at.get().copied()
    }

    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at.get().copied()
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at.get().copied()
    }

    /// Time spent establishing the session, if it was established.
    pub fn connect_duration(&self) -> Option<Duration> {
        Some(self.connected_at()? - self.started_at()?)
    }

    /// Time spent executing after the session was established.
    pub fn execute_duration(&self) -> Option<Duration> {
        Some(self.finished_at()? - self.connected_at()?)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.exit_code.load(Ordering::Acquire) {
            NO_EXIT_CODE => None,
            code => Some(code),
        }
    }

    pub fn set_exit_code(&self, code: i32) {
        if !self.phase().is_terminal() {
            self.exit_code.store(code, Ordering::Release);
        }
    }

    pub fn set_backchannel(&self, backchannel: Arc<dyn Backchannel>) {
        let _ = self.backchannel.set(backchannel);
    }

    pub fn backchannel(&self) -> Option<&Arc<dyn Backchannel>> {
        self.backchannel.get()
    }

    pub fn set_failure(&self, reason: String) {
        let _ = self.failure.set(reason);
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    /// Time left before the watchdog fires for this record, if a timeout applies.
    pub fn remaining(
        &self,
        now: Instant,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Option<Duration> {
        let (since, limit) = match self.phase() {
            Phase::Connecting => (self.started_at()?, connect_timeout),
            Phase::Executing => (self.connected_at()?, command_timeout),
            _ => return None,
        };
        if limit.is_zero() {
            return None;
        }
        Some(limit.saturating_sub(now.saturating_duration_since(since)))
    }
}

impl fmt::Debug for HostRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HostRecord")
            .field("host", &self.host.hostname)
            .field("node_index", &self.node_index)
            .field("phase", &self.phase())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}
