//! Ctrl-C handling.
//!
//! A dedicated task receives interrupts. The first one lists the hosts still in flight; a second
//! one within `INTERRUPT_WINDOW` forwards SIGTERM to every executing host and aborts the
//! dispatch. In batch mode the first interrupt already aborts.

use std::sync::Arc;

use colored::*;
use nix::sys::signal::Signal;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::error::DispatchError;
use crate::output::Console;
use crate::record::{HostRecord, Phase};
use crate::session::HostSession;
use crate::watchdog::Timeouts;

pub const INTERRUPT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptPolicy {
    /// Report on the first interrupt, abort on a second one within the window.
    TwoStep,
    /// Abort on the first interrupt.
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    Report,
    Terminate,
}

/// Decides what each interrupt means.
#[derive(Debug)]
pub struct InterruptCoordinator {
    policy: InterruptPolicy,
    last_interrupt: Option<Instant>,
}

impl InterruptCoordinator {
    pub fn new(policy: InterruptPolicy) -> Self {
        Self {
            policy,
            last_interrupt: None,
        }
    }

    pub fn on_interrupt(&mut self, now: Instant) -> InterruptAction {
        if self.policy == InterruptPolicy::Batch {
            return InterruptAction::Terminate;
        }
        let previous = self.last_interrupt.replace(now);
        match previous {
            Some(at) if now.saturating_duration_since(at) < INTERRUPT_WINDOW => {
                InterruptAction::Terminate
            }
            _ => InterruptAction::Report,
        }
    }
}

/// One line per host still connecting or executing.
pub fn status_lines(
    records: &[HostRecord],
    timeouts: &Timeouts,
    now: Instant,
    verbose: bool,
) -> Vec<String> {
    records
        .iter()
        .filter(|record| record.phase().is_active())
        .map(|record| {
            let mut line = format!("{}: {}", record.hostname(), record.phase());
            if verbose {
                if let Some(left) = record.remaining(now, timeouts.connect, timeouts.command) {
                    line.push_str(&format!(" ({}s left)", left.as_secs()));
                }
            }
            line
        })
        .collect()
}

/// Sends SIGTERM to the remote side of every executing host. Returns how many were signalled.
pub async fn terminate_remote(records: &[HostRecord], backend: &dyn HostSession) -> usize {
    let mut signalled = 0;
    for record in records {
        if record.phase() != Phase::Executing {
            continue;
        }
        match backend
            .signal(record.backchannel(), Signal::SIGTERM as i32)
            .await
        {
            Ok(()) => signalled += 1,
            Err(e) => tracing::warn!(host = record.hostname(), "failed to forward signal: {}", e),
        }
    }
    signalled
}

/// Runs the interrupt task for one dispatch. On termination the fatal error is sent on `fatal`.
pub fn spawn_interrupt_handler(
    records: Arc<[HostRecord]>,
    backend: Arc<dyn HostSession>,
    console: Console,
    policy: InterruptPolicy,
    timeouts: Timeouts,
    fatal: flume::Sender<DispatchError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut coordinator = InterruptCoordinator::new(policy);
        let verbose = tracing::enabled!(tracing::Level::DEBUG);
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("cannot listen for interrupts: {}", e);
                return;
            }
            let now = Instant::now();
            match coordinator.on_interrupt(now) {
                InterruptAction::Report => {
                    console.diagnostic(&format!(
                        "{}",
                        "interrupt (one more within 1 sec to abort)".bold()
                    ));
                    for line in status_lines(&records, &timeouts, now, verbose) {
                        console.diagnostic(&line);
                    }
                }
                InterruptAction::Terminate => {
                    let signalled = terminate_remote(&records, backend.as_ref()).await;
                    tracing::info!(signalled, "interrupted, terminating");
                    console.diagnostic(&format!("{}", "interrupted, aborting".red()));
                    for record in records.iter() {
                        record.abort.fire();
                    }
                    let _ = fatal.send_async(DispatchError::Interrupted).await;
                    return;
                }
            }
        }
    })
}
