//! Fanout scheduling.
//!
//! `dispatch` builds one `HostRecord` per target, then admits one worker task per host through a
//! `FanoutGate` so that at most `fanout` hosts are connecting or executing at any time. It waits
//! for every worker to finish and folds the records into a `DispatchOutcome`.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};

use colourado::{ColorPalette, PaletteType};
use futures::future::join_all;
use itertools::{Itertools, MinMaxResult};
use tokio::sync::Notify;
use tokio::time::Duration;

use crate::config::DispatchOptions;
use crate::error::DispatchError;
use crate::host::TargetList;
use crate::interrupt::{spawn_interrupt_handler, InterruptPolicy};
use crate::output::Console;
use crate::record::{HostRecord, Phase};
use crate::session::{HostSession, Payload};
use crate::status::with_status_probe;
use crate::template::{CommandTemplate, TemplateParams};
use crate::transfer::{enumerate_sources, CopyEntry};
use crate::watchdog::{spawn_watchdog, Timeouts};
use crate::worker::run_worker;

/// Aggregate exit code when any host failed and the maximum remote status was requested.
pub const FAILED_HOST_EXIT_CODE: i32 = 254;

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    peak: usize,
}

/// Bounds the number of live workers.
///
/// A counter under a mutex plus a notification that plays the role of a condition variable:
/// `admit` waits while the counter is at the limit, dropping an `Admission` decrements it and
/// wakes the waiters.
#[derive(Debug)]
pub struct FanoutGate {
    limit: usize,
    state: Mutex<GateState>,
    changed: Notify,
}

impl FanoutGate {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: limit.max(1),
            state: Mutex::new(GateState::default()),
            changed: Notify::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for a free slot and takes it.
    pub async fn admit(self: &Arc<Self>) -> Admission {
        loop {
            let changed = self.changed.notified();
            {
                let mut state = self.lock();
                if state.active < self.limit {
                    state.active += 1;
                    state.peak = state.peak.max(state.active);
                    return Admission(Arc::clone(self));
                }
            }
            changed.await;
        }
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.active -= 1;
        }
        self.changed.notify_waiters();
    }

    /// Waits until every admitted worker has released its slot.
    pub async fn drained(&self) {
        loop {
            let changed = self.changed.notified();
            if self.lock().active == 0 {
                return;
            }
            changed.await;
        }
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    /// Highest number of simultaneously admitted workers so far.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }
}

/// A slot in the gate. Released on drop, so a worker frees its slot on every exit path.
#[derive(Debug)]
pub struct Admission(Arc<FanoutGate>);

impl Drop for Admission {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// State shared by every task of one dispatch.
pub(crate) struct DispatchContext {
    pub records: Arc<[HostRecord]>,
    pub backend: Arc<dyn HostSession>,
    pub console: Console,
    pub options: DispatchOptions,
    pub labels: Vec<String>,
    pub copy_entries: Option<(Arc<[CopyEntry]>, bool)>,
    pub fatal: flume::Sender<DispatchError>,
    /// Set once a lock-step failure has started tearing the dispatch down.
    pub fleet_aborted: AtomicBool,
}

/// Final state of one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    pub hostname: String,
    pub phase: Phase,
    pub exit_code: Option<i32>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Process exit code for this dispatch.
    pub exit_code: i32,
    pub hosts: Vec<HostReport>,
    /// Highest number of hosts in flight at once.
    pub peak_concurrency: usize,
}

impl DispatchOutcome {
    pub fn failed(&self) -> impl Iterator<Item = &HostReport> {
        self.hosts.iter().filter(|h| h.phase == Phase::Failed)
    }
}

/// Exit code of a finished dispatch.
///
/// Without `max_status` this is always 0. With it, any failed host yields
/// `FAILED_HOST_EXIT_CODE`; otherwise the largest remote exit code wins.
pub fn aggregate(records: &[HostRecord], max_status: bool) -> i32 {
    if !max_status {
        return 0;
    }
    if records.iter().any(|r| r.phase() == Phase::Failed) {
        return FAILED_HOST_EXIT_CODE;
    }
    records
        .iter()
        .filter_map(HostRecord::exit_code)
        .max()
        .unwrap_or(0)
}

fn log_stats(name: &str, durations: impl Iterator<Item = Duration>) {
    let durations: Vec<Duration> = durations.collect();
    let (min, max) = match durations.iter().minmax() {
        MinMaxResult::NoElements => return,
        MinMaxResult::OneElement(d) => (*d, *d),
        MinMaxResult::MinMax(min, max) => (*min, *max),
    };
    let avg = durations.iter().sum::<Duration>() / durations.len() as u32;
    tracing::debug!(
        "{} time: min {:.3}s, avg {:.3}s, max {:.3}s",
        name,
        min.as_secs_f64(),
        avg.as_secs_f64(),
        max.as_secs_f64()
    );
}

fn remote_user<'a>(options: &'a DispatchOptions, host_user: Option<&'a str>) -> &'a str {
    host_user
        .or(options.remote_user.as_deref())
        .unwrap_or(&options.local_user)
}

/// Runs `payload` on every host of `targets`.
///
/// Per-host failures are recorded and reported, never returned. An `Err` means the whole
/// dispatch was aborted: resolution or enumeration failed up front, the user interrupted, or a
/// lock-step backend lost a host.
///
/// With `drop_failed` set, failed hosts are removed from `targets` afterwards.
pub async fn dispatch(
    targets: &mut TargetList,
    payload: &Payload,
    backend: Arc<dyn HostSession>,
    options: &DispatchOptions,
    console: &Console,
) -> Result<DispatchOutcome, DispatchError> {
    if targets.is_empty() {
        return Err(DispatchError::NoHosts);
    }
    let nhosts = targets.len();
    backend.init(options).await?;

    let (template, copy_entries) = match payload {
        Payload::Command(command) => (Some(CommandTemplate::new(command)?), None),
        Payload::Copy(spec) => {
            let entries: Arc<[CopyEntry]> = enumerate_sources(spec)?.into();
            (None, Some((entries, spec.preserve)))
        }
    };

    // Resolution and rendering happen here, one host at a time, before any worker exists.
    let mut records = Vec::with_capacity(nhosts);
    let mut commands = Vec::with_capacity(nhosts);
    for (index, host) in targets.hosts().iter().enumerate() {
        let address = backend.resolve(&host.hostname).await?;
        let user = remote_user(options, host.user.as_deref()).to_string();
        let command = match (&template, payload) {
            (Some(template), _) => {
                let rendered = template.render(&TemplateParams {
                    host: &host.hostname,
                    label: host.label(),
                    user: &user,
                    rank: index,
                    nhosts,
                    address: address.map(|a| a.to_string()),
                })?;
                if options.max_remote_status {
                    with_status_probe(&rendered)
                } else {
                    rendered
                }
            }
            (None, Payload::Copy(spec)) => spec.sink_command(),
            (None, Payload::Command(command)) => command.clone(),
        };
        commands.push(command);
        records.push(HostRecord::new(
            host.clone(),
            index,
            address,
            options.local_user.clone(),
            user,
            backend.kind(),
            options.display_labels,
        ));
    }
    let records: Arc<[HostRecord]> = records.into();

    let labels = if options.color_labels {
        let colors = ColorPalette::new(nhosts as u32, PaletteType::Pastel, false).colors;
        targets
            .hosts()
            .iter()
            .zip(colors)
            .map(|(host, color)| host.prettify(color).to_string())
            .collect()
    } else {
        targets
            .hosts()
            .iter()
            .map(|host| host.label().to_string())
            .collect()
    };

    let timeouts = Timeouts {
        connect: options.connect_timeout,
        command: options.command_timeout,
    };
    let (fatal_tx, fatal_rx) = flume::bounded(nhosts + 1);
    let policy = if options.batch {
        InterruptPolicy::Batch
    } else {
        InterruptPolicy::TwoStep
    };
    let interrupts = spawn_interrupt_handler(
        Arc::clone(&records),
        Arc::clone(&backend),
        console.clone(),
        policy,
        timeouts,
        fatal_tx.clone(),
    );
    let watchdog = spawn_watchdog(Arc::clone(&records), timeouts);

    let ctx = Arc::new(DispatchContext {
        records: Arc::clone(&records),
        backend,
        console: console.clone(),
        options: options.clone(),
        labels,
        copy_entries,
        fatal: fatal_tx,
        fleet_aborted: AtomicBool::new(false),
    });

    let limit = options.fanout_limit(nhosts);
    let gate = FanoutGate::new(limit);
    tracing::debug!(hosts = nhosts, fanout = limit, "dispatch started");

    let result = async {
        let mut workers = Vec::with_capacity(nhosts);
        for (index, command) in commands.into_iter().enumerate() {
            let admission = tokio::select! {
                biased;
                Ok(err) = fatal_rx.recv_async() => return Err(err),
                admission = gate.admit() => admission,
            };
            let ctx = Arc::clone(&ctx);
            workers.push(tokio::spawn(run_worker(ctx, index, command, admission)));
        }
        tokio::select! {
            biased;
            Ok(err) = fatal_rx.recv_async() => return Err(err),
            _ = gate.drained() => {}
        }
        for (index, joined) in join_all(workers).await.into_iter().enumerate() {
            if let Err(e) = joined {
                return Err(DispatchError::Worker {
                    host: records[index].hostname().to_string(),
                    reason: e.to_string(),
                });
            }
        }
        // A lock-step abort can land just as the last slot frees up.
        match fatal_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }
    .await;

    interrupts.abort();
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    result?;

    log_stats("connect", records.iter().filter_map(HostRecord::connect_duration));
    log_stats("command", records.iter().filter_map(HostRecord::execute_duration));
    let failures = records
        .iter()
        .filter(|r| r.phase() == Phase::Failed)
        .count();
    tracing::debug!(failures, peak = gate.peak(), "dispatch finished");

    if options.drop_failed {
        let keep: Vec<bool> = records
            .iter()
            .map(|r| r.phase() != Phase::Failed)
            .collect();
        targets.retain_indices(&keep);
    }

    Ok(DispatchOutcome {
        exit_code: aggregate(&records, options.max_remote_status),
        hosts: records
            .iter()
            .map(|r| HostReport {
                hostname: r.hostname().to_string(),
                phase: r.phase(),
                exit_code: r.exit_code(),
                failure: r.failure().map(String::from),
            })
            .collect(),
        peak_concurrency: gate.peak(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::session::ConnectionKind;

    fn finished(name: &str, phase: Phase, code: Option<i32>) -> HostRecord {
        let rec = HostRecord::new(
            Host::new(name.to_string()),
            0,
            None,
            "me".to_string(),
            "me".to_string(),
            ConnectionKind::Exec,
            true,
        );
        rec.advance(Phase::Connecting);
        if phase == Phase::Done || code.is_some() {
            rec.advance(Phase::Executing);
        }
        if let Some(code) = code {
            rec.set_exit_code(code);
        }
        rec.advance(phase);
        rec
    }

    #[test]
    fn test_aggregate_max_code() {
        let recs: Vec<_> = [0, 0, 3, 1]
            .iter()
            .enumerate()
            .map(|(i, &c)| finished(&format!("n{}", i), Phase::Done, Some(c)))
            .collect();
        assert_eq!(aggregate(&recs, true), 3);
        assert_eq!(aggregate(&recs, false), 0);
    }

    #[test]
    fn test_aggregate_failure_wins() {
        let recs = vec![
            finished("a", Phase::Done, Some(7)),
            finished("b", Phase::Failed, None),
        ];
        assert_eq!(aggregate(&recs, true), FAILED_HOST_EXIT_CODE);
        assert_eq!(aggregate(&recs, false), 0);
    }

    #[test]
    fn test_remote_user_precedence() {
        let mut options = DispatchOptions {
            local_user: "me".to_string(),
            ..Default::default()
        };
        assert_eq!(remote_user(&options, None), "me");
        options.remote_user = Some("ops".to_string());
        assert_eq!(remote_user(&options, None), "ops");
        assert_eq!(remote_user(&options, Some("root")), "root");
    }

    #[tokio::test]
    async fn test_gate_bounds_concurrency() {
        let gate = FanoutGate::new(2);
        let a = gate.admit().await;
        let _b = gate.admit().await;
        assert_eq!(gate.active(), 2);

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.admit().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(a);
        let _c = waiter.await.unwrap();
        assert_eq!(gate.active(), 2);
        assert_eq!(gate.peak(), 2);
    }

    #[tokio::test]
    async fn test_gate_drains() {
        let gate = FanoutGate::new(3);
        let held: Vec<_> = vec![gate.admit().await, gate.admit().await];
        let drain = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.drained().await })
        };
        tokio::task::yield_now().await;
        assert!(!drain.is_finished());
        drop(held);
        drain.await.unwrap();
        assert_eq!(gate.active(), 0);
    }
}
