//! Timeout enforcement.
//!
//! The watchdog never changes a record. It only fires the record's abort signal; the worker
//! notices at its next suspension point and fails the host.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

use crate::record::{HostRecord, Phase};

/// Pause between scans after the first one.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(2);

/// How far past the connect timeout the first scan runs. Deadlines are exclusive, so a scan at
/// exactly the timeout could never catch the hosts admitted first.
pub const FIRST_SCAN_SLACK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Zero disables the limit.
    pub connect: Duration,
    /// Zero disables the limit.
    pub command: Duration,
}

impl Timeouts {
    pub fn is_disabled(&self) -> bool {
        self.connect.is_zero() && self.command.is_zero()
    }

    /// Whether `record` has overstayed its current phase at `now`.
    pub fn expired(&self, record: &HostRecord, now: Instant) -> bool {
        match record.phase() {
            Phase::Connecting if !self.connect.is_zero() => record
                .started_at()
                .is_some_and(|at| now.saturating_duration_since(at) > self.connect),
            Phase::Executing if !self.command.is_zero() => record
                .connected_at()
                .is_some_and(|at| now.saturating_duration_since(at) > self.command),
            _ => false,
        }
    }
}

/// Fires the abort of every record past its deadline. Returns how many fired.
pub fn scan(records: &[HostRecord], timeouts: &Timeouts, now: Instant) -> usize {
    let mut fired = 0;
    for record in records {
        if !record.abort.is_fired() && timeouts.expired(record, now) {
            tracing::info!(
                host = record.hostname(),
                phase = %record.phase(),
                "timed out, aborting"
            );
            record.abort.fire();
            fired += 1;
        }
    }
    fired
}

/// Starts the watchdog task. Returns `None` when no timeout is set.
///
/// Nothing can expire before the connect timeout, so the first scan waits for it.
pub fn spawn_watchdog(records: Arc<[HostRecord]>, timeouts: Timeouts) -> Option<JoinHandle<()>> {
    if timeouts.is_disabled() {
        return None;
    }
    let first = if timeouts.connect.is_zero() {
        SCAN_INTERVAL
    } else {
        timeouts.connect + FIRST_SCAN_SLACK
    };
    Some(tokio::spawn(async move {
        time::sleep(first).await;
        loop {
            scan(&records, &timeouts, Instant::now());
            time::sleep(SCAN_INTERVAL).await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::session::ConnectionKind;

    fn records(n: usize) -> Arc<[HostRecord]> {
        (0..n)
            .map(|i| {
                HostRecord::new(
                    Host::new(format!("node{}", i)),
                    i,
                    None,
                    "me".to_string(),
                    "me".to_string(),
                    ConnectionKind::Exec,
                    true,
                )
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_fires_only_expired_phases() {
        let recs = records(4);
        let timeouts = Timeouts {
            connect: Duration::from_secs(5),
            command: Duration::from_secs(10),
        };
        // 0: stuck connecting, 1: executing briefly, 2: executing too long, 3: never started.
        recs[0].advance(Phase::Connecting);
        recs[2].advance(Phase::Connecting);
        recs[2].advance(Phase::Executing);
        time::advance(Duration::from_secs(6)).await;
        recs[1].advance(Phase::Connecting);
        recs[1].advance(Phase::Executing);

        assert_eq!(scan(&recs, &timeouts, Instant::now()), 1);
        assert!(recs[0].abort.is_fired());
        assert!(!recs[1].abort.is_fired());
        assert!(!recs[2].abort.is_fired());

        time::advance(Duration::from_secs(5)).await;
        assert_eq!(scan(&recs, &timeouts, Instant::now()), 1);
        assert!(recs[2].abort.is_fired());
        assert!(!recs[3].abort.is_fired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_command_timeout_never_fires() {
        let recs = records(1);
        let timeouts = Timeouts {
            connect: Duration::from_secs(1),
            command: Duration::ZERO,
        };
        recs[0].advance(Phase::Connecting);
        recs[0].advance(Phase::Executing);
        time::advance(Duration::from_secs(3600)).await;
        assert_eq!(scan(&recs, &timeouts, Instant::now()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_task_aborts_stuck_connect() {
        let recs = records(1);
        recs[0].advance(Phase::Connecting);
        let handle = spawn_watchdog(
            Arc::clone(&recs),
            Timeouts {
                connect: Duration::from_secs(5),
                command: Duration::ZERO,
            },
        )
        .unwrap();
        recs[0].abort.fired().await;
        let waited = Instant::now() - recs[0].started_at().unwrap();
        assert!(waited > Duration::from_secs(5));
        // Caught by the first scan, not the one after it.
        assert!(waited <= Duration::from_secs(5) + FIRST_SCAN_SLACK);
        handle.abort();
    }

    #[test]
    fn test_disabled() {
        let timeouts = Timeouts {
            connect: Duration::ZERO,
            command: Duration::ZERO,
        };
        assert!(timeouts.is_disabled());
    }
}
