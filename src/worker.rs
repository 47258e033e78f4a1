//! The per-host task.
//!
//! A worker owns its host's record for writing. It walks the record through
//! `Connecting -> Executing -> Done`, or to `Failed` from either of the first two, relays the
//! session's output and frees its fanout slot when it returns.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::BufReader;

use crate::error::{DispatchError, HostError};
use crate::interrupt::terminate_remote;
use crate::output::Relay;
use crate::record::{HostRecord, Phase};
use crate::scheduler::{Admission, DispatchContext};
use crate::session::{Channel, OpenRequest, Termination};
use crate::status::CLIENT_FAILURE_STATUS;
use crate::transfer::send_entries;

pub(crate) async fn run_worker(
    ctx: Arc<DispatchContext>,
    index: usize,
    command: String,
    _admission: Admission,
) {
    let record = &ctx.records[index];
    record.advance(Phase::Connecting);
    tracing::debug!(host = record.hostname(), rank = index, "connecting");

    match connect_and_run(&ctx, index, &command).await {
        Ok(()) => {
            record.advance(Phase::Done);
            tracing::debug!(
                host = record.hostname(),
                exit_code = ?record.exit_code(),
                "done"
            );
        }
        Err(e) => {
            record.set_failure(e.to_string());
            record.advance(Phase::Failed);
            tracing::debug!(host = record.hostname(), error = %e, "failed");
            ctx.console
                .diagnostic(&format!("{}: {}", record.hostname(), e));
            if ctx.backend.lockstep() {
                abort_fleet(&ctx, record).await;
            }
        }
    }
}

async fn connect_and_run(
    ctx: &DispatchContext,
    index: usize,
    command: &str,
) -> Result<(), HostError> {
    let record = &ctx.records[index];
    let request = OpenRequest {
        host: record.hostname(),
        address: record.address,
        local_user: &record.local_user,
        remote_user: &record.remote_user,
        command,
        node_index: record.node_index,
        nhosts: ctx.records.len(),
        want_error_channel: ctx.options.separate_stderr,
        want_input: ctx.copy_entries.is_some(),
    };

    let channel = tokio::select! {
        biased;
        _ = record.abort.fired() => {
            return Err(HostError::Interrupted { phase: Phase::Connecting });
        }
        opened = ctx.backend.open(&request) => opened?,
    };
    record.advance(Phase::Executing);
    if let Some(backchannel) = &channel.backchannel {
        record.set_backchannel(Arc::clone(backchannel));
    }
    tracing::debug!(host = record.hostname(), "executing");

    let Channel {
        stdout,
        stderr,
        stdin,
        reaper,
        ..
    } = channel;
    let relay = Relay {
        record,
        console: &ctx.console,
        label: record.display_labels.then(|| ctx.labels[index].as_str()),
        separate_stderr: ctx.options.separate_stderr,
        extract_status: ctx.options.max_remote_status && ctx.copy_entries.is_none(),
    };

    match &ctx.copy_entries {
        None => relay.run(stdout, stderr).await?,
        Some((entries, preserve)) => {
            let mut stdin = stdin.ok_or_else(|| {
                HostError::Protocol("session has no input stream".to_string())
            })?;
            let mut reader = BufReader::new(stdout);
            let mut on_warning = |message: &str| {
                tracing::warn!(host = record.hostname(), "{}", message);
                ctx.console
                    .diagnostic(&format!("{}: {}", record.hostname(), message));
            };
            tokio::select! {
                biased;
                _ = record.abort.fired() => {
                    return Err(HostError::Interrupted { phase: Phase::Executing });
                }
                sent = send_entries(&mut stdin, &mut reader, entries, *preserve, &mut on_warning) => sent?,
            }
            // Closing our end lets the sink exit.
            drop(stdin);
            relay.run(Box::new(reader), stderr).await?;
        }
    }

    match reaper.reap().await? {
        Termination::Signaled(signo) => Err(HostError::Killed(signo)),
        // A code from the status probe outranks whatever the client says.
        Termination::Exited(_) if record.exit_code().is_some() => Ok(()),
        Termination::Exited(CLIENT_FAILURE_STATUS) => {
            Err(HostError::ClientFailed(CLIENT_FAILURE_STATUS))
        }
        Termination::Exited(code) => {
            record.set_exit_code(code);
            Ok(())
        }
        Termination::Unknown => Ok(()),
    }
}

/// Takes down the whole dispatch after a lock-step host failed.
async fn abort_fleet(ctx: &DispatchContext, failed: &HostRecord) {
    if ctx.fleet_aborted.swap(true, Ordering::SeqCst) {
        return;
    }
    let signalled = terminate_remote(&ctx.records, ctx.backend.as_ref()).await;
    tracing::info!(host = failed.hostname(), signalled, "lock-step failure");
    for record in ctx.records.iter() {
        record.abort.fire();
    }
    let _ = ctx
        .fatal
        .send_async(DispatchError::LockstepAbort {
            host: failed.hostname().to_string(),
        })
        .await;
}
