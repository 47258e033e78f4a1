//! Scripted session backend shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::Duration;

use fanout_ssh::status::EXIT_SENTINEL;
use fanout_ssh::{
    parse_host_list, Backchannel, Channel, ConnectionKind, Console, DispatchError,
    DispatchOptions, HostError, HostSession, OpenRequest, Reaper, TargetList, Termination,
};

/// Console sink that keeps everything in memory.
#[derive(Clone, Default)]
pub struct Buffer(pub Arc<Mutex<Vec<u8>>>);

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Buffer {
    pub fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

/// How a mock host behaves.
#[derive(Debug, Clone)]
pub enum Script {
    /// Connects after `connect`, prints `stdout`, runs for `run`, then exits with `code`.
    Run {
        connect: Duration,
        run: Duration,
        stdout: String,
        code: i32,
    },
    /// Connects after `connect`, then never finishes.
    HangRunning { connect: Duration },
    /// Never finishes connecting.
    HangConnecting,
    /// Refuses the connection after `connect`.
    Refuse { connect: Duration },
    /// Acts as a copy sink.
    Sink,
}

impl Script {
    pub fn quick(stdout: &str, code: i32) -> Self {
        Self::Run {
            connect: Duration::from_millis(10),
            run: Duration::from_millis(10),
            stdout: stdout.to_string(),
            code,
        }
    }
}

#[derive(Default)]
pub struct Probe {
    pub live: AtomicUsize,
    pub peak: AtomicUsize,
    pub signals: Mutex<Vec<(String, i32)>>,
    pub commands: Mutex<Vec<(String, String)>>,
    pub transcript: Mutex<Vec<String>>,
}

impl Probe {
    fn enter(&self) {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock session backend that doesn't touch the network.
pub struct MockSession {
    scripts: HashMap<String, Script>,
    pub probe: Arc<Probe>,
    lockstep: bool,
}

impl MockSession {
    pub fn new(scripts: &[(&str, Script)]) -> Self {
        Self {
            scripts: scripts
                .iter()
                .map(|(host, script)| (host.to_string(), script.clone()))
                .collect(),
            probe: Arc::new(Probe::default()),
            lockstep: false,
        }
    }

    pub fn lockstep(mut self) -> Self {
        self.lockstep = true;
        self
    }
}

struct MockBackchannel {
    host: String,
    probe: Arc<Probe>,
}

#[async_trait]
impl Backchannel for MockBackchannel {
    async fn signal(&self, signo: i32) -> Result<(), HostError> {
        self.probe
            .signals
            .lock()
            .unwrap()
            .push((self.host.clone(), signo));
        Ok(())
    }
}

/// Counts the session as finished once dropped.
struct LiveGuard(Option<Arc<Probe>>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if let Some(probe) = self.0.take() {
            probe.leave();
        }
    }
}

#[async_trait]
impl Reaper for LiveGuard {
    async fn reap(self: Box<Self>) -> Result<Termination, HostError> {
        Ok(Termination::Unknown)
    }
}

#[async_trait]
impl HostSession for MockSession {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Exec
    }

    async fn resolve(&self, _host: &str) -> Result<Option<IpAddr>, DispatchError> {
        Ok(None)
    }

    async fn open(&self, request: &OpenRequest<'_>) -> Result<Channel, HostError> {
        let script = self
            .scripts
            .get(request.host)
            .cloned()
            .unwrap_or_else(|| Script::quick("", 0));
        self.probe
            .commands
            .lock()
            .unwrap()
            .push((request.host.to_string(), request.command.to_string()));
        self.probe.enter();
        let guard = LiveGuard(Some(Arc::clone(&self.probe)));
        let backchannel = Arc::new(MockBackchannel {
            host: request.host.to_string(),
            probe: Arc::clone(&self.probe),
        });

        match script {
            Script::Run {
                connect,
                run,
                stdout,
                code,
            } => {
                tokio::time::sleep(connect).await;
                let mut output = stdout;
                if request.command.contains(EXIT_SENTINEL) {
                    output.push_str(&format!("{}{}\n", EXIT_SENTINEL, code));
                }
                let (mut remote, local) = tokio::io::duplex(4096);
                tokio::spawn(async move {
                    remote.write_all(output.as_bytes()).await.unwrap();
                    tokio::time::sleep(run).await;
                });
                Ok(Channel::new(local)
                    .with_backchannel(backchannel)
                    .with_reaper(guard))
            }
            Script::HangRunning { connect } => {
                tokio::time::sleep(connect).await;
                let (remote, local) = tokio::io::duplex(64);
                // Keep the remote end open forever.
                std::mem::forget(remote);
                Ok(Channel::new(local)
                    .with_backchannel(backchannel)
                    .with_reaper(guard))
            }
            Script::HangConnecting => {
                let _guard = guard;
                std::future::pending::<Result<Channel, HostError>>().await
            }
            Script::Refuse { connect } => {
                let _guard = guard;
                tokio::time::sleep(connect).await;
                Err(HostError::Connect("connection refused".to_string()))
            }
            Script::Sink => {
                let (to_sink, sink_in) = tokio::io::duplex(64 * 1024);
                let (sink_out, from_sink) = tokio::io::duplex(64 * 1024);
                let probe = Arc::clone(&self.probe);
                tokio::spawn(run_sink(sink_in, sink_out, probe));
                Ok(Channel::new(from_sink)
                    .with_stdin(to_sink)
                    .with_backchannel(backchannel)
                    .with_reaper(guard))
            }
        }
    }

    fn lockstep(&self) -> bool {
        self.lockstep
    }
}

/// A minimal `scp -t` receiver that records every record it sees.
async fn run_sink(
    input: tokio::io::DuplexStream,
    mut output: tokio::io::DuplexStream,
    probe: Arc<Probe>,
) {
    let mut input = BufReader::new(input);
    output.write_all(&[0]).await.unwrap();
    loop {
        let mut line = String::new();
        if input.read_line(&mut line).await.unwrap() == 0 {
            break;
        }
        let line = line.trim_end().to_string();
        probe.transcript.lock().unwrap().push(line.clone());
        output.write_all(&[0]).await.unwrap();
        if let Some(header) = line.strip_prefix('C') {
            let len: usize = header.split(' ').nth(1).unwrap().parse().unwrap();
            let mut data = vec![0u8; len + 1];
            input.read_exact(&mut data).await.unwrap();
            assert_eq!(data.pop(), Some(0));
            probe
                .transcript
                .lock()
                .unwrap()
                .push(format!("<data {}>", String::from_utf8(data).unwrap()));
            output.write_all(&[0]).await.unwrap();
        }
    }
}

pub fn options(fanout: usize) -> DispatchOptions {
    DispatchOptions {
        fanout,
        connect_timeout: Duration::from_secs(5),
        command_timeout: Duration::ZERO,
        local_user: "tester".to_string(),
        ..Default::default()
    }
}

pub fn console() -> (Console, Buffer, Buffer) {
    let out = Buffer::default();
    let err = Buffer::default();
    (Console::new(out.clone(), err.clone()), out, err)
}

pub fn targets(list: &str) -> TargetList {
    parse_host_list(list).into_iter().collect()
}
