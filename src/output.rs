//! Output multiplexing.
//!
//! Every worker relays its host's streams line by line to the process-wide stdout and stderr.
//! Each line, label included, is written with a single `write_all` while the sink's lock is held,
//! so lines from different hosts never mix.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::error::HostError;
use crate::record::{HostRecord, Phase};
use crate::session::Reader;
use crate::status::extract_exit_status;

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Which shared stream a line goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// The shared, line-atomic console.
#[derive(Clone)]
pub struct Console {
    stdout: Sink,
    stderr: Sink,
}

impl Console {
    pub fn new(stdout: impl Write + Send + 'static, stderr: impl Write + Send + 'static) -> Self {
        Self {
            stdout: Arc::new(Mutex::new(Box::new(stdout))),
            stderr: Arc::new(Mutex::new(Box::new(stderr))),
        }
    }

    /// The process's real stdout and stderr.
    pub fn stdio() -> Self {
        Self::new(io::stdout(), io::stderr())
    }

    /// Writes `line` as one unit, prefixed with `label: ` when a label is given.
    pub fn write_line(&self, stream: Stream, label: Option<&str>, line: &str) -> io::Result<()> {
        let text = match label {
            Some(label) => format!("{}: {}\n", label, line),
            None => format!("{}\n", line),
        };
        let sink = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        let mut guard = sink.lock().unwrap_or_else(PoisonError::into_inner);
        guard.write_all(text.as_bytes())?;
        guard.flush()
    }

    /// A diagnostic line on stderr. Failures to write diagnostics are ignored.
    pub fn diagnostic(&self, line: &str) {
        let _ = self.write_line(Stream::Stderr, None, line);
    }
}

/// Reads newline-terminated lines from a stream.
///
/// Partial lines live in the reader itself, so dropping a pending `next_line` future (as
/// `tokio::select!` does) loses nothing.
pub struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            reader: BufReader::new(stream),
            buf: Vec::new(),
        }
    }

    /// Returns the next line without its terminator, or `None` at end of stream.
    ///
    /// A final line without a terminator is still returned.
    pub async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            let (done, used) = {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    (true, 0)
                } else if let Some(i) = memchr::memchr(b'\n', available) {
                    self.buf.extend_from_slice(&available[..i]);
                    (true, i + 1)
                } else {
                    self.buf.extend_from_slice(available);
                    (false, available.len())
                }
            };
            self.reader.consume(used);
            if done {
                return Ok(Some(std::mem::take(&mut self.buf)));
            }
        }
    }
}

async fn next_line_opt<R: AsyncRead + Unpin>(
    reader: &mut Option<LineReader<R>>,
) -> io::Result<Option<Vec<u8>>> {
    match reader {
        Some(reader) => reader.next_line().await,
        None => Ok(None),
    }
}

/// Relays one host's streams to the console until both reach end of stream.
pub struct Relay<'a> {
    pub record: &'a HostRecord,
    pub console: &'a Console,
    /// Label printed in front of each line, if labels are on.
    pub label: Option<&'a str>,
    /// Route the host's stderr to the shared stderr (otherwise to stdout).
    pub separate_stderr: bool,
    /// Whether the command carries the exit status probe.
    pub extract_status: bool,
}

impl Relay<'_> {
    pub async fn run(&self, stdout: Reader, stderr: Option<Reader>) -> Result<(), HostError> {
        let mut out = Some(LineReader::new(stdout));
        let mut err = stderr.map(LineReader::new);

        while out.is_some() || err.is_some() {
            tokio::select! {
                biased;
                _ = self.record.abort.fired() => {
                    return Err(HostError::Interrupted { phase: Phase::Executing });
                }
                line = next_line_opt(&mut out), if out.is_some() => match line? {
                    Some(line) => self.emit_stdout(&line)?,
                    None => out = None,
                },
                line = next_line_opt(&mut err), if err.is_some() => match line? {
                    Some(line) => self.emit_stderr(&line)?,
                    None => err = None,
                },
            }
        }
        Ok(())
    }

    fn emit_stdout(&self, line: &[u8]) -> Result<(), HostError> {
        let text = String::from_utf8_lossy(line);
        let (display, code) = if self.extract_status {
            extract_exit_status(&text)
        } else {
            (text.as_ref(), None)
        };
        if let Some(code) = code {
            tracing::debug!(host = self.record.hostname(), code, "remote exit status");
            self.record.set_exit_code(code);
        }
        if !display.is_empty() {
            self.console.write_line(Stream::Stdout, self.label, display)?;
        }
        Ok(())
    }

    fn emit_stderr(&self, line: &[u8]) -> Result<(), HostError> {
        if line.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(line);
        let stream = if self.separate_stderr {
            Stream::Stderr
        } else {
            Stream::Stdout
        };
        self.console.write_line(stream, self.label, &text)?;
        Ok(())
    }
}
