//! Copy mode.
//!
//! Sources are enumerated once, before any host is contacted, into a flat depth-first list.
//! Each host then streams that list to a remote `scp -t` sink over its one channel, waiting for
//! a one-byte acknowledgement after every record.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{DispatchError, HostError};
use crate::session::shell_quote;

#[derive(Debug, Clone)]
pub struct CopySpec {
    pub sources: Vec<PathBuf>,
    pub destination: String,
    /// Send modification/access times and keep modes.
    pub preserve: bool,
    pub recursive: bool,
}

impl CopySpec {
    /// The command that starts the receiving side on the remote host.
    pub fn sink_command(&self) -> String {
        let mut cmd = String::from("scp");
        if self.recursive {
            cmd.push_str(" -r");
        }
        if self.preserve {
            cmd.push_str(" -p");
        }
        cmd.push_str(" -t ");
        cmd.push_str(&shell_quote(&self.destination));
        cmd
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File { len: u64 },
    Directory,
    /// Leaves the directory opened by the matching `Directory` entry.
    EndDirectory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
    pub mtime: i64,
    pub atime: i64,
}

impl CopyEntry {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn enumeration_error(path: &Path, reason: impl ToString) -> DispatchError {
    DispatchError::Enumeration {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Expands the sources into the ordered list of records to send.
///
/// Every entry must be a readable regular file or directory; directories need `recursive`.
/// Any problem fails the whole dispatch.
pub fn enumerate_sources(spec: &CopySpec) -> Result<Vec<CopyEntry>, DispatchError> {
    let mut entries = Vec::new();
    for source in &spec.sources {
        visit(source, spec.recursive, &mut entries)?;
    }
    Ok(entries)
}

fn visit(path: &Path, recursive: bool, entries: &mut Vec<CopyEntry>) -> Result<(), DispatchError> {
    let meta = fs::metadata(path).map_err(|e| enumeration_error(path, e))?;
    if path.file_name().is_none() {
        return Err(enumeration_error(path, "cannot copy a path without a file name"));
    }
    let mode = meta.permissions().mode() & 0o7777;
    let entry = |kind| CopyEntry {
        path: path.to_path_buf(),
        kind,
        mode,
        mtime: meta.mtime(),
        atime: meta.atime(),
    };

    if meta.is_file() {
        fs::File::open(path).map_err(|e| enumeration_error(path, e))?;
        entries.push(entry(EntryKind::File { len: meta.len() }));
    } else if meta.is_dir() {
        if !recursive {
            return Err(enumeration_error(path, "is a directory (use -r)"));
        }
        let mut children = fs::read_dir(path)
            .map_err(|e| enumeration_error(path, e))?
            .map(|child| child.map(|c| c.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| enumeration_error(path, e))?;
        children.sort();
        entries.push(entry(EntryKind::Directory));
        for child in children {
            visit(&child, recursive, entries)?;
        }
        entries.push(entry(EntryKind::EndDirectory));
    } else {
        return Err(enumeration_error(
            path,
            "not a regular file or directory",
        ));
    }
    Ok(())
}

/// Reads one acknowledgement.
///
/// `0` is success. `1` is a warning whose message is passed to `on_warning`. `2` (or anything
/// else, or a read failure) is fatal for the host.
pub async fn read_ack<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    on_warning: &mut (dyn FnMut(&str) + Send),
) -> Result<(), HostError> {
    let code = reader
        .read_u8()
        .await
        .map_err(|e| HostError::Protocol(format!("lost connection waiting for ack: {}", e)))?;
    if code == 0 {
        return Ok(());
    }
    let mut message = String::new();
    reader.read_line(&mut message).await?;
    let message = message.trim_end();
    match code {
        1 => {
            on_warning(message);
            Ok(())
        }
        2 => Err(HostError::Protocol(message.to_string())),
        other => Err(HostError::Protocol(format!(
            "unexpected ack byte {} {}",
            other, message
        ))),
    }
}

/// Streams `entries` to a copy sink.
pub async fn send_entries<W, R>(
    writer: &mut W,
    reader: &mut BufReader<R>,
    entries: &[CopyEntry],
    preserve: bool,
    on_warning: &mut (dyn FnMut(&str) + Send),
) -> Result<(), HostError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    // The sink speaks first.
    read_ack(reader, on_warning).await?;
    for entry in entries {
        if preserve && entry.kind != EntryKind::EndDirectory {
            let times = format!("T{} 0 {} 0\n", entry.mtime, entry.atime);
            writer.write_all(times.as_bytes()).await?;
            writer.flush().await?;
            read_ack(reader, on_warning).await?;
        }
        let header = match entry.kind {
            EntryKind::Directory => format!("D{:04o} 0 {}\n", entry.mode, entry.name()),
            EntryKind::File { len } => format!("C{:04o} {} {}\n", entry.mode, len, entry.name()),
            EntryKind::EndDirectory => "E\n".to_string(),
        };
        writer.write_all(header.as_bytes()).await?;
        writer.flush().await?;
        read_ack(reader, on_warning).await?;

        if let EntryKind::File { len } = entry.kind {
            let file = tokio::fs::File::open(&entry.path).await?;
            let sent = tokio::io::copy(&mut file.take(len), writer).await?;
            if sent != len {
                return Err(HostError::Protocol(format!(
                    "{}: file shrank while copying",
                    entry.path.display()
                )));
            }
            writer.write_all(&[0]).await?;
            writer.flush().await?;
            read_ack(reader, on_warning).await?;
        }
        tracing::trace!(path = %entry.path.display(), "sent");
    }
    Ok(())
}
