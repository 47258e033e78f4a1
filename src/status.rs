//! Remote exit status recovery.
//!
//! When the caller wants remote exit codes, the dispatched command is suffixed with an `echo`
//! of a fixed marker followed by `$?`. The relay strips the marker from the displayed output and
//! keeps the number.

pub const EXIT_SENTINEL: &str = "__FANOUT_RC__:";

/// Status ssh exits with when it fails itself rather than passing on the remote command's.
pub const CLIENT_FAILURE_STATUS: i32 = 255;

/// Appends the exit status probe to `command`.
pub fn with_status_probe(command: &str) -> String {
    format!("{}; echo {}$?", command, EXIT_SENTINEL)
}

/// Splits a line into its displayable part and an embedded exit code.
///
/// Only the first marker in a line counts. A line without a marker comes back untouched.
pub fn extract_exit_status(line: &str) -> (&str, Option<i32>) {
    let Some(at) = line.find(EXIT_SENTINEL) else {
        return (line, None);
    };
    let display = &line[..at];
    let display = display.strip_suffix('\n').unwrap_or(display);
    let rest = line[at + EXIT_SENTINEL.len()..].trim_start();
    let end = rest
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    (display, rest[..end].parse().ok())
}
