use tracing_subscriber::EnvFilter;

/// Filter for the given `-v` count. `RUST_LOG` takes precedence when set.
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    match verbosity {
        0 => EnvFilter::new("fanout_ssh=warn"),
        1 => EnvFilter::new("fanout_ssh=info"),
        2 => EnvFilter::new("fanout_ssh=debug"),
        _ => EnvFilter::new("fanout_ssh=trace,openssh=debug"),
    }
}

/// Logs go to stderr so they never mix with relayed remote output on stdout.
pub fn init_logging(verbosity: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(create_env_filter(verbosity))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_env_filter() {
        for verbosity in 0..4 {
            let _ = create_env_filter(verbosity);
        }
    }
}
