use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber, writing to stderr.
///
/// `RUST_LOG` overrides the default filter. Stdout is left alone because the `parse` and
/// `resolve` commands print their results there.
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,arkroot=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
