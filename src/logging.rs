use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Maps the `-v` count to a default filter and installs the subscriber.
/// `RUST_LOG` wins over the command line when set. Log output goes to
/// stderr so that session replies on stdout stay machine-readable.
pub fn init(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}
