use crate::cli::LogLevel;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Build the fmt subscriber for `level`. `RUST_LOG` directives refine it.
pub fn subscriber<W>(level: LogLevel, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::builder()
        .with_default_directive(level.as_filter().into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .finish()
}

/// Install the stderr subscriber for the process. Later calls are no-ops.
pub fn init(level: LogLevel) {
    let _ = tracing::subscriber::set_global_default(subscriber(level, std::io::stderr));
}
