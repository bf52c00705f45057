use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize the process-wide tracing subscriber.
///
/// Configuration is via `RUST_LOG` (standard `tracing_subscriber::EnvFilter`
/// syntax, default `info`). The connect-log lines of spec §6 are emitted as
/// `info`-level events under the `connect_log` target so they can be
/// filtered or redirected independently of the rest of the diagnostic
/// stream.
pub fn init_telemetry() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(false).with_level(true);

    Registry::default().with(filter).with(fmt_layer).init();
}
