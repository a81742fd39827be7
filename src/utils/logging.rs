//! Logging setup for the daemon.

use tracing_subscriber::EnvFilter;

fn is_development() -> bool {
    if let Ok(env_val) = std::env::var("KDECONNECTD_ENV") {
        return env_val == "development";
    }
    cfg!(debug_assertions)
}

/// Initialize the global tracing subscriber.
///
/// Defaults to `debug` in development builds and `info` otherwise; `RUST_LOG`
/// overrides everything. The mdns responder is clamped to warnings because it
/// logs every interface probe.
pub fn init() {
    let default_level = if is_development() { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},mdns_sd=warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
