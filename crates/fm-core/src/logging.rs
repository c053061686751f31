use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing output for a foreman binary or test.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies (e.g. "info",
/// "fm_engine=debug,warn"). `json` switches to machine-readable output.
///
/// Safe to call multiple times -- subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .try_init()
            .ok();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_level(true)
            .try_init()
            .ok();
    }

    tracing::debug!(service = service_name, json, "logging initialised");
}
