use tracing_subscriber::EnvFilter;

/// Installs the process-wide fmt subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        tracing::debug!(service, "Tracing subscriber already installed");
        return;
    }
    tracing::info!(service, "Tracing initialized");
}
