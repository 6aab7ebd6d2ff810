use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "CAMPUS_HUB_LOG";

/// Installs the global fmt subscriber. `CAMPUS_HUB_LOG` wins over the
/// configured filter; a second call is a no-op.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
