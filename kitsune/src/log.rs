use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub fn init() {
    init_with("info");
}

/// Installs the global subscriber; `RUST_LOG` takes precedence over `default`.
///
/// Returns false if a subscriber was already installed.
pub fn init_with(default: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .is_ok()
}
