use tracing_subscriber::EnvFilter;

use deck_runtime::config::ENV_LOG;

/// Installs the stderr subscriber. The filter comes from `DECK_LOG`, then
/// `RUST_LOG`, then `fallback`.
pub fn init(fallback: &str) {
    let filter = EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
