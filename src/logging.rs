use tracing_subscriber::EnvFilter;

/// Initialize structured logging. `LOG_LEVEL` takes the usual env-filter
/// syntax (`info`, `debug`, `on_demand_infra=debug`, ...).
pub fn init() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .ok();
}
