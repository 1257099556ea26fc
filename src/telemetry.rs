use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber once per process. `RUST_LOG` overrides the `info` default.
pub fn init() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .without_time()
    .try_init();
}
