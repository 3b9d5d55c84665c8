use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber for a binary. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  // A second init (tests, warm serverless instances) keeps the first subscriber.
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .try_init();
}
