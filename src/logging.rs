use std::io::IsTerminal;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Installs the global subscriber. `RUST_LOG` takes precedence over `verbose`.
pub fn init(verbose: bool) {
   let default_level = if verbose { "debug" } else { "info" };
   let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
   let fmt_layer = tracing_subscriber::fmt::layer()
      .with_target(verbose)
      .with_ansi(std::io::stderr().is_terminal())
      .with_writer(std::io::stderr);

   // A second call (e.g. from tests) keeps the first subscriber.
   let _ = Registry::default().with(filter).with(fmt_layer).try_init();
}
