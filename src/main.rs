use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use capsule_tweak::config::Config;
use capsule_tweak::logging;

fn main() -> Result<()> {
   let config = Config::parse();
   logging::init(config.verbose);

   let written = capsule_tweak::run(&config).with_context(|| {
      format!(
         "failed to visualize digit {} dimension {} with model \"{}\"",
         config.digit,
         config.dimension,
         config.model_path.display()
      )
   })?;

   for path in written {
      info!("figure available at {}", path.display());
   }
   Ok(())
}
