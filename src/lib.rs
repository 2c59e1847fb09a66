//! Inspect a trained capsule autoencoder on MNIST by nudging one dimension of a
//! digit's capsule and decoding the result.

pub mod config;
pub mod datasets;
pub mod error;
pub mod logging;
pub mod models;
pub mod render;
pub mod tweak;

use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::config::{Config, MatchPolicy};
use crate::datasets::{Mnist, ShuffleExt};
use crate::error::{Result, VisualizeError};
use crate::models::{CapsNet, CapsuleModel};

/// Validates `config`, loads the model and the MNIST test split, and writes the
/// requested figures. Returns the paths of the figures written.
pub fn run(config: &Config) -> Result<Vec<PathBuf>> {
   config.validate()?;
   if !config.sweep_enabled() && !config.single_enabled() {
      warn!("lower difference >= upper difference and difference == 0, nothing to visualize");
      return Ok(Vec::new());
   }

   let model = CapsNet::load(&config.model_path)?;
   let test_set = Mnist::new(&config.data_dir, !config.no_download)
      .map_err(VisualizeError::Dataset)?;
   info!(samples = test_set.len(), "loaded MNIST test split");

   let mut rng = match config.seed {
      Some(seed) => StdRng::seed_from_u64(seed),
      None => StdRng::from_entropy(),
   };
   visualize(&model, &test_set, config, &mut rng)
}

/// Runs whichever of the two modes `config` enables against `model`.
pub fn visualize<M: CapsuleModel + ?Sized>(
   model: &M,
   test_set: &Mnist,
   config: &Config,
   rng: &mut StdRng,
) -> Result<Vec<PathBuf>> {
   let target = config.validate()?;
   let mut written = Vec::new();

   if let Some(range) = config.sweep_range() {
      let samples = test_set.samples().shuffle(config.shuffle_buffer, &mut *rng);
      let sweep = tweak::find_visuals(model, samples, target, range)?;
      written.push(render::render_sweep(&config.output_dir, target, &sweep)?);
   }

   if config.single_enabled() {
      if config.single_match == MatchPolicy::Last {
         warn!("single-offset mode keeps the last match, the whole test split will be encoded");
      }
      let samples = test_set.samples().shuffle(config.shuffle_buffer, &mut *rng);
      let single = tweak::single_visual(
         model,
         samples,
         target,
         config.difference,
         config.single_match,
      )?;
      written.push(render::render_single(&config.output_dir, target, &single)?);
   }

   Ok(written)
}
