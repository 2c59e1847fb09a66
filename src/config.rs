use std::fmt;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use thiserror::Error;

pub const NUM_DIGITS: usize = 10;
pub const NUM_DIMENSIONS: usize = 16;

/// Visualization of reconstructed images from vector outputs with tweaked value.
#[derive(Parser, Debug, Clone)]
#[command(name = "capsule-tweak", version, about, long_about = None)]
pub struct Config {
   /// Path to load the trained model from (directory or .safetensors file)
   #[arg(long, default_value = "./model")]
   pub model_path: PathBuf,

   /// The target digit to visualize on
   #[arg(long, default_value_t = 6, allow_negative_numbers = true)]
   pub digit: i64,

   /// The target dimension of the digit to visualize on
   #[arg(long, default_value_t = 5, allow_negative_numbers = true)]
   pub dimension: i64,

   /// The lower difference bound for the target value
   #[arg(long, default_value_t = -0.25, allow_negative_numbers = true)]
   pub lower_difference: f32,

   /// The upper difference bound for the target value
   #[arg(long, default_value_t = 0.25, allow_negative_numbers = true)]
   pub upper_difference: f32,

   /// The number of steps between the lower and upper bound
   #[arg(long, default_value_t = 10)]
   pub interval: usize,

   /// The difference between the desired value and the original value
   #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
   pub difference: f32,

   /// Directory holding the MNIST files
   #[arg(long, default_value = "data")]
   pub data_dir: PathBuf,

   /// Do not download missing MNIST files
   #[arg(long)]
   pub no_download: bool,

   /// Directory the figures are written to
   #[arg(long, default_value = ".")]
   pub output_dir: PathBuf,

   /// Seed for shuffling the test set
   #[arg(long)]
   pub seed: Option<u64>,

   /// Number of elements held by the shuffle buffer
   #[arg(long, default_value_t = 1024)]
   pub shuffle_buffer: usize,

   /// Which matching sample the single-offset mode keeps
   #[arg(long, value_enum, default_value_t = MatchPolicy::First)]
   pub single_match: MatchPolicy,

   /// Enable debug logging
   #[arg(short, long)]
   pub verbose: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
   /// Stop at the first correctly classified sample
   First,
   /// Scan the whole test set and keep the last correctly classified sample
   Last,
}

impl fmt::Display for MatchPolicy {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         MatchPolicy::First => write!(f, "first"),
         MatchPolicy::Last => write!(f, "last"),
      }
   }
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
   #[error("The value of digit must be in [0, 9], got {0}")]
   DigitOutOfRange(i64),

   #[error("The value of dimension must be in [0, 15], got {0}")]
   DimensionOutOfRange(i64),

   #[error("The interval must be positive when lower difference < upper difference")]
   ZeroInterval,

   #[error("The value of {0} must be finite")]
   NonFinite(&'static str),

   #[error("The shuffle buffer must hold at least one element")]
   ZeroShuffleBuffer,
}

/// Validated target position and offsets, derived from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TweakTarget {
   pub digit: usize,
   pub dimension: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepRange {
   pub lower: f32,
   pub upper: f32,
   pub interval: usize,
}

impl Config {
   /// Checks every argument. Nothing is loaded before this succeeds.
   pub fn validate(&self) -> Result<TweakTarget, ConfigError> {
      if !(0..NUM_DIGITS as i64).contains(&self.digit) {
         return Err(ConfigError::DigitOutOfRange(self.digit));
      }
      if !(0..NUM_DIMENSIONS as i64).contains(&self.dimension) {
         return Err(ConfigError::DimensionOutOfRange(self.dimension));
      }
      for (name, value) in [
         ("lower difference", self.lower_difference),
         ("upper difference", self.upper_difference),
         ("difference", self.difference),
      ] {
         if !value.is_finite() {
            return Err(ConfigError::NonFinite(name));
         }
      }
      if self.sweep_enabled() && self.interval == 0 {
         return Err(ConfigError::ZeroInterval);
      }
      if self.shuffle_buffer == 0 {
         return Err(ConfigError::ZeroShuffleBuffer);
      }
      Ok(TweakTarget {
         digit: self.digit as usize,
         dimension: self.dimension as usize,
      })
   }

   pub fn sweep_enabled(&self) -> bool {
      self.lower_difference < self.upper_difference
   }

   pub fn single_enabled(&self) -> bool {
      self.difference != 0.0
   }

   pub fn sweep_range(&self) -> Option<SweepRange> {
      self.sweep_enabled().then_some(SweepRange {
         lower: self.lower_difference,
         upper: self.upper_difference,
         interval: self.interval,
      })
   }
}
