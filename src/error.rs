use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum VisualizeError {
   #[error(transparent)]
   Config(#[from] ConfigError),

   #[error("Dataset error: {0:#}")]
   Dataset(anyhow::Error),

   #[error("Model file \"{0}\" was not found.")]
   ModelNotFound(PathBuf),

   #[error("Invalid model: {0}")]
   Model(String),

   #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
   Shape {
      context: &'static str,
      expected: Vec<usize>,
      actual: Vec<usize>,
   },

   #[error("Array layout error: {0}")]
   Layout(#[from] ndarray::ShapeError),

   #[error("No correctly classified sample of digit {digit} was found in the test set.")]
   NoMatchingSample { digit: usize },

   #[error("Rendering failed: {0}")]
   Render(String),

   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VisualizeError>;
