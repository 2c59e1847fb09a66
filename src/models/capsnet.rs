//! Capsule network with routing-by-agreement and a fully connected decoder.
//!
//! A model lives in a directory holding `config.json` and `model.safetensors`.
//! Tensors are little-endian `f32`:
//!
//! | name | shape |
//! |---|---|
//! | `conv1.weight` / `conv1.bias` | `[c1, 1, k1, k1]` / `[c1]` |
//! | `primary_caps.weight` / `primary_caps.bias` | `[p * d, c1, k2, k2]` / `[p * d]` |
//! | `digit_caps.weight` | `[n, classes, out_dim, d]` with `n = p * h2 * w2` |
//! | `decoder.fc{1,2,3}.weight` / `.bias` | `[out, in]` / `[out]` |
//!
//! Layer widths and kernel sizes come from these shapes; `config.json` supplies
//! the image side, stride, capsule dimension and routing iterations.

use std::fs;
use std::path::Path;

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayD, ArrayView2, Axis, Dimension, IxDyn};
use safetensors::tensor::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::layers::{conv2d, dense, relu, sigmoid, softmax_rows, squash};
use super::{predicted_class, CapsuleModel};
use crate::error::{Result, VisualizeError};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsNetConfig {
   /// Side of the square input image.
   pub image_size: usize,
   pub routing_iterations: usize,
   pub primary_caps_dim: usize,
   pub primary_stride: usize,
}

impl Default for CapsNetConfig {
   fn default() -> Self {
      Self {
         image_size: 28,
         routing_iterations: 3,
         primary_caps_dim: 8,
         primary_stride: 2,
      }
   }
}

#[derive(Debug, Clone)]
struct Dense {
   weight: Array2<f32>,
   bias: Array1<f32>,
}

impl Dense {
   fn forward(&self, x: &Array1<f32>, activation: fn(f32) -> f32) -> Result<Array1<f32>> {
      Ok(dense(x.view(), self.weight.view(), self.bias.view())?.mapv(activation))
   }
}

#[derive(Debug, Clone)]
pub struct CapsNet {
   config: CapsNetConfig,
   image_size: (usize, usize),
   conv1_weight: Array4<f32>,
   conv1_bias: Array1<f32>,
   primary_weight: Array4<f32>,
   primary_bias: Array1<f32>,
   num_primary_maps: usize,
   /// `[n, classes, out_dim, d]`
   digit_weight: Array4<f32>,
   decoder: [Dense; 3],
}

impl CapsNet {
   /// Loads a model directory, or a bare `.safetensors` file with the default config.
   pub fn load<P: AsRef<Path>>(path: P) -> Result<CapsNet> {
      let path = path.as_ref();
      let (config, weights_path) = if path.is_dir() {
         let config_path = path.join(CONFIG_FILE);
         let config = if config_path.exists() {
            serde_json::from_str(&fs::read_to_string(&config_path)?)
               .map_err(|e| VisualizeError::Model(format!("{}: {}", config_path.display(), e)))?
         } else {
            debug!(path = %config_path.display(), "no config file, using defaults");
            CapsNetConfig::default()
         };
         (config, path.join(WEIGHTS_FILE))
      } else {
         (CapsNetConfig::default(), path.to_path_buf())
      };

      if !weights_path.is_file() {
         return Err(VisualizeError::ModelNotFound(weights_path));
      }
      let bytes = fs::read(&weights_path)?;
      let model = CapsNet::from_safetensors(&bytes, config)?;
      info!(
         path = %weights_path.display(),
         classes = model.num_classes(),
         dims = model.capsule_dim(),
         "loaded capsule network"
      );
      Ok(model)
   }

   pub fn from_safetensors(bytes: &[u8], config: CapsNetConfig) -> Result<CapsNet> {
      if config.image_size == 0
         || config.primary_caps_dim == 0
         || config.primary_stride == 0
         || config.routing_iterations == 0
      {
         return Err(VisualizeError::Model(format!(
            "config values must be positive: {:?}",
            config
         )));
      }
      let st = SafeTensors::deserialize(bytes)
         .map_err(|e| VisualizeError::Model(format!("cannot parse safetensors: {}", e)))?;

      let conv1_weight: Array4<f32> = load_tensor(&st, "conv1.weight")?;
      let conv1_bias: Array1<f32> = load_tensor(&st, "conv1.bias")?;
      let primary_weight: Array4<f32> = load_tensor(&st, "primary_caps.weight")?;
      let primary_bias: Array1<f32> = load_tensor(&st, "primary_caps.bias")?;
      let digit_weight: Array4<f32> = load_tensor(&st, "digit_caps.weight")?;
      let decoder = [
         load_dense(&st, "decoder.fc1")?,
         load_dense(&st, "decoder.fc2")?,
         load_dense(&st, "decoder.fc3")?,
      ];

      let (c1, in_channels, k1, k1w) = conv1_weight.dim();
      let (pd, c1_in, k2, k2w) = primary_weight.dim();
      let (n, classes, out_dim, d) = digit_weight.dim();
      expect_shape("conv1 input channels", &[1, k1], &[in_channels, k1w])?;
      expect_shape("conv1.bias", &[c1], conv1_bias.shape())?;
      expect_shape("primary_caps input channels", &[c1, k2], &[c1_in, k2w])?;
      expect_shape("primary_caps.bias", &[pd], primary_bias.shape())?;
      expect_shape("digit_caps capsule dim", &[config.primary_caps_dim], &[d])?;
      if pd == 0 || pd % d != 0 {
         return Err(VisualizeError::Model(format!(
            "primary_caps has {} channels, not a multiple of capsule dim {}",
            pd, d
         )));
      }
      let num_primary_maps = pd / d;

      let image_side = config.image_size;
      if image_side < k1 || image_side - k1 + 1 < k2 {
         return Err(VisualizeError::Model(format!(
            "{}x{} images are too small for kernels of {} and {}",
            image_side, image_side, k1, k2
         )));
      }
      let grid_side = (image_side - k1 + 1 - k2) / config.primary_stride + 1;
      expect_shape(
         "digit_caps inputs",
         &[num_primary_maps * grid_side * grid_side],
         &[n],
      )?;

      let [fc1, fc2, fc3] = [&decoder[0].weight, &decoder[1].weight, &decoder[2].weight];
      expect_shape("decoder.fc1 input", &[classes * out_dim], &[fc1.ncols()])?;
      expect_shape("decoder.fc2 input", &[fc1.nrows()], &[fc2.ncols()])?;
      expect_shape("decoder.fc3 input", &[fc2.nrows()], &[fc3.ncols()])?;
      expect_shape("decoder.fc3 output", &[image_side * image_side], &[fc3.nrows()])?;

      debug!(image_side, n, classes, out_dim, "inferred capsule network layout");
      Ok(CapsNet {
         config,
         image_size: (image_side, image_side),
         conv1_weight,
         conv1_bias,
         primary_weight,
         primary_bias,
         num_primary_maps,
         digit_weight,
         decoder,
      })
   }

   pub fn config(&self) -> &CapsNetConfig {
      &self.config
   }

   pub fn image_size(&self) -> (usize, usize) {
      self.image_size
   }

   pub fn num_classes(&self) -> usize {
      self.digit_weight.dim().1
   }

   pub fn capsule_dim(&self) -> usize {
      self.digit_weight.dim().2
   }

   /// Squashed primary capsules, `[n, d]`, ordered by (map, row, col).
   fn primary_capsules(&self, image: ArrayView2<f32>) -> Result<Array2<f32>> {
      let input = image.insert_axis(Axis(0));
      let features = conv2d(input, self.conv1_weight.view(), self.conv1_bias.view(), 1)?
         .mapv(relu);
      let maps = conv2d(
         features.view(),
         self.primary_weight.view(),
         self.primary_bias.view(),
         self.config.primary_stride,
      )?;

      let d = self.config.primary_caps_dim;
      let (_, h, w) = maps.dim();
      let mut capsules = Array2::<f32>::zeros((self.num_primary_maps * h * w, d));
      for map in 0..self.num_primary_maps {
         let block = maps.slice(s![map * d..(map + 1) * d, .., ..]);
         for y in 0..h {
            for x in 0..w {
               let raw = block.slice(s![.., y, x]);
               capsules
                  .row_mut((map * h + y) * w + x)
                  .assign(&squash(raw));
            }
         }
      }
      Ok(capsules)
   }

   /// Routing-by-agreement from primary capsules `[n, d]` to class capsules.
   fn route(&self, primary: &Array2<f32>) -> Array2<f32> {
      let (n, classes, out_dim, _) = self.digit_weight.dim();

      let mut predictions = Array3::<f32>::zeros((n, classes, out_dim));
      for i in 0..n {
         let u = primary.row(i);
         for j in 0..classes {
            let transform = self.digit_weight.slice(s![i, j, .., ..]);
            predictions.slice_mut(s![i, j, ..]).assign(&transform.dot(&u));
         }
      }

      let mut logits = Array2::<f32>::zeros((n, classes));
      let mut outputs = Array2::<f32>::zeros((classes, out_dim));
      for iteration in 0..self.config.routing_iterations {
         let coupling = softmax_rows(logits.view());
         for j in 0..classes {
            let votes = predictions.index_axis(Axis(1), j);
            let weighted = coupling.column(j).dot(&votes);
            outputs.row_mut(j).assign(&squash(weighted.view()));
         }
         if iteration + 1 < self.config.routing_iterations {
            for j in 0..classes {
               let votes = predictions.index_axis(Axis(1), j);
               let agreement = votes.dot(&outputs.row(j));
               let mut column = logits.column_mut(j);
               column += &agreement;
            }
         }
      }
      outputs
   }
}

impl CapsuleModel for CapsNet {
   fn encode(&self, image: ArrayView2<f32>) -> Result<Array2<f32>> {
      expect_shape(
         "input image",
         &[self.image_size.0, self.image_size.1],
         image.shape(),
      )?;
      let primary = self.primary_capsules(image)?;
      Ok(self.route(&primary))
   }

   /// Only the longest capsule reaches the decoder; the rest are zeroed.
   fn reconstruct(&self, capsules: ArrayView2<f32>) -> Result<Array2<f32>> {
      expect_shape(
         "capsule matrix",
         &[self.num_classes(), self.capsule_dim()],
         capsules.shape(),
      )?;
      let mut masked = Array2::<f32>::zeros(capsules.raw_dim());
      if let Some(class) = predicted_class(capsules) {
         masked.row_mut(class).assign(&capsules.row(class));
      }
      let flat = Array1::from_iter(masked.iter().copied());

      let hidden = self.decoder[0].forward(&flat, relu)?;
      let hidden = self.decoder[1].forward(&hidden, relu)?;
      let pixels = self.decoder[2].forward(&hidden, sigmoid)?;
      Ok(pixels.into_shape(self.image_size)?)
   }
}

fn load_dense(st: &SafeTensors, prefix: &'static str) -> Result<Dense> {
   let weight: Array2<f32> = load_tensor(st, &format!("{}.weight", prefix))?;
   let bias: Array1<f32> = load_tensor(st, &format!("{}.bias", prefix))?;
   expect_shape(prefix, &[weight.nrows()], bias.shape())?;
   Ok(Dense { weight, bias })
}

fn load_tensor<D: Dimension>(st: &SafeTensors, name: &str) -> Result<ndarray::Array<f32, D>> {
   let view = st
      .tensor(name)
      .map_err(|e| VisualizeError::Model(format!("missing tensor {}: {}", name, e)))?;
   if view.dtype() != Dtype::F32 {
      return Err(VisualizeError::Model(format!(
         "tensor {} has dtype {:?}, expected F32",
         name,
         view.dtype()
      )));
   }
   let data: Vec<f32> = view
      .data()
      .chunks_exact(4)
      .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
      .collect();
   let array = ArrayD::from_shape_vec(IxDyn(view.shape()), data)?;
   let ndim = array.ndim();
   array.into_dimensionality::<D>().map_err(|_| {
      VisualizeError::Model(format!(
         "tensor {} has {} dimensions, expected {}",
         name,
         ndim,
         D::NDIM.unwrap_or(0)
      ))
   })
}

fn expect_shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
   if expected != actual {
      return Err(VisualizeError::Shape {
         context,
         expected: expected.to_vec(),
         actual: actual.to_vec(),
      });
   }
   Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
   use super::*;
   use safetensors::tensor::TensorView;
   use std::collections::HashMap;

   /// Tiny deterministic network: 6x6 images, 3 classes of 4 dims.
   pub(crate) fn tiny_weights() -> Vec<u8> {
      serialize_weights(tiny_shapes())
   }

   fn tiny_shapes() -> Vec<(&'static str, Vec<usize>)> {
      vec![
         ("conv1.weight", vec![2, 1, 3, 3]),
         ("conv1.bias", vec![2]),
         ("primary_caps.weight", vec![4, 2, 2, 2]),
         ("primary_caps.bias", vec![4]),
         ("digit_caps.weight", vec![8, 3, 4, 2]),
         ("decoder.fc1.weight", vec![8, 12]),
         ("decoder.fc1.bias", vec![8]),
         ("decoder.fc2.weight", vec![8, 8]),
         ("decoder.fc2.bias", vec![8]),
         ("decoder.fc3.weight", vec![36, 8]),
         ("decoder.fc3.bias", vec![36]),
      ]
   }

   fn serialize_weights(shapes: Vec<(&'static str, Vec<usize>)>) -> Vec<u8> {
      let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = shapes
         .into_iter()
         .enumerate()
         .map(|(t, (name, shape))| {
            let len: usize = shape.iter().product();
            let bytes = (0..len)
               .flat_map(|i| (((i * 7 + t * 3) % 11) as f32 * 0.1 - 0.5).to_le_bytes())
               .collect();
            (name.to_string(), shape, bytes)
         })
         .collect();
      let views: Vec<(String, TensorView)> = buffers
         .iter()
         .map(|(name, shape, bytes)| {
            (
               name.clone(),
               TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
            )
         })
         .collect();
      safetensors::serialize(views, &None::<HashMap<String, String>>).unwrap()
   }

   pub(crate) fn tiny_config() -> CapsNetConfig {
      CapsNetConfig {
         image_size: 6,
         routing_iterations: 3,
         primary_caps_dim: 2,
         primary_stride: 2,
      }
   }

   fn tiny_image() -> Array2<f32> {
      Array2::from_shape_fn((6, 6), |(r, c)| ((r * 6 + c) % 5) as f32 / 4.0)
   }

   #[test]
   fn infers_the_layout_from_tensor_shapes() {
      let model = CapsNet::from_safetensors(&tiny_weights(), tiny_config()).unwrap();
      assert_eq!(model.image_size(), (6, 6));
      assert_eq!(model.num_classes(), 3);
      assert_eq!(model.capsule_dim(), 4);
   }

   #[test]
   fn encode_produces_squashed_class_capsules() {
      let model = CapsNet::from_safetensors(&tiny_weights(), tiny_config()).unwrap();
      let capsules = model.encode(tiny_image().view()).unwrap();
      assert_eq!(capsules.dim(), (3, 4));
      for row in capsules.rows() {
         let len = row.dot(&row).sqrt();
         assert!(len.is_finite() && len < 1.0);
      }
      let again = model.encode(tiny_image().view()).unwrap();
      assert_eq!(capsules, again);
   }

   #[test]
   fn reconstruct_yields_pixels_in_unit_range() {
      let model = CapsNet::from_safetensors(&tiny_weights(), tiny_config()).unwrap();
      let capsules = model.encode(tiny_image().view()).unwrap();
      let image = model.reconstruct(capsules.view()).unwrap();
      assert_eq!(image.dim(), (6, 6));
      assert!(image.iter().all(|&p| (0.0..=1.0).contains(&p)));
   }

   #[test]
   fn reconstruct_ignores_all_but_the_longest_capsule() {
      let model = CapsNet::from_safetensors(&tiny_weights(), tiny_config()).unwrap();
      let mut capsules = Array2::<f32>::zeros((3, 4));
      capsules.row_mut(1).fill(0.4);
      let base = model.reconstruct(capsules.view()).unwrap();
      capsules[[0, 2]] = 0.1;
      capsules[[2, 3]] = -0.2;
      assert_eq!(model.reconstruct(capsules.view()).unwrap(), base);
   }

   #[test]
   fn rejects_wrongly_shaped_inputs() {
      let model = CapsNet::from_safetensors(&tiny_weights(), tiny_config()).unwrap();
      assert!(matches!(
         model.encode(Array2::<f32>::zeros((28, 28)).view()),
         Err(VisualizeError::Shape { .. })
      ));
      assert!(matches!(
         model.reconstruct(Array2::<f32>::zeros((10, 16)).view()),
         Err(VisualizeError::Shape { .. })
      ));
   }

   #[test]
   fn rejects_a_config_that_disagrees_with_the_weights() {
      let config = CapsNetConfig {
         primary_caps_dim: 8,
         ..tiny_config()
      };
      assert!(CapsNet::from_safetensors(&tiny_weights(), config).is_err());
      assert!(CapsNet::from_safetensors(b"not a model", tiny_config()).is_err());
   }

   #[test]
   fn rejects_a_decoder_bias_of_the_wrong_length() {
      let shapes = tiny_shapes()
         .into_iter()
         .map(|(name, shape)| match name {
            "decoder.fc2.bias" => (name, vec![5]),
            _ => (name, shape),
         })
         .collect();
      match CapsNet::from_safetensors(&serialize_weights(shapes), tiny_config()) {
         Err(VisualizeError::Shape {
            context,
            expected,
            actual,
         }) => {
            assert_eq!(context, "decoder.fc2");
            assert_eq!(expected, vec![8]);
            assert_eq!(actual, vec![5]);
         }
         Err(e) => panic!("unexpected error: {}", e),
         Ok(_) => panic!("mismatched bias was accepted"),
      }
   }

   #[test]
   fn loads_a_model_directory() {
      let dir = tempfile::tempdir().unwrap();
      fs::write(dir.path().join(WEIGHTS_FILE), tiny_weights()).unwrap();
      fs::write(
         dir.path().join(CONFIG_FILE),
         serde_json::to_string(&tiny_config()).unwrap(),
      )
      .unwrap();

      let model = CapsNet::load(dir.path()).unwrap();
      assert_eq!(model.config(), &tiny_config());
   }

   #[test]
   fn missing_weights_are_reported_with_their_path() {
      let dir = tempfile::tempdir().unwrap();
      match CapsNet::load(dir.path()) {
         Err(VisualizeError::ModelNotFound(path)) => {
            assert_eq!(path, dir.path().join(WEIGHTS_FILE))
         }
         other => panic!("unexpected result: {:?}", other.map(|_| ())),
      }
   }
}
