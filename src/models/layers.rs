//! Inference kernels for the capsule network, written against ndarray.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayView4, Axis};

use crate::error::{Result, VisualizeError};

const SQUASH_EPSILON: f32 = 1e-7;

/// Valid (unpadded) 2D convolution.
///
/// `input` is `[c_in, h, w]`, `weight` is `[c_out, c_in, kh, kw]`. Patches are
/// unrolled into a column matrix so the heavy lifting is a single GEMM.
pub fn conv2d(
   input: ArrayView3<f32>,
   weight: ArrayView4<f32>,
   bias: ArrayView1<f32>,
   stride: usize,
) -> Result<Array3<f32>> {
   let (c_in, h, w) = input.dim();
   let (c_out, w_in, kh, kw) = weight.dim();
   if w_in != c_in {
      return Err(VisualizeError::Shape {
         context: "conv2d input channels",
         expected: vec![w_in],
         actual: vec![c_in],
      });
   }
   if bias.len() != c_out {
      return Err(VisualizeError::Shape {
         context: "conv2d bias",
         expected: vec![c_out],
         actual: vec![bias.len()],
      });
   }
   if stride == 0 || h < kh || w < kw {
      return Err(VisualizeError::Model(format!(
         "cannot apply a {}x{} kernel with stride {} to a {}x{} input",
         kh, kw, stride, h, w
      )));
   }

   let oh = (h - kh) / stride + 1;
   let ow = (w - kw) / stride + 1;
   let patch_len = c_in * kh * kw;

   let mut cols = Array2::<f32>::zeros((patch_len, oh * ow));
   for c in 0..c_in {
      for ky in 0..kh {
         for kx in 0..kw {
            let row = (c * kh + ky) * kw + kx;
            for oy in 0..oh {
               for ox in 0..ow {
                  cols[[row, oy * ow + ox]] = input[[c, oy * stride + ky, ox * stride + kx]];
               }
            }
         }
      }
   }

   let kernel = Array2::from_shape_vec((c_out, patch_len), weight.iter().copied().collect())?;
   let mut out = kernel.dot(&cols);
   out += &bias.insert_axis(Axis(1));
   Ok(out.into_shape((c_out, oh, ow))?)
}

/// `weight` is `[out, in]`.
pub fn dense(
   x: ArrayView1<f32>,
   weight: ArrayView2<f32>,
   bias: ArrayView1<f32>,
) -> Result<Array1<f32>> {
   let (out_dim, in_dim) = weight.dim();
   if x.len() != in_dim || bias.len() != out_dim {
      return Err(VisualizeError::Shape {
         context: "dense layer",
         expected: vec![in_dim, out_dim],
         actual: vec![x.len(), bias.len()],
      });
   }
   Ok(weight.dot(&x) + bias)
}

pub fn relu(x: f32) -> f32 {
   x.max(0.0)
}

pub fn sigmoid(x: f32) -> f32 {
   1.0 / (1.0 + (-x).exp())
}

/// Capsule non-linearity: keeps the direction, maps the length into [0, 1).
pub fn squash(s: ArrayView1<f32>) -> Array1<f32> {
   let sq_norm = s.dot(&s);
   let scale = sq_norm / ((1.0 + sq_norm) * (sq_norm.sqrt() + SQUASH_EPSILON));
   s.mapv(|v| v * scale)
}

/// Row-wise softmax.
pub fn softmax_rows(logits: ArrayView2<f32>) -> Array2<f32> {
   let mut out = logits.to_owned();
   for mut row in out.rows_mut() {
      let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
      row.mapv_inplace(|v| (v - max).exp());
      let sum = row.sum();
      row.mapv_inplace(|v| v / sum);
   }
   out
}
