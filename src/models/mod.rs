pub mod capsnet;
pub mod layers;

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::Result;

pub use capsnet::{CapsNet, CapsNetConfig};

/// A capsule autoencoder: an encoder producing one vector per class and a
/// decoder mapping such a matrix back to pixels.
pub trait CapsuleModel {
   /// Encodes a normalized `(rows, cols)` image into a `(class, dimension)` matrix.
   fn encode(&self, image: ArrayView2<f32>) -> Result<Array2<f32>>;

   /// Decodes a `(class, dimension)` matrix into a `(rows, cols)` image.
   fn reconstruct(&self, capsules: ArrayView2<f32>) -> Result<Array2<f32>>;
}

impl<M: CapsuleModel + ?Sized> CapsuleModel for &M {
   fn encode(&self, image: ArrayView2<f32>) -> Result<Array2<f32>> {
      (**self).encode(image)
   }

   fn reconstruct(&self, capsules: ArrayView2<f32>) -> Result<Array2<f32>> {
      (**self).reconstruct(capsules)
   }
}

/// L2 norm of every class vector.
pub fn capsule_norms(capsules: ArrayView2<f32>) -> Array1<f32> {
   capsules.map_axis(Axis(1), |row| row.dot(&row).sqrt())
}

/// Class whose capsule is longest. Ties resolve to the lowest index.
pub fn predicted_class(capsules: ArrayView2<f32>) -> Option<usize> {
   capsule_norms(capsules)
      .iter()
      .enumerate()
      .fold(None, |best: Option<(usize, f32)>, (i, &norm)| match best {
         Some((_, best_norm)) if norm <= best_norm => best,
         _ => Some((i, norm)),
      })
      .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
   use super::*;
   use ndarray::array;

   #[test]
   fn predicts_the_longest_capsule() {
      let capsules = array![[0.1f32, 0.1], [-0.9, 0.0], [0.3, 0.4]];
      assert_eq!(predicted_class(capsules.view()), Some(1));
      let norms = capsule_norms(capsules.view());
      assert!((norms[2] - 0.5).abs() < 1e-6);
   }

   #[test]
   fn ties_pick_the_first_class() {
      let capsules = array![[0.0f32, 1.0], [1.0, 0.0]];
      assert_eq!(predicted_class(capsules.view()), Some(0));
   }

   #[test]
   fn no_classes_no_prediction() {
      let capsules = Array2::<f32>::zeros((0, 16));
      assert_eq!(predicted_class(capsules.view()), None);
   }
}
