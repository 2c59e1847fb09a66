//! Sample selection and capsule tweaking.

use ndarray::{Array2, ArrayView2};
use tracing::{debug, info};

use crate::config::{MatchPolicy, SweepRange, TweakTarget};
use crate::datasets::{normalize, Sample};
use crate::error::{Result, VisualizeError};
use crate::models::{predicted_class, CapsuleModel};

/// A correctly classified exemplar of the target digit.
#[derive(Debug, Clone)]
pub struct Selected {
   /// Raw pixel intensities, before normalization.
   pub image: Array2<f32>,
   pub capsules: Array2<f32>,
   /// Position in the (shuffled) stream.
   pub position: usize,
}

#[derive(Debug, Clone)]
pub struct Sweep {
   /// The original image followed by one reconstruction per tweaked value.
   pub images: Vec<Array2<f32>>,
   pub values: Vec<f32>,
   pub lower: f32,
   pub upper: f32,
}

#[derive(Debug, Clone)]
pub struct SingleTweak {
   pub original: Array2<f32>,
   pub tweaked: Array2<f32>,
   pub value: f32,
}

/// Scans `samples` for an image labelled `digit` that the model also classifies
/// as `digit`.
pub fn select_sample<M, I>(
   model: &M,
   samples: I,
   digit: usize,
   policy: MatchPolicy,
) -> Result<Selected>
where
   M: CapsuleModel + ?Sized,
   I: IntoIterator<Item = Sample>,
{
   let mut accepted = None;
   let mut candidates = 0usize;
   for (position, sample) in samples.into_iter().enumerate() {
      if sample.label as usize != digit {
         continue;
      }
      candidates += 1;
      let image = sample.image.to_array();
      let capsules = model.encode(normalize(image.view()).view())?;
      let predicted = predicted_class(capsules.view());
      if predicted != Some(digit) {
         debug!(position, ?predicted, "misclassified candidate skipped");
         continue;
      }

      accepted = Some(Selected {
         image,
         capsules,
         position,
      });
      if policy == MatchPolicy::First {
         break;
      }
   }

   match accepted {
      Some(selected) => {
         info!(
            digit,
            position = selected.position,
            candidates,
            %policy,
            "selected sample"
         );
         Ok(selected)
      }
      None => Err(VisualizeError::NoMatchingSample { digit }),
   }
}

/// Evenly spaced values from `origin + lower` to `origin + upper`, both inclusive.
pub fn sweep_values(origin: f32, range: SweepRange) -> Vec<f32> {
   let step = (range.upper - range.lower) / range.interval as f32;
   (0..=range.interval)
      .map(|i| origin + range.lower + step * i as f32)
      .collect()
}

pub fn sweep_offsets(range: SweepRange) -> Vec<f32> {
   sweep_values(0.0, range)
}

/// Copy of `capsules` with only `(digit, dimension)` replaced by `value`.
pub fn tweak_vector(
   capsules: ArrayView2<f32>,
   target: TweakTarget,
   value: f32,
) -> Result<Array2<f32>> {
   let (classes, dims) = capsules.dim();
   if target.digit >= classes || target.dimension >= dims {
      return Err(VisualizeError::Shape {
         context: "tweak target",
         expected: vec![classes, dims],
         actual: vec![target.digit, target.dimension],
      });
   }
   let mut tweaked = capsules.to_owned();
   tweaked[[target.digit, target.dimension]] = value;
   Ok(tweaked)
}

/// Decodes the selected sample once per value of the sweep.
pub fn sweep<M: CapsuleModel + ?Sized>(
   model: &M,
   selected: &Selected,
   target: TweakTarget,
   range: SweepRange,
) -> Result<Sweep> {
   let origin = origin_value(selected, target)?;
   let values = sweep_values(origin, range);

   let mut images = Vec::with_capacity(values.len() + 1);
   images.push(selected.image.clone());
   for &value in &values {
      let tweaked = tweak_vector(selected.capsules.view(), target, value)?;
      images.push(model.reconstruct(tweaked.view())?);
   }
   debug!(origin, count = values.len(), "decoded sweep");

   Ok(Sweep {
      images,
      values,
      lower: origin + range.lower,
      upper: origin + range.upper,
   })
}

pub fn single<M: CapsuleModel + ?Sized>(
   model: &M,
   selected: &Selected,
   target: TweakTarget,
   difference: f32,
) -> Result<SingleTweak> {
   let value = origin_value(selected, target)? + difference;
   let tweaked = tweak_vector(selected.capsules.view(), target, value)?;
   Ok(SingleTweak {
      original: selected.image.clone(),
      tweaked: model.reconstruct(tweaked.view())?,
      value,
   })
}

/// Sweep mode: first correctly classified sample, then every tweaked reconstruction.
pub fn find_visuals<M, I>(
   model: &M,
   samples: I,
   target: TweakTarget,
   range: SweepRange,
) -> Result<Sweep>
where
   M: CapsuleModel + ?Sized,
   I: IntoIterator<Item = Sample>,
{
   let selected = select_sample(model, samples, target.digit, MatchPolicy::First)?;
   sweep(model, &selected, target, range)
}

/// Single-offset mode. `policy` decides whether the first or the last match is used.
pub fn single_visual<M, I>(
   model: &M,
   samples: I,
   target: TweakTarget,
   difference: f32,
   policy: MatchPolicy,
) -> Result<SingleTweak>
where
   M: CapsuleModel + ?Sized,
   I: IntoIterator<Item = Sample>,
{
   let selected = select_sample(model, samples, target.digit, policy)?;
   single(model, &selected, target, difference)
}

fn origin_value(selected: &Selected, target: TweakTarget) -> Result<f32> {
   selected
      .capsules
      .get([target.digit, target.dimension])
      .copied()
      .ok_or_else(|| VisualizeError::Shape {
         context: "tweak target",
         expected: selected.capsules.shape().to_vec(),
         actual: vec![target.digit, target.dimension],
      })
}
