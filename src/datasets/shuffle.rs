use std::iter::Fuse;

use ndarray::{Array2, ArrayView2};
use rand::Rng;

/// Pixel scale applied before images enter the model.
pub const RESCALE: f32 = 1.0 / 255.0;

/// Maps raw intensities linearly into [0, 1].
pub fn normalize(image: ArrayView2<f32>) -> Array2<f32> {
   image.mapv(|v| v * RESCALE)
}

/// Streaming shuffle over a bounded buffer.
///
/// The first `buffer_size` elements fill the buffer; each step emits a uniformly
/// chosen buffered element and refills its slot from the source. With a buffer
/// at least as large as the source this is a uniform permutation.
pub struct ShuffleBuffer<I: Iterator, R> {
   source: Fuse<I>,
   buffer: Vec<I::Item>,
   buffer_size: usize,
   rng: R,
}

impl<I: Iterator, R: Rng> ShuffleBuffer<I, R> {
   pub fn new(source: I, buffer_size: usize, rng: R) -> Self {
      let buffer_size = buffer_size.max(1);
      Self {
         source: source.fuse(),
         buffer: Vec::with_capacity(buffer_size),
         buffer_size,
         rng,
      }
   }
}

impl<I: Iterator, R: Rng> Iterator for ShuffleBuffer<I, R> {
   type Item = I::Item;

   fn next(&mut self) -> Option<Self::Item> {
      while self.buffer.len() < self.buffer_size {
         match self.source.next() {
            Some(item) => self.buffer.push(item),
            None => break,
         }
      }
      if self.buffer.is_empty() {
         return None;
      }

      let index = self.rng.gen_range(0..self.buffer.len());
      match self.source.next() {
         Some(item) => Some(std::mem::replace(&mut self.buffer[index], item)),
         None => Some(self.buffer.swap_remove(index)),
      }
   }

   fn size_hint(&self) -> (usize, Option<usize>) {
      let (lower, upper) = self.source.size_hint();
      let buffered = self.buffer.len();
      (
         lower.saturating_add(buffered),
         upper.and_then(|u| u.checked_add(buffered)),
      )
   }
}

pub trait ShuffleExt: Iterator + Sized {
   fn shuffle<R: Rng>(self, buffer_size: usize, rng: R) -> ShuffleBuffer<Self, R> {
      ShuffleBuffer::new(self, buffer_size, rng)
   }
}

impl<I: Iterator> ShuffleExt for I {}

#[cfg(test)]
mod tests {
   use super::*;
   use ndarray::array;
   use rand::rngs::StdRng;
   use rand::SeedableRng;

   #[test]
   fn emits_every_element_exactly_once() {
      for buffer_size in [1, 3, 16, 1024] {
         let mut out: Vec<u32> = (0..100)
            .shuffle(buffer_size, StdRng::seed_from_u64(7))
            .collect();
         out.sort_unstable();
         assert_eq!(out, (0..100).collect::<Vec<_>>());
      }
   }

   #[test]
   fn buffer_of_one_keeps_source_order() {
      let out: Vec<u32> = (0..10).shuffle(1, StdRng::seed_from_u64(1)).collect();
      assert_eq!(out, (0..10).collect::<Vec<_>>());
   }

   #[test]
   fn same_seed_gives_same_order() {
      let a: Vec<u32> = (0..50).shuffle(8, StdRng::seed_from_u64(3)).collect();
      let b: Vec<u32> = (0..50).shuffle(8, StdRng::seed_from_u64(3)).collect();
      assert_eq!(a, b);
      assert_ne!(a, (0..50).collect::<Vec<_>>());
   }

   #[test]
   fn first_element_comes_from_the_initial_buffer() {
      for seed in 0..20 {
         let first = (0..100u32)
            .shuffle(4, StdRng::seed_from_u64(seed))
            .next()
            .unwrap();
         assert!(first < 4);
      }
   }

   #[test]
   fn empty_source_yields_nothing() {
      let mut it = std::iter::empty::<u8>().shuffle(8, StdRng::seed_from_u64(0));
      assert!(it.next().is_none());
   }

   #[test]
   fn normalize_rescales_into_unit_range() {
      let raw = array![[0.0f32, 127.5], [255.0, 51.0]];
      let out = normalize(raw.view());
      let expected = array![[0.0f32, 0.5], [1.0, 0.2]];
      for (a, b) in out.iter().zip(expected.iter()) {
         assert!((a - b).abs() < 1e-6, "{} vs {}", a, b);
      }
   }
}
