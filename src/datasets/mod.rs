pub mod mnist;
pub mod shuffle;
pub mod utils;

pub use mnist::{Image, Mnist, Sample};
pub use shuffle::{normalize, ShuffleBuffer, ShuffleExt};
