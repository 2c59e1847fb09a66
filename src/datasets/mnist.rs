use super::utils::{check_exists, download_with_pb, extract_gz};
use anyhow::{anyhow, ensure, Result};
use ndarray::Array2;
use reqwest::Client;
use std::fs;
use std::io;
use std::path::Path;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

const MIRRORS: [&str; 2] = [
   "http://yann.lecun.com/exdb/mnist/",
   "https://ossci-datasets.s3.amazonaws.com/mnist/",
];

const LABEL_MAGIC_NUMBER: u32 = 2049;
const IMAGE_MAGIC_NUMBER: u32 = 2051;

const LABEL_HEADER_LEN: usize = 8;
const IMAGE_HEADER_LEN: usize = 16;

/// (gzip archive, extracted file) names of the test split.
const TEST_IMAGES: (&str, &str) = ("t10k-images-idx3-ubyte.gz", "t10k-images.idx3-ubyte");
const TEST_LABELS: (&str, &str) = ("t10k-labels-idx1-ubyte.gz", "t10k-labels.idx1-ubyte");

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
   pub rows: u32,
   pub cols: u32,
   pub data: Vec<u8>,
}

impl Image {
   /// Raw pixel intensities in [0, 255], shaped (rows, cols).
   pub fn to_array(&self) -> Array2<f32> {
      Array2::from_shape_fn((self.rows as usize, self.cols as usize), |(r, c)| {
         self.data[r * self.cols as usize + c] as f32
      })
   }
}

/// One (image, label) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
   pub image: Image,
   pub label: u8,
}

/// The MNIST test split.
pub struct Mnist {
   pub images: Vec<Image>,
   pub labels: Vec<u8>,
}

impl Mnist {
   pub fn new<P: AsRef<Path>>(root: &P, download: bool) -> Result<Mnist> {
      let root = root.as_ref();
      if download {
         Mnist::download(root)?;
      }

      Mnist::load_data(root).map_err(|e| match e.downcast_ref::<io::Error>() {
         Some(_) => anyhow!(
            "MNIST dataset files were not found in \"{}\".",
            root.display()
         ),
         None => e,
      })
   }

   pub fn len(&self) -> usize {
      self.images.len()
   }

   pub fn is_empty(&self) -> bool {
      self.images.is_empty()
   }

   pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
      self
         .images
         .iter()
         .zip(self.labels.iter())
         .map(|(image, &label)| Sample {
            image: image.clone(),
            label,
         })
   }

   fn load_data(root: &Path) -> Result<Mnist> {
      let images_file = fs::read(root.join(TEST_IMAGES.1))?;
      let labels_file = fs::read(root.join(TEST_LABELS.1))?;
      Mnist::from_bytes(&images_file, &labels_file)
   }

   pub fn from_bytes<I, L>(images: &I, labels: &L) -> Result<Mnist>
   where
      I: AsRef<[u8]> + ?Sized,
      L: AsRef<[u8]> + ?Sized,
   {
      let images = Mnist::parse_images(images)?;
      let labels = Mnist::parse_labels(labels)?;
      ensure!(
         images.len() == labels.len(),
         "Image count ({}) does not match label count ({}).",
         images.len(),
         labels.len()
      );
      debug!(count = images.len(), "parsed MNIST test split");
      Ok(Mnist { images, labels })
   }

   fn parse_labels<D: AsRef<[u8]> + ?Sized>(data: &D) -> Result<Vec<u8>> {
      let data = data.as_ref();
      ensure!(
         data.len() >= LABEL_HEADER_LEN,
         "Invalid label data. Header is truncated."
      );
      let magic_number = read_u32(data, 0);
      if magic_number != LABEL_MAGIC_NUMBER {
         return Err(anyhow!("Invalid label data. Magic number is not correct."));
      }

      let num_items = read_u32(data, 4);
      if data[LABEL_HEADER_LEN..].len() != num_items as usize {
         return Err(anyhow!(
            "Invalid label data. Number of items is not correct."
         ));
      }
      Ok(data[LABEL_HEADER_LEN..].to_vec())
   }

   fn parse_images<D: AsRef<[u8]> + ?Sized>(data: &D) -> Result<Vec<Image>> {
      let data = data.as_ref();
      ensure!(
         data.len() >= IMAGE_HEADER_LEN,
         "Invalid image data. Header is truncated."
      );
      let magic_number = read_u32(data, 0);
      if magic_number != IMAGE_MAGIC_NUMBER {
         return Err(anyhow!("Invalid image data. Magic number is not correct."));
      }

      let num_items = read_u32(data, 4);
      let num_rows = read_u32(data, 8);
      let num_cols = read_u32(data, 12);
      let pixels_per_image = num_rows as usize * num_cols as usize;

      if data[IMAGE_HEADER_LEN..].len() != num_items as usize * pixels_per_image {
         return Err(anyhow!(
            "Invalid image data. Number of items is not correct."
         ));
      }
      if pixels_per_image == 0 {
         return Ok(Vec::new());
      }

      let images: Vec<Image> = data[IMAGE_HEADER_LEN..]
         .chunks_exact(pixels_per_image)
         .map(|pixels| Image {
            rows: num_rows,
            cols: num_cols,
            data: pixels.to_vec(),
         })
         .collect();
      Ok(images)
   }

   fn download(root: &Path) -> Result<()> {
      let client = Client::new();
      let rt = Runtime::new()?;
      for (gz_filename, raw_filename) in [TEST_IMAGES, TEST_LABELS] {
         let raw_path = root.join(raw_filename);
         if check_exists(&raw_path) {
            debug!(path = %raw_path.display(), "already present, skipping download");
            continue;
         }

         let mut downloaded = false;
         for mirror in MIRRORS.iter() {
            let url = format!("{}{}", mirror, gz_filename);
            let result = rt.block_on(download_with_pb(&client, &url, root, gz_filename));
            match result {
               Ok(_) => {
                  downloaded = true;
                  break;
               }
               Err(e) => {
                  warn!("Failed to download (trying another mirror): {}", e);
                  continue;
               }
            }
         }
         if !downloaded {
            Err(anyhow!(
               "Failed to download {} from all mirrors.",
               gz_filename
            ))?;
         }
         extract_gz(&root.join(gz_filename), &raw_path)?;
         info!(path = %raw_path.display(), "extracted");
      }
      Ok(())
   }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
   u32::from_be_bytes([
      data[offset],
      data[offset + 1],
      data[offset + 2],
      data[offset + 3],
   ])
}

#[cfg(test)]
mod tests {
   use super::*;

   fn idx_images(images: &[Vec<u8>], rows: u32, cols: u32) -> Vec<u8> {
      let mut data = Vec::new();
      data.extend_from_slice(&IMAGE_MAGIC_NUMBER.to_be_bytes());
      data.extend_from_slice(&(images.len() as u32).to_be_bytes());
      data.extend_from_slice(&rows.to_be_bytes());
      data.extend_from_slice(&cols.to_be_bytes());
      for image in images {
         data.extend_from_slice(image);
      }
      data
   }

   fn idx_labels(labels: &[u8]) -> Vec<u8> {
      let mut data = Vec::new();
      data.extend_from_slice(&LABEL_MAGIC_NUMBER.to_be_bytes());
      data.extend_from_slice(&(labels.len() as u32).to_be_bytes());
      data.extend_from_slice(labels);
      data
   }

   #[test]
   fn parses_every_image_including_the_last() {
      let images = vec![vec![0u8, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9, 10, 11]];
      let mnist = Mnist::from_bytes(&idx_images(&images, 2, 2), &idx_labels(&[3, 1, 4])).unwrap();

      assert_eq!(mnist.len(), 3);
      assert_eq!(mnist.images[2].data, vec![8, 9, 10, 11]);
      assert_eq!(mnist.labels, vec![3, 1, 4]);
   }

   #[test]
   fn rejects_wrong_magic_numbers() {
      let images = idx_images(&[vec![0u8; 4]], 2, 2);
      let labels = idx_labels(&[0]);
      assert!(Mnist::from_bytes(&labels, &labels).is_err());
      assert!(Mnist::from_bytes(&images, &images).is_err());
   }

   #[test]
   fn rejects_truncated_files() {
      let mut images = idx_images(&[vec![0u8; 4], vec![1u8; 4]], 2, 2);
      images.pop();
      assert!(Mnist::from_bytes(&images, &idx_labels(&[0, 1])).is_err());
      assert!(Mnist::from_bytes(&[0u8; 3], &idx_labels(&[0])).is_err());
   }

   #[test]
   fn rejects_mismatched_counts() {
      let images = idx_images(&[vec![0u8; 4]], 2, 2);
      assert!(Mnist::from_bytes(&images, &idx_labels(&[0, 1])).is_err());
   }

   #[test]
   fn to_array_keeps_row_major_layout() {
      let image = Image {
         rows: 2,
         cols: 3,
         data: vec![0, 10, 20, 30, 40, 255],
      };
      let array = image.to_array();
      assert_eq!(array.dim(), (2, 3));
      assert_eq!(array[[1, 0]], 30.0);
      assert_eq!(array[[1, 2]], 255.0);
   }

   #[test]
   fn missing_files_give_a_readable_error() {
      let dir = tempfile::tempdir().unwrap();
      let err = Mnist::new(&dir.path(), false).err().unwrap();
      assert!(err.to_string().contains("were not found"));
   }

   #[test]
   fn loads_raw_files_from_disk() {
      let dir = tempfile::tempdir().unwrap();
      fs::write(dir.path().join(TEST_IMAGES.1), idx_images(&[vec![7u8; 4]], 2, 2)).unwrap();
      fs::write(dir.path().join(TEST_LABELS.1), idx_labels(&[7])).unwrap();

      let mnist = Mnist::new(&dir.path(), false).unwrap();
      let samples: Vec<Sample> = mnist.samples().collect();
      assert_eq!(samples.len(), 1);
      assert_eq!(samples[0].label, 7);
   }
}
