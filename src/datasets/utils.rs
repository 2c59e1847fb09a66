use anyhow::Result;
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

const PROGRESS_TEMPLATE: &str = "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})";

/// Sibling path that a file is staged under until it is complete.
fn staging_path(path: &Path) -> PathBuf {
   let mut name = path.file_name().map(OsString::from).unwrap_or_default();
   name.push(".part");
   path.with_file_name(name)
}

/// Streams `url` into `root/filename`. The file only appears under its final
/// name once the whole body has been received.
pub async fn download_with_pb(
   client: &Client,
   url: &str,
   root: &Path,
   filename: &str,
) -> Result<()> {
   info!("Downloading {} ...", url);

   let res = client.get(url).send().await?.error_for_status()?;
   let pb = match res.content_length() {
      Some(total) => ProgressBar::new(total),
      None => ProgressBar::new_spinner(),
   };
   pb.set_style(ProgressStyle::with_template(PROGRESS_TEMPLATE)?.progress_chars("=> "));
   pb.set_message(filename.to_string());

   tokio::fs::create_dir_all(root).await?;
   let dest = root.join(filename);
   let part = staging_path(&dest);
   let mut file = tokio::fs::File::create(&part).await?;
   let mut stream = res.bytes_stream();
   while let Some(chunk) = stream.next().await {
      let chunk = chunk?;
      file.write_all(&chunk).await?;
      pb.inc(chunk.len() as u64);
   }
   file.flush().await?;
   drop(file);
   tokio::fs::rename(&part, &dest).await?;

   pb.finish_and_clear();
   info!(path = %dest.display(), "downloaded");
   Ok(())
}

pub fn check_exists<P: AsRef<Path>>(path: &P) -> bool {
   path.as_ref().exists()
}

/// Decompresses `gz_path` into `raw_path`. A corrupt or truncated archive
/// leaves nothing at `raw_path`, so a later run extracts it again.
pub fn extract_gz<P: AsRef<Path>>(gz_path: &P, raw_path: &P) -> Result<()> {
   let raw_path = raw_path.as_ref();
   let part = staging_path(raw_path);
   let extracted = decompress(gz_path.as_ref(), &part);
   if let Err(e) = extracted {
      let _ = fs::remove_file(&part);
      return Err(e);
   }
   fs::rename(&part, raw_path)?;
   Ok(())
}

fn decompress(gz_path: &Path, out: &Path) -> Result<()> {
   let mut decoder = GzDecoder::new(BufReader::new(File::open(gz_path)?));
   let mut writer = BufWriter::new(File::create(out)?);
   io::copy(&mut decoder, &mut writer)?;
   writer.flush()?;
   Ok(())
}
