//! Writes result figures as PNG files.

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use ndarray::{Array2, ArrayView2};
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use tracing::info;

use crate::config::TweakTarget;
use crate::error::{Result, VisualizeError};
use crate::tweak::{SingleTweak, Sweep};

pub const SWEEP_FIGURE_SIZE: (u32, u32) = (1200, 400);
pub const SINGLE_FIGURE_SIZE: (u32, u32) = (640, 480);

const TITLE_HEIGHT: i32 = 32;
const TITLE_FONT_SIZE: f64 = 16.0;
const PANEL_MARGIN: u32 = 4;

pub struct Panel<'a> {
   pub image: &'a Array2<f32>,
   pub title: Option<String>,
}

/// Grey-scale conversion with min-max scaling, like `imshow` autoscaling.
pub fn to_gray_image(image: ArrayView2<f32>) -> GrayImage {
   let (rows, cols) = image.dim();
   let (min, max) = image.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
      (lo.min(v), hi.max(v))
   });
   let range = max - min;

   let mut img = GrayImage::new(cols as u32, rows as u32);
   for ((r, c), &v) in image.indexed_iter() {
      let level = if range > 0.0 {
         ((v - min) / range * 255.0).round() as u8
      } else {
         0
      };
      img.put_pixel(c as u32, r as u32, Luma([level]));
   }
   img
}

/// Captions for a sweep row: "Original", then the lower bound, then the upper
/// bound on the last panel.
pub fn sweep_titles(panels: usize, lower: f32, upper: f32) -> Vec<Option<String>> {
   let mut titles = vec![None; panels];
   if panels > 0 {
      titles[0] = Some("Original".to_string());
   }
   if panels > 1 {
      titles[1] = Some(format!("{:.2}", lower));
      titles[panels - 1] = Some(format!("{:.2}", upper));
   }
   titles
}

pub fn sweep_path(dir: &Path, target: TweakTarget) -> PathBuf {
   dir.join(format!(
      "sweep_digit{}_dim{}.png",
      target.digit, target.dimension
   ))
}

pub fn single_path(dir: &Path, target: TweakTarget) -> PathBuf {
   dir.join(format!(
      "single_digit{}_dim{}.png",
      target.digit, target.dimension
   ))
}

pub fn render_sweep(dir: &Path, target: TweakTarget, sweep: &Sweep) -> Result<PathBuf> {
   let titles = sweep_titles(sweep.images.len(), sweep.lower, sweep.upper);
   let panels: Vec<Panel> = sweep
      .images
      .iter()
      .zip(titles)
      .map(|(image, title)| Panel { image, title })
      .collect();

   fs::create_dir_all(dir)?;
   let path = sweep_path(dir, target);
   render_row(&path, &panels, SWEEP_FIGURE_SIZE)?;
   info!(path = %path.display(), panels = panels.len(), "wrote sweep figure");
   Ok(path)
}

pub fn render_single(dir: &Path, target: TweakTarget, single: &SingleTweak) -> Result<PathBuf> {
   let panels = [
      Panel {
         image: &single.original,
         title: Some("Original".to_string()),
      },
      Panel {
         image: &single.tweaked,
         title: Some("Tweaked".to_string()),
      },
   ];

   fs::create_dir_all(dir)?;
   let path = single_path(dir, target);
   render_row(&path, &panels, SINGLE_FIGURE_SIZE)?;
   info!(path = %path.display(), value = single.value, "wrote single figure");
   Ok(path)
}

/// Draws `panels` side by side without axes.
pub fn render_row(path: &Path, panels: &[Panel], size: (u32, u32)) -> Result<()> {
   if panels.is_empty() {
      return Err(VisualizeError::Render("nothing to draw".to_string()));
   }

   let root = BitMapBackend::new(path, size).into_drawing_area();
   root.fill(&WHITE).map_err(render_err)?;

   for (area, panel) in root.split_evenly((1, panels.len())).iter().zip(panels) {
      let (title_area, body) = area.split_vertically(TITLE_HEIGHT);
      if let Some(title) = &panel.title {
         let (w, h) = title_area.dim_in_pixel();
         let style = TextStyle::from(("sans-serif", TITLE_FONT_SIZE).into_font())
            .color(&BLACK)
            .pos(Pos::new(HPos::Center, VPos::Center));
         title_area
            .draw(&Text::new(title.as_str(), (w as i32 / 2, h as i32 / 2), style))
            .map_err(render_err)?;
      }
      draw_image(&body, &to_gray_image(panel.image.view()))?;
   }

   root.present().map_err(render_err)?;
   Ok(())
}

fn draw_image(
   area: &DrawingArea<BitMapBackend, plotters::coord::Shift>,
   image: &GrayImage,
) -> Result<()> {
   let (w, h) = area.dim_in_pixel();
   let (cols, rows) = image.dimensions();
   if cols == 0 || rows == 0 {
      return Ok(());
   }
   let avail_w = w.saturating_sub(2 * PANEL_MARGIN);
   let avail_h = h.saturating_sub(2 * PANEL_MARGIN);
   let cell = (avail_w / cols).min(avail_h / rows).max(1) as i32;
   let x0 = (w as i32 - cell * cols as i32) / 2;
   let y0 = (h as i32 - cell * rows as i32) / 2;

   for (x, y, Luma([level])) in image.enumerate_pixels() {
      let left = x0 + x as i32 * cell;
      let top = y0 + y as i32 * cell;
      area
         .draw(&Rectangle::new(
            [(left, top), (left + cell, top + cell)],
            RGBColor(*level, *level, *level).filled(),
         ))
         .map_err(render_err)?;
   }
   Ok(())
}

fn render_err<E: std::fmt::Display>(e: E) -> VisualizeError {
   VisualizeError::Render(e.to_string())
}
