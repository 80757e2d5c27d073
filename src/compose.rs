//! Placement of a frame on an output surface and the raster compositor.

use image::RgbaImage;
use image::imageops::{self, FilterType};

/// Placement on the surface, in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Scales `frame` to the full target height keeping its aspect ratio and centres it
/// horizontally. Wider frames get a negative offset and are cropped by the surface.
pub fn fit_to_height(
    frame_width: u32,
    frame_height: u32,
    target_width: u32,
    target_height: u32,
) -> Rect {
    let target_height = f64::from(target_height);
    let calc_width = if frame_height == 0 {
        0.0
    } else {
        target_height * f64::from(frame_width) / f64::from(frame_height)
    };
    Rect {
        x: (f64::from(target_width) - calc_width) / 2.0,
        y: 0.0,
        width: calc_width,
        height: target_height,
    }
}

/// `composeOntoSurface`: draws `raster` into `rect` of `canvas`.
pub trait Compositor: Send + Sync {
    fn compose(&self, canvas: &mut RgbaImage, rect: Rect, raster: &RgbaImage);
}

/// Resamples with `image::imageops::resize` and copies the result over the canvas.
#[derive(Debug, Clone, Copy)]
pub struct ImageCompositor {
    filter: FilterType,
}

impl ImageCompositor {
    pub fn with_filter(filter: FilterType) -> Self {
        Self { filter }
    }
}

impl Default for ImageCompositor {
    fn default() -> Self {
        Self::with_filter(FilterType::Triangle)
    }
}

impl Compositor for ImageCompositor {
    fn compose(&self, canvas: &mut RgbaImage, rect: Rect, raster: &RgbaImage) {
        let width = rect.width.round() as u32;
        let height = rect.height.round() as u32;
        if width == 0 || height == 0 || raster.width() == 0 || raster.height() == 0 {
            return;
        }
        let x = rect.x.round() as i64;
        let y = rect.y.round() as i64;
        if raster.dimensions() == (width, height) {
            imageops::replace(canvas, raster, x, y);
        } else {
            let scaled = imageops::resize(raster, width, height, self.filter);
            imageops::replace(canvas, &scaled, x, y);
        }
    }
}
