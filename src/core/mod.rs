pub mod crc;
pub mod encode;
pub mod pyramid;
pub mod record;

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Resampling filter for tile downscaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleFilter {
    Bilinear,
    Bicubic,
    Lanczos3,
}

impl fmt::Display for ResampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResampleFilter::Bilinear => write!(f, "bilinear"),
            ResampleFilter::Bicubic => write!(f, "bicubic"),
            ResampleFilter::Lanczos3 => write!(f, "lanczos3"),
        }
    }
}

impl FromStr for ResampleFilter {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bilinear" | "triangle" => Ok(ResampleFilter::Bilinear),
            "bicubic" | "catmullrom" | "catmull-rom" => Ok(ResampleFilter::Bicubic),
            "lanczos3" | "lanczos" => Ok(ResampleFilter::Lanczos3),
            _ => Err(format!("unknown resample filter '{}'. Available: bilinear, bicubic, lanczos3", s)),
        }
    }
}

// ---------------------------------------------------------------------------
// SIMD-accelerated resize (via fast_image_resize)
// ---------------------------------------------------------------------------

/// Resize an RGB image to `dst_w` x `dst_h`.
pub fn resize_rgb(img: &RgbImage, dst_w: u32, dst_h: u32, filter: ResampleFilter) -> Result<RgbImage> {
    use fast_image_resize as fir;
    if img.width() == dst_w && img.height() == dst_h {
        return Ok(img.clone());
    }
    let src = fir::images::Image::from_vec_u8(
        img.width(),
        img.height(),
        img.as_raw().clone(),
        fir::pixels::PixelType::U8x3,
    )
    .map_err(|e| anyhow!("resize source {}x{}: {:?}", img.width(), img.height(), e))?;
    let mut dst = fir::images::Image::new(dst_w, dst_h, fir::pixels::PixelType::U8x3);
    let alg = match filter {
        ResampleFilter::Bilinear => fir::ResizeAlg::Convolution(fir::FilterType::Bilinear),
        ResampleFilter::Bicubic => fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom),
        ResampleFilter::Lanczos3 => fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3),
    };
    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src, &mut dst, &fir::ResizeOptions::new().resize_alg(alg))
        .map_err(|e| anyhow!("resize to {}x{} failed: {:?}", dst_w, dst_h, e))?;
    RgbImage::from_raw(dst_w, dst_h, dst.into_vec())
        .ok_or_else(|| anyhow!("resize produced a buffer of the wrong size"))
}
