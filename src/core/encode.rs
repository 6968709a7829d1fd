use std::io::Cursor;

use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};

use crate::config::ImageFormat;

/// Trait for tile encoding backends.
pub trait TileEncoder: Send + Sync {
    fn encode_rgb(&self, tile: &RgbImage) -> Result<Vec<u8>>;
    fn format(&self) -> ImageFormat;
    fn name(&self) -> &str;
}

pub struct JpegTileEncoder {
    pub quality: u8,
}

impl TileEncoder for JpegTileEncoder {
    fn encode_rgb(&self, tile: &RgbImage) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .write_image(tile.as_raw(), tile.width(), tile.height(), ExtendedColorType::Rgb8)
            .map_err(|e| anyhow!("jpeg encode {}x{} failed: {}", tile.width(), tile.height(), e))?;
        Ok(out)
    }

    fn format(&self) -> ImageFormat {
        ImageFormat::Jpg
    }

    fn name(&self) -> &str {
        "jpeg"
    }
}

pub struct PngTileEncoder;

impl TileEncoder for PngTileEncoder {
    fn encode_rgb(&self, tile: &RgbImage) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        PngEncoder::new(&mut out)
            .write_image(tile.as_raw(), tile.width(), tile.height(), ExtendedColorType::Rgb8)
            .map_err(|e| anyhow!("png encode {}x{} failed: {}", tile.width(), tile.height(), e))?;
        Ok(out.into_inner())
    }

    fn format(&self) -> ImageFormat {
        ImageFormat::Png
    }

    fn name(&self) -> &str {
        "png"
    }
}

/// Create an encoder for the configured tile format.
pub fn create_encoder(format: ImageFormat, jpeg_quality: u8) -> Box<dyn TileEncoder> {
    match format {
        ImageFormat::Jpg => Box::new(JpegTileEncoder { quality: jpeg_quality }),
        ImageFormat::Png => Box::new(PngTileEncoder),
    }
}

/// Decode tile bytes (png or jpeg) back into RGB.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| image::Rgb([(x * 4) as u8, (y * 4) as u8, 128]))
    }

    #[test]
    fn test_png_is_lossless() {
        let tile = gradient(32, 16);
        let enc = create_encoder(ImageFormat::Png, 100);
        let bytes = enc.encode_rgb(&tile).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Png);
        assert_eq!(decode_rgb(&bytes).unwrap(), tile);
    }

    #[test]
    fn test_jpeg_decodes_to_same_dimensions() {
        let tile = gradient(40, 24);
        let enc = create_encoder(ImageFormat::Jpg, 90);
        assert_eq!(enc.name(), "jpeg");
        let bytes = enc.encode_rgb(&tile).unwrap();
        assert_eq!(&bytes[0..2], &[0xFF, 0xD8]);
        let back = decode_rgb(&bytes).unwrap();
        assert_eq!(back.dimensions(), (40, 24));
    }
}
