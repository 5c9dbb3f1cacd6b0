//! Shrinks and recompresses images until their base64 form fits the inline budget.
//!
//! The search is greedy: within a pass the encoder quality is lowered first,
//! then both dimensions drop by 10% and quality is reset. No resize, including
//! the initial one to the dimension caps, may go below `min_dimension`; when
//! the budget still cannot be met the fit fails with [`RelayError::ImageTooLarge`].

use crate::error::RelayError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SHRINK_FACTOR: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageEncoding {
    /// Lossless, keeps alpha. Quality has no effect.
    Png,
    /// Lossy, alpha is flattened onto white.
    Jpeg,
}

impl ImageEncoding {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
        }
    }

    fn honours_quality(&self) -> bool {
        matches!(self, Self::Jpeg)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FitSettings {
    /// Budget for the base64 text, not the raw bytes
    pub max_encoded_len: usize,
    pub max_width: u32,
    pub max_height: u32,
    pub min_dimension: u32,
    pub initial_quality: u8,
    pub min_quality: u8,
    pub quality_step: u8,
    pub encoding: ImageEncoding,
}

#[derive(Debug, Clone)]
pub struct FitResult {
    /// Base64 of the final image bytes
    pub encoded: String,
    pub width: u32,
    pub height: u32,
    /// Size of the image before base64
    pub size_bytes: usize,
    pub mime_type: &'static str,
}

impl FitResult {
    /// `<img>` tag referencing the image inline
    pub fn media_tag(&self) -> String {
        format!(
            r#"<img src="data:{};base64,{}" />"#,
            self.mime_type, self.encoded
        )
    }
}

#[derive(Debug, Clone)]
pub struct MediaFitter {
    settings: FitSettings,
}

impl MediaFitter {
    pub fn new(settings: FitSettings) -> Self {
        Self { settings }
    }

    /// Decode `source` and re-encode it within the configured budget.
    ///
    /// CPU bound, call from a blocking context.
    pub fn fit(&self, source: &[u8]) -> Result<FitResult, RelayError> {
        let s = &self.settings;
        let decoded = image::load_from_memory(source)
            .map_err(|e| RelayError::ImageProcessing(e.to_string()))?;
        let mut img = DynamicImage::ImageRgba8(decoded.to_rgba8());

        let (mut width, mut height) = (img.width(), img.height());
        if width > s.max_width || height > s.max_height {
            let ratio = f64::min(
                s.max_width as f64 / width as f64,
                s.max_height as f64 / height as f64,
            );
            width = ((width as f64 * ratio) as u32).max(1);
            height = ((height as f64 * ratio) as u32).max(1);
            if width.min(height) < s.min_dimension {
                debug!(width, height, "Capped image falls below minimum dimension");
                return Err(RelayError::ImageTooLarge);
            }
            debug!(width, height, "Scaling image down to dimension caps");
            img = img.resize_exact(width, height, FilterType::Lanczos3);
        }

        let mut quality = s.initial_quality;
        loop {
            let bytes = self.encode(&img, quality)?;
            let encoded_len = bytes.len().div_ceil(3) * 4;
            if encoded_len <= s.max_encoded_len {
                debug!(width, height, quality, encoded_len, "Image fits budget");
                return Ok(FitResult {
                    encoded: STANDARD.encode(&bytes),
                    width,
                    height,
                    size_bytes: bytes.len(),
                    mime_type: s.encoding.mime_type(),
                });
            }

            if s.encoding.honours_quality() && quality > s.min_quality {
                quality = quality.saturating_sub(s.quality_step).max(s.min_quality);
                continue;
            }

            width = (width as f64 * SHRINK_FACTOR) as u32;
            height = (height as f64 * SHRINK_FACTOR) as u32;
            if width < s.min_dimension || height < s.min_dimension {
                debug!(width, height, encoded_len, "Image cannot fit budget");
                return Err(RelayError::ImageTooLarge);
            }

            img = img.resize_exact(width, height, FilterType::Lanczos3);
            quality = s.initial_quality;
        }
    }

    fn encode(&self, img: &DynamicImage, quality: u8) -> Result<Vec<u8>, RelayError> {
        let mut buf = Vec::new();
        let result = match self.settings.encoding {
            ImageEncoding::Png => img.write_with_encoder(PngEncoder::new_with_quality(
                &mut buf,
                CompressionType::Best,
                PngFilter::Adaptive,
            )),
            ImageEncoding::Jpeg => DynamicImage::ImageRgb8(flatten_onto_white(img))
                .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality)),
        };
        result.map_err(|e| RelayError::ImageProcessing(e.to_string()))?;
        Ok(buf)
    }
}

fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u16 * a as u16 + 255 * (255 - a as u16)) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}
