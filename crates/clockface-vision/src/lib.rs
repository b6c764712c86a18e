//! clockface-vision: image bytes to a fixed-length face embedding.
//!
//! [`HistogramExtractor`] decodes any format the `image` crate understands,
//! converts to grayscale, rejects captures that are too small, too dark or
//! featureless, then describes a 64×64 resample with intensity, gradient
//! and texture statistics.

pub mod features;
pub mod luma;

use clockface_core::{Embedding, ExtractError, Extraction, FeatureExtractor};
use image::imageops::{self, FilterType};

pub use features::FEATURE_DIM;

pub const MODEL_VERSION: &str = "hist64-v1";

/// Side of the square patch features are computed over.
const PATCH: u32 = 64;
/// Captures smaller than this on either side are refused.
const MIN_SIDE: u32 = 32;
const DARK_THRESHOLD: f32 = 0.95;
/// Below this standard deviation the capture has no usable structure.
const MIN_CONTRAST: f32 = 2.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramExtractor;

impl HistogramExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl FeatureExtractor for HistogramExtractor {
    fn dimension(&self) -> usize {
        FEATURE_DIM
    }

    fn extract(&self, capture: &[u8]) -> Result<Extraction, ExtractError> {
        let img = image::load_from_memory(capture).map_err(|e| ExtractError::Decode(e.to_string()))?;
        let (width, height) = (img.width(), img.height());
        if width < MIN_SIDE || height < MIN_SIDE {
            return Err(ExtractError::TooSmall { width, height });
        }

        let gray = img.to_luma8();
        if luma::is_dark_frame(gray.as_raw(), DARK_THRESHOLD) {
            tracing::debug!(
                brightness = luma::avg_brightness(gray.as_raw()),
                "capture rejected: dark frame"
            );
            return Err(ExtractError::TooDark);
        }

        let patch = imageops::resize(&gray, PATCH, PATCH, FilterType::Triangle);
        let raw = patch.as_raw();
        if luma::contrast(raw) < MIN_CONTRAST {
            return Err(ExtractError::NoFace);
        }

        let pixels: Vec<f32> = raw.iter().map(|&p| p as f32).collect();
        let quality = luma::quality(raw);
        tracing::trace!(width, height, quality, "features extracted");

        Ok(Extraction {
            embedding: Embedding {
                values: features::compute(&pixels, PATCH as usize),
                model_version: Some(MODEL_VERSION.to_string()),
            },
            quality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    fn png(img: &GrayImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn portrait(w: u32, h: u32, shift: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let dx = x as i32 - (w / 2 + shift) as i32;
            let dy = y as i32 - (h / 2) as i32;
            let inside = dx * dx + dy * dy < (w as i32 / 3).pow(2);
            Luma([if inside { 180 } else { 60 + (y % 40) as u8 }])
        })
    }

    fn stripes(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, _| Luma([if (x / 4) % 2 == 0 { 30 } else { 230 }]))
    }

    #[test]
    fn test_embedding_shape() {
        let out = HistogramExtractor.extract(&png(&portrait(120, 160, 0))).unwrap();
        assert_eq!(out.embedding.dim(), FEATURE_DIM);
        assert_eq!(out.embedding.model_version.as_deref(), Some(MODEL_VERSION));
        assert!(out.quality > 0.0 && out.quality <= 1.0);
    }

    #[test]
    fn test_same_capture_is_deterministic() {
        let bytes = png(&portrait(96, 96, 0));
        let a = HistogramExtractor.extract(&bytes).unwrap();
        let b = HistogramExtractor.extract(&bytes).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_similar_captures_closer_than_different_ones() {
        let base = HistogramExtractor.extract(&png(&portrait(96, 96, 0))).unwrap();
        let nudged = HistogramExtractor.extract(&png(&portrait(96, 96, 2))).unwrap();
        let other = HistogramExtractor.extract(&png(&stripes(96, 96))).unwrap();

        let near = base.embedding.similarity(&nudged.embedding);
        let far = base.embedding.similarity(&other.embedding);
        assert!(near > far, "near={near} far={far}");
    }

    #[test]
    fn test_rejections() {
        let x = HistogramExtractor;
        assert!(matches!(x.extract(b"not an image"), Err(ExtractError::Decode(_))));
        assert_eq!(
            x.extract(&png(&portrait(20, 40, 0))),
            Err(ExtractError::TooSmall { width: 20, height: 40 })
        );
        assert_eq!(
            x.extract(&png(&GrayImage::from_pixel(64, 64, Luma([5])))),
            Err(ExtractError::TooDark)
        );
        assert_eq!(
            x.extract(&png(&GrayImage::from_pixel(64, 64, Luma([128])))),
            Err(ExtractError::NoFace)
        );
    }
}
