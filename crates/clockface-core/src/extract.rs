//! Feature extraction seam. The model behind it is opaque to the engine.

use crate::types::Embedding;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("capture could not be decoded: {0}")]
    Decode(String),
    #[error("capture is {width}x{height}, too small to contain a face")]
    TooSmall { width: u32, height: u32 },
    #[error("capture is too dark")]
    TooDark,
    #[error("no face found in capture")]
    NoFace,
}

/// One embedding plus the quality of the capture it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub embedding: Embedding,
    /// Capture quality in [0, 1]; higher is better.
    pub quality: f32,
}

/// Turns raw capture bytes into a fixed-length embedding.
pub trait FeatureExtractor: Send + Sync {
    /// Length of every embedding this extractor produces.
    fn dimension(&self) -> usize;

    fn extract(&self, capture: &[u8]) -> Result<Extraction, ExtractError>;
}
