use serde::{Deserialize, Serialize};

use super::OcrError;

/// OCR result for a single image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPageResult {
    pub text: String,
    /// Mean engine confidence, 0.0 - 1.0.
    pub confidence: f32,
}

/// OCR capability, consumed as a black box.
///
/// Calls are blocking and may be slow; the worker pool runs them on the
/// blocking thread pool and enforces the timeout.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image_bytes: &[u8]) -> Result<OcrPageResult, OcrError>;

    /// Short engine name for logs.
    fn name(&self) -> &'static str;
}
