pub mod engine;
pub mod pool;
pub mod types;

pub use engine::*;
pub use pool::*;
pub use types::*;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OcrError {
    /// The engine did not answer within the per-call budget.
    #[error("OCR timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("OCR engine failure: {0}")]
    EngineFailure(String),

    /// Worker queue is full. Surfaced to the caller as backpressure.
    #[error("OCR pool overloaded")]
    Overloaded,

    #[error("Tesseract OCR initialization failed: {0}")]
    Init(String),

    #[error("Tessdata not found at: {0}")]
    TessdataNotFound(PathBuf),
}

impl OcrError {
    /// Failures the coordinator answers with a degraded verdict. Everything
    /// except backpressure: a broken engine must not stall moderation.
    pub fn is_degradable(&self) -> bool {
        !matches!(self, OcrError::Overloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_engine_failure_degrades() {
        assert!(OcrError::Timeout { timeout_ms: 10 }.is_degradable());
        assert!(OcrError::EngineFailure("x".into()).is_degradable());
        assert!(OcrError::Init("tessdata unreadable".into()).is_degradable());
        assert!(OcrError::TessdataNotFound("/nowhere".into()).is_degradable());
        assert!(!OcrError::Overloaded.is_degradable());
    }

    #[test]
    fn timeout_message_carries_budget() {
        let msg = OcrError::Timeout { timeout_ms: 250 }.to_string();
        assert!(msg.contains("250ms"), "{msg}");
    }
}
