use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::types::{OcrEngine, OcrPageResult};
use super::OcrError;

/// Bundled Tesseract OCR engine.
/// Only available when compiled with the `ocr` feature flag.
#[cfg(feature = "ocr")]
pub struct BundledTesseract {
    tessdata_dir: std::path::PathBuf,
    lang: String,
}

#[cfg(feature = "ocr")]
impl BundledTesseract {
    /// Initialize with a tessdata directory. English is required; other
    /// installed languages are not loaded unless asked for.
    pub fn new(tessdata_dir: &std::path::Path) -> Result<Self, OcrError> {
        if !tessdata_dir.join("eng.traineddata").exists() {
            return Err(OcrError::TessdataNotFound(tessdata_dir.to_path_buf()));
        }

        Ok(Self {
            tessdata_dir: tessdata_dir.to_path_buf(),
            lang: "eng".to_string(),
        })
    }

    /// Set language(s) for OCR (e.g., "eng", "eng+spa")
    pub fn with_languages(mut self, langs: &str) -> Self {
        self.lang = langs.to_string();
        self
    }
}

#[cfg(feature = "ocr")]
impl OcrEngine for BundledTesseract {
    fn recognize(&self, image_bytes: &[u8]) -> Result<OcrPageResult, OcrError> {
        let tessdata_str = self
            .tessdata_dir
            .to_str()
            .ok_or_else(|| OcrError::EngineFailure("Invalid tessdata path".into()))?;

        // A fresh handle per call: Tesseract handles are not shareable across threads.
        let tess = tesseract::Tesseract::new(Some(tessdata_str), Some(&self.lang))
            .map_err(|e| OcrError::EngineFailure(format!("Tesseract handle: {e:?}")))?;

        let mut tess = tess
            .set_image_from_mem(image_bytes)
            .map_err(|e| OcrError::EngineFailure(format!("{e:?}")))?;

        let text = tess
            .get_text()
            .map_err(|e| OcrError::EngineFailure(format!("{e:?}")))?;

        let confidence = tess.mean_text_conf().max(0) as f32 / 100.0;

        Ok(OcrPageResult { text, confidence })
    }

    fn name(&self) -> &'static str {
        "tesseract"
    }
}

/// Stand-in when no OCR backend is available. Every call fails, which routes
/// each uncached attachment through the configured fail mode.
pub struct UnavailableOcrEngine;

impl OcrEngine for UnavailableOcrEngine {
    fn recognize(&self, _image_bytes: &[u8]) -> Result<OcrPageResult, OcrError> {
        Err(OcrError::EngineFailure("no OCR backend available".into()))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

enum Script {
    Fixed(String),
    Echo,
    Fail(OcrError),
}

/// Scripted OCR engine for exercising the pipeline without Tesseract.
///
/// Returns fixed text, echoes the attachment bytes as text, or fails, after
/// an optional delay. Counts calls so callers can assert OCR was skipped.
pub struct ScriptedOcrEngine {
    script: Script,
    confidence: f32,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self::with_script(Script::Fixed(text.to_string()), confidence)
    }

    /// Recognized text is the attachment itself, read as UTF-8.
    pub fn echo() -> Self {
        Self::with_script(Script::Echo, 0.9)
    }

    pub fn failing(message: &str) -> Self {
        Self::failing_with(OcrError::EngineFailure(message.to_string()))
    }

    /// Fail every call with exactly this error.
    pub fn failing_with(error: OcrError) -> Self {
        Self::with_script(Script::Fail(error), 0.0)
    }

    /// Block the calling thread this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn with_script(script: Script, confidence: f32) -> Self {
        Self {
            script,
            confidence,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }
}

impl OcrEngine for ScriptedOcrEngine {
    fn recognize(&self, image_bytes: &[u8]) -> Result<OcrPageResult, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let text = match &self.script {
            Script::Fixed(text) => text.clone(),
            Script::Echo => String::from_utf8_lossy(image_bytes).into_owned(),
            Script::Fail(error) => return Err(error.clone()),
        };

        Ok(OcrPageResult {
            text,
            confidence: self.confidence,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Pick the best available OCR engine for this build.
pub fn build_ocr_engine() -> Arc<dyn OcrEngine> {
    #[cfg(feature = "ocr")]
    {
        match find_tessdata_dir().and_then(|dir| BundledTesseract::new(&dir).map(|e| (dir, e))) {
            Ok((tessdata, engine)) => {
                tracing::info!(tessdata = %tessdata.display(), "Tesseract OCR initialized");
                return Arc::new(engine);
            }
            Err(e) => tracing::warn!(error = %e, "Tesseract unavailable, attachments will not be OCR'd"),
        }
    }

    tracing::warn!("No OCR backend, uncached attachments follow the configured fail mode");
    Arc::new(UnavailableOcrEngine)
}

/// Locate tessdata directory from environment or system paths.
#[cfg(feature = "ocr")]
pub fn find_tessdata_dir() -> Result<std::path::PathBuf, OcrError> {
    use std::path::PathBuf;

    // 1. Check TESSDATA_PREFIX environment variable
    if let Ok(path) = std::env::var("TESSDATA_PREFIX") {
        let p = PathBuf::from(&path);
        if p.join("eng.traineddata").exists() {
            return Ok(p);
        }
    }

    // 2. Try common system paths
    let candidates = [
        "/usr/share/tesseract-ocr/5/tessdata",
        "/usr/share/tesseract-ocr/4.00/tessdata",
        "/usr/share/tessdata",
        "/usr/local/share/tessdata",
        "/opt/homebrew/share/tessdata",
    ];

    for path in &candidates {
        let p = PathBuf::from(path);
        if p.join("eng.traineddata").exists() {
            return Ok(p);
        }
    }

    Err(OcrError::Init(
        "Tesseract data directory not found. Set TESSDATA_PREFIX or install tesseract-ocr-eng".into(),
    ))
}
