use shared::{ClassificationResult, ImageInfo};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::classifier::{Classifier, ClassifierError};
use crate::error::ApiError;
use crate::temp::TempFile;
use crate::validator::ImageValidator;

#[derive(Debug)]
pub struct Classified {
    pub prediction: ClassificationResult,
    pub image_info: ImageInfo,
}

/// Request lifecycle: materialize the upload, validate, classify. Every
/// temporary artifact is owned by a guard local to `classify`, so it is gone
/// by the time the call returns, on success and on every error path.
pub struct Orchestrator {
    classifier: Arc<Classifier>,
    validator: ImageValidator,
    upload_dir: PathBuf,
    max_upload_bytes: u64,
}

impl Orchestrator {
    pub fn new(
        classifier: Arc<Classifier>,
        validator: ImageValidator,
        upload_dir: PathBuf,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&upload_dir)?;
        let max_upload_bytes = validator.limits().max_bytes;
        Ok(Self {
            classifier,
            validator,
            upload_dir,
            max_upload_bytes,
        })
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    pub fn ensure_available(&self) -> Result<(), ApiError> {
        self.classifier.ensure_available().map_err(ApiError::from)
    }

    /// Blocking: writes, decodes and runs inference on the calling thread.
    pub fn classify(&self, filename: &str, bytes: &[u8]) -> Result<Classified, ApiError> {
        let upload = TempFile::write(&self.upload_dir, filename, bytes)
            .map_err(|e| ApiError::Internal(format!("failed to store upload: {e}")))?;
        log::info!("File saved temporarily: {}", upload.path().display());

        let validated = self.validator.validate(upload.path())?;
        log::debug!(
            "Classifying {} as {} ({}x{})",
            validated.path().display(),
            validated.encoding,
            validated.width,
            validated.height
        );

        let started = Instant::now();
        let prediction = self
            .classifier
            .predict(&validated.image)
            .map_err(|err| match err {
                ClassifierError::PredictionFailed(message) => ApiError::PredictionFailed {
                    details: ClassificationResult::failure(
                        message,
                        started.elapsed().as_secs_f64(),
                    ),
                },
                other => other.into(),
            })?;

        Ok(Classified {
            prediction,
            image_info: ImageInfo {
                format: validated.encoding.to_string(),
                width: validated.width,
                height: validated.height,
                size_bytes: validated.size_bytes,
            },
        })
    }
}
