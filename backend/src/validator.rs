use image::{DynamicImage, GenericImageView, ImageFormat};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::decoders;
use crate::formats::{self, Canonicalization, ImageEncoding, Signature};
use crate::temp::TempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub min_dimension: u32,
    pub max_dimension: u32,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            min_bytes: 100,
            max_bytes: 16 * 1024 * 1024,
            min_dimension: 50,
            max_dimension: 4000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("File too large: {:.1}MB (maximum: {:.1}MB)", mib(.size), mib(.max))]
    TooLarge { size: u64, max: u64 },
    #[error("File too small: {size} bytes (minimum: {min} bytes)")]
    TooSmall { size: u64, min: u64 },
    #[error("File is not a valid image")]
    InvalidImage,
    #[error("Error processing image format {format}: {reason}")]
    UnreadableImage { format: String, reason: String },
    #[error("{}", dimension_message(.width, .height, .limit, .below_minimum))]
    DimensionOutOfBounds {
        width: u32,
        height: u32,
        limit: u32,
        below_minimum: bool,
    },
    #[error("Failed to store transcoded image: {0}")]
    Storage(#[source] std::io::Error),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::NotFound(_) => "not_found",
            ValidationError::TooLarge { .. } => "too_large",
            ValidationError::TooSmall { .. } => "too_small",
            ValidationError::InvalidImage => "invalid_image",
            ValidationError::UnreadableImage { .. } => "unreadable_image",
            ValidationError::DimensionOutOfBounds { .. } => "dimension_out_of_bounds",
            ValidationError::Storage(_) => "storage_error",
        }
    }
}

fn mib(bytes: &u64) -> f64 {
    *bytes as f64 / (1024.0 * 1024.0)
}

fn dimension_message(width: &u32, height: &u32, limit: &u32, below_minimum: &bool) -> String {
    if *below_minimum {
        format!("Image too small: {width}x{height}px (minimum: {limit}x{limit}px)")
    } else {
        format!("Image too large: {width}x{height}px (maximum: {limit}x{limit}px)")
    }
}

/// An image that passed every check. When the source needed transcoding the
/// converted artifact travels with it and is removed when this value drops.
#[derive(Debug)]
pub struct ValidatedImage {
    pub source: PathBuf,
    pub transcoded: Option<TempFile>,
    pub encoding: ImageEncoding,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub image: DynamicImage,
}

impl ValidatedImage {
    /// Path of the artifact the classifier consumes.
    pub fn path(&self) -> &Path {
        self.transcoded_path().unwrap_or(&self.source)
    }

    pub fn transcoded_path(&self) -> Option<&Path> {
        self.transcoded.as_ref().map(TempFile::path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageValidator {
    limits: ValidationLimits,
}

impl ImageValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Runs existence, size, signature, decode, transcode and dimension checks
    /// in that order, stopping at the first failure. Never touches the source.
    pub fn validate(&self, path: &Path) -> Result<ValidatedImage, ValidationError> {
        let metadata = fs::metadata(path).map_err(|_| ValidationError::NotFound(path.into()))?;
        if !metadata.is_file() {
            return Err(ValidationError::NotFound(path.into()));
        }

        let size = metadata.len();
        if size > self.limits.max_bytes {
            return Err(ValidationError::TooLarge {
                size,
                max: self.limits.max_bytes,
            });
        }
        if size < self.limits.min_bytes {
            return Err(ValidationError::TooSmall {
                size,
                min: self.limits.min_bytes,
            });
        }

        let bytes = fs::read(path).map_err(|_| ValidationError::NotFound(path.into()))?;
        let extension = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(formats::extension_of);
        let source = resolve_source(formats::sniff(&bytes), extension.as_deref())
            .ok_or(ValidationError::InvalidImage)?;

        match source {
            Source::Foreign(format) => {
                let label = Signature::Foreign(format).extension();
                let decoded = image::load_from_memory_with_format(&bytes, format)
                    .map_err(|e| unreadable(&label, e))?;
                self.convert(path, decoded, &label, ImageEncoding::Png)
            }
            Source::Encoded(encoding) => match formats::canonicalize(&encoding.to_string()) {
                Canonicalization::Native(encoding) => {
                    let image = decoders::decode(encoding, &bytes, path)
                        .map_err(|e| unreadable(&encoding.to_string(), e))?;
                    self.finish(path.to_path_buf(), None, encoding, size, image)
                }
                Canonicalization::Transcode { from, to } => {
                    let decoded = decoders::decode(from, &bytes, path)
                        .map_err(|e| unreadable(&from.to_string(), e))?;
                    self.convert(path, decoded, &from.to_string(), to)
                }
                Canonicalization::Unsupported => Err(ValidationError::InvalidImage),
            },
        }
    }

    /// Re-encodes `decoded` as `target` next to the source and validates the
    /// written artifact.
    fn convert(
        &self,
        path: &Path,
        decoded: DynamicImage,
        label: &str,
        target: ImageEncoding,
    ) -> Result<ValidatedImage, ValidationError> {
        let target_format = target
            .image_format()
            .ok_or_else(|| unreadable(label, format!("no encoder for {target}")))?;

        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("image");
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        // From here on the guard owns the artifact: any early return below removes it.
        let converted = TempFile::reserve(dir, &format!("converted_{stem}.{target}"));

        let mut encoded = Vec::new();
        let to_encode = match target {
            ImageEncoding::Jpeg => DynamicImage::ImageRgb8(decoded.to_rgb8()),
            _ => decoded,
        };
        to_encode
            .write_to(&mut Cursor::new(&mut encoded), target_format)
            .map_err(|e| unreadable(label, e))?;
        fs::write(converted.path(), &encoded).map_err(ValidationError::Storage)?;
        log::info!(
            "Image converted from {} to {}: {}",
            label,
            target,
            converted.path().display()
        );

        let reread = fs::read(converted.path()).map_err(ValidationError::Storage)?;
        let image = image::load_from_memory_with_format(&reread, target_format)
            .map_err(|e| unreadable(&target.to_string(), e))?;
        let size = reread.len() as u64;
        self.finish(path.to_path_buf(), Some(converted), target, size, image)
    }

    fn finish(
        &self,
        source: PathBuf,
        transcoded: Option<TempFile>,
        encoding: ImageEncoding,
        size_bytes: u64,
        image: DynamicImage,
    ) -> Result<ValidatedImage, ValidationError> {
        let (width, height) = image.dimensions();
        let limits = &self.limits;
        if width < limits.min_dimension || height < limits.min_dimension {
            return Err(ValidationError::DimensionOutOfBounds {
                width,
                height,
                limit: limits.min_dimension,
                below_minimum: true,
            });
        }
        if width > limits.max_dimension || height > limits.max_dimension {
            return Err(ValidationError::DimensionOutOfBounds {
                width,
                height,
                limit: limits.max_dimension,
                below_minimum: false,
            });
        }

        Ok(ValidatedImage {
            source,
            transcoded,
            encoding,
            width,
            height,
            size_bytes,
            image,
        })
    }
}

enum Source {
    Encoded(ImageEncoding),
    Foreign(ImageFormat),
}

/// Content signature wins over the declared extension. The extension decides
/// only for containers without a recognizable signature, and for RAW files,
/// many of which carry a plain TIFF header.
fn resolve_source(signature: Option<Signature>, extension: Option<&str>) -> Option<Source> {
    let declared = extension
        .filter(|ext| formats::requires_transcoding(ext))
        .and_then(|ext| ImageEncoding::from_str(ext).ok());
    match (signature, declared) {
        (Some(Signature::Known(ImageEncoding::Tiff)), Some(ImageEncoding::Raw)) => {
            Some(Source::Encoded(ImageEncoding::Raw))
        }
        (Some(Signature::Known(encoding)), _) => Some(Source::Encoded(encoding)),
        (Some(Signature::Foreign(format)), _) => Some(Source::Foreign(format)),
        (None, declared) => declared.map(Source::Encoded),
    }
}

fn unreadable(format: &str, reason: impl ToString) -> ValidationError {
    ValidationError::UnreadableImage {
        format: format.to_string(),
        reason: reason.to_string(),
    }
}
