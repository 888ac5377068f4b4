use actix_web::error::{BlockingError, JsonPayloadError};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::{Map, Value, json};
use shared::ClassificationResult;

use crate::classifier::ClassifierError;
use crate::formats;
use crate::validator::ValidationError;

pub const ENDPOINTS: [&str; 5] = ["/", "/status", "/predict", "/predict_base64", "/classes"];

/// Request problems detected before any image work starts.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("No file sent")]
    NoFile,
    #[error("No file selected")]
    EmptyFilename,
    #[error("File type not allowed")]
    DisallowedType { filename: String },
    #[error("Malformed multipart body: {0}")]
    MalformedMultipart(String),
    #[error("Content must be JSON")]
    NotJson,
    #[error("Invalid JSON data or missing \"image\" field")]
    MissingImageField,
    #[error("Empty base64 string")]
    EmptyBase64,
    #[error("Invalid base64 data")]
    InvalidBase64,
    #[error("Base64 data is not a valid image")]
    NotAnImage,
}

impl InputError {
    pub fn code(&self) -> &'static str {
        match self {
            InputError::NoFile => "no_file",
            InputError::EmptyFilename => "empty_filename",
            InputError::DisallowedType { .. } => "disallowed_type",
            InputError::MalformedMultipart(_) => "malformed_multipart",
            InputError::NotJson => "not_json",
            InputError::MissingImageField => "missing_image_field",
            InputError::EmptyBase64 => "empty_base64",
            InputError::InvalidBase64 => "invalid_base64",
            InputError::NotAnImage => "not_an_image",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{}", too_large_message(.size, .max))]
    PayloadTooLarge { size: Option<u64>, max: u64 },
    #[error("Inference backend is not available: {0}")]
    RuntimeUnavailable(String),
    #[error("{}", .details.error.as_deref().unwrap_or("Prediction failed"))]
    PredictionFailed { details: ClassificationResult },
    #[error("Internal server error: {0}")]
    Internal(String),
    #[error("Endpoint not found")]
    NotFound { path: String },
    #[error("Method {method} not allowed for this endpoint")]
    MethodNotAllowed { method: String, path: String },
}

fn too_large_message(size: &Option<u64>, max: &u64) -> String {
    let max_mb = *max as f64 / (1024.0 * 1024.0);
    match size {
        Some(size) => format!(
            "Image too large: {:.1}MB (maximum: {:.1}MB)",
            *size as f64 / (1024.0 * 1024.0),
            max_mb
        ),
        None => format!("File too large. Maximum size: {max_mb:.1}MB"),
    }
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Input(e) => e.code(),
            ApiError::Validation(e) => e.code(),
            ApiError::PayloadTooLarge { .. } => "payload_too_large",
            ApiError::RuntimeUnavailable(_) => "runtime_unavailable",
            ApiError::PredictionFailed { .. } => "prediction_failed",
            ApiError::Internal(_) => "internal_error",
            ApiError::NotFound { .. } => "not_found",
            ApiError::MethodNotAllowed { .. } => "method_not_allowed",
        }
    }

    /// Maps `web::Json` extractor failures onto the envelope.
    pub fn from_json_payload(err: JsonPayloadError) -> Self {
        match err {
            JsonPayloadError::OverflowKnownLength { length, limit } => ApiError::PayloadTooLarge {
                size: Some(length as u64),
                max: limit as u64,
            },
            JsonPayloadError::Overflow { limit } => ApiError::PayloadTooLarge {
                size: None,
                max: limit as u64,
            },
            JsonPayloadError::ContentType => InputError::NotJson.into(),
            _ => InputError::MissingImageField.into(),
        }
    }

    fn envelope(&self) -> Value {
        let mut body = Map::new();
        body.insert("success".into(), json!(false));
        body.insert("error".into(), json!(self.to_string()));
        body.insert("code".into(), json!(self.code()));
        match self {
            ApiError::Input(InputError::DisallowedType { .. }) => {
                body.insert("allowed_types".into(), json!(formats::allowed_extensions()));
            }
            ApiError::PredictionFailed { details } => {
                body.insert("details".into(), json!(details));
            }
            ApiError::NotFound { path } => {
                body.insert("path".into(), json!(path));
                body.insert("available_endpoints".into(), json!(ENDPOINTS));
            }
            ApiError::MethodNotAllowed { path, .. } => {
                body.insert("path".into(), json!(path));
            }
            _ => {}
        }
        Value::Object(body)
    }
}

impl From<ClassifierError> for ApiError {
    fn from(err: ClassifierError) -> Self {
        match err {
            ClassifierError::RuntimeUnavailable(reason) => ApiError::RuntimeUnavailable(reason),
            ClassifierError::PredictionFailed(message) => ApiError::PredictionFailed {
                details: ClassificationResult::failure(message, 0.0),
            },
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<BlockingError> for ApiError {
    fn from(err: BlockingError) -> Self {
        ApiError::Internal(format!("worker failed: {err}"))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Input(_) => StatusCode::BAD_REQUEST,
            ApiError::Validation(ValidationError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::PredictionFailed { .. } | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("{} ({}): {:?}", status, self.code(), self);
        } else {
            log::warn!("{} ({}): {}", status, self.code(), self);
        }
        HttpResponse::build(status).json(self.envelope())
    }
}
